//! Proxy-supplied request attributes and their canonical, evaluator-facing form.
//!
//! The reverse proxy describes every request it wants authorized as an
//! [`AttributeBundle`]. Before evaluation the bundle may be rewritten in place
//! by the forward-auth state machine ([`handle_forward_auth`]) and is then
//! translated into an [`EvaluatorRequest`] ([`translate`]).

mod forward_auth;
mod translate;

use std::collections::{BTreeMap, HashMap};

pub use forward_auth::{ForwardAuthDecision, handle_forward_auth};
use serde::{Deserialize, Serialize};
pub use translate::{EvaluatorRequest, RequestHttp, RequestSession, translate};

/// Original request URI, set by proxies running in forward-auth mode.
pub const HEADER_FORWARDED_URI: &str = "X-Forwarded-Uri";
/// Original request scheme.
pub const HEADER_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
/// Original request host.
pub const HEADER_FORWARDED_HOST: &str = "X-Forwarded-Host";

/// Description of one HTTP request awaiting an authorization decision.
///
/// Owned by a single check call. The forward-auth state machine may rewrite
/// the HTTP sub-fields in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeBundle {
    /// The downstream peer (client) of the proxied connection.
    #[serde(default)]
    pub peer: Peer,
    /// The HTTP request itself.
    #[serde(default)]
    pub http: HttpAttributes,
}

/// Peer attributes of the proxied connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// URL-encoded PEM client certificate, empty when no certificate was presented.
    #[serde(default)]
    pub certificate: String,
}

/// HTTP attributes of the proxied request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpAttributes {
    /// Opaque request identifier assigned by the proxy
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub method: String,
    /// Path, possibly including a query string
    #[serde(default)]
    pub path: String,
    /// Host, possibly including a port
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub scheme: String,
    /// Header names are matched case-insensitively
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl HttpAttributes {
    /// Look up a header value, ignoring the case of the header name.
    ///
    /// When several keys differ only in case, the lexicographically last key wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, value)| value.as_str())
    }

    /// Headers keyed by their canonical name. Duplicates are resolved the same
    /// way as in [`HttpAttributes::header`].
    pub fn canonical_headers(&self) -> BTreeMap<String, String> {
        let mut headers: Vec<_> = self.headers.iter().collect();
        headers.sort_by(|(a, _), (b, _)| a.cmp(b));
        headers
            .into_iter()
            .map(|(name, value)| (canonical_header_key(name), value.clone()))
            .collect()
    }
}

/// Remove a trailing `:port` from a host.
///
/// Bracketed IPv6 literals keep their brackets (`[::1]:8443` becomes `[::1]`);
/// a bare IPv6 address without brackets is returned unchanged.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

/// Canonical MIME header form of a header name: the first letter and every
/// letter following a hyphen upper-cased, everything else lower-cased
/// (`x-forwarded-proto` → `X-Forwarded-Proto`).
///
/// Names containing bytes that are not valid header token characters are
/// returned unchanged.
pub fn canonical_header_key(name: &str) -> String {
    if !name.bytes().all(is_token_byte) {
        return name.to_string();
    }

    let mut upper = true;
    name.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}

/// RFC 7230 `tchar`.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::no_port("example.com", "example.com")]
    #[case::http_port("example.com:80", "example.com")]
    #[case::high_port("example.com:65535", "example.com")]
    #[case::empty_port("example.com:", "example.com")]
    #[case::ipv4("10.0.0.1:8080", "10.0.0.1")]
    #[case::ipv6_bracketed("[::1]:8443", "[::1]")]
    #[case::ipv6_no_port("[::1]", "[::1]")]
    #[case::ipv6_bare("::1", "::1")]
    #[case::empty("", "")]
    fn test_strip_port(#[case] host: &str, #[case] expected: &str) {
        assert_eq!(strip_port(host), expected);
    }

    #[test]
    fn test_strip_port_is_idempotent() {
        for host in ["example.com:443", "[::1]:1", "a.b.c", "localhost:0"] {
            let once = strip_port(host);
            assert_eq!(strip_port(once), once);
        }
    }

    #[rstest]
    #[case("accept", "Accept")]
    #[case("x-forwarded-proto", "X-Forwarded-Proto")]
    #[case("X-FORWARDED-HOST", "X-Forwarded-Host")]
    #[case("content-MD5", "Content-Md5")]
    #[case("-leading", "-Leading")]
    #[case("", "")]
    fn test_canonical_header_key(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(canonical_header_key(name), expected);
    }

    #[test]
    fn test_canonical_header_key_invalid_token_unchanged() {
        assert_eq!(canonical_header_key("bad header"), "bad header");
        assert_eq!(canonical_header_key("x:y"), "x:y");
    }

    #[test]
    fn test_canonical_header_key_is_idempotent() {
        for name in ["accept", "x-forwarded-uri", "WWW-authenticate", "dnt"] {
            let once = canonical_header_key(name);
            assert_eq!(canonical_header_key(&once), once);
        }
    }

    #[test]
    fn test_case_duplicates_resolve_to_last_key() {
        for pairs in [
            [("x-forwarded-proto", "https"), ("X-Forwarded-Proto", "wss")],
            [("X-Forwarded-Proto", "wss"), ("x-forwarded-proto", "https")],
        ] {
            let http = HttpAttributes {
                headers: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            };
            assert_eq!(http.header(HEADER_FORWARDED_PROTO), Some("https"));
            assert_eq!(
                http.canonical_headers(),
                BTreeMap::from([("X-Forwarded-Proto".to_string(), "https".to_string())])
            );
        }
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let http = HttpAttributes {
            headers: HashMap::from([("x-forwarded-proto".to_string(), "https".to_string())]),
            ..Default::default()
        };
        assert_eq!(http.header(HEADER_FORWARDED_PROTO), Some("https"));
        assert_eq!(http.header("X-FORWARDED-PROTO"), Some("https"));
        assert_eq!(http.header(HEADER_FORWARDED_HOST), None);
    }
}
