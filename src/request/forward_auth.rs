//! Forward-auth detection and rewriting.
//!
//! A proxy in forward-auth mode does not ask "may this request reach me?" but
//! "may *this other* request be allowed?". The other request is carried either
//! in `X-Forwarded-{Uri,Proto,Host}` headers (native sidecar mode) or as the
//! `uri` query parameter of a `/verify` call (`auth_request`-style mode).
//!
//! Only requests addressed to the configured forward-auth host are eligible.
//! That host comparison is the single trust boundary: it is performed once, in
//! [`ForwardAuthDecision::decide`], before either rewrite form is considered.

use url::{Url, form_urlencoded};

use super::{
    AttributeBundle, HEADER_FORWARDED_HOST, HEADER_FORWARDED_PROTO, HEADER_FORWARDED_URI,
    HttpAttributes, strip_port,
};

/// Path prefix of `auth_request`-style verification calls.
const VERIFY_PATH: &str = "/verify";

/// Query parameter carrying the URL of the request to authorize.
const VERIFY_URI_PARAM: &str = "uri";

/// Outcome of inspecting a request for forward-auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardAuthDecision {
    /// Not a (valid) forward-auth request; evaluate the request as-is.
    Reject,
    /// The proxy supplied the original request in forwarded headers.
    ForwardedHeaders {
        path: String,
        host: String,
        scheme: String,
    },
    /// The original request URL was passed to `/verify?uri=...`.
    VerifyUri {
        path: String,
        host: String,
        scheme: String,
    },
}

impl ForwardAuthDecision {
    /// Classify a request addressed to the sidecar.
    pub fn decide(http: &HttpAttributes, forward_auth_url: &Url) -> Self {
        let Some(forward_auth_host) = forward_auth_url.host_str() else {
            return Self::Reject;
        };
        if !strip_port(&http.host).eq_ignore_ascii_case(forward_auth_host) {
            return Self::Reject;
        }

        if let (Some(uri), Some(proto), Some(host)) = (
            http.header(HEADER_FORWARDED_URI),
            http.header(HEADER_FORWARDED_PROTO),
            http.header(HEADER_FORWARDED_HOST),
        ) {
            return Self::ForwardedHeaders {
                path: uri.to_string(),
                host: host.to_string(),
                scheme: proto.to_string(),
            };
        }

        let (path, query) = http
            .path
            .split_once('?')
            .unwrap_or((http.path.as_str(), ""));
        if !path.starts_with(VERIFY_PATH) {
            return Self::Reject;
        }

        let Some(uri) = form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == VERIFY_URI_PARAM)
            .map(|(_, value)| value)
        else {
            return Self::Reject;
        };

        match parse_verify_uri(&uri) {
            Some(target) => Self::VerifyUri {
                path: path_and_query(&target),
                host: host_and_port(&target),
                scheme: target.scheme().to_string(),
            },
            None => Self::Reject,
        }
    }

    /// Rewrite the request in place. Returns whether a rewrite happened.
    pub fn apply(self, http: &mut HttpAttributes) -> bool {
        match self {
            Self::Reject => false,
            Self::ForwardedHeaders { path, host, scheme } | Self::VerifyUri { path, host, scheme } => {
                http.path = path;
                http.host = host;
                http.scheme = scheme;
                true
            }
        }
    }
}

/// Detect a forward-auth request and, when valid, rewrite the bundle so that
/// it describes the request being authorized.
///
/// Returns `false` without touching the bundle when forward-auth is not
/// configured, the bundle is absent, or the request is not an acceptable
/// forward-auth request.
pub fn handle_forward_auth(
    bundle: Option<&mut AttributeBundle>,
    forward_auth_url: Option<&Url>,
) -> bool {
    let (Some(bundle), Some(forward_auth_url)) = (bundle, forward_auth_url) else {
        return false;
    };

    let decision = ForwardAuthDecision::decide(&bundle.http, forward_auth_url);
    tracing::debug!(
        request_id = %bundle.http.id,
        host = %bundle.http.host,
        decision = ?decision,
        "Forward-auth decision"
    );
    decision.apply(&mut bundle.http)
}

/// Parse the `uri` parameter; it must be a well-formed absolute URL with a host.
fn parse_verify_uri(raw: &str) -> Option<Url> {
    // The URL parser silently trims surrounding whitespace; reject it instead.
    if raw.is_empty() || raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return None;
    }
    let target = Url::parse(raw).ok()?;
    target.host_str()?;
    Some(target)
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

fn host_and_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
