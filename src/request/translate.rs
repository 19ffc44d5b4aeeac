//! Translation of proxy attributes into the evaluator request.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{AttributeBundle, HEADER_FORWARDED_PROTO, strip_port};
use crate::{config::Policy, session::SessionState};

/// Normalized request and identity description consumed by the policy evaluator.
///
/// Built fresh for every check and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluatorRequest {
    pub session: RequestSession,
    pub http: RequestHttp,
    /// Custom policy snippets attached to the route matching the request host
    pub custom_policies: Vec<String>,
}

/// Session claims copied verbatim from the decoded session token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestSession {
    pub id: String,
    pub impersonate_email: String,
    pub impersonate_groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestHttp {
    pub method: String,
    /// Absolute URL; the host never carries a port
    pub url: String,
    /// Header names in canonical form
    pub headers: BTreeMap<String, String>,
    /// Decoded PEM client certificate, empty if none was presented
    pub client_certificate: String,
}

/// Build the evaluator request for a (possibly forward-auth rewritten) bundle.
///
/// Never fails: malformed attributes degrade to empty or best-effort values so
/// that a bad request is denied by policy rather than by translation.
pub fn translate(
    bundle: &AttributeBundle,
    session: Option<&SessionState>,
    policies: &[Policy],
) -> EvaluatorRequest {
    let http = &bundle.http;
    let host = strip_port(&http.host);
    let headers = http.canonical_headers();
    let scheme = headers
        .get(HEADER_FORWARDED_PROTO)
        .map_or(http.scheme.as_str(), String::as_str);

    let session = session
        .map(|s| RequestSession {
            id: s.id.clone(),
            impersonate_email: s.impersonate_email.clone().unwrap_or_default(),
            impersonate_groups: s.impersonate_groups.clone(),
        })
        .unwrap_or_default();

    EvaluatorRequest {
        session,
        http: RequestHttp {
            method: http.method.clone(),
            url: format!("{scheme}://{host}{}", http.path),
            headers,
            client_certificate: decode_certificate(&bundle.peer.certificate),
        },
        custom_policies: custom_policies_for_host(policies, host),
    }
}

/// Concatenated snippets of the first policy whose source host equals `host`.
fn custom_policies_for_host(policies: &[Policy], host: &str) -> Vec<String> {
    policies
        .iter()
        .find(|policy| policy.source_host().eq_ignore_ascii_case(host))
        .map(|policy| {
            policy
                .sub_policies
                .iter()
                .flat_map(|sub| sub.rego.iter().cloned())
                .collect()
        })
        .unwrap_or_default()
}

/// Query-unescape the certificate. Invalid escapes are passed through as-is,
/// and decoded bytes that are not valid UTF-8 are re-escaped as `%XX`.
fn decode_certificate(escaped: &str) -> String {
    if escaped.is_empty() {
        return String::new();
    }
    let spaced = escaped.replace('+', " ");
    let bytes = urlencoding::decode_binary(spaced.as_bytes());

    let mut decoded = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        decoded.push_str(chunk.valid());
        for byte in chunk.invalid() {
            decoded.push_str(&format!("%{byte:02X}"));
        }
    }
    decoded
}
