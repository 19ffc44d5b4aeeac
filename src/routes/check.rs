//! Authorization check endpoints.
//!
//! Two surfaces share the same pipeline:
//! - `POST /v1/check` takes an explicit attribute bundle as JSON.
//! - `/verify` (and every unmatched route) authorizes the incoming request
//!   itself, the way a proxy in forward-auth mode calls it.

use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::{
    authorizer::CheckResponse,
    identity::SyncError,
    request::{AttributeBundle, HttpAttributes},
};

/// Body of `POST /v1/check`.
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub attributes: AttributeBundle,
    /// Session token; when absent it is looked up in the bundle's headers
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Errors that prevent a decision from being made at all.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    IdentityUnavailable(#[from] SyncError),
}

impl IntoResponse for CheckError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            CheckError::IdentityUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "identity_unavailable")
            }
        };
        tracing::warn!(error = %self, code, "Authorization check failed");

        let body = ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Authorize an explicit attribute bundle.
#[tracing::instrument(name = "check.bundle", skip_all)]
pub async fn check(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<(StatusCode, Json<CheckResponse>), CheckError> {
    let cancel = CancellationToken::new();
    // Cancels in-flight identity fetches when the client goes away.
    let _guard = cancel.clone().drop_guard();

    let response = state
        .authorizer
        .check(request.attributes, request.token.as_deref(), &cancel)
        .await?;

    Ok((status_code(response.status), Json(response)))
}

/// Authorize the incoming request itself.
///
/// The decision reason is returned as plain text; on allow the identity
/// headers are set on the response for the proxy to copy upstream.
#[tracing::instrument(name = "check.verify", skip_all)]
pub async fn verify(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, CheckError> {
    let bundle = bundle_from_request(&request);

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let decision = state.authorizer.check(bundle, None, &cancel).await?;

    let mut response = Response::new(Body::from(decision.reason));
    *response.status_mut() = status_code(decision.status);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if decision.allowed {
        copy_decision_headers(response.headers_mut(), decision.headers);
    }
    Ok(response)
}

/// Describe an incoming HTTP request as an attribute bundle.
pub fn bundle_from_request(request: &Request) -> AttributeBundle {
    let uri = request.uri();
    let headers = request.headers();

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    // Repeated headers collapse to their last value.
    let header_map = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    AttributeBundle {
        peer: Default::default(),
        http: HttpAttributes {
            id: headers
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            method: request.method().as_str().to_string(),
            path: uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            host,
            scheme: uri.scheme_str().unwrap_or("http").to_string(),
            headers: header_map,
            body: String::new(),
        },
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN)
}

fn copy_decision_headers(
    target: &mut HeaderMap,
    headers: impl IntoIterator<Item = (String, String)>,
) {
    for (name, value) in headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                target.insert(name, value);
            }
            _ => tracing::debug!(header = %name, "Skipping invalid decision header"),
        }
    }
}
