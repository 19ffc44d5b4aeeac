//! Policy evaluation.
//!
//! The authorization core hands every check to a [`PolicyEvaluator`] together
//! with the identity cache. The bundled evaluator, [`CelEvaluator`], treats each
//! custom policy snippet attached to a route as a CEL expression:
//!
//! 1. If the route has no snippets, the configured default effect applies
//! 2. If any snippet evaluates to `true`, the request is allowed
//! 3. If none did and a snippet failed to evaluate, the request is denied
//!    with that failure as the reason
//! 4. Otherwise (every snippet returned `false`) the request is denied

mod engine;
mod error;

use std::collections::BTreeMap;

use async_trait::async_trait;
pub use engine::CelEvaluator;
pub use error::AuthzError;
use serde::Serialize;

use crate::{identity::IdentityCache, request::EvaluatorRequest};

/// Upstream header carrying the user id.
pub const HEADER_AUTHORIZE_USER: &str = "X-Authorize-User";
/// Upstream header carrying the (possibly impersonated) email.
pub const HEADER_AUTHORIZE_EMAIL: &str = "X-Authorize-Email";
/// Upstream header carrying the impersonated groups, comma separated.
pub const HEADER_AUTHORIZE_GROUPS: &str = "X-Authorize-Groups";
/// Upstream header carrying the session id.
pub const HEADER_AUTHORIZE_SESSION: &str = "X-Authorize-Session";

/// Outcome of evaluating a request against its policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// HTTP status to answer a denied request with, if the policy chose one.
    pub status: Option<u16>,
    pub reason: String,
    /// Headers to add to the upstream request when allowed.
    pub headers: BTreeMap<String, String>,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            ..Default::default()
        }
    }
}

/// Evaluates a translated request.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        request: &EvaluatorRequest,
        identity: &IdentityCache,
    ) -> Result<Decision, AuthzError>;
}
