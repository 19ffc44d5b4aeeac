//! HTTP surface of the authorization service.

pub mod check;
pub mod health;

use std::sync::Arc;

use axum::{
    Router,
    routing::{any, get, post},
};
use http::HeaderName;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::{
    authorizer::{AuthorizeOptions, Authorizer},
    authz::{AuthzError, CelEvaluator},
    config::{AuthorizeConfig, ConfigError},
    identity::{HttpIdentityStoreClient, IdentityCache, IdentityStoreError, IdentitySync},
    session::{JwtSessionDecoder, SessionError},
};

/// Errors raised while assembling the service from its configuration.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Session decoder: {0}")]
    Session(#[from] SessionError),

    #[error("Identity store client: {0}")]
    IdentityStore(#[from] IdentityStoreError),

    #[error("Policy compilation: {0}")]
    Policy(#[from] AuthzError),
}

#[derive(Clone)]
pub struct AppState {
    pub authorizer: Arc<Authorizer>,
}

impl AppState {
    pub fn new(authorizer: Arc<Authorizer>) -> Self {
        Self { authorizer }
    }

    /// Wire the session decoder, identity sync, and policy evaluator from configuration.
    pub fn from_config(config: &AuthorizeConfig) -> Result<Self, StartupError> {
        let secret = config.authorize.shared_secret.as_deref().ok_or_else(|| {
            ConfigError::Validation("authorize.shared_secret is required".to_string())
        })?;
        let decoder = JwtSessionDecoder::from_base64_secret(secret)?;

        let store = config.require_identity_store()?;
        let client = HttpIdentityStoreClient::from_config(store)?;
        let sync = IdentitySync::new(
            Arc::new(client),
            Arc::new(IdentityCache::new()),
            store.timeout(),
        );

        let evaluator = CelEvaluator::new(&config.policies, &config.authorize)?;
        tracing::debug!(
            programs = evaluator.program_count(),
            store = %store.url,
            "Authorization pipeline configured"
        );

        let authorizer = Authorizer::new(
            AuthorizeOptions::from_config(config),
            Arc::new(decoder),
            Arc::new(sync),
            Arc::new(evaluator),
        );
        Ok(Self::new(Arc::new(authorizer)))
    }
}

pub fn build_app(config: &AuthorizeConfig, state: AppState) -> Router {
    let request_id = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness))
        .route("/v1/check", post(check::check))
        .route("/verify", any(check::verify))
        .fallback(check::verify)
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .with_state(state)
}
