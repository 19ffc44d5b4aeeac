use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use url::Url;

use super::ConfigError;

/// Session, forward-auth and decision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizeSettings {
    /// Public URL the sidecar is reachable at in forward-auth mode.
    /// Forward-auth handling is disabled when unset.
    #[serde(default)]
    pub forward_auth_url: Option<Url>,

    /// Base64-encoded key used to verify session tokens (HS256).
    #[serde(default)]
    pub shared_secret: Option<String>,

    /// Name of the cookie carrying the session token.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Decision for requests whose host matches no route policy.
    #[serde(default)]
    pub default_effect: PolicyEffect,

    /// Pass the resolved identity upstream as `X-Authorize-*` headers on allow.
    #[serde(default = "default_true")]
    pub pass_identity_headers: bool,

    /// Maximum length of a single policy expression.
    #[serde(default = "default_max_expression_length")]
    pub max_expression_length: usize,
}

impl Default for AuthorizeSettings {
    fn default() -> Self {
        Self {
            forward_auth_url: None,
            shared_secret: None,
            cookie_name: default_cookie_name(),
            default_effect: PolicyEffect::default(),
            pass_identity_headers: true,
            max_expression_length: default_max_expression_length(),
        }
    }
}

impl AuthorizeSettings {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.forward_auth_url
            && url.host_str().is_none_or(str::is_empty)
        {
            return Err(ConfigError::Validation(format!(
                "authorize.forward_auth_url must include a host: {url}"
            )));
        }

        if let Some(secret) = &self.shared_secret
            && STANDARD.decode(secret.trim()).is_err()
        {
            return Err(ConfigError::Validation(
                "authorize.shared_secret must be valid base64".into(),
            ));
        }

        if self.cookie_name.is_empty() {
            return Err(ConfigError::Validation(
                "authorize.cookie_name must not be empty".into(),
            ));
        }

        if self.max_expression_length == 0 {
            return Err(ConfigError::Validation(
                "authorize.max_expression_length must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Effect applied when no route policy matches the request host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEffect {
    Allow,
    #[default]
    Deny,
}

fn default_cookie_name() -> String {
    "_authorize".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_expression_length() -> usize {
    4096
}
