//! Configuration module for the authorization sidecar.
//!
//! The sidecar is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [authorize]
//! forward_auth_url = "https://forward-auth.example.com"
//! shared_secret = "${AUTHORIZE_SHARED_SECRET}"
//!
//! [identity_store]
//! url = "http://databroker:5443"
//!
//! [[policies]]
//! from = "https://app.example.com"
//!
//! [[policies.sub_policies]]
//! name = "admins"
//! rego = ["user.email.endsWith('@example.com')"]
//! ```

mod authorize;
mod identity_store;
mod observability;
mod policy;
mod server;

use std::path::Path;

pub use authorize::*;
pub use identity_store::*;
pub use observability::*;
pub use policy::*;
use serde::{Deserialize, Serialize};
pub use server::*;

/// Root configuration for the authorization sidecar.
///
/// All sections are optional with sensible defaults. The identity store is
/// only required when serving.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizeConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Session, forward-auth and decision settings.
    #[serde(default)]
    pub authorize: AuthorizeSettings,

    /// Remote identity store the session and user records are fetched from.
    #[serde(default)]
    pub identity_store: Option<IdentityStoreConfig>,

    /// Route policies, matched against the request host in order.
    #[serde(default)]
    pub policies: Vec<Policy>,

    /// Observability configuration (logging).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AuthorizeConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: AuthorizeConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.authorize.validate()?;

        if let Some(store) = &self.identity_store {
            store.validate()?;
        }

        for (index, policy) in self.policies.iter().enumerate() {
            policy.validate().map_err(|msg| {
                ConfigError::Validation(format!("policies[{index}] ({}): {msg}", policy.from))
            })?;
        }

        Ok(())
    }

    /// The identity store section, required when serving.
    pub fn require_identity_store(&self) -> Result<&IdentityStoreConfig, ConfigError> {
        self.identity_store.as_ref().ok_or_else(|| {
            ConfigError::Validation(
                "identity_store.url is required to serve authorization requests".into(),
            )
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("invalid expansion pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            // Skip if this variable is inside a comment
            if comment_pos.is_some_and(|pos| whole.start() >= pos) {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);

            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
