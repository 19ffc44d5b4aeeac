use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::ConfigError;

/// Remote identity store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityStoreConfig {
    /// Base URL of the identity store API.
    pub url: Url,

    /// Bearer token sent with every request, if the store requires one.
    #[serde(default)]
    pub shared_secret: Option<String>,

    /// Deadline for a single record fetch, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl IdentityStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "identity_store.url must be an http(s) URL: {}",
                self.url
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "identity_store.timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    5
}
