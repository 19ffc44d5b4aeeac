use serde::{Deserialize, Serialize};
use url::Url;

/// A route policy: custom policy snippets attached to a source URL.
///
/// ```toml
/// [[policies]]
/// from = "https://app.example.com"
///
/// [[policies.sub_policies]]
/// name = "engineering"
/// rego = ["'engineering' in request.session.impersonate_groups"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Source URL; only its host is used for matching.
    pub from: Url,

    #[serde(default)]
    pub sub_policies: Vec<SubPolicy>,
}

impl Policy {
    /// Host of the source URL, without port. Empty when the URL has no host.
    pub fn source_host(&self) -> &str {
        self.from.host_str().unwrap_or_default()
    }

    /// All snippets of this policy, in declaration order.
    pub fn snippets(&self) -> impl Iterator<Item = &str> {
        self.sub_policies
            .iter()
            .flat_map(|sub| sub.rego.iter().map(String::as_str))
    }

    pub(super) fn validate(&self) -> Result<(), String> {
        if self.source_host().is_empty() {
            return Err("source URL must include a host".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubPolicy {
    #[serde(default)]
    pub name: Option<String>,

    /// Custom policy snippets.
    #[serde(default)]
    pub rego: Vec<String>,
}
