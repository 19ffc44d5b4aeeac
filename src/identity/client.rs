use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::{IdentityRecord, IdentityStoreError};
use crate::config::IdentityStoreConfig;

/// Read access to the remote identity store.
#[async_trait]
pub trait IdentityStoreClient: Send + Sync {
    /// Fetch the record of the given type and id.
    ///
    /// Returns [`IdentityStoreError::NotFound`] when the store has no such record.
    async fn get(&self, type_url: &str, id: &str) -> Result<IdentityRecord, IdentityStoreError>;
}

#[derive(Debug, Deserialize)]
struct GetRecordResponse {
    record: IdentityRecord,
}

/// Identity store client speaking the store's JSON HTTP API
/// (`GET /v1/records?type=..&id=..`).
#[derive(Debug, Clone)]
pub struct HttpIdentityStoreClient {
    client: reqwest::Client,
    records_url: Url,
    bearer_token: Option<String>,
}

impl HttpIdentityStoreClient {
    pub fn new(client: reqwest::Client, base_url: &Url, bearer_token: Option<String>) -> Self {
        let mut records_url = base_url.clone();
        if let Ok(mut segments) = records_url.path_segments_mut() {
            segments.pop_if_empty().extend(["v1", "records"]);
        }

        Self {
            client,
            records_url,
            bearer_token,
        }
    }

    pub fn from_config(config: &IdentityStoreConfig) -> Result<Self, IdentityStoreError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self::new(client, &config.url, config.shared_secret.clone()))
    }
}

#[async_trait]
impl IdentityStoreClient for HttpIdentityStoreClient {
    async fn get(&self, type_url: &str, id: &str) -> Result<IdentityRecord, IdentityStoreError> {
        let mut request = self
            .client
            .get(self.records_url.clone())
            .query(&[("type", type_url), ("id", id)]);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(IdentityStoreError::NotFound {
                type_url: type_url.to_string(),
                id: id.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityStoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let parsed: GetRecordResponse = serde_json::from_slice(&body)
            .map_err(|e| IdentityStoreError::InvalidResponse(e.to_string()))?;
        Ok(parsed.record)
    }
}
