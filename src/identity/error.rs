use thiserror::Error;

/// Errors decoding an identity record into a typed object.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Unknown identity record type: {0}")]
    UnknownType(String),

    #[error("Failed to decode {type_url} record: {source}")]
    Decode {
        type_url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Identity store returned {actual_type}/{actual_id}, expected {expected_type}/{expected_id}")]
    Mismatch {
        expected_type: String,
        expected_id: String,
        actual_type: String,
        actual_id: String,
    },
}

/// Errors returned by an identity store client.
#[derive(Debug, Error)]
pub enum IdentityStoreError {
    #[error("Record not found: {type_url}/{id}")]
    NotFound { type_url: String, id: String },

    #[error("Identity store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Identity store returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid identity store response: {0}")]
    InvalidResponse(String),
}

/// Why a single record fetch did not produce a decoded object.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Store(#[from] IdentityStoreError),

    #[error(transparent)]
    Decode(#[from] IdentityError),

    #[error("fetch cancelled")]
    Cancelled,

    #[error("fetch deadline exceeded")]
    DeadlineExceeded,
}

/// Errors returned by [`IdentitySync::force_sync`](super::IdentitySync::force_sync).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Session {id} not found: {source}")]
    SessionNotFound {
        id: String,
        #[source]
        source: FetchError,
    },

    #[error("Identity sync cancelled")]
    Cancelled,

    #[error("Identity sync deadline exceeded")]
    DeadlineExceeded,
}
