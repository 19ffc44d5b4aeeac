//! Identity records and the process-local identity cache.
//!
//! Session and user records live in a remote identity store. [`IdentitySync`]
//! fetches them on demand through an [`IdentityStoreClient`] and merges the
//! decoded objects into a shared [`IdentityCache`] read by the policy evaluator.

mod cache;
mod client;
mod error;
mod record;
mod sync;

pub use cache::{IdentityCache, IdentitySnapshot};
pub use client::{HttpIdentityStoreClient, IdentityStoreClient};
pub use error::{FetchError, IdentityError, IdentityStoreError, SyncError};
pub use record::{
    IdentityObject, IdentityRecord, RecordType, SESSION_TYPE_URL, SessionIdentity, USER_TYPE_URL,
    UserIdentity,
};
pub use sync::IdentitySync;
