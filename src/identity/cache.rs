use std::collections::BTreeMap;

use dashmap::DashMap;

use super::{IdentityObject, RecordType, SessionIdentity, UserIdentity};

/// Point-in-time copy of the cache: type URL → record ID → decoded object.
pub type IdentitySnapshot = BTreeMap<String, BTreeMap<String, IdentityObject>>;

/// Process-wide cache of decoded identity records.
///
/// Entries are only ever written whole after a successful decode, so readers
/// never observe a partially decoded record. The last write for a given
/// (type, id) key wins. There is no expiry.
#[derive(Debug, Default)]
pub struct IdentityCache {
    records: DashMap<(RecordType, String), IdentityObject>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a decoded object under its record type and `id`.
    pub fn insert(&self, id: &str, object: IdentityObject) {
        tracing::debug!(
            record_type = %object.record_type(),
            record_id = %id,
            "Caching identity record"
        );
        self.records
            .insert((object.record_type(), id.to_string()), object);
    }

    pub fn get(&self, record_type: RecordType, id: &str) -> Option<IdentityObject> {
        self.records
            .get(&(record_type, id.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn get_session(&self, id: &str) -> Option<SessionIdentity> {
        match self.get(RecordType::Session, id)? {
            IdentityObject::Session(session) => Some(session),
            IdentityObject::User(_) => None,
        }
    }

    pub fn get_user(&self, id: &str) -> Option<UserIdentity> {
        match self.get(RecordType::User, id)? {
            IdentityObject::User(user) => Some(user),
            IdentityObject::Session(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy the current contents, grouped by type URL.
    pub fn snapshot(&self) -> IdentitySnapshot {
        let mut snapshot = IdentitySnapshot::new();
        for entry in self.records.iter() {
            let (record_type, id) = entry.key();
            snapshot
                .entry(record_type.type_url().to_string())
                .or_default()
                .insert(id.clone(), entry.value().clone());
        }
        snapshot
    }
}
