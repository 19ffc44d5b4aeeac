use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::IdentityError;

pub const SESSION_TYPE_URL: &str = "type.googleapis.com/session.Session";
pub const USER_TYPE_URL: &str = "type.googleapis.com/user.User";

/// The closed set of record types the cache understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    Session,
    User,
}

impl RecordType {
    pub fn type_url(self) -> &'static str {
        match self {
            RecordType::Session => SESSION_TYPE_URL,
            RecordType::User => USER_TYPE_URL,
        }
    }

    pub fn from_type_url(type_url: &str) -> Result<Self, IdentityError> {
        match type_url {
            SESSION_TYPE_URL => Ok(RecordType::Session),
            USER_TYPE_URL => Ok(RecordType::User),
            other => Err(IdentityError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_url())
    }
}

/// A versioned, typed record as stored in the identity store.
///
/// `data` is opaque until decoded according to `type_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(default)]
    pub version: String,
    #[serde(rename = "type")]
    pub type_url: String,
    pub id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl IdentityRecord {
    /// Decode the record, checking that it is the record that was asked for.
    pub fn decode_as(
        &self,
        expected: RecordType,
        expected_id: &str,
    ) -> Result<IdentityObject, IdentityError> {
        if self.type_url != expected.type_url() || self.id != expected_id {
            return Err(IdentityError::Mismatch {
                expected_type: expected.type_url().to_string(),
                expected_id: expected_id.to_string(),
                actual_type: self.type_url.clone(),
                actual_id: self.id.clone(),
            });
        }
        self.decode()
    }

    /// Decode the payload according to the declared type.
    pub fn decode(&self) -> Result<IdentityObject, IdentityError> {
        let decode_err = |source| IdentityError::Decode {
            type_url: self.type_url.clone(),
            source,
        };

        match RecordType::from_type_url(&self.type_url)? {
            RecordType::Session => serde_json::from_value(self.data.clone())
                .map(IdentityObject::Session)
                .map_err(decode_err),
            RecordType::User => serde_json::from_value(self.data.clone())
                .map(IdentityObject::User)
                .map_err(decode_err),
        }
    }
}

/// Session record: links a session to the user that owns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionIdentity {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Identity provider claims captured at sign-in.
    #[serde(default)]
    pub claims: BTreeMap<String, serde_json::Value>,
}

/// User record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub claims: BTreeMap<String, serde_json::Value>,
}

/// A decoded identity record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IdentityObject {
    Session(SessionIdentity),
    User(UserIdentity),
}

impl IdentityObject {
    pub fn record_type(&self) -> RecordType {
        match self {
            IdentityObject::Session(_) => RecordType::Session,
            IdentityObject::User(_) => RecordType::User,
        }
    }
}
