//! Session state carried in signed session tokens.
//!
//! The token itself is produced by the authenticate service; this module only
//! decodes and verifies it ([`SessionDecoder`]) and locates it on a request
//! ([`session_token`]).

mod jwt;

pub use jwt::JwtSessionDecoder;
use serde::{Deserialize, Serialize};

use crate::request::HttpAttributes;

/// Result type for session decoding.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while decoding a session token.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid session token: {0}")]
    InvalidToken(String),

    #[error("Session token has expired")]
    Expired,

    #[error("Invalid session signing key: {0}")]
    InvalidKey(String),
}

/// Decoded, authenticated session claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Session ID (identity store key of the session record)
    #[serde(rename = "jti", default)]
    pub id: String,

    /// Issuer
    #[serde(rename = "iss", default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// Audience (can be string or array)
    #[serde(rename = "aud", default, skip_serializing_if = "Audience::is_none")]
    pub audience: Audience,

    /// Expiration time (Unix timestamp)
    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,

    /// Issued at (Unix timestamp)
    #[serde(rename = "iat", default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,

    /// Email being impersonated by an administrator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonate_email: Option<String>,

    /// Groups being impersonated by an administrator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub impersonate_groups: Vec<String>,

    /// Whether the session was created for programmatic (non-browser) access
    #[serde(default)]
    pub programmatic: bool,
}

/// Audience can be a single string or an array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn is_none(&self) -> bool {
        matches!(self, Audience::None)
    }
}

/// Decodes and authenticates a session token.
pub trait SessionDecoder: Send + Sync {
    fn decode(&self, token: &str) -> SessionResult<SessionState>;
}

/// Find the session token on a request: the session cookie first, then an
/// `Authorization: Bearer` header.
pub fn session_token<'a>(http: &'a HttpAttributes, cookie_name: &str) -> Option<&'a str> {
    let from_cookie = http.header("cookie").and_then(|cookies| {
        cookies
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == cookie_name)
            .map(|(_, value)| value.trim_matches('"'))
    });

    from_cookie
        .or_else(|| {
            http.header("authorization").and_then(|value| {
                let (scheme, token) = value.trim().split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
            })
        })
        .filter(|token| !token.is_empty())
}
