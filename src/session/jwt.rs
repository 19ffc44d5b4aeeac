//! HS256-signed session tokens.

use base64::{Engine, engine::general_purpose::STANDARD};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};

use super::{SessionDecoder, SessionError, SessionResult, SessionState};

/// Session decoder verifying HS256 JWTs signed with the shared secret.
pub struct JwtSessionDecoder {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl JwtSessionDecoder {
    /// Create a decoder from a raw signing key.
    pub fn new(key: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is checked when present but session tokens are not required to carry it.
        validation.required_spec_claims.clear();
        validation.validate_aud = false;

        Self {
            decoding_key: DecodingKey::from_secret(key),
            encoding_key: EncodingKey::from_secret(key),
            validation,
        }
    }

    /// Create a decoder from a base64-encoded shared secret.
    pub fn from_base64_secret(secret: &str) -> SessionResult<Self> {
        let key = STANDARD
            .decode(secret.trim())
            .map_err(|e| SessionError::InvalidKey(e.to_string()))?;
        if key.is_empty() {
            return Err(SessionError::InvalidKey("shared secret is empty".into()));
        }
        Ok(Self::new(&key))
    }

    /// Sign a session state with the same key.
    pub fn encode(&self, state: &SessionState) -> SessionResult<String> {
        encode(&Header::new(Algorithm::HS256), state, &self.encoding_key)
            .map_err(|e| SessionError::InvalidToken(e.to_string()))
    }
}

impl SessionDecoder for JwtSessionDecoder {
    fn decode(&self, token: &str) -> SessionResult<SessionState> {
        decode::<SessionState>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => SessionError::Expired,
                _ => SessionError::InvalidToken(e.to_string()),
            })
    }
}
