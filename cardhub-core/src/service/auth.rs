//! Bearer-token validation for channel open
//!
//! Token issuance belongs to the marketplace's auth service; this side
//! only verifies the HS256 signature and expiry before any connection
//! resources are allocated.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{models::UserId, Error, Result};

/// Claims carried by marketplace-issued access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> UserId {
        UserId::from_string(self.sub.clone())
    }
}

/// Verifies bearer tokens against the shared HS256 secret
#[derive(Clone)]
pub struct TokenValidator {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator").finish()
    }
}

impl TokenValidator {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate a token and extract the authenticated user ID
    pub fn validate(&self, token: &str) -> Result<UserId> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| Error::Authentication(format!("Invalid token: {e}")))?;
        Ok(data.claims.user_id())
    }

    /// Sign a short-lived token. The marketplace issues real tokens; this
    /// exists for tests and local development.
    pub fn sign_for(&self, user_id: &UserId, ttl_seconds: i64) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.as_str().to_string(),
            iat: now,
            exp: now + ttl_seconds,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }
}
