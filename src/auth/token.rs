//! Access-token codec and refresh-token material.
//!
//! Access tokens are self-contained HS256 JWTs (subject id, email, role,
//! issued/expiry timestamps): any holder of the shared secret can validate
//! them without a store round-trip. Refresh tokens are opaque 256-bit random
//! values handed to the client once; only their SHA-256 digest is ever
//! persisted or looked up.

use crate::auth::store::Role;
use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Refresh-token byte length before encoding (32 bytes = 256 bits).
const REFRESH_TOKEN_BYTES: usize = 32;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject: the user id.
    pub sub: String,
    pub email: String,
    pub role: Role,
    /// Issued-at, seconds since the Unix epoch.
    pub iat: i64,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

/// Why a presented access token was rejected. Callers treat both cases as
/// "no identity"; the distinction only feeds debug logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("access token expired")]
    Expired,
    #[error("access token invalid")]
    Invalid,
}

/// Signs and verifies access tokens with the shared HMAC secret.
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl_secs: u64,
}

impl TokenCodec {
    pub fn new(secret: &str, access_ttl_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is exact; cross-service clock skew is a deployment problem,
        // not something to paper over with grace seconds.
        validation.leeway = 0;
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            access_ttl_secs,
        }
    }

    /// Issue a signed access token: sub = user id, expiry = now + TTL.
    pub fn issue_access_token(
        &self,
        user_id: &str,
        email: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let claims = AccessClaims {
            sub: user_id.to_owned(),
            email: email.to_owned(),
            role,
            iat: now.timestamp(),
            exp: now.timestamp() + self.access_ttl_secs as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to sign access token: {e}"))
    }

    /// Verify signature and expiry, returning the embedded claims.
    pub fn parse_claims(&self, token: &str) -> Result<AccessClaims, TokenError> {
        decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })
    }
}

/// Generate an opaque refresh-token value: 256 CSPRNG bits, URL-safe base64
/// without padding. The raw value exists only in the response to the client.
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Digest used to persist and look up refresh tokens. A single SHA-256 pass
/// is enough: the values are already high-entropy, no stretching needed.
pub fn hash_refresh_token(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Short digest prefix for log lines. Raw values and full hashes stay out of
/// the logs.
pub fn token_hash_prefix(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}
