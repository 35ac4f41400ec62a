//! Session lifecycle: registration, login, refresh rotation, revocation.
//!
//! ## Design Decisions
//! - Refresh tokens are single-use. Redeeming one revokes it *before* the
//!   replacement pair is issued, so a token is consumed even when a later
//!   step fails. The conditional UPDATE in the store decides races: one
//!   winner, every loser gets `InvalidCredentials`.
//! - Credential failures collapse into one error value and message. Unknown
//!   email, inactive account, wrong password, unknown/revoked/expired
//!   refresh token: a caller probing the API learns nothing about which
//!   accounts or tokens exist.
//! - Revocation cascades are unconditional: password changes and explicit
//!   logout-all revoke every outstanding refresh token of the account.

use crate::auth::password;
use crate::auth::store::{
    RefreshTokenRecord, RefreshTokenStore, Role, StoreError, User, UserDirectory,
};
use crate::auth::token::{self, TokenCodec};
use chrono::{Duration, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Typed failures of the session operations. The HTTP boundary maps each
/// variant to a fixed status and message exactly once.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Bad password, unknown or inactive account, or an unusable refresh
    /// token. Deliberately one undifferentiated value.
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Email already registered")]
    AlreadyRegistered,
    /// The referenced account vanished mid-operation. Distinguishable only
    /// in refresh/change-password flows.
    #[error("User not found")]
    UserNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A freshly issued access + refresh pair. Raw values, returned to the
/// client once and never persisted.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Orchestrates the auth state machine over the user directory, the
/// refresh-token store and the token codec.
pub struct SessionService {
    users: Arc<dyn UserDirectory>,
    tokens: Arc<dyn RefreshTokenStore>,
    codec: Arc<TokenCodec>,
    refresh_ttl: Duration,
}

impl SessionService {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        tokens: Arc<dyn RefreshTokenStore>,
        codec: Arc<TokenCodec>,
        refresh_ttl_secs: u64,
    ) -> Self {
        Self {
            users,
            tokens,
            codec,
            refresh_ttl: Duration::seconds(refresh_ttl_secs as i64),
        }
    }

    /// Create an account (role STUDENT, active, non-root) and issue its
    /// first token pair.
    pub fn register(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
        let email = email.trim().to_lowercase();
        if self.users.email_exists(&email)? {
            return Err(AuthError::AlreadyRegistered);
        }

        let user = User::new(email, password::hash(password)?, Role::Student);
        // Two registrations racing on the same email: the storage constraint
        // decides the winner.
        if let Err(e) = self.users.create(&user) {
            return Err(match e {
                StoreError::Duplicate => AuthError::AlreadyRegistered,
                other => other.into(),
            });
        }

        tracing::info!(user_id = %user.id, "user registered");
        self.issue_pair(&user)
    }

    /// Verify credentials and issue a token pair.
    pub fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
        let email = email.trim().to_lowercase();
        let Some(user) = self.users.find_by_email(&email)? else {
            // Burn a verification so unknown emails cost as much as wrong
            // passwords.
            let _ = password::verify(password, password::dummy_digest());
            tracing::debug!("login rejected: unknown email");
            return Err(AuthError::InvalidCredentials);
        };
        if !user.is_active {
            tracing::debug!(user_id = %user.id, "login rejected: inactive account");
            return Err(AuthError::InvalidCredentials);
        }
        if !password::verify(password, &user.password_hash) {
            tracing::debug!(user_id = %user.id, "login rejected: password mismatch");
            return Err(AuthError::InvalidCredentials);
        }

        tracing::info!(user_id = %user.id, "login succeeded");
        self.issue_pair(&user)
    }

    /// Redeem a refresh token for a new pair, consuming it. Every successful
    /// call invalidates exactly one prior token and creates exactly one new
    /// one.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let hash = token::hash_refresh_token(refresh_token);
        let now = Utc::now();

        let Some(record) = self.tokens.find_by_hash(&hash)? else {
            tracing::debug!("refresh rejected: unknown token");
            return Err(AuthError::InvalidCredentials);
        };
        if !record.is_active(now) {
            tracing::debug!(
                token = token::token_hash_prefix(&hash),
                "refresh rejected: revoked or expired token"
            );
            return Err(AuthError::InvalidCredentials);
        }

        // Consume first. From here on the token is spent no matter what.
        if !self.tokens.revoke_if_active(&hash, now)? {
            tracing::warn!(
                token = token::token_hash_prefix(&hash),
                "refresh rejected: token consumed concurrently"
            );
            return Err(AuthError::InvalidCredentials);
        }

        let Some(user) = self.users.find_by_id(&record.user_id)? else {
            return Err(AuthError::UserNotFound);
        };
        if !user.is_active {
            tracing::debug!(user_id = %user.id, "refresh rejected: inactive account");
            return Err(AuthError::InvalidCredentials);
        }

        tracing::info!(
            user_id = %user.id,
            token = token::token_hash_prefix(&hash),
            "refresh token rotated"
        );
        self.issue_pair(&user)
    }

    /// Revoke one refresh token. Idempotent: unknown or already-revoked
    /// values are a no-op.
    pub fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        let hash = token::hash_refresh_token(refresh_token);
        if self.tokens.revoke_if_active(&hash, Utc::now())? {
            tracing::info!(
                token = token::token_hash_prefix(&hash),
                "refresh token revoked"
            );
        }
        Ok(())
    }

    /// Revoke every outstanding refresh token of the presented token's
    /// owner. The value only identifies the account, so an already-revoked
    /// token still works; unknown values are a no-op.
    pub fn logout_all(&self, refresh_token: &str) -> Result<(), AuthError> {
        let hash = token::hash_refresh_token(refresh_token);
        let Some(record) = self.tokens.find_by_hash(&hash)? else {
            return Ok(());
        };
        let revoked = self
            .tokens
            .revoke_all_for_user(&record.user_id, Utc::now())?;
        tracing::info!(user_id = %record.user_id, revoked, "logout-all revoked tokens");
        Ok(())
    }

    /// Revoke every outstanding refresh token of an account, regardless of
    /// which token identifies it. Used when an admin deactivates a user.
    pub fn revoke_sessions(&self, user_id: &str) -> Result<u64, AuthError> {
        let revoked = self.tokens.revoke_all_for_user(user_id, Utc::now())?;
        if revoked > 0 {
            tracing::info!(user_id, revoked, "revoked sessions");
        }
        Ok(revoked)
    }

    /// Replace the password after verifying the old one, then revoke all
    /// refresh tokens so every other session re-authenticates.
    pub fn change_password(
        &self,
        user_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let Some(user) = self.users.find_by_id(user_id)? else {
            return Err(AuthError::UserNotFound);
        };
        if !password::verify(old_password, &user.password_hash) {
            tracing::debug!(user_id = %user.id, "password change rejected: old password mismatch");
            return Err(AuthError::InvalidCredentials);
        }

        self.users
            .set_password_hash(&user.id, &password::hash(new_password)?)?;
        let revoked = self.tokens.revoke_all_for_user(&user.id, Utc::now())?;
        tracing::info!(user_id = %user.id, revoked, "password changed");
        Ok(())
    }

    /// One access token plus one refresh token persisted by hash. The raw
    /// refresh value exists only in the returned pair.
    fn issue_pair(&self, user: &User) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let access_token = self
            .codec
            .issue_access_token(&user.id, &user.email, user.role, now)?;

        let refresh_token = token::generate_refresh_token();
        let record = RefreshTokenRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            token_hash: token::hash_refresh_token(&refresh_token),
            created_at: now,
            expires_at: now + self.refresh_ttl,
            revoked_at: None,
        };
        self.tokens.insert(&record)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }
}
