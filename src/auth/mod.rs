//! Accounts and sessions: Argon2 credential hashing, HS256 access tokens,
//! and single-use refresh tokens rotated through a SQLite-backed store.
//!
//! The pieces compose left to right: [`password`] turns secrets into PHC
//! digests, [`token`] mints and checks the wire formats, [`store`] persists
//! users and refresh-token records behind small traits, and
//! [`service::SessionService`] drives the lifecycle on top of all three.

pub mod password;
pub mod service;
pub mod store;
pub mod token;

pub use service::{AuthError, SessionService, TokenPair};
pub use store::{
    RefreshTokenRecord, RefreshTokenStore, Role, SqliteAuthStore, StoreError, User, UserDirectory,
    UserPage, UserQuery,
};
pub use token::{AccessClaims, TokenCodec, TokenError};
