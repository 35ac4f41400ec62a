//! keygate: a small identity service for course platforms.
//!
//! Four building blocks:
//! - [`auth`]: credential hashing, token issuance, session lifecycle, and
//!   the SQLite store behind them
//! - [`gateway`]: the axum HTTP surface with identity middleware and the
//!   root-only admin routes
//! - [`bootstrap`]: first-start provisioning of the root account
//! - [`config`]: TOML file plus `KEYGATE_*` environment overrides
//!
//! The auth core is usable as a library. Sibling services embed
//! [`auth::SessionService`] and [`gateway::identity::authorize`] directly
//! instead of round-tripping identity checks over HTTP.

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod gateway;
