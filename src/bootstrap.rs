//! First-start provisioning of the root account.
//!
//! Runs once at startup, before the gateway binds. When a root user already
//! exists the configured bootstrap values are ignored entirely, so rotating
//! them in config has no effect on a live deployment.

use crate::auth::password;
use crate::auth::store::{Role, StoreError, User, UserDirectory};
use crate::config::Config;
use anyhow::{bail, Context, Result};

/// Create the single root account if none exists yet.
///
/// Fatal when no root exists and the bootstrap config is unusable: a
/// deployment without a root account has no way to administer itself.
pub fn ensure_root(config: &Config, users: &dyn UserDirectory) -> Result<()> {
    if let Some(root) = users.find_root().context("root lookup failed")? {
        tracing::debug!(user_id = %root.id, "root account already provisioned");
        return Ok(());
    }

    let email = config.bootstrap.root_email.trim().to_lowercase();
    if email.is_empty() {
        bail!(
            "no root account exists and [bootstrap] root_email is not set \
             (or KEYGATE_ROOT_EMAIL)"
        );
    }
    if config.bootstrap.root_password.is_empty() {
        bail!(
            "no root account exists and [bootstrap] root_password is not set \
             (or KEYGATE_ROOT_PASSWORD)"
        );
    }

    let mut root = User::new(
        email,
        password::hash(&config.bootstrap.root_password)?,
        Role::Teacher,
    );
    root.is_root = true;

    match users.create(&root) {
        Ok(()) => {
            tracing::info!(user_id = %root.id, "root account created");
            Ok(())
        }
        Err(StoreError::Duplicate) => bail!(
            "the configured root email {} already belongs to an existing account",
            root.email
        ),
        Err(e) => Err(e).context("persisting the root account"),
    }
}
