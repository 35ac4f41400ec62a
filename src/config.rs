//! TOML configuration with environment overrides.
//!
//! Layout mirrors the config file: one struct per `[section]`, every field
//! individually defaulted so a partial file (or no file at all) still yields
//! a runnable config. Secrets (`tokens.signing_secret`,
//! `bootstrap.root_password`) are redacted from `Debug` output and can be
//! supplied via `KEYGATE_*` environment variables, which always win over
//! file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "keygate.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address. Non-loopback binds are refused unless
    /// `allow_public_bind` is set.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit opt-in for binding to a non-loopback interface.
    #[serde(default)]
    pub allow_public_bind: bool,
    /// Trust `X-User-Id` / `X-User-Role` headers from an upstream proxy as a
    /// fallback identity source. Only enable behind a proxy that strips
    /// these headers from client traffic.
    #[serde(default)]
    pub trust_proxy_identity: bool,
    /// Per-client request budget for the credential endpoints
    /// (register/login/refresh) per sliding minute. 0 disables limiting.
    #[serde(default = "default_auth_requests_per_minute")]
    pub auth_requests_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite database file. Created (with parent directories) on first run.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    /// HMAC key for access-token signatures. Required, non-empty; shared
    /// with any service that validates tokens locally.
    #[serde(default)]
    pub signing_secret: String,
    /// Access-token lifetime in seconds.
    #[serde(default = "default_access_ttl_secs")]
    pub access_ttl_secs: u64,
    /// Refresh-token lifetime in seconds.
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_ttl_secs: u64,
}

#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    /// Email for the root account created on first startup.
    #[serde(default)]
    pub root_email: String,
    /// Password for the root account created on first startup.
    #[serde(default)]
    pub root_password: String,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8080
}

fn default_auth_requests_per_minute() -> u32 {
    30
}

fn default_db_path() -> PathBuf {
    PathBuf::from("keygate.db")
}

fn default_access_ttl_secs() -> u64 {
    3600
}

fn default_refresh_ttl_secs() -> u64 {
    30 * 24 * 3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allow_public_bind: false,
            trust_proxy_identity: false,
            auth_requests_per_minute: default_auth_requests_per_minute(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            access_ttl_secs: default_access_ttl_secs(),
            refresh_ttl_secs: default_refresh_ttl_secs(),
        }
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("signing_secret", &"<redacted>")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish()
    }
}

impl std::fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("root_email", &self.root_email)
            .field("root_password", &"<redacted>")
            .finish()
    }
}

impl Config {
    /// Load configuration: explicit path, else `keygate.toml` if present,
    /// else built-in defaults. Environment overrides apply last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// `KEYGATE_*` environment variables override file values, so secrets
    /// never have to live on disk.
    fn apply_env_overrides(&mut self) {
        if let Some(host) = env_nonempty("KEYGATE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_nonempty("KEYGATE_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(path) = env_nonempty("KEYGATE_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(secret) = env_nonempty("KEYGATE_SIGNING_SECRET") {
            self.tokens.signing_secret = secret;
        }
        if let Some(email) = env_nonempty("KEYGATE_ROOT_EMAIL") {
            self.bootstrap.root_email = email;
        }
        if let Some(password) = env_nonempty("KEYGATE_ROOT_PASSWORD") {
            self.bootstrap.root_password = password;
        }
    }

    /// Reject configurations that cannot serve safely.
    pub fn validate(&self) -> Result<()> {
        if self.tokens.signing_secret.trim().is_empty() {
            anyhow::bail!(
                "tokens.signing_secret is empty — set it in the config file \
                 or via KEYGATE_SIGNING_SECRET"
            );
        }
        if self.tokens.access_ttl_secs == 0 {
            anyhow::bail!("tokens.access_ttl_secs must be greater than zero");
        }
        if self.tokens.refresh_ttl_secs == 0 {
            anyhow::bail!("tokens.refresh_ttl_secs must be greater than zero");
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(!config.server.allow_public_bind);
        assert!(!config.server.trust_proxy_identity);
        assert_eq!(config.tokens.access_ttl_secs, 3600);
        assert_eq!(config.tokens.refresh_ttl_secs, 2_592_000);
        assert_eq!(config.database.path, PathBuf::from("keygate.db"));
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let config: Config = toml::from_str(
            r#"
            [tokens]
            signing_secret = "s3cret"

            [server]
            port = 9090
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.tokens.signing_secret, "s3cret");
        assert_eq!(config.tokens.access_ttl_secs, 3600);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<Config, _> = toml::from_str(
            r#"
            [server]
            prot = 9090
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        std::env::set_var("KEYGATE_SIGNING_SECRET", "from-env");
        std::env::set_var("KEYGATE_PORT", "1234");
        let mut config = Config::default();
        config.tokens.signing_secret = "from-file".into();
        config.apply_env_overrides();
        std::env::remove_var("KEYGATE_SIGNING_SECRET");
        std::env::remove_var("KEYGATE_PORT");

        assert_eq!(config.tokens.signing_secret, "from-env");
        assert_eq!(config.server.port, 1234);
    }

    #[test]
    fn validate_requires_signing_secret() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tokens.signing_secret = "s3cret".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = Config::default();
        config.tokens.signing_secret = "super-secret".into();
        config.bootstrap.root_password = "root-pass".into();
        let printed = format!("{config:?}");
        assert!(!printed.contains("super-secret"));
        assert!(!printed.contains("root-pass"));
        assert!(printed.contains("<redacted>"));
    }
}
