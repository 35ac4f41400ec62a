//! SQLite-backed identity storage.
//!
//! Tables:
//! - `users`: email (unique, case-insensitive), Argon2 digest, role, root
//!   and active flags
//! - `refresh_tokens`: SHA-256 digest of the opaque value (unique), owner,
//!   expiry, revocation timestamp
//!
//! Refresh tokens are revoked by setting `revoked_at`, never deleted; the
//! table doubles as an audit trail. The conditional UPDATE in
//! [`RefreshTokenStore::revoke_if_active`] is the serialization point for
//! concurrent refresh attempts on the same token.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Account role. Root capability is a separate flag, not a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "STUDENT",
            Self::Teacher => "TEACHER",
        }
    }

    /// Strict parse for external input (admin requests, proxy headers).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STUDENT" => Some(Self::Student),
            "TEACHER" => Some(Self::Teacher),
            _ => None,
        }
    }

    fn from_str_lossy(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::Student)
    }
}

/// An identity record.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    /// Stored lowercase; uniqueness is additionally case-insensitive at the
    /// schema level.
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    /// Set once by the startup bootstrap, immutable afterwards.
    pub is_root: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Fresh non-root, active user with a random id.
    pub fn new(email: String, password_hash: String, role: Role) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            password_hash,
            role,
            is_root: false,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// A persisted refresh token. `revoked_at == None` means not yet consumed.
#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshTokenRecord {
    /// Redeemable: neither revoked nor past expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// Query for the paginated admin listing.
#[derive(Debug, Clone, Default)]
pub struct UserQuery {
    /// Case-insensitive email substring filter.
    pub email_contains: Option<String>,
    /// Zero-based page index.
    pub page: u32,
    /// Rows per page; callers clamp to a sane range before querying.
    pub size: u32,
}

/// One page of the admin listing plus the unpaged match count.
#[derive(Debug, Clone)]
pub struct UserPage {
    pub users: Vec<User>,
    pub total: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint violation (duplicate email or token hash).
    #[error("duplicate record")]
    Duplicate,
    #[error("auth store failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// User directory consumed by the session service, the identity middleware
/// and the admin surface.
pub trait UserDirectory: Send + Sync {
    fn create(&self, user: &User) -> StoreResult<()>;
    fn find_by_id(&self, id: &str) -> StoreResult<Option<User>>;
    fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    fn email_exists(&self, email: &str) -> StoreResult<bool>;
    /// The bootstrap account, if one exists yet.
    fn find_root(&self) -> StoreResult<Option<User>>;
    /// Returns false when the id is unknown.
    fn set_password_hash(&self, id: &str, password_hash: &str) -> StoreResult<bool>;
    fn set_role(&self, id: &str, role: Role) -> StoreResult<bool>;
    fn set_active(&self, id: &str, active: bool) -> StoreResult<bool>;
    fn search(&self, query: &UserQuery) -> StoreResult<UserPage>;
}

/// Persistence contract for refresh tokens.
pub trait RefreshTokenStore: Send + Sync {
    fn insert(&self, record: &RefreshTokenRecord) -> StoreResult<()>;
    fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshTokenRecord>>;
    /// Conditionally revoke: sets `revoked_at = now` iff it is still null,
    /// in one UPDATE. Returns whether this call revoked the row, so exactly
    /// one of any number of concurrent redeemers of the same token wins.
    fn revoke_if_active(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<bool>;
    /// Revoke every unrevoked token of a user; returns how many changed.
    /// Idempotent; a second call returns 0.
    fn revoke_all_for_user(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<u64>;
}

// ── SQLite implementation ───────────────────────────────────────

pub struct SqliteAuthStore {
    conn: Mutex<Connection>,
}

impl SqliteAuthStore {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database dir: {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open auth DB: {}", db_path.display()))?;
        Self::init(conn)
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'STUDENT',
                is_root INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS refresh_tokens (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                token_hash TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                revoked_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_refresh_tokens_user ON refresh_tokens(user_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn map_constraint(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Duplicate
        }
        other => StoreError::Sqlite(other),
    }
}

fn parse_timestamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

const USER_COLUMNS: &str = "id, email, password_hash, role, is_root, is_active, created_at";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        role: Role::from_str_lossy(&row.get::<_, String>(3)?),
        is_root: row.get(4)?,
        is_active: row.get(5)?,
        created_at: parse_timestamp(&row.get::<_, String>(6)?, 6)?,
    })
}

const TOKEN_COLUMNS: &str = "id, user_id, token_hash, created_at, expires_at, revoked_at";

fn token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RefreshTokenRecord> {
    let revoked_at = match row.get::<_, Option<String>>(5)? {
        Some(raw) => Some(parse_timestamp(&raw, 5)?),
        None => None,
    };
    Ok(RefreshTokenRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token_hash: row.get(2)?,
        created_at: parse_timestamp(&row.get::<_, String>(3)?, 3)?,
        expires_at: parse_timestamp(&row.get::<_, String>(4)?, 4)?,
        revoked_at,
    })
}

impl UserDirectory for SqliteAuthStore {
    fn create(&self, user: &User) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, email, password_hash, role, is_root, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id,
                user.email,
                user.password_hash,
                user.role.as_str(),
                user.is_root,
                user.is_active,
                user.created_at.to_rfc3339(),
            ],
        )
        .map_err(map_constraint)?;
        Ok(())
    }

    fn find_by_id(&self, id: &str) -> StoreResult<Option<User>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            user_from_row,
        );
        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1 COLLATE NOCASE"),
            params![email],
            user_from_row,
        );
        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn email_exists(&self, email: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1 COLLATE NOCASE)",
            params![email],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn find_root(&self) -> StoreResult<Option<User>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE is_root = 1 LIMIT 1"),
            [],
            user_from_row,
        );
        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_password_hash(&self, id: &str, password_hash: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            params![password_hash, id],
        )?;
        Ok(changed > 0)
    }

    fn set_role(&self, id: &str, role: Role) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE users SET role = ?1 WHERE id = ?2",
            params![role.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    fn set_active(&self, id: &str, active: bool) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE users SET is_active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Ok(changed > 0)
    }

    fn search(&self, query: &UserQuery) -> StoreResult<UserPage> {
        let conn = self.conn.lock();
        let limit = i64::from(query.size);
        let offset = i64::from(query.page) * limit;

        let (total, mut stmt, pattern) = match &query.email_contains {
            Some(q) => {
                let pattern = format!("%{q}%");
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM users WHERE email LIKE ?1",
                    params![pattern],
                    |row| row.get(0),
                )?;
                let stmt = conn.prepare(&format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE email LIKE ?1
                     ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3"
                ))?;
                (total, stmt, Some(pattern))
            }
            None => {
                let total: i64 =
                    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
                let stmt = conn.prepare(&format!(
                    "SELECT {USER_COLUMNS} FROM users
                     ORDER BY created_at ASC, id ASC LIMIT ?1 OFFSET ?2"
                ))?;
                (total, stmt, None)
            }
        };

        let rows = match &pattern {
            Some(p) => stmt.query_map(params![p, limit, offset], user_from_row)?,
            None => stmt.query_map(params![limit, offset], user_from_row)?,
        };

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(UserPage {
            users,
            total: total.max(0) as u64,
        })
    }
}

impl RefreshTokenStore for SqliteAuthStore {
    fn insert(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, created_at, expires_at, revoked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.user_id,
                record.token_hash,
                record.created_at.to_rfc3339(),
                record.expires_at.to_rfc3339(),
                record.revoked_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(map_constraint)?;
        Ok(())
    }

    fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = ?1"),
            params![token_hash],
            token_from_row,
        );
        match row {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn revoke_if_active(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE refresh_tokens SET revoked_at = ?1
             WHERE token_hash = ?2 AND revoked_at IS NULL",
            params![now.to_rfc3339(), token_hash],
        )?;
        Ok(changed > 0)
    }

    fn revoke_all_for_user(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE refresh_tokens SET revoked_at = ?1
             WHERE user_id = ?2 AND revoked_at IS NULL",
            params![now.to_rfc3339(), user_id],
        )?;
        Ok(changed as u64)
    }
}
