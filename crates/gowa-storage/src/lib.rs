//! SQLite-backed chat storage.
//!
//! One database per worker; every row is scoped by `device_id` so a worker
//! can serve several linked devices without cross-talk. Split into focused
//! submodules:
//! - `chats` — chat upserts, filtered listing, deletion, truncation
//! - `messages` — message upserts, batch ingest, search, statistics
//! - `devices` — persisted device registry rows and per-device purge
//! - `lid` — phone-number ↔ hidden-identifier side-store and migration

mod chats;
mod devices;
mod lid;
mod messages;

#[cfg(test)]
mod tests;

pub use chats::{ChatFilter, ChatRow, TruncateStats};
pub use devices::DeviceRow;
pub use messages::{MessageFilter, MessageRow};

use gowa_core::GatewayError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Hard cap on rows returned by any listing or search.
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Page size used when the caller does not supply a limit.
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// Clamp a caller-supplied limit to `[1, MAX_PAGE_SIZE]`.
pub(crate) fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 {
        DEFAULT_PAGE_SIZE
    } else {
        limit.min(MAX_PAGE_SIZE)
    }
}

pub(crate) fn db_err(e: sqlx::Error) -> GatewayError {
    GatewayError::Storage(e.to_string())
}

/// Chat storage handle. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct ChatStorage {
    pool: SqlitePool,
}

impl ChatStorage {
    /// Open (or create) the store at `path`, running migrations.
    /// `None` opens an in-memory database, used when chat storage is
    /// disabled by config and in tests.
    pub async fn open(path: Option<&Path>) -> Result<Self, GatewayError> {
        let (url, max_connections) = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                (format!("sqlite:{}", path.display()), 4)
            }
            // A pooled in-memory database must stay on one connection or
            // every checkout would see a different empty database.
            None => ("sqlite::memory:".to_string(), 1),
        };

        let mut opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| GatewayError::Storage(format!("invalid db path: {e}")))?
            .create_if_missing(true);
        if path.is_some() {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| GatewayError::Storage(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("chat storage initialized at {url}");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the migration tail past the current schema version.
    ///
    /// Each migration runs inside a transaction that also records the new
    /// version in `schema_info`. Migrations are additive only.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), GatewayError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_info (
                version INTEGER PRIMARY KEY,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| GatewayError::Storage(format!("failed to create schema_info: {e}")))?;

        let (current,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_info")
                .fetch_one(pool)
                .await
                .map_err(db_err)?;

        let migrations: &[(i64, &str)] = &[
            (1, include_str!("../migrations/001_init.sql")),
            (2, include_str!("../migrations/002_indexes.sql")),
            (3, include_str!("../migrations/003_devices.sql")),
            (4, include_str!("../migrations/004_lid_map.sql")),
        ];

        for (version, sql) in migrations {
            if *version <= current {
                continue;
            }

            let mut tx = pool.begin().await.map_err(db_err)?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| GatewayError::Storage(format!("migration {version} failed: {e}")))?;
            sqlx::query("INSERT INTO schema_info (version) VALUES (?)")
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    GatewayError::Storage(format!("failed to record migration {version}: {e}"))
                })?;
            tx.commit().await.map_err(db_err)?;

            info!(version, "applied chat storage migration");
        }

        Ok(())
    }

    /// Current schema version.
    pub async fn schema_version(&self) -> Result<i64, GatewayError> {
        let (version,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_info")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(version)
    }

    /// `(chat_count, message_count)` across all devices in this store.
    pub async fn get_statistics(&self) -> Result<(i64, i64), GatewayError> {
        let (chats,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chats")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let (messages,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok((chats, messages))
    }
}
