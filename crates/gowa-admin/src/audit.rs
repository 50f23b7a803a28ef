//! Audit log — records every instance operation through the admin API.

use gowa_core::GatewayError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

pub struct AuditEntry {
    pub action: String,
    pub port: Option<u16>,
    pub request_id: String,
    pub result: AuditResult,
    pub error: Option<String>,
    pub duration_ms: i64,
}

pub enum AuditResult {
    Ok,
    Error,
}

impl AuditResult {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// Audit logger backed by SQLite.
#[derive(Clone)]
pub struct AuditLogger {
    pool: SqlitePool,
}

impl AuditLogger {
    /// Open (or create) the audit database. `None` keeps it in memory.
    pub async fn open(path: Option<&Path>) -> Result<Self, GatewayError> {
        let (url, max_connections) = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                (format!("sqlite:{}", path.display()), 2)
            }
            None => ("sqlite::memory:".to_string(), 1),
        };
        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| GatewayError::Storage(format!("invalid audit db path: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| GatewayError::Storage(format!("audit db connect failed: {e}")))?;

        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                action TEXT NOT NULL,
                port INTEGER,
                request_id TEXT NOT NULL,
                result TEXT NOT NULL,
                error TEXT,
                duration_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(&pool)
        .await
        .map_err(|e| GatewayError::Storage(format!("audit table create failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn log(&self, entry: &AuditEntry) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO audit_log (id, action, port, request_id, result, error, duration_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&entry.action)
        .bind(entry.port.map(|p| p as i64))
        .bind(&entry.request_id)
        .bind(entry.result.as_str())
        .bind(&entry.error)
        .bind(entry.duration_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Storage(format!("audit write failed: {e}")))?;

        debug!(
            action = %entry.action,
            port = ?entry.port,
            request_id = %entry.request_id,
            result = entry.result.as_str(),
            "audit"
        );
        Ok(())
    }

    pub async fn count(&self) -> Result<i64, GatewayError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GatewayError::Storage(format!("audit count failed: {e}")))?;
        Ok(count)
    }
}
