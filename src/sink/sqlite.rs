// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable replica backed by SQLite.
//!
//! One database file per namespace under the data directory. Two tables:
//!
//! ```text
//! kv              (key TEXT PRIMARY KEY, value BLOB)
//! replica_offset  (namespace PK, segment_id, record_offset, updated_at)
//! ```
//!
//! Each apply runs in a single transaction that writes the records and the
//! new offset together, so the stored offset never runs ahead of (or behind)
//! the stored data. The in-memory offset is published only after commit.
//!
//! ```text
//! BEGIN → upsert/delete records → upsert replica_offset → COMMIT → publish
//!         (any failure here drops the tx = ROLLBACK, offset unchanged)
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (5
//! attempts, 10ms doubling to 500ms). Other errors surface immediately.

use super::{pending_records, ApplyError, ApplySink, BoxFuture, SinkResult};
use crate::batch::{WalBatch, WalOp, WalRecord};
use crate::error::{RelayError, Result};
use crate::offset::{Offset, OffsetCell};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Failure inside an apply transaction.
#[derive(Debug)]
enum TxError {
    Sql(sqlx::Error),
    Malformed { offset: Offset, reason: String },
}

impl From<sqlx::Error> for TxError {
    fn from(e: sqlx::Error) -> Self {
        Self::Sql(e)
    }
}

impl From<TxError> for ApplyError {
    fn from(e: TxError) -> Self {
        match e {
            TxError::Sql(e) => ApplyError::Storage(e.to_string()),
            TxError::Malformed { offset, reason } => ApplyError::Malformed { offset, reason },
        }
    }
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a transaction with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, TxError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, TxError>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(TxError::Sql(e)) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_sqlite_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

fn to_sql_offset(offset: Offset) -> std::result::Result<(i64, i64), TxError> {
    match (i64::try_from(offset.segment_id), i64::try_from(offset.offset)) {
        (Ok(segment_id), Ok(record_offset)) => Ok((segment_id, record_offset)),
        _ => Err(TxError::Malformed {
            offset,
            reason: "offset exceeds SQLite integer range".to_string(),
        }),
    }
}

async fn write_records(
    pool: &SqlitePool,
    namespace: &str,
    records: &[&WalRecord],
    position: Offset,
) -> std::result::Result<(), TxError> {
    let mut tx = pool.begin().await?;

    for record in records {
        match record.op {
            WalOp::Put => {
                let value = record.value.as_deref().ok_or_else(|| TxError::Malformed {
                    offset: record.offset,
                    reason: "PUT without value".to_string(),
                })?;
                sqlx::query(
                    "INSERT INTO kv (key, value) VALUES (?, ?) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .bind(&record.key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            }
            WalOp::Delete => {
                sqlx::query("DELETE FROM kv WHERE key = ?")
                    .bind(&record.key)
                    .execute(&mut *tx)
                    .await?;
            }
        }
    }

    let (segment_id, record_offset) = to_sql_offset(position)?;
    sqlx::query(
        "INSERT INTO replica_offset (namespace, segment_id, record_offset, updated_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(namespace) DO UPDATE SET \
         segment_id = excluded.segment_id, \
         record_offset = excluded.record_offset, \
         updated_at = excluded.updated_at",
    )
    .bind(namespace)
    .bind(segment_id)
    .bind(record_offset)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Durable key/value replica in SQLite.
pub struct SqliteSink {
    pool: SqlitePool,
    namespace: String,
    path: PathBuf,
    offset: OffsetCell,
    /// Serializes applies so the filter-then-write sequence sees a stable offset.
    apply_lock: Mutex<()>,
}

impl SqliteSink {
    /// Open (or create) the replica for `namespace` under `data_dir`.
    ///
    /// The directory must exist. Restores the durable offset from a
    /// previous run.
    pub async fn open(data_dir: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        let path = data_dir.as_ref().join(format!("{}.db", namespace));
        info!(path = %path.display(), namespace = %namespace, "Opening replica store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| RelayError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2) // single writer plus readers
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replica_offset (
                namespace TEXT PRIMARY KEY,
                segment_id INTEGER NOT NULL,
                record_offset INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT segment_id, record_offset FROM replica_offset WHERE namespace = ?",
        )
        .bind(namespace)
        .fetch_optional(&pool)
        .await?;

        let restored = match row {
            Some((segment_id, record_offset)) => {
                let (Ok(segment_id), Ok(offset)) = (u64::try_from(segment_id), u64::try_from(record_offset)) else {
                    return Err(RelayError::Internal(format!(
                        "negative offset stored for namespace '{}': {}-{}",
                        namespace, segment_id, record_offset
                    )));
                };
                let offset = Offset::new(segment_id, offset);
                info!(offset = %offset, "Restored replica offset from previous run");
                Some(offset)
            }
            None => None,
        };

        Ok(Self {
            pool,
            namespace: namespace.to_string(),
            path,
            offset: OffsetCell::new(restored),
            apply_lock: Mutex::new(()),
        })
    }

    /// Fetch a replicated value.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Number of keys in the replica.
    pub async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
                .map_err(TxError::from)
        })
        .await
        .map_err(|e| match e {
            TxError::Sql(e) => RelayError::Storage(e),
            TxError::Malformed { reason, .. } => RelayError::Internal(reason),
        })?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(namespace = %self.namespace, "Replica store closed");
    }

    async fn apply_pending(&self, records: &[&WalRecord], position: Offset) -> SinkResult<()> {
        let pool = &self.pool;
        let namespace = self.namespace.as_str();
        execute_with_retry("apply_batch", || async move {
            write_records(pool, namespace, records, position).await
        })
        .await?;

        self.offset.publish(position);
        Ok(())
    }
}

impl ApplySink for SqliteSink {
    fn current_offset(&self) -> Option<Offset> {
        self.offset.load()
    }

    fn apply_record(&self, record: WalRecord) -> BoxFuture<'_, SinkResult<()>> {
        Box::pin(async move {
            let _guard = self.apply_lock.lock().await;
            if self.offset.load().is_some_and(|c| record.offset <= c) {
                return Ok(());
            }
            self.apply_pending(&[&record], record.offset).await
        })
    }

    fn apply_batch<'a>(&'a self, batch: &'a WalBatch) -> BoxFuture<'a, SinkResult<()>> {
        Box::pin(async move {
            let _guard = self.apply_lock.lock().await;
            let pending = pending_records(batch, self.offset.load());
            if pending.is_empty() {
                return Ok(());
            }
            self.apply_pending(&pending, batch.position()).await
        })
    }
}

/// Namespaces become file names; keep them to a safe alphabet.
fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !namespace.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(RelayError::Config(format!(
            "namespace '{}' must be non-empty and use only [A-Za-z0-9._-]",
            namespace
        )))
    }
}
