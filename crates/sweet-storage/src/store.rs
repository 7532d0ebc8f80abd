use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use sweet_core::{CompanyTicker, Fingerprint, FingerprintRecord, LookupEntry};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

const CREATE_CIK_LOOKUP: &str = r#"
CREATE TABLE IF NOT EXISTS CIK_LOOKUP (
    ID INTEGER PRIMARY KEY,
    CIK VARCHAR(255) NOT NULL,
    TICKER VARCHAR(10) NOT NULL,
    TITLE VARCHAR(100) NOT NULL,
    VIEW_ BOOL NOT NULL
)
"#;

const CREATE_UPDATE_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS UPDATE_HISTORY (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    LAST_UPDATED DATETIME NOT NULL,
    CHECKSUM VARCHAR(64) NOT NULL
)
"#;

// ROWID rather than ID so history tables created without an ID column still order correctly.
const SELECT_LATEST: &str =
    "SELECT ROWID AS ID, LAST_UPDATED, CHECKSUM FROM UPDATE_HISTORY ORDER BY ROWID DESC LIMIT 1";

const INSERT_IF_CHANGED: &str = r#"
INSERT INTO UPDATE_HISTORY (LAST_UPDATED, CHECKSUM)
SELECT ?1, ?2
WHERE NOT EXISTS (
    SELECT 1 FROM (
        SELECT CHECKSUM FROM UPDATE_HISTORY ORDER BY ROWID DESC LIMIT 1
    ) AS latest
    WHERE latest.CHECKSUM = ?2
)
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("store operation {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("corrupt history row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Append-only log of payload fingerprints.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Creates the backing tables when missing. Never drops or rewrites data.
    async fn initialize(&self) -> Result<(), StoreError>;

    async fn latest_record(&self) -> Result<Option<FingerprintRecord>, StoreError>;

    async fn latest_fingerprint(&self) -> Result<Option<Fingerprint>, StoreError> {
        Ok(self.latest_record().await?.map(|record| record.fingerprint))
    }

    /// Unconditionally appends one record.
    async fn append(
        &self,
        fingerprint: &Fingerprint,
        recorded_at: DateTime<Utc>,
    ) -> Result<FingerprintRecord, StoreError>;

    /// Appends only if `fingerprint` differs from the latest record, with the
    /// comparison and the insert performed as one atomic store operation.
    /// Returns `None` when the latest record already carries `fingerprint`.
    async fn append_if_changed(
        &self,
        fingerprint: &Fingerprint,
        recorded_at: DateTime<Utc>,
    ) -> Result<Option<FingerprintRecord>, StoreError>;

    /// Most recent first.
    async fn history(&self, limit: usize) -> Result<Vec<FingerprintRecord>, StoreError>;
}

/// Write access to the CIK lookup table.
#[async_trait]
pub trait LookupStore: Send + Sync {
    /// Replaces the whole table in one transaction; returns rows written.
    async fn replace_lookup(&self, entries: &[CompanyTicker]) -> Result<u64, StoreError>;

    async fn lookup_entries(&self, limit: usize) -> Result<Vec<LookupEntry>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    op_timeout: Duration,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and its parent directory.
    pub async fn open(path: impl AsRef<Path>, op_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|err| {
                StoreError::Unavailable(format!("creating {}: {err}", parent.display()))
            })?;
        }
        if !fs::try_exists(path).await.unwrap_or(false) {
            info!(path = %path.display(), "database not found, creating a new one");
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(op_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(op_timeout)
            .connect_with(options)
            .await
            .map_err(|err| StoreError::Unavailable(format!("opening {}: {err}", path.display())))?;

        debug!(path = %path.display(), "database connection established");
        Ok(Self { pool, op_timeout })
    }

    /// Opens an existing database file; never creates the file or its directory.
    pub async fn open_existing(path: impl AsRef<Path>, op_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Err(StoreError::Unavailable(format!(
                "database {} does not exist",
                path.display()
            )));
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false)
            .busy_timeout(op_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(op_timeout)
            .connect_with(options)
            .await
            .map_err(|err| StoreError::Unavailable(format!("opening {}: {err}", path.display())))?;
        Ok(Self { pool, op_timeout })
    }

    /// Private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            pool,
            op_timeout: Duration::from_secs(10),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout {
                operation,
                timeout: self.op_timeout,
            })?
    }

    pub async fn lookup_count(&self) -> Result<u64, StoreError> {
        self.bounded("lookup_count", async {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM CIK_LOOKUP")
                .fetch_one(&self.pool)
                .await
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

fn record_from_row(row: &SqliteRow) -> Result<FingerprintRecord, StoreError> {
    let id: i64 = row
        .try_get("ID")
        .map_err(|err| StoreError::Unavailable(err.to_string()))?;
    let recorded_at: DateTime<Utc> = row.try_get("LAST_UPDATED").map_err(|err| StoreError::Corrupt {
        id,
        reason: format!("LAST_UPDATED: {err}"),
    })?;
    let checksum: String = row.try_get("CHECKSUM").map_err(|err| StoreError::Corrupt {
        id,
        reason: format!("CHECKSUM: {err}"),
    })?;
    let fingerprint = checksum.parse().map_err(|err| StoreError::Corrupt {
        id,
        reason: format!("CHECKSUM: {err}"),
    })?;
    Ok(FingerprintRecord {
        id,
        recorded_at,
        fingerprint,
    })
}

#[async_trait]
impl FingerprintStore for SqliteStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.bounded("initialize", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            for (table, ddl) in [
                ("CIK_LOOKUP", CREATE_CIK_LOOKUP),
                ("UPDATE_HISTORY", CREATE_UPDATE_HISTORY),
            ] {
                debug!(table, "ensuring table exists");
                sqlx::query(ddl)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| StoreError::Unavailable(format!("creating {table}: {err}")))?;
            }
            tx.commit()
                .await
                .map_err(|err| StoreError::Unavailable(err.to_string()))
        })
        .await
    }

    async fn latest_record(&self) -> Result<Option<FingerprintRecord>, StoreError> {
        self.bounded("latest_record", async {
            let row = sqlx::query(SELECT_LATEST)
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            row.as_ref().map(record_from_row).transpose()
        })
        .await
    }

    async fn append(
        &self,
        fingerprint: &Fingerprint,
        recorded_at: DateTime<Utc>,
    ) -> Result<FingerprintRecord, StoreError> {
        self.bounded("append", async {
            let result = sqlx::query("INSERT INTO UPDATE_HISTORY (LAST_UPDATED, CHECKSUM) VALUES (?1, ?2)")
                .bind(recorded_at)
                .bind(fingerprint.to_hex())
                .execute(&self.pool)
                .await
                .map_err(|err| StoreError::WriteFailed(err.to_string()))?;
            Ok(FingerprintRecord {
                id: result.last_insert_rowid(),
                recorded_at,
                fingerprint: *fingerprint,
            })
        })
        .await
    }

    async fn append_if_changed(
        &self,
        fingerprint: &Fingerprint,
        recorded_at: DateTime<Utc>,
    ) -> Result<Option<FingerprintRecord>, StoreError> {
        self.bounded("append_if_changed", async {
            let result = sqlx::query(INSERT_IF_CHANGED)
                .bind(recorded_at)
                .bind(fingerprint.to_hex())
                .execute(&self.pool)
                .await
                .map_err(|err| StoreError::WriteFailed(err.to_string()))?;
            if result.rows_affected() == 0 {
                return Ok(None);
            }
            Ok(Some(FingerprintRecord {
                id: result.last_insert_rowid(),
                recorded_at,
                fingerprint: *fingerprint,
            }))
        })
        .await
    }

    async fn history(&self, limit: usize) -> Result<Vec<FingerprintRecord>, StoreError> {
        self.bounded("history", async {
            let rows = sqlx::query(
                "SELECT ROWID AS ID, LAST_UPDATED, CHECKSUM FROM UPDATE_HISTORY ORDER BY ROWID DESC LIMIT ?1",
            )
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            rows.iter().map(record_from_row).collect()
        })
        .await
    }
}

#[async_trait]
impl LookupStore for SqliteStore {
    async fn replace_lookup(&self, entries: &[CompanyTicker]) -> Result<u64, StoreError> {
        self.bounded("replace_lookup", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| StoreError::WriteFailed(err.to_string()))?;
            sqlx::query("DELETE FROM CIK_LOOKUP")
                .execute(&mut *tx)
                .await
                .map_err(|err| StoreError::WriteFailed(err.to_string()))?;

            let mut written = 0u64;
            for entry in entries {
                written += sqlx::query(
                    "INSERT INTO CIK_LOOKUP (CIK, TICKER, TITLE, VIEW_) VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(&entry.cik)
                .bind(&entry.ticker)
                .bind(&entry.title)
                .bind(true)
                .execute(&mut *tx)
                .await
                .map_err(|err| StoreError::WriteFailed(err.to_string()))?
                .rows_affected();
            }

            tx.commit()
                .await
                .map_err(|err| StoreError::WriteFailed(err.to_string()))?;
            Ok(written)
        })
        .await
    }

    async fn lookup_entries(&self, limit: usize) -> Result<Vec<LookupEntry>, StoreError> {
        self.bounded("lookup_entries", async {
            let rows = sqlx::query(
                "SELECT ID, CIK, TICKER, TITLE, VIEW_ FROM CIK_LOOKUP ORDER BY ID ASC LIMIT ?1",
            )
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

            rows.iter()
                .map(|row| {
                    Ok(LookupEntry {
                        id: row.try_get("ID")?,
                        cik: row.try_get("CIK")?,
                        ticker: row.try_get("TICKER")?,
                        title: row.try_get("TITLE")?,
                        visible: row.try_get("VIEW_")?,
                    })
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()
                .map_err(|err| StoreError::Unavailable(err.to_string()))
        })
        .await
    }
}
