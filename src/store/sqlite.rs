use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{RunStore, UploadStore};
use crate::error::{ReportingError, Result};
use crate::files::UploadedFile;
use crate::run::{RunId, RunRecord, RunStatus, RunTransition};

pub type DbPool = sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        version INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        record_json TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_runs_status_started_at ON runs (status, started_at)",
    "CREATE TABLE IF NOT EXISTS uploads (
        id TEXT PRIMARY KEY,
        filename TEXT NOT NULL,
        external_file_ref TEXT NULL,
        created_at TEXT NOT NULL,
        deleted_at TEXT NULL,
        record_json TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_uploads_created_at ON uploads (created_at)",
];

pub async fn connect(database_url: &str) -> Result<DbPool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    connect_with_settings(options, 5, 30).await
}

pub async fn connect_with_settings(
    options: SqliteConnectOptions,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool> {
    Ok(pool_options(max_connections, timeout_secs)
        .connect_with(options)
        .await?)
}

fn pool_options(max_connections: u32, timeout_secs: u64) -> SqlitePoolOptions {
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA synchronous = FULL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
}

/// Run records and upload rows in one SQLite database.
///
/// Each run row carries a version; `update` applies the transition to the
/// row it read and writes back only if the version is unchanged, retrying
/// otherwise. Writers on one run therefore serialize without any
/// in-process lock, and writers on different runs never wait on each other
/// beyond SQLite's own write lock.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = connect_with_settings(options, 5, 30).await?;
        debug!("Run store opened at {}", path.display());
        Self::with_pool(pool).await
    }

    /// Private database living as long as the store; for tests and demos.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection to `:memory:` is its own database, so keep exactly one alive.
        let pool = pool_options(1, 30)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: DbPool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn load(&self, id: &RunId) -> Result<(RunRecord, i64)> {
        let row = sqlx::query("SELECT record_json, version FROM runs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ReportingError::RunNotFound(id.to_string()))?;

        let version = row.try_get::<i64, _>("version")?;
        Ok((record_from_row(&row)?, version))
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create(&self, record: RunRecord) -> Result<RunRecord> {
        let inserted = sqlx::query(
            "INSERT INTO runs (id, status, version, started_at, updated_at, record_json)
             VALUES (?, ?, 0, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(record.id.as_str())
        .bind(record.status.as_str())
        .bind(timestamp(record.started_at))
        .bind(timestamp(record.updated_at))
        .bind(serde_json::to_string(&record)?)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(ReportingError::Storage(format!("run {} already exists", record.id)));
        }
        Ok(record)
    }

    async fn get(&self, id: &RunId) -> Result<RunRecord> {
        self.load(id).await.map(|(record, _)| record)
    }

    async fn update(&self, id: &RunId, transition: RunTransition, now: DateTime<Utc>) -> Result<RunRecord> {
        loop {
            let (mut record, version) = self.load(id).await?;
            record.apply(transition.clone(), now)?;

            let written = sqlx::query(
                "UPDATE runs
                 SET status = ?, version = ?, updated_at = ?, record_json = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(record.status.as_str())
            .bind(version + 1)
            .bind(timestamp(record.updated_at))
            .bind(serde_json::to_string(&record)?)
            .bind(id.as_str())
            .bind(version)
            .execute(&self.pool)
            .await?;

            if written.rows_affected() == 1 {
                return Ok(record);
            }
            debug!("Run {} changed underneath {}; re-reading", id, transition.name());
        }
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT id, record_json FROM runs
             WHERE status = ?
             ORDER BY started_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match record_from_row(&row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let id = row.try_get::<String, _>("id").unwrap_or_default();
                    warn!("Skipping unreadable run record {}: {}", id, e);
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl UploadStore for SqliteStore {
    async fn save_upload(&self, file: &UploadedFile) -> Result<()> {
        sqlx::query(
            "INSERT INTO uploads (id, filename, external_file_ref, created_at, deleted_at, record_json)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                external_file_ref = excluded.external_file_ref,
                created_at = excluded.created_at,
                deleted_at = excluded.deleted_at,
                record_json = excluded.record_json",
        )
        .bind(&file.id.0)
        .bind(&file.filename)
        .bind(file.external_file_ref.as_ref().map(|handle| handle.as_str()))
        .bind(timestamp(file.created_at))
        .bind(file.deleted_at.map(timestamp))
        .bind(serde_json::to_string(file)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_uploads(&self) -> Result<Vec<UploadedFile>> {
        let rows = sqlx::query("SELECT record_json FROM uploads ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let uploads = rows
            .iter()
            .map(|row| -> Result<UploadedFile> {
                let json = row.try_get::<String, _>("record_json")?;
                Ok(serde_json::from_str(&json)?)
            })
            .collect::<Result<Vec<_>>>()?;
        info!("Read {} upload row(s)", uploads.len());
        Ok(uploads)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let json = row.try_get::<String, _>("record_json")?;
    Ok(serde_json::from_str(&json)?)
}

/// Fixed-width UTC text, so column order is time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::files::ExternalFileRef;
    use crate::store::tests::{exercise_concurrent_updates, exercise_store, new_record, submitted};

    #[tokio::test]
    async fn test_sqlite_store_contract() {
        exercise_store(&SqliteStore::in_memory().await.unwrap()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_to_one_record_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("runs.db")).await.unwrap();
        exercise_concurrent_updates(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn test_runs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let id = {
            let store = SqliteStore::open(&path).await.unwrap();
            let record = store.create(new_record()).await.unwrap();
            store.update(&record.id, submitted(), Utc::now()).await.unwrap();
            store.pool().close().await;
            record.id
        };

        let reopened = SqliteStore::open(&path).await.unwrap();
        let in_flight = reopened.list_by_status(RunStatus::Submitted).await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].id, id);
        assert_eq!(in_flight[0].remote.as_ref().unwrap().run_id, "run_1");
    }

    #[tokio::test]
    async fn test_status_lookup_uses_index() {
        let store = SqliteStore::in_memory().await.unwrap();
        let plan: Vec<String> = sqlx::query("EXPLAIN QUERY PLAN SELECT id FROM runs WHERE status = ?")
            .bind("pending")
            .fetch_all(store.pool())
            .await
            .unwrap()
            .iter()
            .map(|row| row.get::<String, _>("detail"))
            .collect();
        assert!(
            plan.iter().any(|step| step.contains("idx_runs_status_started_at")),
            "unexpected plan: {:?}",
            plan
        );
    }

    #[tokio::test]
    async fn test_upload_rows_are_upserted() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut file = UploadedFile::new("ledger.csv", 42, "sha256:abc");
        store.save_upload(&file).await.unwrap();

        file.external_file_ref = Some(ExternalFileRef::new("file-9"));
        file.deleted_at = Some(Utc::now());
        store.save_upload(&file).await.unwrap();

        let uploads = store.list_uploads().await.unwrap();
        assert_eq!(uploads, vec![file]);
    }
}
