use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ReportingError, Result};
use crate::files::UploadedFile;
use crate::run::{RunId, RunRecord, RunStatus, RunTransition};

mod sqlite;

pub use sqlite::{connect, connect_with_settings, DbPool, SqliteStore};

/// Persistence for run records.
///
/// Implementations serialize updates to the same record and never make
/// updates to different records contend. `update` only moves a record
/// forward; anything else fails with `InvalidTransition` and leaves the
/// stored record as it was.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, record: RunRecord) -> Result<RunRecord>;

    async fn get(&self, id: &RunId) -> Result<RunRecord>;

    async fn update(&self, id: &RunId, transition: RunTransition, now: DateTime<Utc>) -> Result<RunRecord>;

    /// Oldest first.
    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>>;
}

/// Durable rows behind a `FileRegistry`, tombstoned uploads included.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Inserts or replaces the row for `file.id`.
    async fn save_upload(&self, file: &UploadedFile) -> Result<()>;

    async fn list_uploads(&self) -> Result<Vec<UploadedFile>>;
}

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    records: RwLock<HashMap<RunId, Arc<Mutex<RunRecord>>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &RunId) -> Result<Arc<Mutex<RunRecord>>> {
        let records = self.records.read().map_err(ReportingError::poisoned)?;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| ReportingError::RunNotFound(id.to_string()))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, record: RunRecord) -> Result<RunRecord> {
        let mut records = self.records.write().map_err(ReportingError::poisoned)?;
        if records.contains_key(&record.id) {
            return Err(ReportingError::Storage(format!("run {} already exists", record.id)));
        }
        records.insert(record.id.clone(), Arc::new(Mutex::new(record.clone())));
        Ok(record)
    }

    async fn get(&self, id: &RunId) -> Result<RunRecord> {
        let slot = self.slot(id)?;
        let record = slot.lock().map_err(ReportingError::poisoned)?;
        Ok(record.clone())
    }

    async fn update(&self, id: &RunId, transition: RunTransition, now: DateTime<Utc>) -> Result<RunRecord> {
        // The map lock is released before the record lock is taken.
        let slot = self.slot(id)?;
        let mut record = slot.lock().map_err(ReportingError::poisoned)?;
        record.apply(transition, now)?;
        Ok(record.clone())
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>> {
        let slots: Vec<_> = {
            let records = self.records.read().map_err(ReportingError::poisoned)?;
            records.values().cloned().collect()
        };

        let mut matching = Vec::new();
        for slot in slots {
            let record = slot.lock().map_err(ReportingError::poisoned)?;
            if record.status == status {
                matching.push(record.clone());
            }
        }
        matching.sort_by_key(|r| r.started_at);
        Ok(matching)
    }
}
