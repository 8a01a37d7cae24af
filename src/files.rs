use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ReportingError, Result};
use crate::store::UploadStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(pub String);

impl UploadId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle of a file that already lives on the remote agent service
/// (e.g. an OpenAI `file-…` id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalFileRef(pub String);

impl ExternalFileRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalFileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: UploadId,
    pub external_file_ref: Option<ExternalFileRef>,
    pub filename: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub content_type: Option<String>,
    /// Accounting package the export came from (Xero, QuickBooks, ...), if the
    /// uploader said so.
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UploadedFile {
    #[must_use]
    pub fn new(filename: impl Into<String>, size_bytes: u64, checksum: impl Into<String>) -> Self {
        Self {
            id: UploadId::generate(),
            external_file_ref: None,
            filename: filename.into(),
            size_bytes,
            checksum: checksum.into(),
            content_type: None,
            provider: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn with_external_ref(mut self, handle: ExternalFileRef) -> Self {
        self.external_file_ref = Some(handle);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Maps local upload ids to the remote handles produced by upload intake.
/// Entries are never removed; deletion only tombstones them so the audit
/// trail of which file fed which run survives.
///
/// Reads are served from memory. With a backing `UploadStore` every change
/// is written there before it becomes visible, and `open` reloads the full
/// history, tombstones included.
#[derive(Default)]
pub struct FileRegistry {
    files: RwLock<HashMap<UploadId, UploadedFile>>,
    store: Option<Arc<dyn UploadStore>>,
    writes: Mutex<()>,
}

impl FileRegistry {
    /// Registry kept in memory only.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(store: Arc<dyn UploadStore>) -> Result<Self> {
        let files = store.list_uploads().await?;
        info!("Loaded {} recorded upload(s)", files.len());
        Ok(Self {
            files: RwLock::new(files.into_iter().map(|f| (f.id.clone(), f)).collect()),
            store: Some(store),
            writes: Mutex::new(()),
        })
    }

    pub async fn register(&self, file: UploadedFile) -> Result<UploadId> {
        if file.filename.trim().is_empty() {
            return Err(ReportingError::InvalidConfiguration(
                "uploaded file must have a filename".to_string(),
            ));
        }

        let _write = self.writes.lock().await;
        let exists = self
            .files
            .read()
            .map_err(ReportingError::poisoned)?
            .contains_key(&file.id);
        if exists {
            return Err(ReportingError::Storage(format!(
                "upload {} is already registered",
                file.id
            )));
        }

        info!(
            "Registered upload '{}' ({} bytes) as {}",
            file.filename, file.size_bytes, file.id
        );
        let file = self.commit(file).await?;
        Ok(file.id)
    }

    /// Records the remote handle of an upload. The handle is write-once:
    /// repeating the same handle is a no-op, a different one is rejected.
    pub async fn attach_external_ref(&self, id: &UploadId, handle: ExternalFileRef) -> Result<UploadedFile> {
        let _write = self.writes.lock().await;
        let mut file = self.get(id)?;

        if file.is_deleted() {
            return Err(ReportingError::FileUnavailable {
                id: id.to_string(),
                reason: "upload was deleted".to_string(),
            });
        }

        match file.external_file_ref.clone() {
            Some(existing) if existing == handle => Ok(file),
            Some(existing) => Err(ReportingError::FileUnavailable {
                id: id.to_string(),
                reason: format!("already bound to remote file {}", existing),
            }),
            None => {
                debug!("Upload {} bound to remote file {}", id, handle);
                file.external_file_ref = Some(handle);
                self.commit(file).await
            }
        }
    }

    pub fn get(&self, id: &UploadId) -> Result<UploadedFile> {
        let files = self.files.read().map_err(ReportingError::poisoned)?;
        files
            .get(id)
            .cloned()
            .ok_or_else(|| ReportingError::UnknownFile(id.to_string()))
    }

    pub async fn tombstone(&self, id: &UploadId) -> Result<UploadedFile> {
        let _write = self.writes.lock().await;
        let mut file = self.get(id)?;
        if file.is_deleted() {
            return Ok(file);
        }

        info!("Tombstoned upload {} ('{}')", id, file.filename);
        file.deleted_at = Some(Utc::now());
        self.commit(file).await
    }

    /// Resolves upload ids to remote handles, preserving order.
    pub fn resolve(&self, ids: &[UploadId]) -> Result<Vec<ExternalFileRef>> {
        let files = self.files.read().map_err(ReportingError::poisoned)?;
        ids.iter()
            .map(|id| {
                let file = files
                    .get(id)
                    .ok_or_else(|| ReportingError::UnknownFile(id.to_string()))?;
                if file.is_deleted() {
                    return Err(ReportingError::FileUnavailable {
                        id: id.to_string(),
                        reason: "upload was deleted".to_string(),
                    });
                }
                file.external_file_ref
                    .clone()
                    .ok_or_else(|| ReportingError::FileUnavailable {
                        id: id.to_string(),
                        reason: "file has not been transferred to the remote service".to_string(),
                    })
            })
            .collect()
    }

    pub fn list_active(&self) -> Result<Vec<UploadedFile>> {
        let files = self.files.read().map_err(ReportingError::poisoned)?;
        let mut active: Vec<UploadedFile> = files.values().filter(|f| !f.is_deleted()).cloned().collect();
        active.sort_by_key(|f| f.created_at);
        Ok(active)
    }

    /// Callers hold `writes`.
    async fn commit(&self, file: UploadedFile) -> Result<UploadedFile> {
        if let Some(store) = &self.store {
            store.save_upload(&file).await?;
        }
        self.files
            .write()
            .map_err(ReportingError::poisoned)?
            .insert(file.id.clone(), file.clone());
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn transferred(name: &str, handle: &str) -> UploadedFile {
        UploadedFile::new(name, 1024, "sha256:abc").with_external_ref(ExternalFileRef::new(handle))
    }

    #[tokio::test]
    async fn test_resolve_preserves_order() {
        let registry = FileRegistry::new();
        let a = registry.register(transferred("pnl.csv", "file-a")).await.unwrap();
        let b = registry.register(transferred("ledger.xlsx", "file-b")).await.unwrap();

        let refs = registry.resolve(&[b.clone(), a.clone()]).unwrap();
        assert_eq!(refs, vec![ExternalFileRef::new("file-b"), ExternalFileRef::new("file-a")]);
    }

    #[tokio::test]
    async fn test_resolve_rejects_untransferred_and_unknown() {
        let registry = FileRegistry::new();
        let pending = registry.register(UploadedFile::new("bank.csv", 10, "x")).await.unwrap();

        let err = registry.resolve(&[pending]).unwrap_err();
        assert!(matches!(err, ReportingError::FileUnavailable { .. }));

        let err = registry.resolve(&[UploadId("missing".to_string())]).unwrap_err();
        assert!(matches!(err, ReportingError::UnknownFile(_)));
    }

    #[tokio::test]
    async fn test_external_ref_is_write_once() {
        let registry = FileRegistry::new();
        let id = registry.register(UploadedFile::new("bank.csv", 10, "x")).await.unwrap();

        registry.attach_external_ref(&id, ExternalFileRef::new("file-1")).await.unwrap();
        registry.attach_external_ref(&id, ExternalFileRef::new("file-1")).await.unwrap();
        let err = registry
            .attach_external_ref(&id, ExternalFileRef::new("file-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReportingError::FileUnavailable { .. }));
        assert_eq!(
            registry.get(&id).unwrap().external_file_ref,
            Some(ExternalFileRef::new("file-1"))
        );
    }

    #[tokio::test]
    async fn test_tombstone_keeps_the_entry() {
        let registry = FileRegistry::new();
        let id = registry.register(transferred("pnl.csv", "file-a")).await.unwrap();

        registry.tombstone(&id).await.unwrap();

        let file = registry.get(&id).unwrap();
        assert!(file.is_deleted());
        assert!(registry.list_active().unwrap().is_empty());
        assert!(matches!(
            registry.resolve(&[id]).unwrap_err(),
            ReportingError::FileUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_blank_filename_and_duplicates() {
        let registry = FileRegistry::new();
        let err = registry.register(UploadedFile::new("  ", 1, "x")).await.unwrap_err();
        assert!(matches!(err, ReportingError::InvalidConfiguration(_)));

        let file = UploadedFile::new("bank.csv", 1, "x");
        registry.register(file.clone()).await.unwrap();
        let err = registry.register(file).await.unwrap_err();
        assert!(matches!(err, ReportingError::Storage(_)));
    }

    #[tokio::test]
    async fn test_upload_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        let (kept, deleted) = {
            let store = Arc::new(SqliteStore::open(&path).await.unwrap());
            let registry = FileRegistry::open(store.clone()).await.unwrap();
            let kept = registry.register(UploadedFile::new("pnl.csv", 10, "a")).await.unwrap();
            registry.attach_external_ref(&kept, ExternalFileRef::new("file-a")).await.unwrap();
            let deleted = registry.register(transferred("old.csv", "file-old")).await.unwrap();
            registry.tombstone(&deleted).await.unwrap();
            store.pool().close().await;
            (kept, deleted)
        };

        let registry = FileRegistry::open(Arc::new(SqliteStore::open(&path).await.unwrap()))
            .await
            .unwrap();
        assert_eq!(registry.resolve(&[kept.clone()]).unwrap(), vec![ExternalFileRef::new("file-a")]);
        assert!(registry.get(&deleted).unwrap().is_deleted());
        let active: Vec<_> = registry.list_active().unwrap().into_iter().map(|f| f.id).collect();
        assert_eq!(active, vec![kept]);
    }
}
