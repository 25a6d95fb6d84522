//! Backing stores for firmware metadata.

use super::FirmwareRecord;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::path::PathBuf;

/// Source of truth for firmware metadata, consulted by value; the store
/// never holds session state.
#[async_trait]
pub trait FirmwareStore: Send + Sync {
    /// All records whose `codename` field matches exactly.
    async fn records_for(&self, codename: &str) -> Result<Vec<FirmwareRecord>>;
}

/// In-memory store, used by tests and the daemon's mock mode.
#[derive(Default)]
pub struct MemoryStore {
    records: Vec<FirmwareRecord>,
}

impl MemoryStore {
    pub fn new(records: Vec<FirmwareRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl FirmwareStore for MemoryStore {
    async fn records_for(&self, codename: &str) -> Result<Vec<FirmwareRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.codename == codename)
            .cloned()
            .collect())
    }
}

/// Store backed by a JSON file holding an array of records. Reread on every
/// fetch; the catalog's TTL cache keeps that cheap.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FirmwareStore for JsonFileStore {
    async fn records_for(&self, codename: &str) -> Result<Vec<FirmwareRecord>> {
        let raw = tokio::fs::read(&self.path).await?;
        let records: Vec<FirmwareRecord> = serde_json::from_slice(&raw).map_err(|e| {
            CoreError::InvalidParameter(format!(
                "catalog file {} is not valid: {e}",
                self.path.display()
            ))
        })?;
        Ok(records.into_iter().filter(|r| r.codename == codename).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::record;

    #[tokio::test]
    async fn test_memory_store_filters_by_codename() {
        let store = MemoryStore::new(vec![
            record("fw-1", "guacamole", "11.0"),
            record("fw-2", "hotdog", "11.0"),
        ]);
        let records = store.records_for("guacamole").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "fw-1");
    }

    #[tokio::test]
    async fn test_json_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let records = vec![record("fw-1", "guacamole", "11.0")];
        tokio::fs::write(&path, serde_json::to_vec(&records).unwrap())
            .await
            .unwrap();

        let store = JsonFileStore::new(&path);
        let loaded = store.records_for("guacamole").await.unwrap();
        assert_eq!(loaded, records);
        assert!(store.records_for("hotdog").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let err = JsonFileStore::new(&path).records_for("guacamole").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidParameter(_)));
    }
}
