use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::{DeviceRecord, DeviceStore, RecordSet, StoreError};

/// Device records kept in a JSON array on disk. Every mutation rewrites the
/// file through a temporary sibling and a rename.
pub struct JsonFileDeviceStore {
    path: PathBuf,
    records: Mutex<RecordSet>,
}

impl JsonFileDeviceStore {
    /// Opens the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice::<Vec<DeviceRecord>>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        debug!(path = %path.display(), count = records.len(), "Loaded device records.");
        Ok(Self {
            path,
            records: Mutex::new(RecordSet::from_records(records)),
        })
    }

    async fn persist(&self, set: &RecordSet) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };
        let json = serde_json::to_vec_pretty(&set.all())?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }

    /// Applies `change` to a copy of the records, persists it, then commits it.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut RecordSet) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.records.lock().await;
        let mut next = guard.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(out)
    }
}

#[async_trait]
impl DeviceStore for JsonFileDeviceStore {
    async fn list_all(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.records.lock().await.all())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.records.lock().await.get(id))
    }

    async fn get_by_ip(&self, address: &str) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.records.lock().await.by_address(address))
    }

    async fn save(&self, record: DeviceRecord) -> Result<DeviceRecord, StoreError> {
        self.mutate(|set| Ok(set.save(record))).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        self.mutate(|set| set.update(id, |r| r.monitoring_enabled = enabled))
            .await
    }

    async fn set_threshold(&self, id: &str, threshold: f64) -> Result<(), StoreError> {
        self.mutate(|set| set.update(id, |r| r.change_threshold = Some(threshold)))
            .await
    }

    async fn set_interval(&self, id: &str, interval_ms: u64) -> Result<(), StoreError> {
        self.mutate(|set| set.update(id, |r| r.interval_ms = Some(interval_ms)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::models::TargetKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("devices.json");

        let store = JsonFileDeviceStore::open(&path).await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
        let saved = store
            .save(DeviceRecord {
                label: Some("Porch".into()),
                ..DeviceRecord::new(TargetKind::Camera, "10.0.0.5")
            })
            .await
            .unwrap();
        store.set_enabled(&saved.id, true).await.unwrap();
        store.set_threshold(&saved.id, 0.25).await.unwrap();
        drop(store);

        let reopened = JsonFileDeviceStore::open(&path).await.unwrap();
        let record = reopened.get_by_id(&saved.id).await.unwrap().unwrap();
        assert!(record.monitoring_enabled);
        assert_eq!(record.change_threshold, Some(0.25));
        assert_eq!(record.label.as_deref(), Some("Porch"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_malformed_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileDeviceStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let store = JsonFileDeviceStore::open(&path).await.unwrap();
        store.save(DeviceRecord::new(TargetKind::Camera, "10.0.0.5")).await.unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        assert!(store.set_enabled("missing", true).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }
}
