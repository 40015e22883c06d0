use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DeviceRecord, DeviceStore, RecordSet, StoreError};

/// Process-local store, used when no store file is configured.
#[derive(Default)]
pub struct MemoryDeviceStore {
    records: Mutex<RecordSet>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<DeviceRecord>) -> Self {
        Self {
            records: Mutex::new(RecordSet::from_records(records)),
        }
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
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
        Ok(self.records.lock().await.save(record))
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .update(id, |r| r.monitoring_enabled = enabled)
    }

    async fn set_threshold(&self, id: &str, threshold: f64) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .update(id, |r| r.change_threshold = Some(threshold))
    }

    async fn set_interval(&self, id: &str, interval_ms: u64) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .update(id, |r| r.interval_ms = Some(interval_ms))
    }
}
