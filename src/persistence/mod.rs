//! Persisted device records and the bridge that turns them into monitors.
pub mod bridge;
pub mod json_file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::monitor::models::{MonitorDefaults, MonitorTarget, TargetKind, TargetSpec, derive_target_id};

pub use bridge::{BridgeError, ConflictChoice, ConflictGroup, LoadReport, PersistenceBridge};
pub use json_file::JsonFileDeviceStore;
pub use memory::MemoryDeviceStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Device record not found: {0}")]
    NotFound(String),
    #[error("Failed to access device store at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Device store data is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub address: String,
    #[serde(default)]
    pub kind: TargetKind,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub http_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub stream_path: Option<String>,
    #[serde(default)]
    pub monitoring_enabled: bool,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub change_threshold: Option<f64>,
    #[serde(default)]
    pub last_snapshot_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl DeviceRecord {
    pub fn new(kind: TargetKind, address: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            label: None,
            address: address.into(),
            kind,
            stream_url: None,
            http_url: None,
            username: None,
            password: None,
            stream_path: None,
            monitoring_enabled: false,
            interval_ms: None,
            change_threshold: None,
            last_snapshot_at: None,
            notes: None,
        }
    }

    pub fn display_name(&self) -> String {
        self.label
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| format!("{} {}", self.kind, self.address))
    }

    /// Address key used to group records that would monitor the same thing.
    pub fn address_key(&self) -> String {
        self.address.trim().to_lowercase()
    }

    /// Builds a monitor for this record. Unset interval and threshold fall back
    /// to `defaults`; stored values count as per-target overrides.
    pub fn to_target(&self, defaults: MonitorDefaults) -> MonitorTarget {
        let address = self.address.trim().to_string();
        let spec = TargetSpec {
            kind: self.kind,
            name: Some(self.display_name()),
            address: Some(address.clone()),
            stream_url: self.stream_url.clone(),
            http_url: self.http_url.clone(),
            stream_path: self.stream_path.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            interval_ms: self.interval_ms,
            threshold: self.change_threshold,
        };
        let mut target = MonitorTarget::from_spec(derive_target_id(self.kind, &address), address, spec, defaults);
        target.record_id = Some(self.id.clone());
        target
    }
}

/// Storage of device records. Implementations serialise their own writes.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<DeviceRecord>, StoreError>;

    async fn list_monitored(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.monitoring_enabled)
            .collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<DeviceRecord>, StoreError>;

    /// Every record whose address matches `address`, ignoring case.
    async fn get_by_ip(&self, address: &str) -> Result<Vec<DeviceRecord>, StoreError>;

    /// Inserts or replaces a record. An empty id is assigned a fresh one.
    async fn save(&self, record: DeviceRecord) -> Result<DeviceRecord, StoreError>;

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError>;

    async fn set_threshold(&self, id: &str, threshold: f64) -> Result<(), StoreError>;

    async fn set_interval(&self, id: &str, interval_ms: u64) -> Result<(), StoreError>;
}

/// Record map shared by the store implementations.
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordSet {
    records: BTreeMap<String, DeviceRecord>,
}

impl RecordSet {
    pub(crate) fn from_records(records: Vec<DeviceRecord>) -> Self {
        let mut set = Self::default();
        for record in records {
            set.save(record);
        }
        set
    }

    pub(crate) fn all(&self) -> Vec<DeviceRecord> {
        self.records.values().cloned().collect()
    }

    pub(crate) fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.records.get(id).cloned()
    }

    pub(crate) fn by_address(&self, address: &str) -> Vec<DeviceRecord> {
        let key = address.trim().to_lowercase();
        self.records
            .values()
            .filter(|r| r.address_key() == key)
            .cloned()
            .collect()
    }

    pub(crate) fn save(&mut self, mut record: DeviceRecord) -> DeviceRecord {
        if record.id.trim().is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        self.records.insert(record.id.clone(), record.clone());
        record
    }

    pub(crate) fn update(
        &mut self,
        id: &str,
        apply: impl FnOnce(&mut DeviceRecord),
    ) -> Result<(), StoreError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(record);
        Ok(())
    }
}
