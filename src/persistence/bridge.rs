use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{DeviceRecord, DeviceStore, StoreError};
use crate::monitor::models::TargetKind;
use crate::monitor::scheduler::{ReconfiguredTarget, RegisterOutcome, Scheduler, SettingChange};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No device store is configured")]
    NoStore,
    #[error("No persisted device matches '{0}'")]
    NotFound(String),
    #[error("'{identifier}' matches several devices ({}); use one of the ids", candidates.join(", "))]
    Ambiguous {
        identifier: String,
        candidates: Vec<String>,
    },
    #[error("Record {0} is not part of a pending conflict")]
    NoSuchConflict(String),
    #[error("Address {address} has several enabled records; resolve the conflict by keeping one of: {}", choices.join(", "))]
    Conflicted { address: String, choices: Vec<String> },
    #[error("Address {address} is already monitored through record {record_id}; disable it first")]
    AddressInUse { address: String, record_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictChoice {
    pub id: String,
    pub label: String,
    pub kind: TargetKind,
}

/// Enabled records sharing one address. None of them runs until one is kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictGroup {
    pub address: String,
    pub choices: Vec<ConflictChoice>,
}

impl ConflictGroup {
    fn choice_ids(&self) -> Vec<String> {
        self.choices.iter().map(|c| c.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub started: Vec<String>,
    pub conflicts: usize,
}

/// Keeps persisted device records and the live scheduler in step.
pub struct PersistenceBridge {
    store: Option<Arc<dyn DeviceStore>>,
    conflicts: Mutex<Vec<ConflictGroup>>,
}

impl PersistenceBridge {
    pub fn new(store: Option<Arc<dyn DeviceStore>>) -> Self {
        Self {
            store,
            conflicts: Mutex::new(Vec::new()),
        }
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    fn store(&self) -> Result<&Arc<dyn DeviceStore>, BridgeError> {
        self.store.as_ref().ok_or(BridgeError::NoStore)
    }

    /// Starts every enabled record whose address is unique among enabled
    /// records; shared addresses become pending conflicts instead.
    pub async fn load(&self, scheduler: &Scheduler) -> LoadReport {
        let Some(store) = &self.store else {
            return LoadReport::default();
        };
        let records = match store.list_monitored().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to load persisted devices; continuing in memory only.");
                return LoadReport::default();
            }
        };

        let mut by_address: BTreeMap<String, Vec<DeviceRecord>> = BTreeMap::new();
        for record in records {
            by_address.entry(record.address_key()).or_default().push(record);
        }

        let mut report = LoadReport::default();
        let mut pending = Vec::new();
        for (address, mut group) in by_address {
            if group.len() == 1 {
                if let Some(record) = group.pop() {
                    let target = record.to_target(scheduler.defaults());
                    report.started.push(target.id.clone());
                    scheduler.register(target).await;
                }
                continue;
            }
            warn!(address = %address, count = group.len(), "Several enabled devices share an address; waiting for a choice.");
            pending.push(ConflictGroup {
                address,
                choices: group
                    .iter()
                    .map(|r| ConflictChoice {
                        id: r.id.clone(),
                        label: r.display_name(),
                        kind: r.kind,
                    })
                    .collect(),
            });
        }
        report.conflicts = pending.len();
        *self.conflicts.lock().await = pending;
        info!(started = report.started.len(), conflicts = report.conflicts, "Persisted devices loaded.");
        report
    }

    pub async fn conflicts(&self) -> Vec<ConflictGroup> {
        self.conflicts.lock().await.clone()
    }

    /// The pending conflict for `address`, if any.
    pub async fn conflict_for(&self, address: &str) -> Option<ConflictGroup> {
        let key = address.trim().to_lowercase();
        self.conflicts
            .lock()
            .await
            .iter()
            .find(|g| g.address == key)
            .cloned()
    }

    /// Keeps `keep_id`, disables the rest of its group and starts it.
    pub async fn resolve_conflict(
        &self,
        keep_id: &str,
        scheduler: &Scheduler,
    ) -> Result<RegisterOutcome, BridgeError> {
        let store = self.store()?;
        let group = {
            let conflicts = self.conflicts.lock().await;
            conflicts
                .iter()
                .find(|g| g.choices.iter().any(|c| c.id == keep_id))
                .cloned()
                .ok_or_else(|| BridgeError::NoSuchConflict(keep_id.to_string()))?
        };

        let record = store
            .get_by_id(keep_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(keep_id.to_string()))?;
        for choice in group.choices.iter().filter(|c| c.id != keep_id) {
            if let Err(e) = store.set_enabled(&choice.id, false).await {
                error!(record_id = %choice.id, error = %e, "Failed to disable conflicting record.");
            }
        }
        store.set_enabled(keep_id, true).await?;

        self.conflicts
            .lock()
            .await
            .retain(|g| g.address != group.address);
        info!(address = %group.address, record_id = %keep_id, "Address conflict resolved.");
        Ok(scheduler.register(record.to_target(scheduler.defaults())).await)
    }

    /// Finds a record by id, then by address, then by label.
    pub async fn find_record(&self, identifier: &str) -> Result<DeviceRecord, BridgeError> {
        let store = self.store()?;
        let needle = identifier.trim();
        if let Some(record) = store.get_by_id(needle).await? {
            return Ok(record);
        }

        let mut matches = store.get_by_ip(needle).await?;
        if matches.is_empty() {
            matches = store
                .list_all()
                .await?
                .into_iter()
                .filter(|r| r.label.as_deref().is_some_and(|l| l.eq_ignore_ascii_case(needle)))
                .collect();
        }
        match matches.len() {
            0 => Err(BridgeError::NotFound(needle.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(BridgeError::Ambiguous {
                identifier: needle.to_string(),
                candidates: matches.into_iter().map(|r| r.id).collect(),
            }),
        }
    }

    /// Marks a record enabled and starts monitoring it.
    pub async fn enable(&self, identifier: &str, scheduler: &Scheduler) -> Result<RegisterOutcome, BridgeError> {
        let record = self.find_record(identifier).await?;
        if let Some(group) = self.conflict_for(&record.address).await {
            if group.choices.iter().any(|c| c.id == record.id) {
                return self.resolve_conflict(&record.id, scheduler).await;
            }
            return Err(BridgeError::Conflicted {
                address: group.address.clone(),
                choices: group.choice_ids(),
            });
        }

        let store = self.store()?;
        if let Some(other) = store
            .get_by_ip(&record.address)
            .await?
            .into_iter()
            .find(|r| r.monitoring_enabled && r.id != record.id)
        {
            return Err(BridgeError::AddressInUse {
                address: record.address.clone(),
                record_id: other.id,
            });
        }

        store.set_enabled(&record.id, true).await?;
        Ok(scheduler.register(record.to_target(scheduler.defaults())).await)
    }

    /// Stops any monitor for the record and persists it as disabled.
    /// Returns the record that was disabled.
    pub async fn disable(&self, identifier: &str, scheduler: &Scheduler) -> Result<DeviceRecord, BridgeError> {
        let record = self.find_record(identifier).await?;
        for entry in scheduler.registry().entries() {
            let backed = entry.target.lock().await.record_id.as_deref() == Some(record.id.as_str());
            if backed {
                scheduler.unregister(&entry.id).await;
            }
        }
        self.store()?.set_enabled(&record.id, false).await?;
        Ok(record)
    }

    /// Persists the disabled state of a stopped record. Failures are logged.
    pub async fn persist_disabled(&self, record_id: &str) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.set_enabled(record_id, false).await {
            error!(record_id = %record_id, error = %e, "Failed to persist disabled state.");
        }
    }

    /// Attaches a record to an ad-hoc target with the same kind and address.
    pub async fn link_record(&self, kind: TargetKind, address: &str) -> Option<DeviceRecord> {
        let store = self.store.as_ref()?;
        match store.get_by_ip(address).await {
            Ok(records) => {
                let record = records.iter().find(|r| r.kind == kind)?.clone();
                if let Some(other) = records.iter().find(|r| r.monitoring_enabled && r.id != record.id) {
                    warn!(
                        address = %address,
                        record_id = %record.id,
                        enabled_record = %other.id,
                        "Address already monitored through another record; not linking."
                    );
                    return None;
                }
                if !record.monitoring_enabled {
                    if let Err(e) = store.set_enabled(&record.id, true).await {
                        error!(record_id = %record.id, error = %e, "Failed to persist enabled state.");
                    }
                }
                Some(record)
            }
            Err(e) => {
                error!(address = %address, error = %e, "Device lookup failed.");
                None
            }
        }
    }

    /// Writes target-scoped setting changes through to their records.
    pub async fn mirror(&self, changed: &[ReconfiguredTarget], change: SettingChange) {
        let Some(store) = &self.store else { return };
        for target in changed {
            let Some(record_id) = &target.record_id else { continue };
            let result = match change {
                SettingChange::Threshold(value) => store.set_threshold(record_id, value).await,
                SettingChange::Interval(ms) => store.set_interval(record_id, ms).await,
            };
            if let Err(e) = result {
                error!(record_id = %record_id, target_id = %target.id, error = %e, "Failed to mirror setting change.");
            }
        }
    }
}
