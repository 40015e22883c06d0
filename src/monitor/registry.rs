//! Owned map of monitored targets and their timers.
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use super::models::{MonitorTarget, TargetKind};

pub type SharedTarget = Arc<Mutex<MonitorTarget>>;

/// A running per-target timer task and the means to stop it.
pub struct TimerHandle {
    pub(crate) handle: JoinHandle<()>,
    pub(crate) shutdown_tx: oneshot::Sender<()>,
}

impl TimerHandle {
    /// Stops further ticks. A poll already in flight is left to finish.
    pub fn cancel(self) -> JoinHandle<()> {
        if self.shutdown_tx.send(()).is_err() {
            warn!("Failed to send shutdown signal to timer task; it might have already finished.");
        }
        self.handle
    }
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    pub address: String,
    pub kind: TargetKind,
    pub target: SharedTarget,
    /// Serialises poll cycles of this target.
    pub poll_guard: Arc<Mutex<()>>,
}

struct Slot {
    entry: RegistryEntry,
    timer: Option<TimerHandle>,
}

#[derive(Default)]
pub struct TargetRegistry {
    slots: RwLock<HashMap<String, Slot>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a new entry, or returns the existing one for the same id.
    pub fn try_insert(&self, entry: RegistryEntry) -> Result<(), RegistryEntry> {
        let mut slots = self.write();
        if let Some(existing) = slots.get(&entry.id) {
            return Err(existing.entry.clone());
        }
        slots.insert(entry.id.clone(), Slot { entry, timer: None });
        Ok(())
    }

    /// Installs `timer` for `id`, returning the timer it replaced. If the entry
    /// is gone the new timer is handed back so the caller can cancel it.
    pub fn attach_timer(&self, id: &str, timer: TimerHandle) -> Result<Option<TimerHandle>, TimerHandle> {
        let mut slots = self.write();
        match slots.get_mut(id) {
            Some(slot) => Ok(slot.timer.replace(timer)),
            None => Err(timer),
        }
    }

    pub fn remove(&self, id: &str) -> Option<(RegistryEntry, Option<TimerHandle>)> {
        self.write().remove(id).map(|slot| (slot.entry, slot.timer))
    }

    pub fn drain(&self) -> Vec<(RegistryEntry, Option<TimerHandle>)> {
        self.write()
            .drain()
            .map(|(_, slot)| (slot.entry, slot.timer))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<RegistryEntry> {
        self.read().get(id).map(|slot| slot.entry.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn has_timer(&self, id: &str) -> bool {
        self.read().get(id).is_some_and(|slot| slot.timer.is_some())
    }

    pub fn timer_count(&self) -> usize {
        self.read().values().filter(|slot| slot.timer.is_some()).count()
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<_> = self.read().values().map(|slot| slot.entry.clone()).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        entries
    }

    /// Resolves an operator-supplied identifier: exact id, then exact address,
    /// then case-insensitive name.
    pub fn resolve(&self, identifier: &str) -> Vec<RegistryEntry> {
        let needle = identifier.trim();
        if needle.is_empty() {
            return Vec::new();
        }
        let slots = self.read();
        if let Some(slot) = slots.get(needle) {
            return vec![slot.entry.clone()];
        }

        let lowered = needle.to_lowercase();
        let passes: [&dyn Fn(&RegistryEntry) -> bool; 2] = [
            &|e: &RegistryEntry| e.address.eq_ignore_ascii_case(needle),
            &|e: &RegistryEntry| e.name.to_lowercase() == lowered,
        ];
        for matches in passes {
            let found = Self::collect(&slots, |e| matches(e));
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }

    /// Targets whose name contains `fragment`, ignoring case. Only used to
    /// suggest candidates; commands never act on these.
    pub fn suggest(&self, fragment: &str) -> Vec<RegistryEntry> {
        let lowered = fragment.trim().to_lowercase();
        if lowered.is_empty() {
            return Vec::new();
        }
        Self::collect(&self.read(), |e| e.name.to_lowercase().contains(&lowered))
    }

    fn collect(slots: &HashMap<String, Slot>, keep: impl Fn(&RegistryEntry) -> bool) -> Vec<RegistryEntry> {
        let mut found: Vec<_> = slots
            .values()
            .map(|slot| &slot.entry)
            .filter(|e| keep(e))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }
}
