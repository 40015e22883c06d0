//! Per-target timers over the [`TargetRegistry`].
//!
//! Each target gets one tokio task that ticks at its interval and awaits the
//! poll before the next tick, with missed ticks skipped. A manual poll takes
//! the same per-target guard, so cycles of one target never overlap.
use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::models::{LogKind, MonitorDefaults, MonitorLogEntry, MonitorTarget, TargetSummary};
use super::poll::{PollOutcome, Poller};
use super::registry::{RegistryEntry, SharedTarget, TargetRegistry, TimerHandle};

/// Which targets a settings change applies to. Deserializes from an optional
/// string where absent, `"global"` and `"all"` mean every target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Option<String>")]
pub enum Scope {
    #[default]
    Global,
    Target(String),
}

impl From<Option<String>> for Scope {
    fn from(raw: Option<String>) -> Self {
        match raw.as_deref().map(str::trim) {
            None | Some("") => Scope::Global,
            Some(s) if s.eq_ignore_ascii_case("global") || s.eq_ignore_ascii_case("all") => Scope::Global,
            Some(s) => Scope::Target(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingChange {
    Interval(u64),
    Threshold(f64),
}

pub enum RegisterOutcome {
    Started(TargetSummary),
    AlreadyMonitoring(TargetSummary),
}

/// A target whose settings changed, with the store record to mirror it to.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconfiguredTarget {
    pub id: String,
    pub name: String,
    pub record_id: Option<String>,
}

pub struct Scheduler {
    registry: TargetRegistry,
    defaults: RwLock<MonitorDefaults>,
    poller: Arc<Poller>,
    log_soft_cap: usize,
}

impl Scheduler {
    pub fn new(defaults: MonitorDefaults, poller: Arc<Poller>, log_soft_cap: usize) -> Self {
        Self {
            registry: TargetRegistry::new(),
            defaults: RwLock::new(defaults),
            poller,
            log_soft_cap,
        }
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn defaults(&self) -> MonitorDefaults {
        *self.defaults.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.registry.has_timer(id)
    }

    /// Activates `target` and starts its timer unless its id is already
    /// registered, in which case the existing target is reported untouched.
    pub async fn register(&self, mut target: MonitorTarget) -> RegisterOutcome {
        if let Some(existing) = self.registry.get(&target.id) {
            let summary = existing.target.lock().await.summary(Utc::now());
            return RegisterOutcome::AlreadyMonitoring(summary);
        }

        let now = Utc::now();
        target.active = true;
        target.started_at = now;
        let message = format!(
            "Monitoring started: every {:.1}s, change threshold {:.0}%",
            target.interval_ms as f64 / 1000.0,
            target.threshold * 100.0
        );
        target.push_log(MonitorLogEntry::new(LogKind::Start, message), self.log_soft_cap);

        let summary = target.summary(now);
        let interval_ms = target.interval_ms;
        let entry = RegistryEntry {
            id: target.id.clone(),
            name: target.name.clone(),
            address: target.address.clone(),
            kind: target.kind,
            target: Arc::new(Mutex::new(target)),
            poll_guard: Arc::new(Mutex::new(())),
        };

        if let Err(existing) = self.registry.try_insert(entry.clone()) {
            let summary = existing.target.lock().await.summary(Utc::now());
            return RegisterOutcome::AlreadyMonitoring(summary);
        }

        info!(target_id = %entry.id, kind = %entry.kind, interval_ms, "Monitoring started.");
        self.start_timer(&entry, interval_ms);
        RegisterOutcome::Started(summary)
    }

    /// Stops the timer, marks the target inactive and removes it. A poll
    /// already in flight finishes against the detached target.
    pub async fn unregister(&self, id: &str) -> Option<SharedTarget> {
        let (entry, timer) = self.registry.remove(id)?;
        if let Some(timer) = timer {
            drop(timer.cancel());
        }
        let mut target = entry.target.lock().await;
        target.active = false;
        target.push_log(
            MonitorLogEntry::new(LogKind::Stop, "Monitoring stopped"),
            self.log_soft_cap,
        );
        info!(target_id = %id, "Monitoring stopped.");
        drop(target);
        Some(entry.target)
    }

    /// Applies a settings change. Global scope moves the default and every
    /// target without an override for that field; target scope updates the
    /// resolved targets and marks the field overridden on them.
    pub async fn reconfigure(&self, scope: &Scope, change: SettingChange) -> Vec<ReconfiguredTarget> {
        let (entries, explicit) = match scope {
            Scope::Global => {
                {
                    let mut defaults = self.defaults.write().unwrap_or_else(PoisonError::into_inner);
                    match change {
                        SettingChange::Interval(ms) => defaults.interval_ms = ms,
                        SettingChange::Threshold(value) => defaults.threshold = value.clamp(0.0, 1.0),
                    }
                }
                (self.registry.entries(), false)
            }
            Scope::Target(identifier) => (self.registry.resolve(identifier), true),
        };

        let mut changed = Vec::new();
        for entry in entries {
            let mut target = entry.target.lock().await;
            let restart = match change {
                SettingChange::Interval(ms) => {
                    if !explicit && target.interval_overridden {
                        continue;
                    }
                    target.interval_overridden |= explicit;
                    let restart = target.interval_ms != ms;
                    target.interval_ms = ms;
                    restart
                }
                SettingChange::Threshold(value) => {
                    if !explicit && target.threshold_overridden {
                        continue;
                    }
                    target.threshold_overridden |= explicit;
                    target.threshold = value.clamp(0.0, 1.0);
                    false
                }
            };
            changed.push(ReconfiguredTarget {
                id: target.id.clone(),
                name: target.name.clone(),
                record_id: target.record_id.clone(),
            });
            let interval_ms = target.interval_ms;
            drop(target);

            if restart {
                debug!(target_id = %entry.id, interval_ms, "Restarting timer with new interval.");
                self.start_timer(&entry, interval_ms);
            }
        }
        changed
    }

    /// Runs one poll cycle now, outside the timer. Waits for a cycle already
    /// in flight for the same target.
    pub async fn poll_now(&self, id: &str) -> Option<PollOutcome> {
        let entry = self.registry.get(id)?;
        Some(self.poller.poll(&entry.target, &entry.poll_guard).await)
    }

    pub async fn summaries(&self) -> Vec<TargetSummary> {
        let now = Utc::now();
        let mut summaries = Vec::new();
        for entry in self.registry.entries() {
            summaries.push(entry.target.lock().await.summary(now));
        }
        summaries
    }

    /// Stops every timer and waits for the timer tasks to wind down.
    pub async fn dispose_all(&self) {
        let drained = self.registry.drain();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Stopping all monitors.");
        let mut handles = Vec::new();
        for (entry, timer) in drained {
            if let Some(timer) = timer {
                handles.push(timer.cancel());
            }
            let mut target = entry.target.lock().await;
            target.active = false;
            target.push_log(
                MonitorLogEntry::new(LogKind::Stop, "Monitoring stopped (engine shutdown)"),
                self.log_soft_cap,
            );
        }
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Timer task ended abnormally.");
            }
        }
    }

    /// Spawns the timer for `entry`, replacing (and cancelling) any previous one.
    fn start_timer(&self, entry: &RegistryEntry, interval_ms: u64) {
        let timer = spawn_timer(entry.clone(), self.poller.clone(), interval_ms);
        match self.registry.attach_timer(&entry.id, timer) {
            Ok(Some(previous)) => drop(previous.cancel()),
            Ok(None) => {}
            Err(orphan) => {
                debug!(target_id = %entry.id, "Target removed before its timer was attached.");
                drop(orphan.cancel());
            }
        }
    }
}

fn spawn_timer(entry: RegistryEntry, poller: Arc<Poller>, interval_ms: u64) -> TimerHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let period = Duration::from_millis(interval_ms.max(1));

    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(target_id = %entry.id, interval_ms, "Started timer task.");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    debug!(target_id = %entry.id, "Timer task received shutdown signal.");
                    break;
                }
                _ = interval.tick() => {
                    if let PollOutcome::Inactive = poller.poll(&entry.target, &entry.poll_guard).await {
                        break;
                    }
                }
            }
        }
        debug!(target_id = %entry.id, "Timer task finished.");
    });

    TimerHandle { handle, shutdown_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::models::{TargetKind, TargetSpec, derive_target_id};
    use crate::capture::CaptureCascade;
    use crate::capture::strategies::NativeStream;
    use crate::monitor::poll::tests::{idle_poller, poller_with};
    use crate::native::{NativeBackend, NativeError};
    use crate::scoring::image_diff::tests::png_with_changed_pixels;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DEFAULTS: MonitorDefaults = MonitorDefaults {
        interval_ms: 3000,
        threshold: 0.15,
    };

    fn target(address: &str, name: &str, threshold: Option<f64>) -> MonitorTarget {
        let spec = TargetSpec {
            kind: TargetKind::Camera,
            name: Some(name.into()),
            address: Some(address.into()),
            threshold,
            ..Default::default()
        };
        MonitorTarget::from_spec(derive_target_id(TargetKind::Camera, address), address.into(), spec, DEFAULTS)
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(DEFAULTS, Arc::new(idle_poller()), 500)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let scheduler = scheduler();
        let first = scheduler.register(target("10.0.0.5", "Porch", None)).await;
        assert!(matches!(first, RegisterOutcome::Started(_)));

        let second = scheduler.register(target("10.0.0.5", "Porch again", None)).await;
        match second {
            RegisterOutcome::AlreadyMonitoring(summary) => {
                assert_eq!(summary.name, "Porch");
                assert!(summary.active);
            }
            RegisterOutcome::Started(_) => panic!("second start must not create a new target"),
        }
        assert_eq!(scheduler.registry().timer_count(), 1);
        scheduler.dispose_all().await;
    }

    #[tokio::test]
    async fn test_global_threshold_skips_overridden_targets() {
        let scheduler = scheduler();
        scheduler.register(target("10.0.0.5", "A", None)).await;
        scheduler.register(target("10.0.0.6", "B", None)).await;

        let changed = scheduler
            .reconfigure(&Scope::Target("A".into()), SettingChange::Threshold(0.3))
            .await;
        assert_eq!(changed.len(), 1);

        let changed = scheduler
            .reconfigure(&Scope::Global, SettingChange::Threshold(0.1))
            .await;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].name, "B");

        let summaries = scheduler.summaries().await;
        let a = summaries.iter().find(|s| s.name == "A").unwrap();
        let b = summaries.iter().find(|s| s.name == "B").unwrap();
        assert_eq!(a.threshold, 0.3);
        assert!(a.threshold_overridden);
        assert_eq!(b.threshold, 0.1);
        assert!(!b.threshold_overridden);
        assert_eq!(scheduler.defaults().threshold, 0.1);
        scheduler.dispose_all().await;
    }

    #[tokio::test]
    async fn test_interval_change_replaces_timer() {
        let scheduler = scheduler();
        scheduler.register(target("10.0.0.5", "A", None)).await;
        let id = derive_target_id(TargetKind::Camera, "10.0.0.5");

        scheduler
            .reconfigure(&Scope::Target(id.clone()), SettingChange::Interval(5000))
            .await;
        assert_eq!(scheduler.registry().timer_count(), 1);
        let summary = &scheduler.summaries().await[0];
        assert_eq!(summary.interval_ms, 5000);
        assert!(summary.interval_overridden);
        scheduler.dispose_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_stops_ticks() {
        let scheduler = scheduler();
        let mut t = target("10.0.0.5", "A", None);
        t.interval_ms = 1000;
        scheduler.register(t).await;
        let id = derive_target_id(TargetKind::Camera, "10.0.0.5");

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let shared = scheduler.unregister(&id).await.unwrap();
        let polls_before = shared
            .lock()
            .await
            .log()
            .iter()
            .filter(|e| e.kind == LogKind::Error)
            .count();
        assert!(polls_before >= 1);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        let guard = shared.lock().await;
        let polls_after = guard.log().iter().filter(|e| e.kind == LogKind::Error).count();
        assert_eq!(polls_before, polls_after);
        assert!(!guard.active);
        assert_eq!(guard.log().last().unwrap().kind, LogKind::Stop);
        assert!(!scheduler.registry().contains(&id));
    }

    #[tokio::test]
    async fn test_poll_after_unregister_is_noop() {
        let scheduler = scheduler();
        scheduler.register(target("10.0.0.5", "A", None)).await;
        let id = derive_target_id(TargetKind::Camera, "10.0.0.5");
        let entry = scheduler.registry().get(&id).unwrap();
        scheduler.unregister(&id).await;

        let poller = idle_poller();
        let outcome = poller.poll(&entry.target, &entry.poll_guard).await;
        assert!(matches!(outcome, PollOutcome::Inactive));
        assert_eq!(entry.target.lock().await.log().last().unwrap().kind, LogKind::Stop);
        assert!(scheduler.poll_now(&id).await.is_none());
    }

    /// Sleeps inside every capture and records how many captures overlap.
    #[derive(Default)]
    struct SlowNative {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NativeBackend for SlowNative {
        async fn capture_frame(&self, _stream_url: &str) -> Result<Vec<u8>, NativeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(png_with_changed_pixels(4, 4, 0))
        }

        async fn resize(&self, bytes: &[u8], _max_width: u32) -> Result<Vec<u8>, NativeError> {
            Ok(bytes.to_vec())
        }
    }

    #[tokio::test]
    async fn test_poll_cycles_of_one_target_never_overlap() {
        let native = Arc::new(SlowNative::default());
        let backend: Arc<dyn NativeBackend> = native.clone();
        let cascade = CaptureCascade::new(vec![Box::new(NativeStream::new(Some(backend), Duration::from_secs(5)))]);
        let scheduler = Scheduler::new(DEFAULTS, Arc::new(poller_with(cascade)), 500);

        let mut porch = target("10.0.0.5", "Porch", None);
        porch.stream_url = Some("rtsp://10.0.0.5/stream".into());
        porch.interval_ms = 60_000;
        scheduler.register(porch).await;
        let id = derive_target_id(TargetKind::Camera, "10.0.0.5");

        let (first, second) = tokio::join!(scheduler.poll_now(&id), scheduler.poll_now(&id));
        let outcomes = [first.unwrap(), second.unwrap()];
        assert!(outcomes.contains(&PollOutcome::Baseline));
        assert_eq!(native.calls.load(Ordering::SeqCst), 2);
        assert_eq!(native.max_in_flight.load(Ordering::SeqCst), 1);
        scheduler.dispose_all().await;
    }
}
