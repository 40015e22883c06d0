//! One poll cycle: capture, compare with the previous sample, hand the score
//! to the alert gate.
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::models::{LogKind, MonitorLogEntry, Sample, TargetKind};
use super::registry::SharedTarget;
use crate::alerting::{AlertGate, AlertVerdict};
use crate::capture::endpoint::TextFetcher;
use crate::capture::{CacheUpdate, CaptureCascade, CaptureRequest};
use crate::scoring::score_samples;

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The target was stopped; nothing was written.
    Inactive,
    Failed(String),
    /// First sample stored; nothing to compare against yet.
    Baseline,
    Scored { score: f64, verdict: AlertVerdict },
}

pub struct Poller {
    cascade: CaptureCascade,
    text: TextFetcher,
    gate: AlertGate,
    log_soft_cap: usize,
}

impl Poller {
    pub fn new(cascade: CaptureCascade, text: TextFetcher, gate: AlertGate, log_soft_cap: usize) -> Self {
        Self {
            cascade,
            text,
            gate,
            log_soft_cap,
        }
    }

    pub async fn poll(&self, target: &SharedTarget, poll_guard: &Mutex<()>) -> PollOutcome {
        let _in_flight = poll_guard.lock().await;

        let request = {
            let t = target.lock().await;
            if !t.active {
                return PollOutcome::Inactive;
            }
            CaptureRequest::from_target(&t)
        };

        let captured = match request.kind {
            TargetKind::Camera => self.cascade.run(&request).await.map(|success| {
                let sample = Sample::Image {
                    bytes: success.frame.bytes,
                    mime: success.frame.mime,
                };
                (sample, success.metadata, success.frame.cache)
            }),
            _ => self
                .text
                .fetch(&request)
                .await
                .map(|(sample, metadata)| (sample, metadata, CacheUpdate::default())),
        };

        let (sample, metadata, cache) = match captured {
            Ok(captured) => captured,
            Err(failure) => {
                let mut t = target.lock().await;
                if !t.active {
                    return PollOutcome::Inactive;
                }
                warn!(target_id = %request.target_id, reason = %failure.reason, "Capture failed.");
                t.last_checked = Some(Utc::now());
                t.push_log(
                    MonitorLogEntry::new(LogKind::Error, failure.reason.clone()).with_capture(failure.metadata),
                    self.log_soft_cap,
                );
                return PollOutcome::Failed(failure.reason);
            }
        };

        let previous = {
            let mut t = target.lock().await;
            if !t.active {
                return PollOutcome::Inactive;
            }
            cache.apply(&mut t);
            t.last_checked = Some(Utc::now());
            let previous = t.last_sample.replace(sample.clone());
            match previous {
                Some(previous) if !previous.is_empty() => previous,
                _ => {
                    let message = format!("Baseline sample captured ({} bytes)", sample.byte_size());
                    t.push_log(
                        MonitorLogEntry::new(LogKind::Snapshot, message)
                            .with_capture(metadata)
                            .with_sample(&sample),
                        self.log_soft_cap,
                    );
                    debug!(target_id = %request.target_id, "Stored baseline sample.");
                    return PollOutcome::Baseline;
                }
            }
        };

        let score = {
            let (prev, curr) = (previous.clone(), sample.clone());
            match tokio::task::spawn_blocking(move || score_samples(&prev, &curr)).await {
                Ok(score) => score,
                Err(e) => {
                    let reason = format!("Scoring failed: {e}");
                    let mut t = target.lock().await;
                    if t.active {
                        t.push_log(MonitorLogEntry::new(LogKind::Error, reason.clone()), self.log_soft_cap);
                    }
                    return PollOutcome::Failed(reason);
                }
            }
        };

        let verdict = self
            .gate
            .process(target, &previous, &sample, score, metadata)
            .await;
        if verdict == AlertVerdict::Dropped {
            return PollOutcome::Inactive;
        }
        PollOutcome::Scored { score, verdict }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alerting::GateSettings;
    use crate::capture::http::{HttpFetcher, NetworkRouting};
    use crate::events::EventBroadcaster;
    use std::sync::Arc;
    use std::time::Duration;

    /// A poller whose camera cascade has no strategies, so every camera poll fails.
    pub(crate) fn idle_poller() -> Poller {
        poller_with(CaptureCascade::new(Vec::new()))
    }

    pub(crate) fn poller_with(cascade: CaptureCascade) -> Poller {
        let http = Arc::new(HttpFetcher::new(NetworkRouting::direct()).unwrap());
        let gate = AlertGate::new(
            GateSettings {
                describe_threshold: 0.10,
                thumbnail_max_width: 480,
                log_soft_cap: 500,
            },
            None,
            None,
            EventBroadcaster::new(16),
        );
        Poller::new(
            cascade,
            TextFetcher::new(http, Duration::from_secs(1), 1024),
            gate,
            500,
        )
    }

    #[tokio::test]
    async fn test_failed_capture_logs_error_without_counting() {
        use crate::monitor::models::{MonitorDefaults, MonitorTarget, TargetSpec};

        let spec = TargetSpec {
            address: Some("10.0.0.5".into()),
            ..Default::default()
        };
        let defaults = MonitorDefaults { interval_ms: 3000, threshold: 0.15 };
        let mut target = MonitorTarget::from_spec("camera:10.0.0.5".into(), "10.0.0.5".into(), spec, defaults);
        target.active = true;
        let shared = Arc::new(Mutex::new(target));

        let outcome = idle_poller().poll(&shared, &Mutex::new(())).await;
        assert!(matches!(outcome, PollOutcome::Failed(_)));

        let t = shared.lock().await;
        assert_eq!(t.change_count, 0);
        assert!(t.last_sample.is_none());
        assert!(t.last_checked.is_some());
        let entry = t.log().last().unwrap();
        assert_eq!(entry.kind, LogKind::Error);
        assert!(entry.score.is_none());
        assert!(entry.capture.as_ref().unwrap().failure_reason.is_some());
    }
}
