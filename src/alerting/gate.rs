use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::description::{DescriptionService, is_no_significant_change};
use super::thumbnail::resize_to_width;
use crate::config::EngineConfig;
use crate::events::{ChangeEvent, EventBroadcaster};
use crate::monitor::models::{CaptureMetadata, LogKind, MonitorLogEntry, Sample};
use crate::monitor::registry::SharedTarget;
use crate::native::NativeBackend;
use crate::scoring::text_diff::summarize_text_change;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertVerdict {
    /// Score at or below the target's threshold.
    Unchanged,
    /// Counted as a change but below the describe threshold.
    ChangeQuiet,
    /// Described as "no significant change"; logged, not emitted.
    Suppressed,
    /// Change event emitted.
    Alerted,
    /// The target stopped while the change was being processed.
    Dropped,
}

#[derive(Debug, Clone, Copy)]
pub struct GateSettings {
    pub describe_threshold: f64,
    pub thumbnail_max_width: u32,
    pub log_soft_cap: usize,
}

impl GateSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            describe_threshold: config.describe_threshold,
            thumbnail_max_width: config.thumbnail_max_width,
            log_soft_cap: config.log_soft_cap,
        }
    }
}

pub struct AlertGate {
    settings: GateSettings,
    native: Option<Arc<dyn NativeBackend>>,
    describer: Option<Arc<dyn DescriptionService>>,
    events: EventBroadcaster,
}

impl AlertGate {
    pub fn new(
        settings: GateSettings,
        native: Option<Arc<dyn NativeBackend>>,
        describer: Option<Arc<dyn DescriptionService>>,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            settings,
            native,
            describer,
            events,
        }
    }

    /// Decides what a scored cycle amounts to and writes the matching log entry.
    pub async fn process(
        &self,
        target: &SharedTarget,
        previous: &Sample,
        current: &Sample,
        score: f64,
        capture: CaptureMetadata,
    ) -> AlertVerdict {
        let cap = self.settings.log_soft_cap;
        let percent = score * 100.0;

        let (id, name, kind) = {
            let mut t = target.lock().await;
            if !t.active {
                return AlertVerdict::Dropped;
            }
            if score <= t.threshold {
                t.push_log(
                    MonitorLogEntry::new(LogKind::Check, format!("No significant change ({percent:.1}%)"))
                        .with_score(score)
                        .with_capture(capture)
                        .with_sample(current),
                    cap,
                );
                return AlertVerdict::Unchanged;
            }

            t.change_count += 1;
            t.last_change = Some(Utc::now());

            if score < self.settings.describe_threshold {
                t.push_log(
                    MonitorLogEntry::new(
                        LogKind::Change,
                        format!("Change detected ({percent:.1}%), below the description threshold"),
                    )
                    .with_score(score)
                    .with_capture(capture)
                    .with_sample(current),
                    cap,
                );
                return AlertVerdict::ChangeQuiet;
            }
            (t.id.clone(), t.name.clone(), t.kind)
        };

        let (description, thumbnail) = match (previous, current) {
            (Sample::Image { bytes: prev, .. }, Sample::Image { bytes: curr, mime }) => {
                let thumbnail = self.thumbnail(&id, curr).await;
                let description = self.describe(&id, prev, curr, mime, percent).await;
                (description, thumbnail)
            }
            (Sample::Text(prev), Sample::Text(curr)) => (summarize_text_change(prev, curr), None),
            _ => (format!("Content changed ({percent:.1}%)"), None),
        };
        let suppressed = is_no_significant_change(&description);

        {
            let mut t = target.lock().await;
            if !t.active {
                return AlertVerdict::Dropped;
            }
            let message = if suppressed {
                format!("{description} (score {percent:.1}%, alert suppressed)")
            } else {
                description.clone()
            };
            t.push_log(
                MonitorLogEntry::new(LogKind::Change, message)
                    .with_score(score)
                    .with_capture(capture)
                    .with_sample(current),
                cap,
            );
        }

        if suppressed {
            info!(target_id = %id, score, "Change described as insignificant; alert suppressed.");
            return AlertVerdict::Suppressed;
        }

        info!(target_id = %id, score, "Change detected; emitting alert.");
        self.events.emit(ChangeEvent {
            id,
            name,
            kind,
            timestamp: Utc::now(),
            score,
            description,
            thumbnail,
        });
        AlertVerdict::Alerted
    }

    async fn describe(&self, id: &str, previous: &[u8], current: &[u8], mime: &str, percent: f64) -> String {
        let Some(describer) = &self.describer else {
            return format!("Change detected: {percent:.1}% of the frame differs");
        };
        match describer.describe_change(previous, current, mime).await {
            Ok(text) => text,
            Err(e) => {
                warn!(target_id = %id, error = %e, "Description request failed.");
                format!("Change detected (description unavailable: {e})")
            }
        }
    }

    /// Base64 JPEG thumbnail of `frame`, or `None` if it could not be made.
    async fn thumbnail(&self, id: &str, frame: &[u8]) -> Option<String> {
        let max_width = self.settings.thumbnail_max_width;
        if let Some(native) = &self.native {
            match native.resize(frame, max_width).await {
                Ok(bytes) => return Some(STANDARD.encode(bytes)),
                Err(e) => warn!(target_id = %id, error = %e, "Native resize failed; resizing locally."),
            }
        }

        let owned = frame.to_vec();
        match tokio::task::spawn_blocking(move || resize_to_width(&owned, max_width)).await {
            Ok(Ok(bytes)) => Some(STANDARD.encode(bytes)),
            Ok(Err(e)) => {
                warn!(target_id = %id, error = %e, "Could not build thumbnail.");
                None
            }
            Err(e) => {
                warn!(target_id = %id, error = %e, "Thumbnail task failed.");
                None
            }
        }
    }
}
