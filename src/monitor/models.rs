//! Core data model for monitored targets and their logs.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Camera,
    Device,
    Endpoint,
    Service,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Camera => "camera",
            TargetKind::Device => "device",
            TargetKind::Endpoint => "endpoint",
            TargetKind::Service => "service",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single acquired sample. Cameras produce encoded frames, everything else text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    Image { bytes: Vec<u8>, mime: String },
    Text(String),
}

impl Sample {
    pub fn is_empty(&self) -> bool {
        match self {
            Sample::Image { bytes, .. } => bytes.is_empty(),
            Sample::Text(text) => text.is_empty(),
        }
    }

    pub fn byte_size(&self) -> usize {
        match self {
            Sample::Image { bytes, .. } => bytes.len(),
            Sample::Text(text) => text.len(),
        }
    }

    pub fn mime(&self) -> &str {
        match self {
            Sample::Image { mime, .. } => mime,
            Sample::Text(_) => "text/plain",
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Sample::Image { bytes, .. } => bytes,
            Sample::Text(text) => text.as_bytes(),
        }
    }

    pub fn reference(&self) -> SampleRef {
        SampleRef {
            mime: self.mime().to_string(),
            byte_size: self.byte_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMethod {
    Rtsp,
    Http,
    #[default]
    None,
}

/// Diagnostics attached to log entries describing how a sample was (not) acquired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetadata {
    pub method: CaptureMethod,
    pub resolution: Option<(u32, u32)>,
    pub byte_size: usize,
    pub latency_ms: u64,
    pub failure_reason: Option<String>,
    pub attempts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Start,
    Stop,
    Check,
    Change,
    Error,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRef {
    pub mime: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<SampleRef>,
}

impl MonitorLogEntry {
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            score: None,
            capture: None,
            sample: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_capture(mut self, capture: CaptureMetadata) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_sample(mut self, sample: &Sample) -> Self {
        self.sample = Some(sample.reference());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraAuth {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl CameraAuth {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .map(|user| (user, self.password.as_deref().unwrap_or("")))
    }
}

/// Session token for camera APIs that authenticate with a login call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Global values that targets without an override follow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorDefaults {
    pub interval_ms: u64,
    pub threshold: f64,
}

/// Input for starting a target, produced by the external command parser or
/// provisioned from a persisted device record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    #[serde(default)]
    pub kind: TargetKind,
    pub name: Option<String>,
    pub address: Option<String>,
    pub stream_url: Option<String>,
    pub http_url: Option<String>,
    pub stream_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub interval_ms: Option<u64>,
    pub threshold: Option<f64>,
}

/// Derives the registry id for a target that has no persisted record.
pub fn derive_target_id(kind: TargetKind, address: &str) -> String {
    format!("{}:{}", kind.as_str(), address.trim().to_lowercase())
}

#[derive(Debug, Clone)]
pub struct MonitorTarget {
    pub id: String,
    pub kind: TargetKind,
    pub name: String,
    pub address: String,
    pub record_id: Option<String>,
    pub stream_url: Option<String>,
    pub http_url: Option<String>,
    pub stream_path: Option<String>,
    pub interval_ms: u64,
    pub threshold: f64,
    pub interval_overridden: bool,
    pub threshold_overridden: bool,
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_change: Option<DateTime<Utc>>,
    pub change_count: u64,
    pub last_sample: Option<Sample>,
    pub auth: CameraAuth,
    pub session: Option<SessionToken>,
    pub resolved_snapshot_url: Option<String>,
    pub vendor_hint: Option<String>,
    log: Vec<MonitorLogEntry>,
}

impl MonitorTarget {
    /// Builds a target from a [`TargetSpec`]. Explicit interval/threshold values
    /// count as per-target overrides.
    pub fn from_spec(id: String, address: String, spec: TargetSpec, defaults: MonitorDefaults) -> Self {
        let name = spec
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{} {}", spec.kind, address));
        Self {
            id,
            kind: spec.kind,
            name,
            address,
            record_id: None,
            stream_url: spec.stream_url,
            http_url: spec.http_url,
            stream_path: spec.stream_path,
            interval_ms: spec.interval_ms.unwrap_or(defaults.interval_ms),
            threshold: spec.threshold.unwrap_or(defaults.threshold).clamp(0.0, 1.0),
            interval_overridden: spec.interval_ms.is_some(),
            threshold_overridden: spec.threshold.is_some(),
            active: false,
            started_at: Utc::now(),
            last_checked: None,
            last_change: None,
            change_count: 0,
            last_sample: None,
            auth: CameraAuth {
                username: spec.username,
                password: spec.password,
            },
            session: None,
            resolved_snapshot_url: None,
            vendor_hint: None,
            log: Vec::new(),
        }
    }

    pub fn log(&self) -> &[MonitorLogEntry] {
        &self.log
    }

    /// Appends to the log. Entries beyond `soft_cap` are trimmed oldest-first
    /// and the trim is always reported.
    pub fn push_log(&mut self, entry: MonitorLogEntry, soft_cap: usize) {
        self.log.push(entry);
        if soft_cap > 0 && self.log.len() > soft_cap {
            let excess = self.log.len() - soft_cap;
            self.log.drain(..excess);
            warn!(
                target_id = %self.id,
                trimmed = excess,
                soft_cap = soft_cap,
                "Monitor log exceeded its soft cap; oldest entries trimmed."
            );
        }
    }

    pub fn summary(&self, now: DateTime<Utc>) -> TargetSummary {
        TargetSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            address: self.address.clone(),
            record_id: self.record_id.clone(),
            active: self.active,
            interval_ms: self.interval_ms,
            threshold: self.threshold,
            interval_overridden: self.interval_overridden,
            threshold_overridden: self.threshold_overridden,
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            change_count: self.change_count,
            last_checked: self.last_checked,
            last_change: self.last_change,
            log_entries: self.log.len(),
        }
    }
}

/// Read-only view of a target for the outward-facing list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    pub id: String,
    pub name: String,
    pub kind: TargetKind,
    pub address: String,
    pub record_id: Option<String>,
    pub active: bool,
    pub interval_ms: u64,
    pub threshold: f64,
    pub interval_overridden: bool,
    pub threshold_overridden: bool,
    pub uptime_secs: u64,
    pub change_count: u64,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_change: Option<DateTime<Utc>>,
    pub log_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> MonitorDefaults {
        MonitorDefaults {
            interval_ms: 3000,
            threshold: 0.15,
        }
    }

    #[test]
    fn test_from_spec_uses_defaults_without_overrides() {
        let spec = TargetSpec {
            kind: TargetKind::Camera,
            address: Some("10.0.0.5".into()),
            ..Default::default()
        };
        let target = MonitorTarget::from_spec("camera:10.0.0.5".into(), "10.0.0.5".into(), spec, defaults());
        assert_eq!(target.interval_ms, 3000);
        assert_eq!(target.threshold, 0.15);
        assert!(!target.interval_overridden);
        assert!(!target.threshold_overridden);
        assert_eq!(target.name, "camera 10.0.0.5");
    }

    #[test]
    fn test_from_spec_explicit_values_are_overrides() {
        let spec = TargetSpec {
            kind: TargetKind::Endpoint,
            address: Some("https://example.com".into()),
            threshold: Some(0.3),
            interval_ms: Some(60_000),
            ..Default::default()
        };
        let target = MonitorTarget::from_spec("x".into(), "https://example.com".into(), spec, defaults());
        assert!(target.threshold_overridden);
        assert!(target.interval_overridden);
        assert_eq!(target.threshold, 0.3);
    }

    #[test]
    fn test_push_log_trims_beyond_soft_cap() {
        let spec = TargetSpec::default();
        let mut target = MonitorTarget::from_spec("t".into(), "a".into(), spec, defaults());
        for i in 0..5 {
            target.push_log(MonitorLogEntry::new(LogKind::Check, format!("entry {i}")), 3);
        }
        assert_eq!(target.log().len(), 3);
        assert_eq!(target.log()[0].message, "entry 2");
    }

    #[test]
    fn test_derive_target_id() {
        assert_eq!(derive_target_id(TargetKind::Camera, " 10.0.0.5 "), "camera:10.0.0.5");
    }
}
