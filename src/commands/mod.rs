//! Typed command surface of the engine.
//!
//! Commands arrive already parsed (for example as JSON lines); the engine
//! never interprets free text. Every command yields a [`CommandResponse`],
//! including malformed ones.
pub mod engine;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitor::models::{MonitorLogEntry, TargetSpec, TargetSummary};
use crate::persistence::{BridgeError, ConflictGroup};

pub use crate::monitor::scheduler::Scope;
pub use engine::{Collaborators, EngineError, MonitorEngine};

/// Maximum number of log lines returned by a `logs` command.
pub const LOG_VIEW_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    Start(TargetSpec),
    /// Target id, address or name, or `"all"`.
    Stop {
        target: String,
    },
    List,
    Logs {
        #[serde(default)]
        target: Option<String>,
    },
    SetThreshold {
        #[serde(default)]
        scope: Scope,
        percent: f64,
    },
    SetInterval {
        #[serde(default)]
        scope: Scope,
        interval_ms: u64,
    },
    Enable {
        target: String,
    },
    Disable {
        target: String,
    },
    ResolveConflict {
        keep_id: String,
    },
    Explain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: ResponseData) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<CommandError> for CommandResponse {
    fn from(err: CommandError) -> Self {
        CommandResponse::failure(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ResponseData {
    Target(TargetSummary),
    Targets {
        targets: Vec<TargetSummary>,
        conflicts: Vec<ConflictGroup>,
    },
    Logs(Vec<LogLine>),
    Explanation(Explanation),
}

/// A log entry tagged with the target it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub target_id: String,
    pub target_name: String,
    #[serde(flatten)]
    pub entry: MonitorLogEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Explanation {
    pub pipeline: Vec<String>,
    pub default_interval_ms: u64,
    pub default_threshold: f64,
    pub describe_threshold: f64,
    pub min_interval_ms: u64,
    pub sandbox: bool,
    pub native_backend: bool,
    pub description_service: bool,
    pub persistence: bool,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Missing address: give the IP address, hostname or URL to monitor, e.g. {{\"command\":\"start\",\"address\":\"192.168.1.20\"}}")]
    MissingAddress,
    #[error("Threshold {0}% is out of range: use a percentage between 0 and 100")]
    PercentOutOfRange(f64),
    #[error("Interval {requested} ms is too short: the minimum is {minimum} ms")]
    IntervalTooShort { requested: u64, minimum: u64 },
    #[error("No monitored target matches '{identifier}'. {hint}. Use 'list' to see ids")]
    UnknownTarget { identifier: String, hint: String },
    #[error(
        "Address {address} has several enabled device records; choose one with resolveConflict using keepId {}",
        choices.join(" or ")
    )]
    Conflicted { address: String, choices: Vec<String> },
    #[error(transparent)]
    Persistence(#[from] BridgeError),
}
