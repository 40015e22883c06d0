use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::{
    Command, CommandError, CommandResponse, Explanation, LOG_VIEW_LIMIT, LogLine, ResponseData, Scope,
};
use crate::alerting::{AlertGate, ChatDescriptionService, DescriptionService, GateSettings};
use crate::capture::CaptureCascade;
use crate::capture::endpoint::TextFetcher;
use crate::capture::http::{HttpFetcher, NetworkRouting};
use crate::config::EngineConfig;
use crate::events::{ChangeEvent, EventBroadcaster};
use crate::monitor::models::{MonitorTarget, TargetSpec, TargetSummary, derive_target_id};
use crate::monitor::poll::Poller;
use crate::monitor::registry::RegistryEntry;
use crate::monitor::scheduler::{RegisterOutcome, Scheduler, SettingChange};
use crate::native::{HttpNativeBackend, NativeBackend};
use crate::persistence::{BridgeError, DeviceStore, JsonFileDeviceStore, LoadReport, PersistenceBridge};

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// External services the engine talks to. Each one is optional.
#[derive(Default, Clone)]
pub struct Collaborators {
    pub native: Option<Arc<dyn NativeBackend>>,
    pub describer: Option<Arc<dyn DescriptionService>>,
    pub store: Option<Arc<dyn DeviceStore>>,
}

impl Collaborators {
    /// Builds the configured collaborators. One that cannot be built is
    /// logged and left out.
    pub async fn from_config(config: &EngineConfig) -> Self {
        let native = config.native_backend_url.as_deref().and_then(|url| {
            match HttpNativeBackend::new(url, config.capture_timeout()) {
                Ok(backend) => Some(Arc::new(backend) as Arc<dyn NativeBackend>),
                Err(e) => {
                    error!(error = %e, "Failed to create native backend client.");
                    None
                }
            }
        });

        let describer = config.description_url.as_deref().and_then(|url| {
            match ChatDescriptionService::new(
                url,
                config.description_api_key.clone(),
                config.description_model.clone(),
                config.endpoint_timeout() * 3,
            ) {
                Ok(service) => Some(Arc::new(service) as Arc<dyn DescriptionService>),
                Err(e) => {
                    error!(error = %e, "Failed to create description client.");
                    None
                }
            }
        });

        let store = match &config.store_path {
            Some(path) => match JsonFileDeviceStore::open(path).await {
                Ok(store) => Some(Arc::new(store) as Arc<dyn DeviceStore>),
                Err(e) => {
                    error!(path = %path, error = %e, "Failed to open device store; running in memory only.");
                    None
                }
            },
            None => None,
        };

        Self {
            native,
            describer,
            store,
        }
    }
}

/// Owns the scheduler, the persistence bridge and the event stream, and
/// executes commands against them.
pub struct MonitorEngine {
    config: EngineConfig,
    scheduler: Scheduler,
    bridge: PersistenceBridge,
    events: EventBroadcaster,
    has_native: bool,
    has_describer: bool,
}

impl MonitorEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        let routing = NetworkRouting {
            sandbox: config.sandbox,
            relay_url: config.relay_url.clone(),
        };
        let http = Arc::new(HttpFetcher::new(routing)?);
        let events = EventBroadcaster::new(EVENT_CAPACITY);

        let cascade = CaptureCascade::standard(
            http.clone(),
            collaborators.native.clone(),
            config.capture_timeout(),
        );
        let text = TextFetcher::new(http, config.endpoint_timeout(), config.max_text_bytes);
        let gate = AlertGate::new(
            GateSettings::from_config(&config),
            collaborators.native.clone(),
            collaborators.describer.clone(),
            events.clone(),
        );
        let poller = Arc::new(Poller::new(cascade, text, gate, config.log_soft_cap));

        Ok(Self {
            scheduler: Scheduler::new(config.defaults(), poller, config.log_soft_cap),
            bridge: PersistenceBridge::new(collaborators.store),
            events,
            has_native: collaborators.native.is_some(),
            has_describer: collaborators.describer.is_some(),
            config,
        })
    }

    /// Starts monitors for persisted devices.
    pub async fn initialize(&self) -> LoadReport {
        self.bridge.load(&self.scheduler).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn shutdown(&self) {
        self.scheduler.dispose_all().await;
    }

    pub async fn execute(&self, command: Command) -> CommandResponse {
        let result = match command {
            Command::Start(spec) => self.start(spec).await,
            Command::Stop { target } => self.stop(&target).await,
            Command::List => Ok(self.list().await),
            Command::Logs { target } => self.logs(target.as_deref()).await,
            Command::SetThreshold { scope, percent } => self.set_threshold(scope, percent).await,
            Command::SetInterval { scope, interval_ms } => self.set_interval(scope, interval_ms).await,
            Command::Enable { target } => self.enable(&target).await,
            Command::Disable { target } => self.disable(&target).await,
            Command::ResolveConflict { keep_id } => self.resolve_conflict(&keep_id).await,
            Command::Explain => Ok(self.explain()),
        };
        result.unwrap_or_else(|e| {
            warn!(error = %e, "Command rejected.");
            e.into()
        })
    }

    fn validate_interval(&self, interval_ms: u64) -> Result<(), CommandError> {
        if interval_ms < self.config.min_interval_ms {
            return Err(CommandError::IntervalTooShort {
                requested: interval_ms,
                minimum: self.config.min_interval_ms,
            });
        }
        Ok(())
    }

    fn resolve(&self, identifier: &str) -> Result<Vec<RegistryEntry>, CommandError> {
        let registry = self.scheduler.registry();
        let entries = registry.resolve(identifier);
        if entries.is_empty() {
            let describe = |e: RegistryEntry| format!("{} ({})", e.name, e.address);
            let suggested: Vec<String> = registry.suggest(identifier).into_iter().map(describe).collect();
            let hint = if !suggested.is_empty() {
                format!("Did you mean: {}", suggested.join(", "))
            } else {
                let known: Vec<String> = registry.entries().into_iter().map(describe).collect();
                if known.is_empty() {
                    "Nothing is being monitored".to_string()
                } else {
                    format!("Known targets: {}", known.join(", "))
                }
            };
            return Err(CommandError::UnknownTarget {
                identifier: identifier.to_string(),
                hint,
            });
        }
        Ok(entries)
    }

    async fn start(&self, spec: TargetSpec) -> Result<CommandResponse, CommandError> {
        let address = spec
            .address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .ok_or(CommandError::MissingAddress)?;
        if let Some(threshold) = spec.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(CommandError::PercentOutOfRange(threshold * 100.0));
            }
        }
        if let Some(interval_ms) = spec.interval_ms {
            self.validate_interval(interval_ms)?;
        }
        if let Some(group) = self.bridge.conflict_for(&address).await {
            return Err(CommandError::Conflicted {
                address: group.address.clone(),
                choices: group.choices.iter().map(|c| c.id.clone()).collect(),
            });
        }

        let id = derive_target_id(spec.kind, &address);
        let kind = spec.kind;
        let mut target = MonitorTarget::from_spec(id.clone(), address.clone(), spec, self.scheduler.defaults());
        if !self.scheduler.registry().contains(&id) {
            if let Some(record) = self.bridge.link_record(kind, &address).await {
                info!(target_id = %id, record_id = %record.id, "Linked target to persisted device.");
                target.record_id = Some(record.id);
            }
        }

        Ok(match self.scheduler.register(target).await {
            RegisterOutcome::Started(summary) => CommandResponse::ok(format!(
                "Started monitoring {} ({}) every {:.1}s with a {:.0}% change threshold",
                summary.name,
                summary.address,
                summary.interval_ms as f64 / 1000.0,
                summary.threshold * 100.0
            ))
            .with_data(ResponseData::Target(summary)),
            RegisterOutcome::AlreadyMonitoring(summary) => CommandResponse::ok(format!(
                "Already monitoring {} ({}): {} change(s) seen, up for {}s",
                summary.name, summary.address, summary.change_count, summary.uptime_secs
            ))
            .with_data(ResponseData::Target(summary)),
        })
    }

    async fn stop(&self, identifier: &str) -> Result<CommandResponse, CommandError> {
        let entries = if identifier.trim().eq_ignore_ascii_case("all") {
            self.scheduler.registry().entries()
        } else {
            self.resolve(identifier)?
        };

        let mut stopped = Vec::new();
        for entry in entries {
            if let Some(target) = self.scheduler.unregister(&entry.id).await {
                let record_id = target.lock().await.record_id.clone();
                if let Some(record_id) = record_id {
                    self.bridge.persist_disabled(&record_id).await;
                }
                stopped.push(entry.name);
            }
        }
        Ok(if stopped.is_empty() {
            CommandResponse::ok("Nothing is being monitored")
        } else {
            CommandResponse::ok(format!("Stopped monitoring {}", stopped.join(", ")))
        })
    }

    async fn list(&self) -> CommandResponse {
        let targets = self.scheduler.summaries().await;
        let conflicts = self.bridge.conflicts().await;
        let mut message = format!("{} target(s) monitored", targets.len());
        if !conflicts.is_empty() {
            message.push_str(&format!(
                ", {} address conflict(s) waiting for a choice",
                conflicts.len()
            ));
        }
        CommandResponse::ok(message).with_data(ResponseData::Targets { targets, conflicts })
    }

    async fn logs(&self, identifier: Option<&str>) -> Result<CommandResponse, CommandError> {
        let entries = match identifier {
            Some(identifier) => self.resolve(identifier)?,
            None => self.scheduler.registry().entries(),
        };

        let mut lines = Vec::new();
        for entry in entries {
            let target = entry.target.lock().await;
            lines.extend(target.log().iter().map(|log| LogLine {
                target_id: target.id.clone(),
                target_name: target.name.clone(),
                entry: log.clone(),
            }));
        }
        lines.sort_by_key(|line| line.entry.timestamp);
        let skip = lines.len().saturating_sub(LOG_VIEW_LIMIT);
        let lines: Vec<LogLine> = lines.into_iter().skip(skip).collect();

        Ok(CommandResponse::ok(format!("{} log entries", lines.len())).with_data(ResponseData::Logs(lines)))
    }

    async fn set_threshold(&self, scope: Scope, percent: f64) -> Result<CommandResponse, CommandError> {
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(CommandError::PercentOutOfRange(percent));
        }
        self.reconfigure(scope, SettingChange::Threshold(percent / 100.0), format!("{percent}%"))
            .await
    }

    async fn set_interval(&self, scope: Scope, interval_ms: u64) -> Result<CommandResponse, CommandError> {
        self.validate_interval(interval_ms)?;
        self.reconfigure(
            scope,
            SettingChange::Interval(interval_ms),
            format!("{:.1}s", interval_ms as f64 / 1000.0),
        )
        .await
    }

    async fn reconfigure(
        &self,
        scope: Scope,
        change: SettingChange,
        shown: String,
    ) -> Result<CommandResponse, CommandError> {
        let field = match change {
            SettingChange::Threshold(_) => "threshold",
            SettingChange::Interval(_) => "interval",
        };
        if let Scope::Target(identifier) = &scope {
            self.resolve(identifier)?;
        }

        let changed = self.scheduler.reconfigure(&scope, change).await;
        match scope {
            Scope::Global => Ok(CommandResponse::ok(format!(
                "Default {field} set to {shown}; applied to {} target(s) without their own {field}",
                changed.len()
            ))),
            Scope::Target(_) => {
                self.bridge.mirror(&changed, change).await;
                let names: Vec<_> = changed.iter().map(|t| t.name.as_str()).collect();
                Ok(CommandResponse::ok(format!("{field} for {} set to {shown}", names.join(", "))))
            }
        }
    }

    async fn enable(&self, identifier: &str) -> Result<CommandResponse, CommandError> {
        let outcome = self.bridge.enable(identifier, &self.scheduler).await?;
        Ok(register_response("Enabled", outcome))
    }

    async fn disable(&self, identifier: &str) -> Result<CommandResponse, CommandError> {
        if !self.bridge.has_store() {
            return self.stop(identifier).await;
        }
        let record = match self.bridge.disable(identifier, &self.scheduler).await {
            Ok(record) => record,
            // Ad-hoc targets have no record to disable.
            Err(BridgeError::NotFound(_)) if !self.scheduler.registry().resolve(identifier).is_empty() => {
                return self.stop(identifier).await;
            }
            Err(e) => return Err(e.into()),
        };
        Ok(CommandResponse::ok(format!(
            "Disabled monitoring for {} ({})",
            record.display_name(),
            record.address
        )))
    }

    async fn resolve_conflict(&self, keep_id: &str) -> Result<CommandResponse, CommandError> {
        let outcome = self.bridge.resolve_conflict(keep_id, &self.scheduler).await?;
        Ok(register_response("Conflict resolved; monitoring", outcome))
    }

    fn explain(&self) -> CommandResponse {
        let defaults = self.scheduler.defaults();
        let explanation = Explanation {
            pipeline: vec![
                "Each target is polled on its own timer; a poll never overlaps the previous one.".into(),
                "Cameras are captured through the native stream, a cached snapshot URL, the token snapshot API, then vendor snapshot paths.".into(),
                "Endpoints, services and devices are fetched as text over HTTP.".into(),
                "Consecutive samples are compared pixel by pixel (or by text) into a score from 0 to 1.".into(),
                "A score above the target's threshold counts as a change; larger changes are described and announced.".into(),
            ],
            default_interval_ms: defaults.interval_ms,
            default_threshold: defaults.threshold,
            describe_threshold: self.config.describe_threshold,
            min_interval_ms: self.config.min_interval_ms,
            sandbox: self.config.sandbox,
            native_backend: self.has_native,
            description_service: self.has_describer,
            persistence: self.bridge.has_store(),
        };
        let message = format!(
            "Targets are checked every {:.1}s by default. A change is reported when more than {:.0}% of a sample differs; \
             changes of {:.0}% or more get a description and an alert.",
            defaults.interval_ms as f64 / 1000.0,
            defaults.threshold * 100.0,
            self.config.describe_threshold * 100.0
        );
        CommandResponse::ok(message).with_data(ResponseData::Explanation(explanation))
    }
}

fn register_response(verb: &str, outcome: RegisterOutcome) -> CommandResponse {
    let (summary, already): (TargetSummary, bool) = match outcome {
        RegisterOutcome::Started(summary) => (summary, false),
        RegisterOutcome::AlreadyMonitoring(summary) => (summary, true),
    };
    let message = if already {
        format!("Already monitoring {} ({})", summary.name, summary.address)
    } else {
        format!("{verb} {} ({}) at {}", summary.name, summary.address, Utc::now().format("%H:%M:%S"))
    };
    CommandResponse::ok(message).with_data(ResponseData::Target(summary))
}
