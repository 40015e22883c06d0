use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::monitor::models::MonitorDefaults;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone)]
pub struct EngineConfig {
    pub default_interval_ms: u64,
    pub default_threshold: f64,
    pub describe_threshold: f64,
    pub min_interval_ms: u64,
    pub capture_timeout_secs: u64,
    pub endpoint_timeout_secs: u64,
    pub max_text_bytes: usize,
    pub thumbnail_max_width: u32,
    pub log_soft_cap: usize,
    pub sandbox: bool,
    pub relay_url: String,
    pub native_backend_url: Option<String>,
    pub description_url: Option<String>,
    pub description_api_key: Option<String>,
    pub description_model: String,
    pub store_path: Option<String>,
    pub log_dir: String,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialEngineConfig {
    default_interval_ms: Option<u64>,
    default_threshold: Option<f64>,
    describe_threshold: Option<f64>,
    min_interval_ms: Option<u64>,
    capture_timeout_secs: Option<u64>,
    endpoint_timeout_secs: Option<u64>,
    max_text_bytes: Option<usize>,
    thumbnail_max_width: Option<u32>,
    log_soft_cap: Option<usize>,
    sandbox: Option<bool>,
    relay_url: Option<String>,
    native_backend_url: Option<String>,
    description_url: Option<String>,
    description_api_key: Option<String>,
    description_model: Option<String>,
    store_path: Option<String>,
    log_dir: Option<String>,
}

pub const ENV_PREFIX: &str = "NEXUSWATCH_";

fn default_relay_url() -> String {
    "http://127.0.0.1:3001/proxy".to_string()
}

fn default_description_model() -> String {
    "google/gemini-2.0-flash-001".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 3000,
            default_threshold: 0.15,
            describe_threshold: 0.10,
            min_interval_ms: 1000,
            capture_timeout_secs: 8,
            endpoint_timeout_secs: 10,
            max_text_bytes: 64 * 1024,
            thumbnail_max_width: 480,
            log_soft_cap: 500,
            sandbox: false,
            relay_url: default_relay_url(),
            native_backend_url: None,
            description_url: None,
            description_api_key: None,
            description_model: default_description_model(),
            store_path: None,
            log_dir: "logs".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads defaults, then the optional TOML file, then `NEXUSWATCH_*`
    /// environment variables. Environment overrides file.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let file_config: PartialEngineConfig = match config_path {
            Some(path_str) if Path::new(path_str).exists() => {
                let contents = fs::read_to_string(path_str).map_err(|source| ConfigError::Read {
                    path: path_str.to_string(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path_str.to_string(),
                    source,
                })?
            }
            _ => PartialEngineConfig::default(),
        };

        let env_config: PartialEngineConfig = envy::prefixed(ENV_PREFIX).from_env()?;

        Self::merge(env_config, file_config)
    }

    fn merge(env: PartialEngineConfig, file: PartialEngineConfig) -> Result<Self, ConfigError> {
        let base = EngineConfig::default();
        let native_backend_url = env.native_backend_url.or(file.native_backend_url);
        let relay_from_env = env.relay_url.is_some();
        let relay_url = env.relay_url.or(file.relay_url).unwrap_or(base.relay_url);
        let sandbox = env
            .sandbox
            .or(file.sandbox)
            .unwrap_or_else(|| detect_sandbox(native_backend_url.as_deref(), relay_from_env));

        let config = EngineConfig {
            default_interval_ms: env.default_interval_ms.or(file.default_interval_ms).unwrap_or(base.default_interval_ms),
            default_threshold: env.default_threshold.or(file.default_threshold).unwrap_or(base.default_threshold),
            describe_threshold: env.describe_threshold.or(file.describe_threshold).unwrap_or(base.describe_threshold),
            min_interval_ms: env.min_interval_ms.or(file.min_interval_ms).unwrap_or(base.min_interval_ms),
            capture_timeout_secs: env.capture_timeout_secs.or(file.capture_timeout_secs).unwrap_or(base.capture_timeout_secs),
            endpoint_timeout_secs: env.endpoint_timeout_secs.or(file.endpoint_timeout_secs).unwrap_or(base.endpoint_timeout_secs),
            max_text_bytes: env.max_text_bytes.or(file.max_text_bytes).unwrap_or(base.max_text_bytes),
            thumbnail_max_width: env.thumbnail_max_width.or(file.thumbnail_max_width).unwrap_or(base.thumbnail_max_width),
            log_soft_cap: env.log_soft_cap.or(file.log_soft_cap).unwrap_or(base.log_soft_cap),
            sandbox,
            relay_url,
            native_backend_url,
            description_url: env.description_url.or(file.description_url),
            description_api_key: env.description_api_key.or(file.description_api_key),
            description_model: env.description_model.or(file.description_model).unwrap_or(base.description_model),
            store_path: env.store_path.or(file.store_path),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or(base.log_dir),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("default_threshold", self.default_threshold),
            ("describe_threshold", self.describe_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within 0..1, got {value}")));
            }
        }
        if self.default_interval_ms < self.min_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "default_interval_ms ({}) is below min_interval_ms ({})",
                self.default_interval_ms, self.min_interval_ms
            )));
        }
        Ok(())
    }

    pub fn defaults(&self) -> MonitorDefaults {
        MonitorDefaults {
            interval_ms: self.default_interval_ms,
            threshold: self.default_threshold,
        }
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs.max(1))
    }

    pub fn endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint_timeout_secs.max(1))
    }
}

/// Without a native backend the engine runs in the restricted environment;
/// an explicitly provided relay confirms it.
fn detect_sandbox(native_backend_url: Option<&str>, relay_configured: bool) -> bool {
    native_backend_url.is_none() && relay_configured
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_overrides_file() {
        let file = PartialEngineConfig {
            default_threshold: Some(0.2),
            default_interval_ms: Some(5000),
            ..Default::default()
        };
        let env = PartialEngineConfig {
            default_threshold: Some(0.3),
            ..Default::default()
        };
        let config = EngineConfig::merge(env, file).unwrap();
        assert_eq!(config.default_threshold, 0.3);
        assert_eq!(config.default_interval_ms, 5000);
        assert_eq!(config.describe_threshold, 0.10);
    }

    #[test]
    fn test_sandbox_detection() {
        let env = PartialEngineConfig {
            relay_url: Some("http://127.0.0.1:9999/proxy".into()),
            ..Default::default()
        };
        let config = EngineConfig::merge(env, PartialEngineConfig::default()).unwrap();
        assert!(config.sandbox);

        let env = PartialEngineConfig {
            relay_url: Some("http://127.0.0.1:9999/proxy".into()),
            native_backend_url: Some("http://127.0.0.1:7000".into()),
            ..Default::default()
        };
        let config = EngineConfig::merge(env, PartialEngineConfig::default()).unwrap();
        assert!(!config.sandbox);

        let env = PartialEngineConfig {
            sandbox: Some(true),
            native_backend_url: Some("http://127.0.0.1:7000".into()),
            ..Default::default()
        };
        assert!(EngineConfig::merge(env, PartialEngineConfig::default()).unwrap().sandbox);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let file = PartialEngineConfig {
            default_threshold: Some(1.5),
            ..Default::default()
        };
        let result = EngineConfig::merge(PartialEngineConfig::default(), file);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_interval_ms = 10000\nstore_path = \"devices.json\"").unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        let partial: PartialEngineConfig = toml::from_str(&contents).unwrap();
        assert_eq!(partial.default_interval_ms, Some(10000));
        assert_eq!(partial.store_path.as_deref(), Some("devices.json"));
    }
}
