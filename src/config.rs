//! TOML configuration for machinewatch.
//!
//! Every section has compiled-in defaults, so an empty file (or no file) is a
//! valid configuration. Lookup order: explicit `--config` path, the
//! `MACHINEWATCH_CONFIG` environment variable, `/etc/machinewatch/machinewatch.toml`,
//! then defaults.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alert::RetryPolicy;
use crate::detect::{ForestParams, SafetyRule, SeverityThresholds};
use crate::telemetry::Sensor;

const CONFIG_ENV: &str = "MACHINEWATCH_CONFIG";
const SYSTEM_CONFIG: &str = "/etc/machinewatch/machinewatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub model: ModelConfig,
    pub severity: SeverityThresholds,
    pub safety: SafetyConfig,
    pub transport: TransportConfig,
    pub alerts: AlertConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub simulator: SimulatorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration. An explicit path must load; the environment and
    /// system locations fall through to defaults on error.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "{} set but file could not be loaded, trying fallback", CONFIG_ENV
                ),
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %system_path.display(),
                    error = %e,
                    "system config file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.min_training_samples < 2 {
            bail!(
                "engine.min_training_samples must be at least 2, got {}",
                self.engine.min_training_samples
            );
        }
        if self.engine.queue_depth == 0 {
            bail!("engine.queue_depth must be positive");
        }
        if !(self.model.contamination > 0.0 && self.model.contamination < 1.0) {
            bail!("model.contamination must be in (0, 1), got {}", self.model.contamination);
        }
        if self.model.n_estimators == 0 {
            bail!("model.n_estimators must be positive");
        }
        if self.model.max_samples < 2 {
            bail!("model.max_samples must be at least 2");
        }
        if self.model.features.is_empty() {
            bail!("model.features must list at least one sensor");
        }
        for (i, s) in self.model.features.iter().enumerate() {
            if self.model.features[..i].contains(s) {
                bail!("model.features lists '{}' twice", s);
            }
        }
        if !(self.severity.critical < self.severity.warning) {
            bail!(
                "severity.critical ({}) must be below severity.warning ({})",
                self.severity.critical,
                self.severity.warning
            );
        }
        if self.alerts.retry.max_attempts == 0 {
            bail!("alerts.retry.max_attempts must be at least 1");
        }
        if self.simulator.interval_ms == 0 {
            bail!("simulator.interval_ms must be positive");
        }
        if self.storage.enabled && self.storage.model_dir.as_os_str().is_empty() {
            bail!("storage.model_dir must be set when storage is enabled");
        }
        if self.transport.namespace.is_empty() || self.transport.namespace.contains(['+', '#']) {
            bail!(
                "transport.namespace '{}' is not a valid topic prefix",
                self.transport.namespace
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Baseline size that triggers the COLD -> TRAINED transition.
    pub min_training_samples: usize,
    /// Recent readings kept per machine for the query API.
    pub history_len: usize,
    /// Per-machine inbound queue depth.
    pub queue_depth: usize,
    /// Interval between statistics log lines. Zero disables them.
    pub stats_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_training_samples: 30,
            history_len: 50,
            queue_depth: 1024,
            stats_interval_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Feature layout. Changing it invalidates persisted models.
    pub features: Vec<Sensor>,
    pub n_estimators: usize,
    pub contamination: f64,
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let params = ForestParams::default();
        Self {
            features: Sensor::ALL.to_vec(),
            n_estimators: params.n_estimators,
            contamination: params.contamination,
            max_samples: params.max_samples,
            seed: params.seed,
        }
    }
}

impl ModelConfig {
    pub fn forest_params(&self) -> ForestParams {
        ForestParams {
            n_estimators: self.n_estimators,
            max_samples: self.max_samples,
            contamination: self.contamination,
            seed: self.seed,
        }
    }
}

// ---------------------------------------------------------------------------
// Safety rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub rules: Vec<SafetyRule>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            rules: SafetyRule::defaults(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process broadcast channel.
    Memory,
    /// NATS broker (requires the `nats` feature).
    Nats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Topic prefix, e.g. `factory` for `factory/machines/+/sensors`.
    pub namespace: String,
    pub nats_url: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Memory,
            namespace: "factory".to_string(),
            nats_url: "127.0.0.1:4222".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Alerts waiting for publish before new ones are dropped.
    pub outbox_capacity: usize,
    /// Recent alerts kept for the query API.
    pub feed_len: usize,
    pub retry: RetryPolicy,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 1024,
            feed_len: 100,
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage / API / simulator / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Persist trained models and restore them at start-up.
    pub enabled: bool,
    /// Directory for persisted models.
    pub model_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_dir: PathBuf::from("models"),
        }
    }
}

impl StorageConfig {
    /// Model directory, or `None` when persistence is disabled.
    pub fn active_dir(&self) -> Option<&Path> {
        self.enabled.then_some(self.model_dir.as_path())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Run the simulator inside the engine process.
    pub enabled: bool,
    pub machines: usize,
    pub interval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            machines: 3,
            interval_ms: 3_000,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::severity::Bound;

    #[test]
    fn test_empty_file_is_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.engine.min_training_samples, 30);
        assert_eq!(config.model.n_estimators, 100);
        assert_eq!(config.model.contamination, 0.15);
        assert_eq!(config.severity.critical, -0.5);
        assert_eq!(config.severity.warning, -0.3);
        assert_eq!(config.safety.rules.len(), 4);
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml(
            r#"
            [engine]
            min_training_samples = 50

            [model]
            features = ["temperature", "vibration", "current", "pressure"]

            [[safety.rules]]
            sensor = "pressure"
            bound = "above"
            limit = 8.0
            message = "Pressure above rated limit"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.min_training_samples, 50);
        assert_eq!(config.engine.history_len, 50);
        assert_eq!(config.model.features.len(), 4);
        assert_eq!(config.safety.rules.len(), 1);
        assert_eq!(config.safety.rules[0].bound, Bound::Above);
    }

    #[test]
    fn test_validation_rejects() {
        assert!(Config::from_toml("[engine]\nmin_training_samples = 1").is_err());
        assert!(Config::from_toml("[model]\ncontamination = 1.0").is_err());
        assert!(Config::from_toml("[model]\ncontamination = 0.0").is_err());
        assert!(Config::from_toml("[model]\nfeatures = [\"rpm\", \"rpm\"]").is_err());
        assert!(Config::from_toml("[severity]\ncritical = -0.2\nwarning = -0.3").is_err());
        assert!(Config::from_toml("[alerts.retry]\nmax_attempts = 0").is_err());
        assert!(Config::from_toml("[simulator]\ninterval_ms = 0").is_err());
        assert!(Config::from_toml("[transport]\nnamespace = \"a/#\"").is_err());
        assert!(Config::from_toml("[storage]\nmodel_dir = \"\"").is_err());
    }

    #[test]
    fn test_storage_can_be_disabled() {
        let defaults = Config::from_toml("[storage]\n").unwrap();
        assert_eq!(defaults.storage.active_dir(), Some(Path::new("models")));

        let disabled = Config::from_toml("[storage]\nenabled = false\n").unwrap();
        assert_eq!(disabled.storage.active_dir(), None);

        let moved = Config::from_toml("[storage]\nmodel_dir = \"/var/lib/machinewatch\"").unwrap();
        assert_eq!(moved.storage.active_dir(), Some(Path::new("/var/lib/machinewatch")));

        let text = toml::to_string_pretty(&disabled).unwrap();
        assert!(!Config::from_toml(&text).unwrap().storage.enabled);
    }

    #[test]
    fn test_defaults_serialize_and_reload() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let reloaded = Config::from_toml(&text).unwrap();
        assert_eq!(reloaded, Config::default());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_or_default(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("machinewatch.toml");
        std::fs::write(&path, "[transport]\nnamespace = \"plant7\"\n").unwrap();
        let config = Config::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.transport.namespace, "plant7");
    }
}
