//! Configuration for the checkgate controller.
//!
//! Settings are layered: built-in defaults, then `checkgate.toml`, then
//! `CHECKGATE_*` environment variables, then command-line flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [reconciler]
//! requeue_after_ms = 5000
//! task_name_attempts = 5
//! task_suffix_len = 10
//!
//! [controller]
//! workers = 4
//! resync_interval_secs = 300
//! store_timeout_ms = 30000
//! error_backoff_base_ms = 500
//! error_backoff_max_ms = 300000
//!
//! [events]
//! reporting_controller = "workloadinstance-controller"
//! reporting_instance = "workloadinstance-controller"
//!
//! [logging]
//! filter = "info"
//! format = "text"
//! directory = "/var/log/checkgate"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::controller::ControllerSettings;
use crate::events::DEFAULT_REPORTING_CONTROLLER;
use crate::naming::{DEFAULT_NAME_ATTEMPTS, DEFAULT_SUFFIX_LEN};
use crate::reconciler::ReconcilerSettings;

/// File looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "checkgate.toml";

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "CHECKGATE_";

/// Longest suffix a UUID can supply
const MAX_SUFFIX_LEN: usize = 36;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines (default)
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: text, json", s),
        }
    }
}

/// Reconcile pass settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerSection {
    /// Delay between polls of a running check task
    #[serde(default = "default_requeue_after_ms")]
    pub requeue_after_ms: u64,
    /// Creation attempts before a task name collision is fatal
    #[serde(default = "default_task_name_attempts")]
    pub task_name_attempts: usize,
    /// Characters of the generated identifier used as name suffix
    #[serde(default = "default_task_suffix_len")]
    pub task_suffix_len: usize,
}

fn default_requeue_after_ms() -> u64 {
    5000
}

fn default_task_name_attempts() -> usize {
    DEFAULT_NAME_ATTEMPTS
}

fn default_task_suffix_len() -> usize {
    DEFAULT_SUFFIX_LEN
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            requeue_after_ms: default_requeue_after_ms(),
            task_name_attempts: default_task_name_attempts(),
            task_suffix_len: default_task_suffix_len(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Deadline for a whole reconcile pass
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_error_backoff_base_ms")]
    pub error_backoff_base_ms: u64,
    #[serde(default = "default_error_backoff_max_ms")]
    pub error_backoff_max_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_resync_interval_secs() -> u64 {
    300
}

fn default_store_timeout_ms() -> u64 {
    30_000
}

fn default_error_backoff_base_ms() -> u64 {
    500
}

fn default_error_backoff_max_ms() -> u64 {
    300_000
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_interval_secs: default_resync_interval_secs(),
            store_timeout_ms: default_store_timeout_ms(),
            error_backoff_base_ms: default_error_backoff_base_ms(),
            error_backoff_max_ms: default_error_backoff_max_ms(),
        }
    }
}

/// Identity written into every audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsSection {
    #[serde(default = "default_reporter")]
    pub reporting_controller: String,
    #[serde(default = "default_reporter")]
    pub reporting_instance: String,
}

fn default_reporter() -> String {
    DEFAULT_REPORTING_CONTROLLER.to_string()
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            reporting_controller: default_reporter(),
            reporting_instance: default_reporter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `tracing` filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily-rolling log files here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// Parsed `checkgate.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckgateConfig {
    #[serde(default)]
    pub reconciler: ReconcilerSection,
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl CheckgateConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse checkgate.toml")
    }

    /// Defaults, then the file, then the process environment.
    ///
    /// An explicit `path` must exist. Without one, `checkgate.toml` in the
    /// working directory is used if present.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize checkgate.toml")
    }

    /// Override settings from `CHECKGATE_*` variables found through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        override_parsed(&var, "REQUEUE_AFTER_MS", &mut self.reconciler.requeue_after_ms)?;
        override_parsed(&var, "TASK_NAME_ATTEMPTS", &mut self.reconciler.task_name_attempts)?;
        override_parsed(&var, "TASK_SUFFIX_LEN", &mut self.reconciler.task_suffix_len)?;

        override_parsed(&var, "WORKERS", &mut self.controller.workers)?;
        override_parsed(
            &var,
            "RESYNC_INTERVAL_SECS",
            &mut self.controller.resync_interval_secs,
        )?;
        override_parsed(&var, "STORE_TIMEOUT_MS", &mut self.controller.store_timeout_ms)?;
        override_parsed(
            &var,
            "ERROR_BACKOFF_BASE_MS",
            &mut self.controller.error_backoff_base_ms,
        )?;
        override_parsed(
            &var,
            "ERROR_BACKOFF_MAX_MS",
            &mut self.controller.error_backoff_max_ms,
        )?;

        if let Some(value) = var("REPORTING_CONTROLLER") {
            self.events.reporting_controller = value;
        }
        if let Some(value) = var("REPORTING_INSTANCE") {
            self.events.reporting_instance = value;
        }

        if let Some(value) = var("LOG_FILTER") {
            self.logging.filter = value;
        }
        override_parsed(&var, "LOG_FORMAT", &mut self.logging.format)?;
        if let Some(value) = var("LOG_DIR") {
            self.logging.directory = (!value.is_empty()).then(|| PathBuf::from(value));
        }

        Ok(())
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.reconciler.requeue_after_ms == 0 {
            errors.push("reconciler.requeue_after_ms must be greater than 0".to_string());
        }
        if self.reconciler.task_name_attempts == 0 {
            errors.push("reconciler.task_name_attempts must be at least 1".to_string());
        }
        if !(1..=MAX_SUFFIX_LEN).contains(&self.reconciler.task_suffix_len) {
            errors.push(format!(
                "reconciler.task_suffix_len must be between 1 and {}, got {}",
                MAX_SUFFIX_LEN, self.reconciler.task_suffix_len
            ));
        }
        if self.controller.workers == 0 {
            errors.push("controller.workers must be at least 1".to_string());
        }
        if self.controller.resync_interval_secs == 0 {
            errors.push("controller.resync_interval_secs must be greater than 0".to_string());
        }
        if self.controller.store_timeout_ms == 0 {
            errors.push("controller.store_timeout_ms must be greater than 0".to_string());
        }
        if self.controller.error_backoff_base_ms > self.controller.error_backoff_max_ms {
            errors.push(format!(
                "controller.error_backoff_base_ms ({}) exceeds error_backoff_max_ms ({})",
                self.controller.error_backoff_base_ms, self.controller.error_backoff_max_ms
            ));
        }
        if self.events.reporting_controller.is_empty() {
            errors.push("events.reporting_controller must not be empty".to_string());
        }

        errors
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            requeue_after: Duration::from_millis(self.reconciler.requeue_after_ms),
            task_name_attempts: self.reconciler.task_name_attempts,
            task_suffix_len: self.reconciler.task_suffix_len,
            reporting_controller: self.events.reporting_controller.clone(),
            reporting_instance: self.events.reporting_instance.clone(),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            workers: self.controller.workers,
            resync_interval: Duration::from_secs(self.controller.resync_interval_secs),
            store_timeout: Duration::from_millis(self.controller.store_timeout_ms),
            error_backoff_base: Duration::from_millis(self.controller.error_backoff_base_ms),
            error_backoff_max: Duration::from_millis(self.controller.error_backoff_max_ms),
        }
    }
}

fn override_parsed<T, F>(var: &F, name: &str, target: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}{}='{}': {}", ENV_PREFIX, name, raw, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CheckgateConfig::default();
        assert_eq!(config.reconciler.requeue_after_ms, 5000);
        assert_eq!(config.reconciler.task_name_attempts, 5);
        assert_eq!(config.reconciler.task_suffix_len, 10);
        assert_eq!(config.controller.workers, 4);
        assert_eq!(config.controller.resync_interval_secs, 300);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = CheckgateConfig::parse(
            r#"
[reconciler]
requeue_after_ms = 250

[logging]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.reconciler.requeue_after_ms, 250);
        assert_eq!(config.reconciler.task_name_attempts, 5);
        assert_eq!(config.controller.workers, 4);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_rejects_unknown_format() {
        let err = CheckgateConfig::parse("[logging]\nformat = \"xml\"\n").unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkgate.toml");
        let mut config = CheckgateConfig::default();
        config.controller.workers = 9;
        config.logging.directory = Some(PathBuf::from("/tmp/logs"));
        config.save(&path).unwrap();

        let loaded = CheckgateConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempdir().unwrap();
        let err = CheckgateConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = CheckgateConfig::parse("[controller]\nworkers = 2\n").unwrap();
        config
            .apply_env(env(&[
                ("CHECKGATE_WORKERS", "16"),
                ("CHECKGATE_REQUEUE_AFTER_MS", " 100 "),
                ("CHECKGATE_LOG_FORMAT", "JSON"),
                ("CHECKGATE_REPORTING_INSTANCE", "checkgate-7f9c"),
                ("CHECKGATE_LOG_DIR", "/var/log/checkgate"),
            ]))
            .unwrap();

        assert_eq!(config.controller.workers, 16);
        assert_eq!(config.reconciler.requeue_after_ms, 100);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.events.reporting_instance, "checkgate-7f9c");
        assert_eq!(
            config.logging.directory,
            Some(PathBuf::from("/var/log/checkgate"))
        );
    }

    #[test]
    fn test_env_with_bad_number_is_error() {
        let mut config = CheckgateConfig::default();
        let err = config
            .apply_env(env(&[("CHECKGATE_WORKERS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("CHECKGATE_WORKERS"));
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = CheckgateConfig::default();
        config.reconciler.requeue_after_ms = 0;
        config.reconciler.task_name_attempts = 0;
        config.reconciler.task_suffix_len = 37;
        config.controller.workers = 0;

        let errors = config.validate();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("task_suffix_len")));
        assert!(errors.iter().any(|e| e.contains("workers")));
    }

    #[test]
    fn test_settings_conversion() {
        let mut config = CheckgateConfig::default();
        config.reconciler.requeue_after_ms = 1500;
        config.controller.store_timeout_ms = 2000;

        let reconciler = config.reconciler_settings();
        assert_eq!(reconciler.requeue_after, Duration::from_millis(1500));
        assert_eq!(reconciler.reporting_controller, DEFAULT_REPORTING_CONTROLLER);

        let controller = config.controller_settings();
        assert_eq!(controller.store_timeout, Duration::from_secs(2));
        assert_eq!(controller.resync_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!(
            "yaml"
                .parse::<LogFormat>()
                .unwrap_err()
                .to_string()
                .contains("Invalid log format")
        );
    }
}
