//! Configuration loading and validation
//!
//! Durations are written in milliseconds in the YAML file and converted to
//! `Duration` when building a `DispatcherConfig`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayqError, Result};
use crate::scheduler::{DispatcherConfig, RateLimitConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub dispatch: DispatchSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            dispatch: DispatchSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub tick_interval_ms: u64,
    pub max_batch_size: usize,
    pub max_retries: u32,
    pub default_retry_after_ms: u64,
    pub queue_capacity: Option<usize>,
    pub stop_grace_ms: u64,
    pub fail_pending_on_stop: bool,
    pub rate_limit: RateLimitSection,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            max_batch_size: 5,
            max_retries: 3,
            default_retry_after_ms: 1000,
            queue_capacity: None,
            stop_grace_ms: 5000,
            fail_pending_on_stop: false,
            rate_limit: RateLimitSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub window_ms: u64,
    pub max_requests_per_window: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            max_requests_per_window: 50,
            backoff_base_ms: 1000,
            max_backoff_ms: 60000,
        }
    }
}

impl From<&RateLimitSection> for RateLimitConfig {
    fn from(section: &RateLimitSection) -> Self {
        RateLimitConfig::new(Duration::from_millis(section.window_ms), section.max_requests_per_window).with_backoff(
            Duration::from_millis(section.backoff_base_ms),
            Duration::from_millis(section.max_backoff_ms),
        )
    }
}

impl From<&DispatchSection> for DispatcherConfig {
    fn from(section: &DispatchSection) -> Self {
        DispatcherConfig::default()
            .with_rate_limit(RateLimitConfig::from(&section.rate_limit))
            .with_tick_interval(Duration::from_millis(section.tick_interval_ms))
            .with_batch_size(section.max_batch_size)
            .with_max_retries(section.max_retries)
            .with_default_retry_after(Duration::from_millis(section.default_retry_after_ms))
            .with_queue_capacity(section.queue_capacity)
            .with_stop_grace(Duration::from_millis(section.stop_grace_ms))
            .with_fail_pending_on_stop(section.fail_pending_on_stop)
    }
}

/// Problems found by `Config::validate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Settings the dispatcher cannot run with.
    pub errors: Vec<String>,
    /// Settings that work but are probably a mistake.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    /// Emit every finding through the log.
    pub fn log(&self) {
        for warning in &self.warnings {
            tracing::warn!(warning = %warning, "Config warning");
        }
        for error in &self.errors {
            tracing::error!(error = %error, "Config error");
        }
    }

    /// Turn the report into an error if it holds any errors.
    pub fn into_result(self) -> Result<()> {
        if self.has_errors() {
            return Err(RelayqError::InvalidConfig(self.errors.join("; ")));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // An explicit path must load; no silent fallback.
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        let project_name = env!("CARGO_PKG_NAME");

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config = Self::from_yaml(&content)?;
        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document means "all defaults".
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Dispatcher settings described by this config.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::from(&self.dispatch)
    }

    /// Check the dispatch settings for values that cannot work or look wrong.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        let dispatch = &self.dispatch;
        let rate_limit = &dispatch.rate_limit;

        if dispatch.max_batch_size == 0 {
            report
                .errors
                .push("dispatch.max_batch_size must be greater than 0".to_string());
        }
        if dispatch.tick_interval_ms == 0 {
            report
                .errors
                .push("dispatch.tick_interval_ms must be greater than 0".to_string());
        } else if dispatch.tick_interval_ms < 10 {
            report.warnings.push(format!(
                "dispatch.tick_interval_ms is {}ms; intervals under 10ms busy-loop the scheduler",
                dispatch.tick_interval_ms
            ));
        }
        if rate_limit.window_ms == 0 {
            report
                .errors
                .push("dispatch.rate_limit.window_ms must be greater than 0".to_string());
        }
        if rate_limit.max_requests_per_window == 0 {
            report
                .errors
                .push("dispatch.rate_limit.max_requests_per_window must be greater than 0".to_string());
        } else if rate_limit.max_requests_per_window > 100 {
            report.warnings.push(format!(
                "dispatch.rate_limit.max_requests_per_window is {}; most chat APIs allow far fewer",
                rate_limit.max_requests_per_window
            ));
        }
        if rate_limit.max_backoff_ms < rate_limit.backoff_base_ms {
            report.warnings.push(format!(
                "dispatch.rate_limit.max_backoff_ms ({}) is below backoff_base_ms ({}); every backoff is clamped",
                rate_limit.max_backoff_ms, rate_limit.backoff_base_ms
            ));
        }
        if dispatch.queue_capacity == Some(0) {
            report
                .errors
                .push("dispatch.queue_capacity must be greater than 0 when set".to_string());
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level.as_deref(), Some("info"));
        assert_eq!(config.dispatch.tick_interval_ms, 100);
        assert_eq!(config.dispatch.max_batch_size, 5);
        assert_eq!(config.dispatch.rate_limit.max_requests_per_window, 50);
        assert!(config.validate().is_clean());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
dispatch:
  max_batch_size: 10
  rate_limit:
    window_ms: 2000
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.dispatch.max_batch_size, 10);
        assert_eq!(config.dispatch.rate_limit.window_ms, 2000);
        assert_eq!(config.dispatch.rate_limit.max_requests_per_window, 50);
        assert_eq!(config.dispatch.tick_interval_ms, 100);
        assert_eq!(config.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        let err = Config::from_yaml("dispatch: [not, a, map]").unwrap_err();
        assert!(matches!(err, RelayqError::Yaml(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "log_level: debug\ndispatch:\n  queue_capacity: 500").unwrap();

        let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.dispatch.queue_capacity, Some(500));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yml");
        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, RelayqError::Io(_)));
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = Config::default();
        config.dispatch.fail_pending_on_stop = true;
        let yaml = config.to_yaml().unwrap();
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_dispatcher_config_conversion() {
        let mut config = Config::default();
        config.dispatch.tick_interval_ms = 250;
        config.dispatch.rate_limit.max_backoff_ms = 30000;
        config.dispatch.queue_capacity = Some(10);

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.tick_interval, Duration::from_millis(250));
        assert_eq!(dispatcher.rate_limit.max_backoff, Duration::from_secs(30));
        assert_eq!(dispatcher.rate_limit.window, Duration::from_millis(1000));
        assert_eq!(dispatcher.queue_capacity, Some(10));
        assert_eq!(dispatcher.default_retry_after, Duration::from_millis(1000));
    }

    #[test]
    fn test_validate_errors() {
        let mut config = Config::default();
        config.dispatch.max_batch_size = 0;
        config.dispatch.tick_interval_ms = 0;
        config.dispatch.rate_limit.window_ms = 0;
        config.dispatch.rate_limit.max_requests_per_window = 0;

        let report = config.validate();
        assert_eq!(report.errors.len(), 4);
        assert!(report.has_errors());
        assert!(report.warnings.is_empty());

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, RelayqError::InvalidConfig(_)));
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = Config::default();
        config.dispatch.tick_interval_ms = 5;
        config.dispatch.rate_limit.max_requests_per_window = 500;
        config.dispatch.rate_limit.max_backoff_ms = 100;

        let report = config.validate();
        assert!(!report.has_errors());
        assert_eq!(report.warnings.len(), 3);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_zero_capacity_is_error() {
        let mut config = Config::default();
        config.dispatch.queue_capacity = Some(0);
        assert!(config.validate().has_errors());
    }
}
