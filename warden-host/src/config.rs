//! Runtime configuration
//!
//! Plain structs with defaults, `with_*` builders and two presets:
//! [`RuntimeConfig::development`] and [`RuntimeConfig::production`].

use crate::health::ResourceThresholds;
use crate::installer::default_plugin_dirs;
use std::path::PathBuf;
use std::time::Duration;

/// Application name used for default paths
pub const APP_NAME: &str = "warden";

/// Health monitor settings
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Time between health sweeps
    pub interval: Duration,
    /// Samples kept per metric for trend detection
    pub history_len: usize,
    pub thresholds: ResourceThresholds,
    /// Total violations that escalate to MILD
    pub mild_after: u32,
    /// Total violations that escalate to SEVERE
    pub severe_after: u32,
    /// Total violations that suspend the plugin
    pub suspend_after: u32,
    /// Consecutive reported errors that isolate the plugin
    pub isolate_after_consecutive_errors: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            history_len: 5,
            thresholds: ResourceThresholds::default(),
            mild_after: 3,
            severe_after: 5,
            suspend_after: 10,
            isolate_after_consecutive_errors: 5,
        }
    }
}

impl HealthConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_thresholds(mut self, thresholds: ResourceThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_escalation(mut self, mild: u32, severe: u32, suspend: u32) -> Self {
        self.mild_after = mild;
        self.severe_after = severe;
        self.suspend_after = suspend;
        self
    }

    pub fn with_isolation_threshold(mut self, consecutive_errors: u32) -> Self {
        self.isolate_after_consecutive_errors = consecutive_errors;
        self
    }
}

/// Rollout manager settings
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutConfig {
    /// Time between scheduler ticks
    pub tick_interval: Duration,
    pub default_batch_size_percent: u8,
    pub default_validate_window: Duration,
    /// Unhealthy share of observations above which a rollout fails
    pub unhealthy_ratio_threshold: f64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            default_batch_size_percent: 10,
            default_validate_window: Duration::from_secs(10 * 60),
            unhealthy_ratio_threshold: 0.2,
        }
    }
}

impl RolloutConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_unhealthy_ratio(mut self, threshold: f64) -> Self {
        self.unhealthy_ratio_threshold = threshold;
        self
    }
}

/// Top-level runtime settings
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Deadline for every loader call
    pub operation_timeout: Duration,
    /// Deadline for one resource sample
    pub probe_timeout: Duration,
    pub event_workers: usize,
    pub event_queue_capacity: usize,
    pub health: HealthConfig,
    pub rollout: RolloutConfig,
    /// Where packages are installed
    pub install_root: PathBuf,
    /// Directories scanned at startup and watched afterwards
    pub plugin_dirs: Vec<PathBuf>,
    /// JSON file of persisted plugin records; `None` disables persistence
    pub state_file: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl RuntimeConfig {
    /// Short intervals and local paths
    pub fn development() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            event_workers: 2,
            event_queue_capacity: 256,
            health: HealthConfig::default().with_interval(Duration::from_secs(5)),
            rollout: RolloutConfig {
                tick_interval: Duration::from_secs(5),
                default_validate_window: Duration::from_secs(60),
                ..RolloutConfig::default()
            },
            install_root: PathBuf::from(".warden").join("installed"),
            plugin_dirs: vec![PathBuf::from("plugins")],
            state_file: None,
        }
    }

    /// Platform data directories and conservative intervals
    pub fn production() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(APP_NAME);
        Self {
            operation_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            event_workers: 4,
            event_queue_capacity: 1024,
            health: HealthConfig::default(),
            rollout: RolloutConfig::default(),
            install_root: data_dir.join("installed"),
            plugin_dirs: default_plugin_dirs(APP_NAME),
            state_file: Some(data_dir.join("plugins.json")),
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_rollout(mut self, rollout: RolloutConfig) -> Self {
        self.rollout = rollout;
        self
    }

    pub fn with_install_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.install_root = root.into();
        self
    }

    pub fn with_plugin_dirs(mut self, dirs: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.plugin_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_state_file(mut self, path: Option<PathBuf>) -> Self {
        self.state_file = path;
        self
    }
}
