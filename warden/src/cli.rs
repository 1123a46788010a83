//! Command-line flags for `wardend`

use crate::tracing_support::{TracingConfig, TracingFormat};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use warden_host::RuntimeConfig;

/// Configuration preset the flags are applied on top of
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    /// Local paths, short intervals, no persisted state
    Development,
    /// Platform data directories and persisted state
    Production,
}

#[derive(Debug, Parser)]
#[command(name = "wardend", version, about = "Plugin orchestration daemon")]
pub struct Cli {
    /// Configuration preset
    #[arg(long, value_enum, env = "WARDEN_PROFILE", default_value = "production")]
    pub profile: Profile,

    /// Plugin package directory (repeatable, or comma separated)
    #[arg(long = "plugin-dir", env = "WARDEN_PLUGIN_DIR", value_delimiter = ',')]
    pub plugin_dirs: Vec<PathBuf>,

    /// Where packages are installed
    #[arg(long, env = "WARDEN_INSTALL_ROOT")]
    pub install_root: Option<PathBuf>,

    /// JSON file holding plugin records across restarts
    #[arg(long, env = "WARDEN_STATE_FILE", conflicts_with = "ephemeral")]
    pub state_file: Option<PathBuf>,

    /// Keep no state across restarts
    #[arg(long)]
    pub ephemeral: bool,

    /// Keep watching plugin directories after the startup scan
    #[arg(long, env = "WARDEN_WATCH")]
    pub watch: bool,

    /// Deadline for each plugin lifecycle call, in milliseconds
    #[arg(long, env = "WARDEN_OPERATION_TIMEOUT_MS")]
    pub operation_timeout_ms: Option<u64>,

    /// Time plugins get between the shutdown announcement and unload
    #[arg(long, env = "WARDEN_SHUTDOWN_GRACE_MS", default_value_t = 5000)]
    pub shutdown_grace_ms: u64,

    /// Log format: pretty, compact or json
    #[arg(long, env = "WARDEN_LOG_FORMAT", default_value = "pretty")]
    pub log_format: TracingFormat,

    /// Force a log level instead of reading RUST_LOG
    #[arg(long, env = "WARDEN_LOG_LEVEL")]
    pub log_level: Option<tracing::Level>,

    /// Omit timestamps, e.g. when journald adds its own
    #[arg(long)]
    pub no_log_timestamps: bool,
}

impl Cli {
    /// Runtime configuration: the profile preset with flag overrides applied
    pub fn runtime_config(&self) -> RuntimeConfig {
        let mut config = match self.profile {
            Profile::Development => RuntimeConfig::development(),
            Profile::Production => RuntimeConfig::production(),
        };

        if !self.plugin_dirs.is_empty() {
            config = config.with_plugin_dirs(self.plugin_dirs.iter().cloned());
        }
        if let Some(root) = &self.install_root {
            config = config.with_install_root(root.clone());
        }
        if self.ephemeral {
            config = config.with_state_file(None);
        } else if let Some(path) = &self.state_file {
            config = config.with_state_file(Some(path.clone()));
        }
        if let Some(ms) = self.operation_timeout_ms {
            config = config.with_operation_timeout(Duration::from_millis(ms));
        }
        config
    }

    pub fn tracing_config(&self) -> TracingConfig {
        TracingConfig {
            level: self.log_level,
            format: self.log_format,
            timestamps: !self.no_log_timestamps,
            thread_ids: self.log_format == TracingFormat::Json,
            ..TracingConfig::default()
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("wardend").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_profile() {
        let cli = parse(&[
            "--profile",
            "development",
            "--plugin-dir",
            "/srv/a,/srv/b",
            "--install-root",
            "/srv/installed",
            "--state-file",
            "/srv/state.json",
            "--operation-timeout-ms",
            "250",
        ]);
        let config = cli.runtime_config();
        assert_eq!(
            config.plugin_dirs,
            vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]
        );
        assert_eq!(config.install_root, PathBuf::from("/srv/installed"));
        assert_eq!(config.state_file, Some(PathBuf::from("/srv/state.json")));
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.health, RuntimeConfig::development().health);
    }

    #[test]
    fn test_ephemeral_drops_state_file() {
        let cli = parse(&["--ephemeral"]);
        assert!(cli.runtime_config().state_file.is_none());

        let conflict = Cli::try_parse_from(["wardend", "--ephemeral", "--state-file", "/x"]);
        assert!(conflict.is_err());
    }

    #[test]
    fn test_log_flags() {
        let cli = parse(&["--log-format", "json", "--log-level", "debug", "--no-log-timestamps"]);
        let tracing = cli.tracing_config();
        assert_eq!(tracing.format, TracingFormat::Json);
        assert_eq!(tracing.level, Some(tracing::Level::DEBUG));
        assert!(!tracing.timestamps);
        assert!(tracing.thread_ids);

        assert!(Cli::try_parse_from(["wardend", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn test_grace_period() {
        let cli = parse(&["--shutdown-grace-ms", "1500"]);
        assert_eq!(cli.shutdown_grace(), Duration::from_millis(1500));
    }
}
