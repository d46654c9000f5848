//! Top-level application configuration, loaded from a single YAML file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors that can occur while loading or validating the application config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Directories {
    pub configs: PathBuf,
    pub logs: PathBuf,
    pub templates: PathBuf,
    pub output: PathBuf,
}

impl Default for Directories {
    fn default() -> Self {
        Self {
            configs: PathBuf::from("configs"),
            logs: PathBuf::from("logs"),
            templates: PathBuf::from("templates"),
            output: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub directory: PathBuf,
    pub colored_console: bool,
    pub max_file_size_bytes: u64,
    pub max_rotated_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            directory: PathBuf::from("logs"),
            colored_console: true,
            max_file_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Path to the bridge CLI binary (e.g. `adb`), or just the name if it's on PATH.
    pub path: String,
    /// Port the bridge server listens on (`adb.port`); not passed on every
    /// call, since the CLI binary itself talks to its own default server,
    /// but carried through for parity with the wire config surface.
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    /// Logs the full argv of every bridge command at debug level.
    pub debug: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            path: "adb".to_string(),
            port: 5037,
            connect_timeout_ms: 5_000,
            command_timeout_ms: 10_000,
            max_retries: 3,
            retry_interval_ms: 1_000,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub roster_file: PathBuf,
    pub auto_reconnect: bool,
    pub status_check_interval_s: u64,
    /// Minimum time between reconnect attempts for the same device.
    pub reconnect_backoff_s: u64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            roster_file: PathBuf::from("devices.txt"),
            auto_reconnect: true,
            status_check_interval_s: 30,
            reconnect_backoff_s: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub run_on_start: bool,
    /// Minutes-of-hour at which automation runs fire (cron-like, rising edge).
    pub run_minutes: Vec<u32>,
    pub poll_interval_s: u64,
    /// Devices per batch (`B`); batches partition the roster, independent of
    /// the concurrency cap below.
    pub batch_size: usize,
    /// Max device tasks running in parallel across all batches (`N`).
    pub max_concurrent_devices: usize,
    pub batch_stagger_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_on_start: true,
            run_minutes: vec![0, 30],
            poll_interval_s: 10,
            batch_size: 10,
            max_concurrent_devices: 20,
            batch_stagger_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub default_threshold: f32,
    pub max_find_all_results: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.85,
            max_find_all_results: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiStyle {
    Rich,
    Plain,
}

impl Default for UiStyle {
    fn default() -> Self {
        UiStyle::Rich
    }
}

/// Console/REPL presentation knobs. No rendering lives here (the CLI is a
/// plain `println!`/`rustyline` shell, not a TUI) — this just carries the
/// config surface's `ui.*` keys through a YAML round trip for whichever
/// front end reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub style: UiStyle,
    pub show_progress: bool,
    pub update_interval_ms: u64,
    pub max_lines: usize,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            style: UiStyle::default(),
            show_progress: true,
            update_interval_ms: 500,
            max_lines: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub directories: Directories,
    pub logging: LoggingConfig,
    pub bridge: BridgeConfig,
    pub devices: DevicesConfig,
    pub scheduler: SchedulerConfig,
    pub matcher: MatcherConfig,
    pub ui: UiConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            directories: Directories::default(),
            logging: LoggingConfig::default(),
            bridge: BridgeConfig::default(),
            devices: DevicesConfig::default(),
            scheduler: SchedulerConfig::default(),
            matcher: MatcherConfig::default(),
            ui: UiConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    /// Create the configured directories if they don't already exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            &self.directories.configs,
            &self.directories.logs,
            &self.directories.templates,
            &self.directories.output,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::create_dir_all(self.directories.logs.join("devices"))?;
        Ok(())
    }
}
