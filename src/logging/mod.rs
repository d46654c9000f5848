//! Logging setup: console output plus rotating file sinks.
//!
//! The main application log rotates by size (`logging.max_file_size_bytes`,
//! keeping `logging.max_rotated_files` old copies), matching the rotation
//! knobs carried over from the config. Per-device logs get their own sink
//! under `logs/devices/<date>_<id>.log` so a single noisy device doesn't
//! drown out the others.

mod rotating_writer;

pub use rotating_writer::RotatingFileWriter;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initializes the global `tracing` subscriber: colored console output plus
/// a rotating file sink under `<logging.directory>/<today>.log`.
pub fn init(config: &LoggingConfig) -> std::io::Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let log_path = config.directory.join(format!(
        "{}.log",
        chrono::Local::now().format("%Y%m%d")
    ));
    let file_writer = RotatingFileWriter::new(
        log_path,
        config.max_file_size_bytes,
        config.max_rotated_files,
    )?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter_str(config.level)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.colored_console)
        .with_writer(move || file_writer.clone())
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    Ok(())
}

fn level_filter_str(level: crate::config::LogLevel) -> &'static str {
    match level {
        crate::config::LogLevel::Debug => "debug",
        crate::config::LogLevel::Info => "info",
        crate::config::LogLevel::Warning => "warn",
        crate::config::LogLevel::Error | crate::config::LogLevel::Critical => "error",
    }
}

/// Opens (creating if necessary) a per-device rotating log file under
/// `<logs_dir>/devices/<date>_<device_id>.log`. The `:` separators commonly
/// found in `host:port` device ids are replaced so the filename stays
/// filesystem-safe on every platform.
pub fn device_log_path(logs_dir: &Path, device_id: &str) -> PathBuf {
    let safe_id = device_id.replace([':', '/', '\\'], "_");
    logs_dir
        .join("devices")
        .join(format!("{}_{}.log", chrono::Local::now().format("%Y%m%d"), safe_id))
}

/// A minimal per-device log sink: writes plain lines, no rotation (device
/// logs are naturally bounded by one file per calendar day).
pub struct DeviceLogSink {
    path: PathBuf,
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl DeviceLogSink {
    pub fn open(logs_dir: &Path, device_id: &str) -> std::io::Result<Self> {
        let path = device_log_path(logs_dir, device_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(std::sync::Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&self, level: &str, message: &str) {
        use std::io::Write;
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let mut file = self.file.lock().expect("device log mutex poisoned");
        let _ = writeln!(file, "[{timestamp}] [{level}] {message}");
    }
}

impl Clone for DeviceLogSink {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            file: self.file.clone(),
        }
    }
}
