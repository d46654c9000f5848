//! The bridge client: a thin, typed wrapper over a host debug-bridge CLI
//! (e.g. `adb`), spawned as a subprocess for every call.

pub mod backoff;
mod mock;
mod real;

pub use backoff::ExponentialBackoff;
pub use mock::MockBridgeClient;
pub use real::RealBridgeClient;

use async_trait::async_trait;
use std::time::Duration;

/// Errors a bridge call can fail with.
#[derive(Debug, thiserror::Error, Clone)]
pub enum BridgeError {
    #[error("not connected to device {0}")]
    NotConnected(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("bridge command failed: {0}")]
    BridgeFailure(String),

    #[error("i/o error launching bridge process: {0}")]
    Io(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// One device's screen dimensions, as reported by `wm size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

/// One row of `adb devices` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListEntry {
    pub id: String,
    pub state: String,
}

/// Cached device metadata (`getprop`/`wm size`), surfaced via `info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub os_version: String,
    pub screen: ScreenSize,
}

/// Aggregate call statistics, tracked per `BridgeClient` instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeStats {
    pub calls_total: u64,
    pub calls_failed: u64,
    pub total_latency_ms: u64,
}

impl BridgeStats {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.calls_total == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.calls_total as f64
        }
    }
}

/// Everything the rest of the system needs from the bridge, independent of
/// whether it is backed by a real subprocess or a test double.
#[async_trait]
pub trait BridgeClient: Send + Sync {
    async fn connect(&self, address: &str) -> BridgeResult<()>;
    async fn disconnect(&self, address: &str) -> BridgeResult<()>;
    async fn is_device_present(&self, device_id: &str) -> BridgeResult<bool>;

    async fn shell(&self, device_id: &str, command: &str) -> BridgeResult<String>;
    async fn push(&self, device_id: &str, local: &str, remote: &str) -> BridgeResult<()>;
    async fn pull(&self, device_id: &str, remote: &str, local: &str) -> BridgeResult<()>;

    async fn screenshot(&self, device_id: &str, local_path: &str) -> BridgeResult<()>;
    async fn tap(&self, device_id: &str, x: i32, y: i32) -> BridgeResult<()>;
    async fn swipe(
        &self,
        device_id: &str,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    ) -> BridgeResult<()>;
    async fn input_text(&self, device_id: &str, text: &str) -> BridgeResult<()>;
    async fn keyevent(&self, device_id: &str, keycode: u32) -> BridgeResult<()>;
    async fn restart_app(&self, device_id: &str, package: &str) -> BridgeResult<()>;
    async fn screen_size(&self, device_id: &str) -> BridgeResult<ScreenSize>;

    /// Starts the bridge daemon if it isn't already running. Idempotent.
    async fn start_server(&self) -> BridgeResult<()>;
    /// Stops the bridge daemon.
    async fn stop_server(&self) -> BridgeResult<()>;
    /// Lists every device the bridge daemon currently sees, connected or not.
    async fn list_devices(&self) -> BridgeResult<Vec<DeviceListEntry>>;

    /// Runs an arbitrary argv against the device and reports success,
    /// stdout, and stderr without converting a non-zero exit into an error —
    /// the caller decides what a failing exit code means.
    async fn exec(
        &self,
        device_id: &str,
        argv: &[&str],
        timeout: Option<Duration>,
    ) -> BridgeResult<(bool, String, String)>;

    /// A tap held for `duration_ms` — a swipe from a point to itself.
    async fn long_tap(&self, device_id: &str, x: i32, y: i32, duration_ms: u64) -> BridgeResult<()> {
        self.swipe(device_id, x, y, x, y, duration_ms).await
    }

    /// Model, OS version, and screen size, read from device properties.
    async fn info(&self, device_id: &str) -> BridgeResult<DeviceInfo>;

    fn stats(&self) -> BridgeStats;
}

/// Escapes a string for safe inclusion in an `adb shell input text` argument:
/// spaces become `%s`, and shell metacharacters that the Android `input`
/// command treats specially are backslash-escaped.
pub fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            ' ' => out.push_str("%s"),
            '&' | '<' | '>' | '|' | ';' | '(' | ')' | '$' | '`' | '"' | '\'' | '\\' | '*' | '~' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_spaces_and_metacharacters() {
        assert_eq!(escape_input_text("hello world"), "hello%sworld");
        assert_eq!(escape_input_text("a&b"), "a\\&b");
        assert_eq!(escape_input_text("plain"), "plain");
    }
}
