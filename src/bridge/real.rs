use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::{
    escape_input_text, BridgeClient, BridgeError, BridgeResult, BridgeStats, DeviceInfo,
    DeviceListEntry, ExponentialBackoff, ScreenSize,
};
use crate::config::BridgeConfig;

/// Wraps an on-PATH (or explicitly pathed) bridge CLI binary, spawning one
/// subprocess per call. Every call is wrapped in a timeout; on expiry the
/// child is killed rather than left to leak.
pub struct RealBridgeClient {
    bridge_path: String,
    command_timeout: Duration,
    connect_timeout: Duration,
    connect_max_retries: u32,
    connect_retry_interval_ms: u64,
    debug: bool,
    calls_total: AtomicU64,
    calls_failed: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl RealBridgeClient {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            bridge_path: config.path.clone(),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            connect_max_retries: config.max_retries,
            connect_retry_interval_ms: config.retry_interval_ms,
            debug: config.debug,
            calls_total: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
        }
    }

    /// Runs `<bridge_path> <args...>`, applying the given timeout, and
    /// returns (stdout, stderr) on a zero exit code.
    async fn run(&self, args: &[&str], call_timeout: Duration) -> BridgeResult<(String, String)> {
        if self.debug {
            tracing::info!(bridge = %self.bridge_path, args = ?args, "running bridge command");
        } else {
            tracing::debug!(bridge = %self.bridge_path, args = ?args, "running bridge command");
        }

        let start = Instant::now();
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let mut cmd = Command::new(&self.bridge_path);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        let spawn_result = cmd.spawn();
        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                self.calls_failed.fetch_add(1, Ordering::Relaxed);
                return Err(BridgeError::Io(e.to_string()));
            }
        };

        let output = match timeout(call_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                self.calls_failed.fetch_add(1, Ordering::Relaxed);
                return Err(BridgeError::Io(e.to_string()));
            }
            Err(_) => {
                self.calls_failed.fetch_add(1, Ordering::Relaxed);
                return Err(BridgeError::Timeout(call_timeout));
            }
        };

        self.total_latency_ms
            .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            Ok((stdout, stderr))
        } else {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
            if stderr.contains("device not found") || stderr.contains("not found") {
                Err(BridgeError::DeviceNotFound(stderr))
            } else {
                Err(BridgeError::BridgeFailure(stderr))
            }
        }
    }

    async fn shell_raw(&self, device_id: &str, command: &str) -> BridgeResult<(String, String)> {
        self.run(
            &["-s", device_id, "shell", command],
            self.command_timeout,
        )
        .await
    }

    /// Like `run`, but a non-zero exit code is reported as `ok = false`
    /// rather than turned into an `Err` — callers that need the exact exit
    /// outcome (`exec`) use this instead of `run`.
    async fn run_tuple(&self, args: &[&str], call_timeout: Duration) -> BridgeResult<(bool, String, String)> {
        if self.debug {
            tracing::info!(bridge = %self.bridge_path, args = ?args, "running bridge command");
        } else {
            tracing::debug!(bridge = %self.bridge_path, args = ?args, "running bridge command");
        }

        let start = Instant::now();
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let mut cmd = Command::new(&self.bridge_path);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.calls_failed.fetch_add(1, Ordering::Relaxed);
                return Err(BridgeError::Io(e.to_string()));
            }
        };

        let output = match timeout(call_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                self.calls_failed.fetch_add(1, Ordering::Relaxed);
                return Err(BridgeError::Io(e.to_string()));
            }
            Err(_) => {
                self.calls_failed.fetch_add(1, Ordering::Relaxed);
                return Err(BridgeError::Timeout(call_timeout));
            }
        };

        self.total_latency_ms
            .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);

        let ok = output.status.success();
        if !ok {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Ok((ok, stdout, stderr))
    }
}

#[async_trait]
impl BridgeClient for RealBridgeClient {
    async fn connect(&self, address: &str) -> BridgeResult<()> {
        let mut backoff =
            ExponentialBackoff::from_config(self.connect_max_retries, self.connect_retry_interval_ms);
        loop {
            match self.run(&["connect", address], self.connect_timeout).await {
                Ok(_) => return Ok(()),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            address = %address,
                            attempt = backoff.current_attempt(),
                            error = %e,
                            "connect attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    async fn disconnect(&self, address: &str) -> BridgeResult<()> {
        self.run(&["disconnect", address], self.connect_timeout).await?;
        Ok(())
    }

    async fn is_device_present(&self, device_id: &str) -> BridgeResult<bool> {
        let (stdout, _) = self.run(&["devices"], self.command_timeout).await?;
        Ok(stdout
            .lines()
            .skip(1)
            .any(|line| line.starts_with(device_id) && line.contains("device")))
    }

    async fn shell(&self, device_id: &str, command: &str) -> BridgeResult<String> {
        let (stdout, _) = self.shell_raw(device_id, command).await?;
        Ok(stdout)
    }

    async fn push(&self, device_id: &str, local: &str, remote: &str) -> BridgeResult<()> {
        self.run(
            &["-s", device_id, "push", local, remote],
            self.command_timeout,
        )
        .await?;
        Ok(())
    }

    async fn pull(&self, device_id: &str, remote: &str, local: &str) -> BridgeResult<()> {
        self.run(
            &["-s", device_id, "pull", remote, local],
            self.command_timeout,
        )
        .await?;
        Ok(())
    }

    async fn screenshot(&self, device_id: &str, local_path: &str) -> BridgeResult<()> {
        let remote_path = format!("/sdcard/screenshot_{}.png", uuid::Uuid::new_v4());
        let capture = self
            .shell_raw(device_id, &format!("screencap -p {remote_path}"))
            .await;
        if let Err(e) = capture {
            let _ = self.shell_raw(device_id, &format!("rm {remote_path}")).await;
            return Err(e);
        }
        let pulled = self.pull(device_id, &remote_path, local_path).await;
        let _ = self.shell_raw(device_id, &format!("rm {remote_path}")).await;
        pulled
    }

    async fn tap(&self, device_id: &str, x: i32, y: i32) -> BridgeResult<()> {
        self.shell_raw(device_id, &format!("input tap {x} {y}")).await?;
        Ok(())
    }

    async fn swipe(
        &self,
        device_id: &str,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    ) -> BridgeResult<()> {
        self.shell_raw(
            device_id,
            &format!("input swipe {x1} {y1} {x2} {y2} {duration_ms}"),
        )
        .await?;
        Ok(())
    }

    async fn input_text(&self, device_id: &str, text: &str) -> BridgeResult<()> {
        let escaped = escape_input_text(text);
        self.shell_raw(device_id, &format!("input text {escaped}")).await?;
        Ok(())
    }

    async fn keyevent(&self, device_id: &str, keycode: u32) -> BridgeResult<()> {
        self.shell_raw(device_id, &format!("input keyevent {keycode}"))
            .await?;
        Ok(())
    }

    async fn restart_app(&self, device_id: &str, package: &str) -> BridgeResult<()> {
        self.shell_raw(device_id, &format!("am force-stop {package}"))
            .await?;
        self.shell_raw(
            device_id,
            &format!("monkey -p {package} -c android.intent.category.LAUNCHER 1"),
        )
        .await?;
        Ok(())
    }

    async fn screen_size(&self, device_id: &str) -> BridgeResult<ScreenSize> {
        let (stdout, _) = self.shell_raw(device_id, "wm size").await?;
        parse_screen_size(&stdout)
            .ok_or_else(|| BridgeError::BridgeFailure(format!("unparsable `wm size` output: {stdout}")))
    }

    async fn start_server(&self) -> BridgeResult<()> {
        self.run(&["start-server"], self.connect_timeout).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.run(&["devices"], self.connect_timeout).await?;
        Ok(())
    }

    async fn stop_server(&self) -> BridgeResult<()> {
        self.run(&["kill-server"], self.connect_timeout).await?;
        Ok(())
    }

    async fn list_devices(&self) -> BridgeResult<Vec<DeviceListEntry>> {
        let (stdout, _) = self.run(&["devices"], self.command_timeout).await?;
        Ok(parse_device_list(&stdout))
    }

    async fn exec(
        &self,
        device_id: &str,
        argv: &[&str],
        timeout: Option<Duration>,
    ) -> BridgeResult<(bool, String, String)> {
        let mut args = vec!["-s", device_id];
        args.extend_from_slice(argv);
        self.run_tuple(&args, timeout.unwrap_or(self.command_timeout)).await
    }

    async fn info(&self, device_id: &str) -> BridgeResult<DeviceInfo> {
        let (model, _) = self
            .shell_raw(device_id, "getprop ro.product.model")
            .await?;
        let (os_version, _) = self
            .shell_raw(device_id, "getprop ro.build.version.release")
            .await?;
        let (size_out, _) = self.shell_raw(device_id, "wm size").await?;
        let screen = parse_screen_size(&size_out)
            .ok_or_else(|| BridgeError::BridgeFailure(format!("unparsable `wm size` output: {size_out}")))?;
        Ok(DeviceInfo {
            model: model.trim().to_string(),
            os_version: os_version.trim().to_string(),
            screen,
        })
    }

    fn stats(&self) -> BridgeStats {
        BridgeStats {
            calls_total: self.calls_total.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// Parses `Physical size: 1080x1920` (or `Override size: ...`, which `wm
/// size` prints second and takes precedence when present).
fn parse_screen_size(output: &str) -> Option<ScreenSize> {
    let mut physical = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(dims) = line.strip_prefix("Override size:") {
            if let Some(size) = parse_dims(dims) {
                return Some(size);
            }
        } else if let Some(dims) = line.strip_prefix("Physical size:") {
            physical = parse_dims(dims);
        }
    }
    physical
}

fn parse_dims(s: &str) -> Option<ScreenSize> {
    let s = s.trim();
    let (w, h) = s.split_once('x')?;
    Some(ScreenSize {
        width: w.trim().parse().ok()?,
        height: h.trim().parse().ok()?,
    })
}

/// Parses `adb devices` output, skipping the `List of devices attached`
/// header and blank lines. Each remaining line is `<serial>\t<state>`.
fn parse_device_list(output: &str) -> Vec<DeviceListEntry> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let mut parts = line.split_whitespace();
            let id = parts.next()?.to_string();
            let state = parts.next().unwrap_or("unknown").to_string();
            Some(DeviceListEntry { id, state })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_physical_size() {
        let out = "Physical size: 1080x1920\n";
        assert_eq!(
            parse_screen_size(out),
            Some(ScreenSize {
                width: 1080,
                height: 1920
            })
        );
    }

    #[test]
    fn parses_device_list_skipping_header_and_blanks() {
        let out = "List of devices attached\nemulator-5554\tdevice\n\n192.168.1.5:5555\toffline\n";
        let devices = parse_device_list(out);
        assert_eq!(
            devices,
            vec![
                DeviceListEntry { id: "emulator-5554".into(), state: "device".into() },
                DeviceListEntry { id: "192.168.1.5:5555".into(), state: "offline".into() },
            ]
        );
    }

    #[test]
    fn override_size_takes_precedence() {
        let out = "Physical size: 1080x1920\nOverride size: 720x1280\n";
        assert_eq!(
            parse_screen_size(out),
            Some(ScreenSize {
                width: 720,
                height: 1280
            })
        );
    }
}
