use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use tokio::sync::{Mutex, RwLock};

use super::{parse_roster_line, DeviceError, DeviceRecord, DeviceResult, DeviceState};
use crate::bridge::BridgeClient;
use crate::config::DevicesConfig;
use crate::logging::DeviceLogSink;

type ReconnectLimiter = RateLimiter<String, governor::state::keyed::DefaultKeyedStateStore<String>, governor::clock::DefaultClock>;

/// Central device manager: owns the roster, the live connection state
/// machine for every device, and the background health/reconnect loop.
///
/// A per-device `Mutex<()>` is held for the entire duration of any run
/// against that device (connect, health check, or script execution), so
/// the bridge is never asked to do two things to the same device at once.
pub struct DeviceManager {
    bridge: Arc<dyn BridgeClient>,
    config: DevicesConfig,
    logs_dir: PathBuf,
    devices: Arc<RwLock<HashMap<String, DeviceRecord>>>,
    run_locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
    device_loggers: Arc<RwLock<HashMap<String, DeviceLogSink>>>,
    /// Caps reconnect attempts per device to at most one per
    /// `reconnect_backoff_s`, so a flapping device can't busy-loop the
    /// bridge with connect attempts between health-check sweeps.
    reconnect_limiter: ReconnectLimiter,
}

impl DeviceManager {
    pub fn new(bridge: Arc<dyn BridgeClient>, config: DevicesConfig, logs_dir: PathBuf) -> Self {
        let period = Duration::from_secs(config.reconnect_backoff_s.max(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
            .allow_burst(NonZeroU32::new(1).unwrap());
        Self {
            bridge,
            config,
            logs_dir,
            devices: Arc::new(RwLock::new(HashMap::new())),
            run_locks: Arc::new(RwLock::new(HashMap::new())),
            device_loggers: Arc::new(RwLock::new(HashMap::new())),
            reconnect_limiter: RateLimiter::keyed(quota),
        }
    }

    /// Parses the roster file (`#`-comments, `host:port[:name]` or
    /// `serial[:name]` per line) and replaces the current device set.
    pub async fn load_roster(&self, path: &Path) -> DeviceResult<usize> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::RosterFile(format!("{}: {e}", path.display())))?;

        let mut devices = HashMap::new();
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match parse_roster_line(line) {
                Some(record) => {
                    devices.insert(record.id.clone(), record);
                }
                None => {
                    tracing::warn!(roster = %path.display(), line = %trimmed, "skipping unparseable roster line");
                }
            }
        }

        let count = devices.len();
        *self.devices.write().await = devices;
        tracing::info!(count, roster = %path.display(), "loaded device roster");
        Ok(count)
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Partitions the roster into ordered batches of at most `batch_size`
    /// devices; the last batch may be smaller. Derived fresh on every call,
    /// never persisted.
    pub async fn batches(&self, batch_size: usize) -> Vec<Vec<String>> {
        let ids = self.device_ids().await;
        if batch_size == 0 {
            return vec![ids];
        }
        ids.chunks(batch_size).map(|c| c.to_vec()).collect()
    }

    pub async fn connected_devices(&self, ids: &[String]) -> Vec<String> {
        let devices = self.devices.read().await;
        ids.iter()
            .filter(|id| {
                matches!(
                    devices.get(*id).map(|d| d.state),
                    Some(DeviceState::Connected) | Some(DeviceState::Running)
                )
            })
            .cloned()
            .collect()
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn is_connected(&self, device_id: &str) -> bool {
        matches!(
            self.devices.read().await.get(device_id).map(|d| d.state),
            Some(DeviceState::Connected) | Some(DeviceState::Running)
        )
    }

    /// Acquires (creating if necessary) the per-device run lock.
    async fn run_lock_for(&self, device_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.run_locks.read().await.get(device_id) {
            return lock.clone();
        }
        let mut locks = self.run_locks.write().await;
        locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn set_state(&self, device_id: &str, state: DeviceState) {
        if let Some(record) = self.devices.write().await.get_mut(device_id) {
            record.state = state;
        }
    }

    pub async fn device_logger(&self, device_id: &str) -> DeviceLogSink {
        if let Some(sink) = self.device_loggers.read().await.get(device_id) {
            return sink.clone();
        }
        let sink = DeviceLogSink::open(&self.logs_dir, device_id)
            .unwrap_or_else(|e| panic!("failed to open device log for {device_id}: {e}"));
        self.device_loggers
            .write()
            .await
            .insert(device_id.to_string(), sink.clone());
        sink
    }

    /// Connects to one device, taking its run lock for the duration.
    pub async fn connect(&self, device_id: &str) -> DeviceResult<()> {
        let lock = self.run_lock_for(device_id).await;
        let _guard = lock.lock().await;
        self.connect_locked(device_id).await
    }

    async fn connect_locked(&self, device_id: &str) -> DeviceResult<()> {
        let record = self
            .devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| DeviceError::DeviceNotFound(device_id.to_string()))?;

        self.set_state(device_id, DeviceState::Connecting).await;
        {
            let mut devices = self.devices.write().await;
            if let Some(r) = devices.get_mut(device_id) {
                r.mark_attempt();
            }
        }

        let logger = self.device_logger(device_id).await;

        let connect_result = if let Some((host, port)) = &record.address {
            self.bridge.connect(&format!("{host}:{port}")).await
        } else {
            Ok(())
        };

        if let Err(e) = connect_result {
            logger.write_line("ERROR", &format!("connect failed: {e}"));
            self.set_state(device_id, DeviceState::Disconnected).await;
            return Err(DeviceError::BridgeFailure(e));
        }

        match self.bridge.is_device_present(device_id).await {
            Ok(true) => {
                let info = self.bridge.info(device_id).await.ok();
                let mut devices = self.devices.write().await;
                if let Some(r) = devices.get_mut(device_id) {
                    r.state = DeviceState::Connected;
                    r.connection_attempts = 0;
                    if let Some(info) = info {
                        r.screen_width = Some(info.screen.width);
                        r.screen_height = Some(info.screen.height);
                        r.model = Some(info.model);
                        r.os_version = Some(info.os_version);
                    }
                }
                logger.write_line("INFO", "device connected");
                Ok(())
            }
            Ok(false) => {
                logger.write_line("WARNING", "device not present after connect");
                self.set_state(device_id, DeviceState::Disconnected).await;
                Err(DeviceError::NotConnected(device_id.to_string()))
            }
            Err(e) => {
                logger.write_line("ERROR", &format!("presence check failed: {e}"));
                self.set_state(device_id, DeviceState::Disconnected).await;
                Err(DeviceError::BridgeFailure(e))
            }
        }
    }

    pub async fn disconnect(&self, device_id: &str) -> DeviceResult<()> {
        let lock = self.run_lock_for(device_id).await;
        let _guard = lock.lock().await;

        let record = self
            .devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| DeviceError::DeviceNotFound(device_id.to_string()))?;

        if let Some((host, port)) = &record.address {
            self.bridge.disconnect(&format!("{host}:{port}")).await?;
        }
        self.set_state(device_id, DeviceState::Disconnected).await;
        Ok(())
    }

    /// Connects every device in `ids`, logging (but not propagating)
    /// per-device failures. Returns the ids that ended up connected.
    pub async fn connect_many(&self, ids: &[String]) -> Vec<String> {
        let mut connected = Vec::new();
        for id in ids {
            match self.connect(id).await {
                Ok(()) => connected.push(id.clone()),
                Err(e) => tracing::warn!(device = %id, error = %e, "batch connect failed"),
            }
        }
        connected
    }

    pub async fn disconnect_all(&self) -> usize {
        let ids = self.device_ids().await;
        let mut count = 0;
        for id in ids {
            if self.disconnect(&id).await.is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Marks a device as running or idle — used by the step executor to
    /// surface the current step description via `status`.
    pub async fn set_current_action(&self, device_id: &str, action: Option<String>) {
        let mut devices = self.devices.write().await;
        if let Some(r) = devices.get_mut(device_id) {
            r.current_action = action.clone();
            r.state = if action.is_some() {
                DeviceState::Running
            } else if r.state == DeviceState::Running {
                DeviceState::Connected
            } else {
                r.state
            };
        }
    }

    pub fn bridge(&self) -> Arc<dyn BridgeClient> {
        self.bridge.clone()
    }

    pub fn run_lock(&self, device_id: &str) -> impl std::future::Future<Output = Arc<Mutex<()>>> + '_ {
        self.run_lock_for(device_id)
    }

    /// Runs the periodic health-check / auto-reconnect loop until the
    /// process is cancelled. Spawn this once at startup.
    pub async fn health_loop(self: Arc<Self>) {
        if !self.config.auto_reconnect {
            return;
        }
        let interval = Duration::from_secs(self.config.status_check_interval_s.max(1));
        loop {
            tokio::time::sleep(interval).await;
            self.check_and_reconnect().await;
        }
    }

    async fn check_and_reconnect(&self) {
        let ids = self.device_ids().await;
        for id in ids {
            let needs_reconnect = {
                let devices = self.devices.read().await;
                let Some(record) = devices.get(&id) else {
                    continue;
                };
                match record.state {
                    DeviceState::Running => continue,
                    // Re-verify presence; bridge-side drops don't always
                    // surface until the next call fails.
                    DeviceState::Connected => false,
                    _ => true,
                }
            };

            if needs_reconnect && self.reconnect_limiter.check_key(&id).is_err() {
                continue;
            }

            match self.bridge.is_device_present(&id).await {
                Ok(true) => {
                    self.set_state(&id, DeviceState::Connected).await;
                }
                Ok(false) | Err(_) => {
                    self.set_state(&id, DeviceState::Reconnecting).await;
                    if let Err(e) = self.connect(&id).await {
                        tracing::warn!(device = %id, error = %e, "reconnect attempt failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridgeClient;

    fn manager_with(bridge: Arc<MockBridgeClient>) -> DeviceManager {
        DeviceManager::new(
            bridge,
            DevicesConfig::default(),
            tempfile::tempdir().unwrap().keep(),
        )
    }

    #[tokio::test]
    async fn connect_updates_state_on_success() {
        let bridge = Arc::new(MockBridgeClient::new());
        bridge.set_present("127.0.0.1:5555", true);
        let manager = manager_with(bridge.clone());
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "127.0.0.1:5555:emu\n").unwrap();
        manager.load_roster(tmp.path()).await.unwrap();

        manager.connect("127.0.0.1:5555").await.unwrap();
        assert!(manager.is_connected("127.0.0.1:5555").await);
    }

    #[tokio::test]
    async fn connect_to_unknown_device_errors() {
        let bridge = Arc::new(MockBridgeClient::new());
        let manager = manager_with(bridge);
        assert!(matches!(
            manager.connect("nope").await,
            Err(DeviceError::DeviceNotFound(_))
        ));
    }
}
