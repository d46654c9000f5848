use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BridgeClient, BridgeError, BridgeResult, BridgeStats, DeviceInfo, DeviceListEntry, ScreenSize};

/// A test double for [`BridgeClient`]: records every call, lets tests
/// script specific failures, and returns canned screen sizes without ever
/// touching a real subprocess.
pub struct MockBridgeClient {
    state: Mutex<MockState>,
}

struct MockState {
    present: HashMap<String, bool>,
    fail_next: HashMap<String, BridgeError>,
    calls: Vec<String>,
    screen_size: ScreenSize,
    stats: BridgeStats,
    /// Source image files `screenshot` copies to its `local_path` argument,
    /// one per call; the last one queued repeats once the queue is empty.
    screenshot_queue: VecDeque<PathBuf>,
    last_screenshot_source: Option<PathBuf>,
    device_info: DeviceInfo,
    device_list: Vec<DeviceListEntry>,
    exec_result: Option<(bool, String, String)>,
}

impl Default for MockBridgeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBridgeClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                present: HashMap::new(),
                fail_next: HashMap::new(),
                calls: Vec::new(),
                screen_size: ScreenSize {
                    width: 1080,
                    height: 1920,
                },
                stats: BridgeStats::default(),
                screenshot_queue: VecDeque::new(),
                last_screenshot_source: None,
                device_info: DeviceInfo {
                    model: "mock-model".into(),
                    os_version: "13".into(),
                    screen: ScreenSize { width: 1080, height: 1920 },
                },
                device_list: Vec::new(),
                exec_result: None,
            }),
        }
    }

    /// Sets the `DeviceInfo` returned by `info` for every device.
    pub fn set_device_info(&self, info: DeviceInfo) {
        self.state.lock().unwrap().device_info = info;
    }

    /// Sets the devices returned by `list_devices`.
    pub fn set_device_list(&self, devices: Vec<DeviceListEntry>) {
        self.state.lock().unwrap().device_list = devices;
    }

    /// Scripts the `(ok, stdout, stderr)` tuple the next `exec` call returns.
    pub fn set_exec_result(&self, result: (bool, String, String)) {
        self.state.lock().unwrap().exec_result = Some(result);
    }

    /// Queues a screenshot source image; the next call to `screenshot`
    /// copies it to the requested `local_path` instead of writing nothing.
    pub fn queue_screenshot(&self, source: impl Into<PathBuf>) {
        self.state.lock().unwrap().screenshot_queue.push_back(source.into());
    }

    pub fn set_present(&self, device_id: &str, present: bool) {
        self.state
            .lock()
            .unwrap()
            .present
            .insert(device_id.to_string(), present);
    }

    /// Makes the next call whose name matches `op` fail with `error`.
    pub fn fail_next(&self, op: &str, error: BridgeError) {
        self.state
            .lock()
            .unwrap()
            .fail_next
            .insert(op.to_string(), error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, op: &str) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(op.to_string());
        state.stats.calls_total += 1;
        if let Some(err) = state.fail_next.remove(op) {
            state.stats.calls_failed += 1;
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl BridgeClient for MockBridgeClient {
    async fn connect(&self, address: &str) -> BridgeResult<()> {
        self.record("connect")?;
        self.set_present(address, true);
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> BridgeResult<()> {
        self.record("disconnect")?;
        self.set_present(address, false);
        Ok(())
    }

    async fn is_device_present(&self, device_id: &str) -> BridgeResult<bool> {
        self.record("is_device_present")?;
        Ok(*self
            .state
            .lock()
            .unwrap()
            .present
            .get(device_id)
            .unwrap_or(&false))
    }

    async fn shell(&self, _device_id: &str, _command: &str) -> BridgeResult<String> {
        self.record("shell")?;
        Ok(String::new())
    }

    async fn push(&self, _device_id: &str, _local: &str, _remote: &str) -> BridgeResult<()> {
        self.record("push")
    }

    async fn pull(&self, _device_id: &str, _remote: &str, _local: &str) -> BridgeResult<()> {
        self.record("pull")
    }

    async fn screenshot(&self, _device_id: &str, local_path: &str) -> BridgeResult<()> {
        self.record("screenshot")?;
        let source = {
            let mut state = self.state.lock().unwrap();
            let next = state.screenshot_queue.pop_front();
            if let Some(src) = &next {
                state.last_screenshot_source = Some(src.clone());
            }
            next.or_else(|| state.last_screenshot_source.clone())
        };
        if let Some(source) = source {
            std::fs::copy(&source, local_path)
                .map_err(|e| BridgeError::Io(format!("mock screenshot copy failed: {e}")))?;
        }
        Ok(())
    }

    async fn tap(&self, _device_id: &str, _x: i32, _y: i32) -> BridgeResult<()> {
        self.record("tap")
    }

    async fn swipe(
        &self,
        _device_id: &str,
        _x1: i32,
        _y1: i32,
        _x2: i32,
        _y2: i32,
        _duration_ms: u64,
    ) -> BridgeResult<()> {
        self.record("swipe")
    }

    async fn input_text(&self, _device_id: &str, _text: &str) -> BridgeResult<()> {
        self.record("input_text")
    }

    async fn keyevent(&self, _device_id: &str, _keycode: u32) -> BridgeResult<()> {
        self.record("keyevent")
    }

    async fn restart_app(&self, _device_id: &str, _package: &str) -> BridgeResult<()> {
        self.record("restart_app")
    }

    async fn screen_size(&self, _device_id: &str) -> BridgeResult<ScreenSize> {
        self.record("screen_size")?;
        Ok(self.state.lock().unwrap().screen_size)
    }

    async fn start_server(&self) -> BridgeResult<()> {
        self.record("start_server")
    }

    async fn stop_server(&self) -> BridgeResult<()> {
        self.record("stop_server")
    }

    async fn list_devices(&self) -> BridgeResult<Vec<DeviceListEntry>> {
        self.record("list_devices")?;
        Ok(self.state.lock().unwrap().device_list.clone())
    }

    async fn exec(
        &self,
        _device_id: &str,
        _argv: &[&str],
        _timeout: Option<std::time::Duration>,
    ) -> BridgeResult<(bool, String, String)> {
        self.record("exec")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .exec_result
            .clone()
            .unwrap_or((true, String::new(), String::new())))
    }

    async fn long_tap(&self, _device_id: &str, _x: i32, _y: i32, _duration_ms: u64) -> BridgeResult<()> {
        self.record("long_tap")
    }

    async fn info(&self, _device_id: &str) -> BridgeResult<DeviceInfo> {
        self.record("info")?;
        Ok(self.state.lock().unwrap().device_info.clone())
    }

    fn stats(&self) -> BridgeStats {
        self.state.lock().unwrap().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_and_honors_scripted_failures() {
        let mock = MockBridgeClient::new();
        mock.connect("127.0.0.1:5555").await.unwrap();
        assert!(mock.is_device_present("127.0.0.1:5555").await.unwrap());

        mock.fail_next("tap", BridgeError::Timeout(std::time::Duration::from_secs(1)));
        let err = mock.tap("127.0.0.1:5555", 10, 20).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));

        assert_eq!(mock.calls(), vec!["connect", "is_device_present", "tap"]);
    }

    #[tokio::test]
    async fn info_and_list_devices_return_scripted_values() {
        let mock = MockBridgeClient::new();
        mock.set_device_info(DeviceInfo {
            model: "Pixel 6".into(),
            os_version: "14".into(),
            screen: ScreenSize { width: 1440, height: 3120 },
        });
        mock.set_device_list(vec![DeviceListEntry { id: "dev1".into(), state: "device".into() }]);

        let info = mock.info("dev1").await.unwrap();
        assert_eq!(info.model, "Pixel 6");

        let devices = mock.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "dev1");
    }

    #[tokio::test]
    async fn exec_reports_ok_false_without_erroring() {
        let mock = MockBridgeClient::new();
        mock.set_exec_result((false, "".into(), "no such file".into()));
        let (ok, _stdout, stderr) = mock.exec("dev1", &["ls", "/nope"], None).await.unwrap();
        assert!(!ok);
        assert_eq!(stderr, "no such file");
    }
}
