//! Shared helpers for the end-to-end scenario tests: building a device
//! manager + executor wired to a [`MockBridgeClient`], and writing template
//! images that the matcher can decode from disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_automation_controller::bridge::MockBridgeClient;
use fleet_automation_controller::config::{BridgeConfig, DevicesConfig};
use fleet_automation_controller::device::DeviceManager;
use fleet_automation_controller::executor::StepExecutor;
use fleet_automation_controller::matcher::ImageMatcher;

use image::{GrayImage, Luma};

pub fn solid_image(w: u32, h: u32, value: u8) -> GrayImage {
    image::ImageBuffer::from_pixel(w, h, Luma([value]))
}

/// A `value`-colored `size x size` square at `(x, y)` on a `w x h` canvas
/// of background `50`, saved to `path` as a PNG.
pub fn save_square(path: &Path, w: u32, h: u32, x: u32, y: u32, size: u32, value: u8) {
    let mut img = solid_image(w, h, 50);
    for yy in y..y + size {
        for xx in x..x + size {
            img.put_pixel(xx, yy, Luma([value]));
        }
    }
    img.save(path).expect("failed to write test image");
}

pub fn write_roster(path: &Path, lines: &[&str]) {
    std::fs::write(path, lines.join("\n") + "\n").expect("failed to write roster file");
}

pub struct Harness {
    pub bridge: Arc<MockBridgeClient>,
    pub device_manager: Arc<DeviceManager>,
    pub executor: Arc<StepExecutor>,
    pub templates_dir: PathBuf,
    pub screenshot_dir: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        let bridge = Arc::new(MockBridgeClient::new());
        let device_manager = Arc::new(DeviceManager::new(
            bridge.clone(),
            DevicesConfig {
                reconnect_backoff_s: 0,
                ..DevicesConfig::default()
            },
            tempfile::tempdir().unwrap().keep(),
        ));
        let templates_dir = tempfile::tempdir().unwrap().keep();
        let matcher = Arc::new(ImageMatcher::new(templates_dir.clone(), 0.9, 10));
        let screenshot_dir = tempfile::tempdir().unwrap().keep();
        let executor = Arc::new(StepExecutor::new(
            device_manager.clone(),
            matcher,
            BridgeConfig {
                max_retries: 0,
                retry_interval_ms: 10,
                ..BridgeConfig::default()
            },
            screenshot_dir.clone(),
        ));
        Self {
            bridge,
            device_manager,
            executor,
            templates_dir,
            screenshot_dir,
        }
    }
}
