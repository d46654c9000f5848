//! Spec §8 end-to-end scenario 5: batch and concurrency cap.
//!
//! 25 devices, `batch_size=10`, `max_concurrent_devices=12`, no inter-batch
//! stagger. Expects at most 12 device tasks in flight at any instant, and
//! all 25 devices to eventually run their script.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_automation_controller::bridge::MockBridgeClient;
use fleet_automation_controller::config::{BridgeConfig, DevicesConfig, SchedulerConfig};
use fleet_automation_controller::device::DeviceManager;
use fleet_automation_controller::executor::StepExecutor;
use fleet_automation_controller::matcher::ImageMatcher;
use fleet_automation_controller::scheduler::Scheduler;
use fleet_automation_controller::script::ScriptStore;

#[tokio::test]
async fn concurrency_never_exceeds_the_configured_cap() {
    let bridge = Arc::new(MockBridgeClient::new());
    let roster_lines: Vec<String> = (0..25).map(|i| format!("dev{i}")).collect();
    for line in &roster_lines {
        bridge.set_present(line, true);
    }

    let device_manager = Arc::new(DeviceManager::new(
        bridge.clone(),
        DevicesConfig::default(),
        tempfile::tempdir().unwrap().keep(),
    ));
    let roster_path = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(roster_path.path(), roster_lines.join("\n") + "\n").unwrap();
    device_manager.load_roster(roster_path.path()).await.unwrap();

    let matcher = Arc::new(ImageMatcher::new("templates", 0.85, 10));
    let executor = Arc::new(StepExecutor::new(
        device_manager.clone(),
        matcher,
        BridgeConfig::default(),
        tempfile::tempdir().unwrap().keep(),
    ));

    let store_dir = tempfile::tempdir().unwrap().keep();
    std::fs::write(
        store_dir.join("fan_out.yaml"),
        "name: fan_out\nsteps:\n  - name: settle\n    action: sleep\n    seconds: 0.3\n  - name: tap_it\n    action: tap\n    x: 1\n    y: 1\n",
    )
    .unwrap();
    let store = Arc::new(ScriptStore::new(store_dir));
    store.load_all().unwrap();

    let config = SchedulerConfig {
        enabled: false,
        run_on_start: false,
        batch_size: 10,
        max_concurrent_devices: 12,
        batch_stagger_ms: 0,
        ..SchedulerConfig::default()
    };
    let scheduler = Arc::new(Scheduler::new(config, device_manager, store, executor));

    let peak = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let watcher_scheduler = scheduler.clone();
    let watcher_peak = peak.clone();
    let watcher_stop = stop.clone();
    let watcher = tokio::spawn(async move {
        while !watcher_stop.load(Ordering::Relaxed) {
            let in_flight = watcher_scheduler.running_devices().await.len();
            watcher_peak.fetch_max(in_flight, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    scheduler.run_automation(Some("fan_out".to_string())).await.unwrap();
    stop.store(true, Ordering::Relaxed);
    let _ = watcher.await;

    assert!(
        peak.load(Ordering::Relaxed) <= 12,
        "observed {} devices in flight at once, cap is 12",
        peak.load(Ordering::Relaxed)
    );
    assert_eq!(peak.load(Ordering::Relaxed), 12, "expected the cap to actually be reached");

    let tap_calls = bridge.calls().iter().filter(|c| *c == "tap").count();
    assert_eq!(tap_calls, 25, "expected every device to reach the tap step");
}
