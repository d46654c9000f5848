//! Spec §8 end-to-end scenario 2: reconnect loop.
//!
//! Bridge presence flaps: connected, then missing for a couple of health
//! cycles, then connected again, with `auto_reconnect=true` and a short
//! `status_check_interval_s`. Expects the device to transition away from
//! `Connected` while missing and back to `Connected` once presence returns,
//! picking up at least one extra `connect` call along the way.

mod common;

use std::sync::Arc;
use std::time::Duration;

use fleet_automation_controller::bridge::MockBridgeClient;
use fleet_automation_controller::config::DevicesConfig;
use fleet_automation_controller::device::{DeviceManager, DeviceState};

#[tokio::test]
async fn device_reconnects_after_presence_returns() {
    let bridge = Arc::new(MockBridgeClient::new());
    let device_manager = Arc::new(DeviceManager::new(
        bridge.clone(),
        DevicesConfig {
            auto_reconnect: true,
            status_check_interval_s: 1,
            reconnect_backoff_s: 1,
            ..DevicesConfig::default()
        },
        tempfile::tempdir().unwrap().keep(),
    ));

    let roster = tempfile::NamedTempFile::new().unwrap();
    common::write_roster(roster.path(), &["127.0.0.1:5555"]);
    device_manager.load_roster(roster.path()).await.unwrap();

    bridge.set_present("127.0.0.1:5555", true);
    device_manager.connect("127.0.0.1:5555").await.unwrap();
    assert!(device_manager.is_connected("127.0.0.1:5555").await);
    let connect_calls_after_initial = bridge.calls().iter().filter(|c| *c == "connect").count();
    assert_eq!(connect_calls_after_initial, 1);

    // Device drops off the bridge's device list for a couple of health-check
    // cycles.
    bridge.set_present("127.0.0.1:5555", false);

    let health_manager = device_manager.clone();
    let health_handle = tokio::spawn(async move { health_manager.health_loop().await });

    tokio::time::sleep(Duration::from_millis(2_600)).await;
    let mid_state = device_manager
        .get("127.0.0.1:5555")
        .await
        .unwrap()
        .state;
    assert_ne!(mid_state, DeviceState::Connected);
    assert!(!device_manager.is_connected("127.0.0.1:5555").await);

    // Presence returns; the next health cycle should reconnect it.
    bridge.set_present("127.0.0.1:5555", true);
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(device_manager.is_connected("127.0.0.1:5555").await);
    let final_connect_calls = bridge.calls().iter().filter(|c| *c == "connect").count();
    assert!(
        final_connect_calls >= 2,
        "expected at least one reconnect attempt, saw {final_connect_calls} connect calls"
    );

    health_handle.abort();
}
