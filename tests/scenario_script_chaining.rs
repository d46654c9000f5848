//! Spec §8 end-to-end scenario 6: script chaining via `next`.
//!
//! Script `a` names `b` as its `next`. `b` should run immediately after `a`
//! completes successfully on the same device, and should not run at all if
//! `a` fails.

use std::sync::Arc;

use fleet_automation_controller::bridge::{BridgeError, MockBridgeClient};
use fleet_automation_controller::config::{BridgeConfig, DevicesConfig, SchedulerConfig};
use fleet_automation_controller::device::DeviceManager;
use fleet_automation_controller::executor::StepExecutor;
use fleet_automation_controller::matcher::ImageMatcher;
use fleet_automation_controller::scheduler::Scheduler;
use fleet_automation_controller::script::ScriptStore;

fn write_chain_scripts(dir: &std::path::Path) {
    std::fs::write(
        dir.join("a.yaml"),
        "name: a\nnext: b\nsteps:\n  - name: do_it\n    action: shell\n    command: echo hi\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("b.yaml"),
        "name: b\nsteps:\n  - name: mark\n    action: tap\n    x: 5\n    y: 5\n",
    )
    .unwrap();
}

async fn build(bridge: Arc<MockBridgeClient>) -> Arc<Scheduler> {
    bridge.set_present("dev1", true);
    let dm = Arc::new(DeviceManager::new(
        bridge,
        DevicesConfig::default(),
        tempfile::tempdir().unwrap().keep(),
    ));
    let roster = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(roster.path(), "dev1\n").unwrap();
    dm.load_roster(roster.path()).await.unwrap();

    let matcher = Arc::new(ImageMatcher::new("templates", 0.85, 10));
    let executor = Arc::new(StepExecutor::new(
        dm.clone(),
        matcher,
        BridgeConfig {
            max_retries: 0,
            retry_interval_ms: 0,
            ..BridgeConfig::default()
        },
        tempfile::tempdir().unwrap().keep(),
    ));

    let store_dir = tempfile::tempdir().unwrap().keep();
    write_chain_scripts(&store_dir);
    let store = Arc::new(ScriptStore::new(store_dir));
    store.load_all().unwrap();

    let config = SchedulerConfig {
        enabled: false,
        run_on_start: false,
        batch_size: 10,
        max_concurrent_devices: 1,
        batch_stagger_ms: 0,
        ..SchedulerConfig::default()
    };
    Arc::new(Scheduler::new(config, dm, store, executor))
}

#[tokio::test]
async fn next_script_runs_after_a_successful_predecessor() {
    let bridge = Arc::new(MockBridgeClient::new());
    let scheduler = build(bridge.clone()).await;

    scheduler.run_automation(Some("a".to_string())).await.unwrap();

    let calls = bridge.calls();
    assert!(calls.iter().any(|c| c == "shell"), "expected a's step to run");
    assert!(calls.iter().any(|c| c == "tap"), "expected b to chain in after a succeeded");
}

#[tokio::test]
async fn next_script_does_not_run_after_a_failed_predecessor() {
    let bridge = Arc::new(MockBridgeClient::new());
    bridge.fail_next("shell", BridgeError::BridgeFailure("boom".into()));
    let scheduler = build(bridge.clone()).await;

    scheduler.run_automation(Some("a".to_string())).await.unwrap();

    let calls = bridge.calls();
    assert!(calls.iter().any(|c| c == "shell"), "expected a's step to be attempted");
    assert!(!calls.iter().any(|c| c == "tap"), "b must not run when a fails");
}
