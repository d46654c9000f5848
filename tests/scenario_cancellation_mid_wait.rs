//! Spec §8 end-to-end scenario 3: cancellation mid-wait.
//!
//! A `wait_image` step polls for a template that never appears. Two seconds
//! in, the run is cancelled. Expects the task to return `Cancelled` within
//! about a second of the cancel call, the device's action tag cleared, and
//! the `finalize` hook invoked.

mod common;

use std::time::{Duration, Instant};

use fleet_automation_controller::control::{CancellationToken, PauseGate};
use fleet_automation_controller::executor::ScriptOutcome;
use fleet_automation_controller::script::{Action, Script, Step};

#[tokio::test]
async fn cancellation_during_wait_image_returns_promptly() {
    let harness = common::Harness::new();

    let template = common::solid_image(20, 20, 220);
    template
        .save(harness.templates_dir.join("never.png"))
        .unwrap();
    let non_matching = harness.templates_dir.join("non_matching_source.png");
    common::solid_image(100, 100, 50)
        .save(&non_matching)
        .unwrap();
    harness.bridge.queue_screenshot(&non_matching);

    let roster = harness.templates_dir.join("roster.txt");
    common::write_roster(&roster, &["dev1"]);
    harness.device_manager.load_roster(&roster).await.unwrap();
    harness.bridge.set_present("dev1", true);
    harness.device_manager.connect("dev1").await.unwrap();

    let script = Script {
        name: "waiter".into(),
        author: None,
        version: None,
        steps: vec![Step {
            name: "wait_for_never".into(),
            description: None,
            action: Action::WaitImage {
                template: "never".into(),
                timeout_s: 30,
                threshold: Some(0.9),
            },
            wait_after_ms: 0,
        }],
        enabled_steps: Default::default(),
        next: None,
        initialize: None,
        finalize: Some(Step {
            name: "mark_done".into(),
            description: None,
            action: Action::Tap { x: 1, y: 1 },
            wait_after_ms: 0,
        }),
        dependencies: vec![],
    };
    script.validate().unwrap();

    let cancel = CancellationToken::new();
    let pause = PauseGate::new();
    let executor = harness.executor.clone();
    let cancel_for_task = cancel.clone();
    let handle = tokio::spawn(async move {
        executor
            .execute(&script, "dev1", &cancel_for_task, &pause)
            .await
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    let cancel_requested_at = Instant::now();
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("task did not finish in time")
        .unwrap()
        .unwrap();

    assert!(
        cancel_requested_at.elapsed() <= Duration::from_millis(1_500),
        "cancellation took too long to take effect: {:?}",
        cancel_requested_at.elapsed()
    );
    assert_eq!(outcome, ScriptOutcome::Cancelled);

    let record = harness.device_manager.get("dev1").await.unwrap();
    assert!(record.current_action.is_none());

    assert!(harness.bridge.calls().iter().any(|c| c == "tap"));
}
