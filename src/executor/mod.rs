//! The step executor: runs one validated script against one device —
//! ordered steps, the enable mask, initialize/finalize hooks, and the
//! built-in `Action` handlers (screenshot → template-match → tap, text
//! input, swipe, sleep, restart, raw shell).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::{BridgeClient, BridgeError};
use crate::config::BridgeConfig;
use crate::control::{CancellationToken, PauseGate};
use crate::device::DeviceManager;
use crate::matcher::{ImageMatcher, MatcherError};
use crate::script::{Action, Script, Step};

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("no handler for step {0}")]
    HandlerMissing(String),

    #[error("run was cancelled")]
    Cancelled,

    #[error("initialize hook failed: {0}")]
    HookFailure(String),

    #[error("i/o failure: {0}")]
    IoFailure(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Matcher(#[from] MatcherError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// How one step concluded. `RestartRequested` is deliberately distinct
/// from `Failed` — a handler asking for the app/script to be restarted
/// is not the same thing as the step itself having failed.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success,
    Failed(String),
    RestartRequested,
}

/// The outcome of a whole script run against one device.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutcome {
    /// Every step ran (or was skipped by the enable mask); `next` may chain.
    Completed { success: bool },
    /// A handler asked for a restart; the run ends without chaining `next`
    /// and without being counted as either a success or a failure.
    RestartRequested,
    /// The cancellation token fired before the run finished.
    Cancelled,
}

impl ScriptOutcome {
    pub fn should_chain_next(&self) -> bool {
        matches!(self, ScriptOutcome::Completed { success: true })
    }
}

/// Runs scripts against devices, owning no state of its own beyond shared
/// handles to the device manager and image matcher.
pub struct StepExecutor {
    device_manager: Arc<DeviceManager>,
    matcher: Arc<ImageMatcher>,
    bridge_config: BridgeConfig,
    screenshot_dir: std::path::PathBuf,
}

impl StepExecutor {
    pub fn new(
        device_manager: Arc<DeviceManager>,
        matcher: Arc<ImageMatcher>,
        bridge_config: BridgeConfig,
        screenshot_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            device_manager,
            matcher,
            bridge_config,
            screenshot_dir: screenshot_dir.into(),
        }
    }

    pub async fn execute(
        &self,
        script: &Script,
        device_id: &str,
        cancel: &CancellationToken,
        pause: &PauseGate,
    ) -> ExecutorResult<ScriptOutcome> {
        let logger = self.device_manager.device_logger(device_id).await;
        logger.write_line("INFO", &format!("script '{}' starting", script.name));

        let mut overall_success = true;

        if let Some(step) = &script.initialize {
            match self.run_step(step, device_id, &logger, cancel, pause).await {
                Ok(StepOutcome::Success) => {}
                Ok(StepOutcome::RestartRequested) => {
                    self.device_manager.set_current_action(device_id, None).await;
                    return Ok(ScriptOutcome::RestartRequested);
                }
                Ok(StepOutcome::Failed(reason)) | Err(ExecutorError::HandlerMissing(reason)) => {
                    logger.write_line("ERROR", &format!("initialize hook failed: {reason}"));
                    overall_success = false;
                    self.run_finalize(script, device_id, &logger, cancel, pause, false)
                        .await;
                    self.device_manager.set_current_action(device_id, None).await;
                    return Ok(ScriptOutcome::Completed { success: false });
                }
                Err(e) => {
                    logger.write_line("ERROR", &format!("initialize hook errored: {e}"));
                    self.run_finalize(script, device_id, &logger, cancel, pause, false)
                        .await;
                    self.device_manager.set_current_action(device_id, None).await;
                    return Err(ExecutorError::HookFailure(e.to_string()));
                }
            }
        }

        for step in &script.steps {
            pause.wait().await;
            if cancel.is_cancelled() {
                logger.write_line("WARNING", "cancelled before step loop completed");
                self.device_manager.set_current_action(device_id, None).await;
                self.run_finalize(script, device_id, &logger, cancel, pause, false)
                    .await;
                return Ok(ScriptOutcome::Cancelled);
            }

            if !script.is_step_enabled(&step.name) {
                logger.write_line("DEBUG", &format!("step '{}' skipped (disabled)", step.name));
                continue;
            }

            match self.run_step(step, device_id, &logger, cancel, pause).await {
                Ok(StepOutcome::Success) => {}
                Ok(StepOutcome::RestartRequested) => {
                    self.device_manager.set_current_action(device_id, None).await;
                    return Ok(ScriptOutcome::RestartRequested);
                }
                Ok(StepOutcome::Failed(reason)) => {
                    logger.write_line("ERROR", &format!("step '{}' failed: {reason}", step.name));
                    overall_success = false;
                    break;
                }
                Err(ExecutorError::Cancelled) => {
                    self.device_manager.set_current_action(device_id, None).await;
                    self.run_finalize(script, device_id, &logger, cancel, pause, false)
                        .await;
                    return Ok(ScriptOutcome::Cancelled);
                }
                Err(e) => {
                    logger.write_line("ERROR", &format!("step '{}' errored: {e}", step.name));
                    overall_success = false;
                    break;
                }
            }
        }

        self.run_finalize(script, device_id, &logger, cancel, pause, overall_success)
            .await;
        self.device_manager.set_current_action(device_id, None).await;
        logger.write_line(
            "INFO",
            &format!("script '{}' completed success={overall_success}", script.name),
        );
        Ok(ScriptOutcome::Completed {
            success: overall_success,
        })
    }

    async fn run_finalize(
        &self,
        script: &Script,
        device_id: &str,
        logger: &crate::logging::DeviceLogSink,
        cancel: &CancellationToken,
        pause: &PauseGate,
        success: bool,
    ) {
        let Some(step) = &script.finalize else {
            return;
        };
        logger.write_line("DEBUG", &format!("finalize hook running (success={success})"));
        if let Err(e) = self.run_step(step, device_id, logger, cancel, pause).await {
            logger.write_line("WARNING", &format!("finalize hook errored (suppressed): {e}"));
        }
    }

    async fn run_step(
        &self,
        step: &Step,
        device_id: &str,
        logger: &crate::logging::DeviceLogSink,
        cancel: &CancellationToken,
        pause: &PauseGate,
    ) -> ExecutorResult<StepOutcome> {
        pause.wait().await;
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        let label = step.description.clone().unwrap_or_else(|| step.name.clone());
        self.device_manager
            .set_current_action(device_id, Some(label))
            .await;

        let start = Instant::now();
        let outcome = self.dispatch(&step.action, device_id, logger, cancel).await;
        logger.write_line(
            "DEBUG",
            &format!("step '{}' finished in {:?}", step.name, start.elapsed()),
        );

        self.device_manager.set_current_action(device_id, None).await;

        if step.wait_after_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.wait_after_ms)).await;
        }

        outcome
    }

    async fn dispatch(
        &self,
        action: &Action,
        device_id: &str,
        logger: &crate::logging::DeviceLogSink,
        cancel: &CancellationToken,
    ) -> ExecutorResult<StepOutcome> {
        let bridge = self.device_manager.bridge();
        match action {
            Action::Tap { x, y } => {
                self.with_retry(|| bridge.tap(device_id, *x, *y)).await?;
                Ok(StepOutcome::Success)
            }
            Action::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => {
                self.with_retry(|| bridge.swipe(device_id, *x1, *y1, *x2, *y2, *duration_ms))
                    .await?;
                Ok(StepOutcome::Success)
            }
            Action::Key { code } => {
                self.with_retry(|| bridge.keyevent(device_id, *code)).await?;
                Ok(StepOutcome::Success)
            }
            Action::InputText { text } => {
                // Clear the field with a burst of DEL key events, then type.
                for _ in 0..32 {
                    self.with_retry(|| bridge.keyevent(device_id, KEYCODE_DEL)).await?;
                }
                self.with_retry(|| bridge.input_text(device_id, text)).await?;
                Ok(StepOutcome::Success)
            }
            Action::Sleep { seconds } => {
                tokio::time::sleep(Duration::from_secs_f64((*seconds).max(0.0))).await;
                Ok(StepOutcome::Success)
            }
            Action::RestartApp { package } => {
                match self.with_retry(|| bridge.restart_app(device_id, package)).await {
                    Ok(()) => Ok(StepOutcome::RestartRequested),
                    Err(e) => Ok(StepOutcome::Failed(e.to_string())),
                }
            }
            Action::Shell { command } => match self.with_retry(|| bridge.shell(device_id, command)).await {
                Ok(output) => {
                    logger.write_line("DEBUG", &format!("shell output: {}", output.trim()));
                    Ok(StepOutcome::Success)
                }
                Err(e) => Ok(StepOutcome::Failed(e.to_string())),
            },
            Action::ClickImage {
                template,
                threshold,
                press_enter_if_not_found,
            } => {
                let image_path = self.take_screenshot(device_id, &bridge).await?;
                let image = crate::matcher::load_image(&image_path)?;
                match self.matcher.find(&image, template, *threshold) {
                    Ok(m) => {
                        let (cx, cy) = m.center();
                        self.with_retry(|| bridge.tap(device_id, cx as i32, cy as i32)).await?;
                        Ok(StepOutcome::Success)
                    }
                    Err(MatcherError::NoMatch(..)) if *press_enter_if_not_found => {
                        self.with_retry(|| bridge.keyevent(device_id, KEYCODE_ENTER)).await?;
                        Ok(StepOutcome::Success)
                    }
                    Err(e) => Ok(StepOutcome::Failed(e.to_string())),
                }
            }
            Action::WaitImage {
                template,
                timeout_s,
                threshold,
            } => {
                let deadline = Instant::now() + Duration::from_secs(*timeout_s);
                loop {
                    if cancel.is_cancelled() {
                        return Err(ExecutorError::Cancelled);
                    }
                    let image_path = self.take_screenshot(device_id, &bridge).await?;
                    let image = crate::matcher::load_image(&image_path)?;
                    match self.matcher.find(&image, template, *threshold) {
                        Ok(_) => return Ok(StepOutcome::Success),
                        Err(MatcherError::NoMatch(..)) => {
                            if Instant::now() >= deadline {
                                return Ok(StepOutcome::Failed(format!(
                                    "template '{template}' not found within {timeout_s}s"
                                )));
                            }
                            tokio::time::sleep(Duration::from_millis(1_000)).await;
                        }
                        Err(e) => return Ok(StepOutcome::Failed(e.to_string())),
                    }
                }
            }
        }
    }

    async fn take_screenshot(
        &self,
        device_id: &str,
        bridge: &Arc<dyn BridgeClient>,
    ) -> ExecutorResult<std::path::PathBuf> {
        std::fs::create_dir_all(&self.screenshot_dir)
            .map_err(|e| ExecutorError::IoFailure(e.to_string()))?;
        let safe_id = device_id.replace(':', "_");
        let path = self.screenshot_dir.join(format!(
            "screenshot_{safe_id}_{}.png",
            chrono::Utc::now().timestamp_millis()
        ));
        self.with_retry(|| bridge.screenshot(device_id, path.to_str().unwrap_or_default()))
            .await?;
        Ok(path)
    }

    /// Retries a fallible bridge call up to `bridge.max_retries` times,
    /// spaced by `bridge.retry_interval_ms`, per the step-level recoverable
    /// error policy (`Timeout` / `BridgeFailure`).
    async fn with_retry<F, Fut, T>(&self, mut call: F) -> Result<T, BridgeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, BridgeError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e @ (BridgeError::Timeout(_) | BridgeError::BridgeFailure(_))) => {
                    attempt += 1;
                    if attempt > self.bridge_config.max_retries {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis(self.bridge_config.retry_interval_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

const KEYCODE_DEL: u32 = 67;
const KEYCODE_ENTER: u32 = 66;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridgeClient;
    use crate::config::{BridgeConfig, DevicesConfig};
    use crate::script::Step;

    fn executor_with(bridge: Arc<MockBridgeClient>) -> (StepExecutor, Arc<DeviceManager>) {
        let dm = Arc::new(DeviceManager::new(
            bridge,
            DevicesConfig::default(),
            tempfile::tempdir().unwrap().keep(),
        ));
        let matcher = Arc::new(ImageMatcher::new("templates", 0.85, 10));
        let exec = StepExecutor::new(
            dm.clone(),
            matcher,
            BridgeConfig::default(),
            tempfile::tempdir().unwrap().keep(),
        );
        (exec, dm)
    }

    fn tap_step(name: &str, x: i32, y: i32) -> Step {
        Step {
            name: name.to_string(),
            description: None,
            action: Action::Tap { x, y },
            wait_after_ms: 0,
        }
    }

    #[tokio::test]
    async fn empty_steps_list_succeeds() {
        let bridge = Arc::new(MockBridgeClient::new());
        let (exec, dm) = executor_with(bridge.clone());
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "dev1\n").unwrap();
        dm.load_roster(tmp.path()).await.unwrap();

        let script = Script {
            name: "empty".into(),
            author: None,
            version: None,
            steps: vec![],
            enabled_steps: Default::default(),
            next: None,
            initialize: None,
            finalize: None,
            dependencies: vec![],
        };

        let cancel = CancellationToken::new();
        let pause = PauseGate::new();
        let outcome = exec.execute(&script, "dev1", &cancel, &pause).await.unwrap();
        assert_eq!(outcome, ScriptOutcome::Completed { success: true });
    }

    #[tokio::test]
    async fn empty_steps_list_still_fires_hooks() {
        let bridge = Arc::new(MockBridgeClient::new());
        let (exec, dm) = executor_with(bridge.clone());
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "dev1\n").unwrap();
        dm.load_roster(tmp.path()).await.unwrap();

        let script = Script {
            name: "empty_with_hooks".into(),
            author: None,
            version: None,
            steps: vec![],
            enabled_steps: Default::default(),
            next: None,
            initialize: Some(tap_step("init_hook", 1, 1)),
            finalize: Some(tap_step("finalize_hook", 2, 2)),
            dependencies: vec![],
        };

        let cancel = CancellationToken::new();
        let pause = PauseGate::new();
        let outcome = exec.execute(&script, "dev1", &cancel, &pause).await.unwrap();
        assert_eq!(outcome, ScriptOutcome::Completed { success: true });
        assert_eq!(bridge.calls(), vec!["tap", "tap"]);
    }

    #[tokio::test]
    async fn disabled_step_is_skipped() {
        let bridge = Arc::new(MockBridgeClient::new());
        let (exec, dm) = executor_with(bridge.clone());
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "dev1\n").unwrap();
        dm.load_roster(tmp.path()).await.unwrap();

        let mut enabled_steps = std::collections::HashMap::new();
        enabled_steps.insert("tap_it".to_string(), false);

        let script = Script {
            name: "s".into(),
            author: None,
            version: None,
            steps: vec![tap_step("tap_it", 1, 2)],
            enabled_steps,
            next: None,
            initialize: None,
            finalize: None,
            dependencies: vec![],
        };

        let cancel = CancellationToken::new();
        let pause = PauseGate::new();
        exec.execute(&script, "dev1", &cancel, &pause).await.unwrap();
        assert!(bridge.calls().is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_step_reports_cancelled() {
        let bridge = Arc::new(MockBridgeClient::new());
        let (exec, dm) = executor_with(bridge.clone());
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "dev1\n").unwrap();
        dm.load_roster(tmp.path()).await.unwrap();

        let script = Script {
            name: "s".into(),
            author: None,
            version: None,
            steps: vec![tap_step("tap_it", 1, 2)],
            enabled_steps: Default::default(),
            next: None,
            initialize: None,
            finalize: None,
            dependencies: vec![],
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        let pause = PauseGate::new();
        let outcome = exec.execute(&script, "dev1", &cancel, &pause).await.unwrap();
        assert_eq!(outcome, ScriptOutcome::Cancelled);
        assert!(dm.get("dev1").await.unwrap().current_action.is_none());
    }
}
