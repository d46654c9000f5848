//! Wall-clock trigger that fans automation runs out across the fleet in
//! bounded batches, with pause/resume/stop lifecycle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::config::SchedulerConfig;
use crate::control::{CancellationToken, PauseGate};
use crate::device::DeviceManager;
use crate::executor::{ScriptOutcome, StepExecutor};
use crate::script::ScriptStore;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no scripts are loaded")]
    NoScriptsLoaded,

    #[error("script {0} not found")]
    ScriptNotFound(String),

    #[error("scheduler is already running")]
    AlreadyRunning,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Owns the trigger task, the run-set, and the pause/cancel handles shared
/// with every in-flight batch and device task.
pub struct Scheduler {
    config: SchedulerConfig,
    device_manager: Arc<DeviceManager>,
    script_store: Arc<ScriptStore>,
    executor: Arc<StepExecutor>,
    running: AtomicBool,
    pause: Arc<PauseGate>,
    cancel: RwLock<CancellationToken>,
    running_devices: Arc<Mutex<HashSet<String>>>,
    trigger_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        device_manager: Arc<DeviceManager>,
        script_store: Arc<ScriptStore>,
        executor: Arc<StepExecutor>,
    ) -> Self {
        Self {
            config,
            device_manager,
            script_store,
            executor,
            running: AtomicBool::new(false),
            pause: Arc::new(PauseGate::new()),
            cancel: RwLock::new(CancellationToken::new()),
            running_devices: Arc::new(Mutex::new(HashSet::new())),
            trigger_handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub async fn running_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running_devices.lock().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    /// Arms the rising-edge trigger task, if `config.enabled`. Idempotent:
    /// calling `start` while already running is a no-op.
    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.cancel.write().await = CancellationToken::new();

        if self.config.run_on_start {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.run_automation(None).await {
                    tracing::warn!(error = %e, "run_on_start automation failed");
                }
            });
        }

        if !self.config.enabled {
            return Ok(());
        }

        let this = self.clone();
        let handle = tokio::spawn(async move { this.trigger_loop().await });
        *self.trigger_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Cancels the trigger and every open device task, then awaits them.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.read().await.cancel();
        if let Some(handle) = self.trigger_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.running_devices.lock().await.clear();
    }

    /// Runs `name` (or the first loaded script, if `None`) against every
    /// connected device in the roster, chunked into batches.
    pub async fn run_automation(&self, name: Option<String>) -> SchedulerResult<()> {
        let script_name = match name {
            Some(n) => n,
            None => self
                .script_store
                .list()
                .into_iter()
                .next()
                .ok_or(SchedulerError::NoScriptsLoaded)?,
        };
        if !self.script_store.is_loaded(&script_name) {
            return Err(SchedulerError::ScriptNotFound(script_name));
        }

        let batches = self.device_manager.batches(self.config.batch_size.max(1)).await;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_devices.max(1)));
        let cancel = self.cancel.read().await.clone();

        let mut batch_handles = Vec::new();
        for batch in batches {
            if cancel.is_cancelled() {
                break;
            }
            let this = self.clone_handles();
            let script_name = script_name.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            batch_handles.push(tokio::spawn(async move {
                this.run_batch_inner(batch, script_name, semaphore, cancel).await;
            }));
            tokio::time::sleep(Duration::from_millis(self.config.batch_stagger_ms)).await;
        }

        for handle in batch_handles {
            let _ = handle.await;
        }
        Ok(())
    }

    fn clone_handles(&self) -> SchedulerWorkers {
        SchedulerWorkers {
            device_manager: self.device_manager.clone(),
            script_store: self.script_store.clone(),
            executor: self.executor.clone(),
            pause: self.pause.clone(),
            running_devices: self.running_devices.clone(),
        }
    }

    async fn trigger_loop(self: Arc<Self>) {
        let poll = Duration::from_secs(self.config.poll_interval_s.max(1));
        let trigger_set: HashSet<u32> = self.config.run_minutes.iter().copied().collect();
        let mut previous_minute: Option<u32> = Some(chrono::Local::now().minute());
        let mut suppress_until_next_edge = self.config.run_on_start;

        loop {
            tokio::time::sleep(poll).await;
            if self.cancel.read().await.is_cancelled() {
                return;
            }

            let current_minute = chrono::Local::now().minute();
            let should_run = sample_trigger(
                current_minute,
                previous_minute,
                &trigger_set,
                &mut suppress_until_next_edge,
            );

            if should_run {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.run_automation(None).await {
                        tracing::warn!(error = %e, "scheduled automation failed");
                    }
                });
            }

            previous_minute = Some(current_minute);
        }
    }
}

/// The pure rising-edge decision at the heart of `trigger_loop`, factored out
/// so it can be exercised against a simulated clock sweep without waiting on
/// real wall-clock time. Returns whether this sample should fire a run, and
/// updates `suppress_until_next_edge` in place.
///
/// `run_on_start` suppresses the first rising-edge match landing in the same
/// minute the scheduler started in; the flag clears the next time the
/// sampled minute leaves `trigger_set`.
fn sample_trigger(
    current_minute: u32,
    previous_minute: Option<u32>,
    trigger_set: &HashSet<u32>,
    suppress_until_next_edge: &mut bool,
) -> bool {
    let in_set = trigger_set.contains(&current_minute);
    let was_in_set = previous_minute.map(|m| trigger_set.contains(&m)).unwrap_or(false);
    let rising_edge = in_set && !was_in_set;

    if !in_set {
        *suppress_until_next_edge = false;
        return false;
    }

    if rising_edge && *suppress_until_next_edge {
        *suppress_until_next_edge = false;
        return false;
    }

    rising_edge
}

/// The subset of scheduler state a batch/device task needs, split out so a
/// batch can be spawned onto its own task without holding `&Scheduler`
/// across an `.await` boundary.
#[derive(Clone)]
struct SchedulerWorkers {
    device_manager: Arc<DeviceManager>,
    script_store: Arc<ScriptStore>,
    executor: Arc<StepExecutor>,
    pause: Arc<PauseGate>,
    running_devices: Arc<Mutex<HashSet<String>>>,
}

impl SchedulerWorkers {
    async fn run_batch_inner(
        &self,
        batch: Vec<String>,
        script_name: String,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) {
        let connected = self.device_manager.connect_many(&batch).await;
        if connected.is_empty() {
            tracing::warn!(batch = ?batch, "batch connected no devices");
            return;
        }

        let mut device_handles = Vec::new();
        for device_id in connected {
            let semaphore = semaphore.clone();
            let script_name = script_name.clone();
            let cancel = cancel.clone();
            let this = self.clone();
            device_handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                this.running_devices.lock().await.insert(device_id.clone());
                this.run_device_chain(&device_id, script_name, &cancel).await;
                this.running_devices.lock().await.remove(&device_id);
            }));
        }
        for handle in device_handles {
            let _ = handle.await;
        }
    }

    async fn run_device_chain(&self, device_id: &str, mut script_name: String, cancel: &CancellationToken) {
        let lock = self.device_manager.run_lock(device_id).await;
        let _guard = lock.lock().await;
        loop {
            let script = match self.script_store.get(&script_name) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(device = %device_id, script = %script_name, error = %e, "chained script missing");
                    return;
                }
            };

            let outcome = self
                .executor
                .execute(&script, device_id, cancel, &self.pause)
                .await;

            match outcome {
                Ok(ScriptOutcome::Completed { success: true }) => match &script.next {
                    Some(next) => script_name = next.clone(),
                    None => return,
                },
                Ok(ScriptOutcome::Completed { success: false }) => {
                    tracing::error!(device = %device_id, script = %script.name, "device task failed mid-script");
                    return;
                }
                Ok(ScriptOutcome::RestartRequested) => return,
                Ok(ScriptOutcome::Cancelled) => return,
                Err(e) => {
                    tracing::error!(device = %device_id, script = %script.name, error = %e, "device task errored");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridgeClient;
    use crate::config::{BridgeConfig, DevicesConfig};
    use crate::matcher::ImageMatcher;

    fn build(config: SchedulerConfig) -> (Arc<Scheduler>, Arc<DeviceManager>, Arc<ScriptStore>) {
        let bridge = Arc::new(MockBridgeClient::new());
        bridge.set_present("dev1", true);
        let dm = Arc::new(DeviceManager::new(
            bridge,
            DevicesConfig::default(),
            tempfile::tempdir().unwrap().keep(),
        ));
        let matcher = Arc::new(ImageMatcher::new("templates", 0.85, 10));
        let executor = Arc::new(StepExecutor::new(
            dm.clone(),
            matcher,
            BridgeConfig::default(),
            tempfile::tempdir().unwrap().keep(),
        ));
        let store_dir = tempfile::tempdir().unwrap().keep();
        std::fs::write(
            store_dir.join("one.yaml"),
            "name: one\nsteps:\n  - name: s1\n    action: sleep\n    seconds: 0\n",
        )
        .unwrap();
        let store = Arc::new(ScriptStore::new(store_dir));
        store.load_all().unwrap();

        let scheduler = Arc::new(Scheduler::new(config, dm.clone(), store.clone(), executor));
        (scheduler, dm, store)
    }

    #[tokio::test]
    async fn run_automation_errors_without_loaded_scripts() {
        let bridge = Arc::new(MockBridgeClient::new());
        let dm = Arc::new(DeviceManager::new(
            bridge,
            DevicesConfig::default(),
            tempfile::tempdir().unwrap().keep(),
        ));
        let matcher = Arc::new(ImageMatcher::new("templates", 0.85, 10));
        let executor = Arc::new(StepExecutor::new(
            dm.clone(),
            matcher,
            BridgeConfig::default(),
            tempfile::tempdir().unwrap().keep(),
        ));
        let empty_store = Arc::new(ScriptStore::new(tempfile::tempdir().unwrap().keep()));
        empty_store.load_all().unwrap();

        let mut config = SchedulerConfig::default();
        config.enabled = false;
        config.run_on_start = false;
        let scheduler = Scheduler::new(config, dm, empty_store, executor);

        let err = scheduler.run_automation(None).await;
        assert!(matches!(err, Err(SchedulerError::NoScriptsLoaded)));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let mut config = SchedulerConfig::default();
        config.enabled = false;
        config.run_on_start = false;
        let (scheduler, _dm, _store) = build(config);
        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[test]
    fn rising_edge_fires_once_per_clock_sweep() {
        // run_minutes=[5,25,45]; clock sweeps 04:59 -> 05:00 -> 05:01 -> 05:05:30.
        // Expect exactly one fire, at the 05:05 sample.
        let trigger_set: HashSet<u32> = [5, 25, 45].into_iter().collect();
        let mut suppress = false;
        let mut previous = Some(59u32);
        let mut fires = 0;

        for minute in [0u32, 1, 5] {
            if sample_trigger(minute, previous, &trigger_set, &mut suppress) {
                fires += 1;
            }
            previous = Some(minute);
        }

        assert_eq!(fires, 1);
    }

    #[test]
    fn run_on_start_suppresses_first_edge_in_starting_minute() {
        let trigger_set: HashSet<u32> = [5].into_iter().collect();
        let mut suppress = true; // scheduler started during minute 5
        let mut previous = None;

        // Still minute 5: suppressed even though it's a "rising edge" from None.
        assert!(!sample_trigger(5, previous, &trigger_set, &mut suppress));
        previous = Some(5);

        // Leaves the trigger set: suppression clears.
        assert!(!sample_trigger(6, previous, &trigger_set, &mut suppress));
        previous = Some(6);

        // Re-enters on the next cycle: fires normally now.
        assert!(sample_trigger(5, previous, &trigger_set, &mut suppress));
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_gate() {
        let mut config = SchedulerConfig::default();
        config.enabled = false;
        config.run_on_start = false;
        let (scheduler, _dm, _store) = build(config);
        assert!(!scheduler.is_paused());
        scheduler.pause();
        assert!(scheduler.is_paused());
        scheduler.resume();
        assert!(!scheduler.is_paused());
    }
}
