//! The script store: loads, validates, and serves the declarative
//! automation scripts that the step executor runs against a device.

mod store;

pub use store::{ScriptInfo, ScriptStore};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script {0} is invalid: {1}")]
    ScriptInvalid(String, String),

    #[error("handler not found for action in step {0}")]
    HandlerMissing(String),

    #[error("script {0} not found")]
    NotFound(String),

    #[error("failed to read script file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse script file {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type ScriptResult<T> = Result<T, ScriptError>;

/// The closed set of step actions a script can invoke. Tagged by `action`
/// in the YAML file, e.g.:
///
/// ```yaml
/// steps:
///   - name: open_app
///     action: restart_app
///     package: com.example.app
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Action {
    ClickImage {
        template: String,
        threshold: Option<f32>,
        #[serde(default)]
        press_enter_if_not_found: bool,
    },
    InputText {
        text: String,
    },
    WaitImage {
        template: String,
        #[serde(default = "default_wait_timeout_s")]
        timeout_s: u64,
        threshold: Option<f32>,
    },
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        #[serde(default = "default_swipe_duration_ms")]
        duration_ms: u64,
    },
    Key {
        code: u32,
    },
    Tap {
        x: i32,
        y: i32,
    },
    Sleep {
        seconds: f64,
    },
    RestartApp {
        package: String,
    },
    Shell {
        command: String,
    },
}

fn default_wait_timeout_s() -> u64 {
    30
}

fn default_swipe_duration_ms() -> u64 {
    500
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::ClickImage { .. } => "click_image",
            Action::InputText { .. } => "input_text",
            Action::WaitImage { .. } => "wait_image",
            Action::Swipe { .. } => "swipe",
            Action::Key { .. } => "key",
            Action::Tap { .. } => "tap",
            Action::Sleep { .. } => "sleep",
            Action::RestartApp { .. } => "restart_app",
            Action::Shell { .. } => "shell",
        }
    }
}

/// One step in a script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub action: Action,
    /// Milliseconds to wait after the handler returns, regardless of outcome.
    #[serde(default)]
    pub wait_after_ms: u64,
}

/// A fully parsed, validated script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Step name -> enabled flag; steps not present default to enabled.
    #[serde(default)]
    pub enabled_steps: std::collections::HashMap<String, bool>,
    /// Name of another script to chain into after this one completes
    /// successfully.
    #[serde(default)]
    pub next: Option<String>,
    /// A step to run before the main loop, as a setup hook. A failure here
    /// skips the step loop entirely but `finalize` still runs. Inline
    /// rather than a name reference into `steps`, since an empty `steps`
    /// list must still be able to carry a hook.
    #[serde(default)]
    pub initialize: Option<Step>,
    /// A step to run after the main loop regardless of outcome, as a
    /// teardown hook. Its own failure is logged and suppressed.
    #[serde(default)]
    pub finalize: Option<Step>,
    /// Surfaced informationally via `ScriptStore::info`; not acted upon by
    /// the executor or scheduler.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Script {
    /// A step is enabled unless explicitly disabled in `enabled_steps`.
    pub fn is_step_enabled(&self, step_name: &str) -> bool {
        *self.enabled_steps.get(step_name).unwrap_or(&true)
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn validate(&self) -> ScriptResult<()> {
        if self.name.trim().is_empty() {
            return Err(ScriptError::ScriptInvalid(
                self.name.clone(),
                "script name must not be empty".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(ScriptError::ScriptInvalid(
                    self.name.clone(),
                    "every step must have a non-empty name".into(),
                ));
            }
            if !seen.insert(step.name.clone()) {
                return Err(ScriptError::ScriptInvalid(
                    self.name.clone(),
                    format!("duplicate step name: {}", step.name),
                ));
            }
        }
        for key in self.enabled_steps.keys() {
            if !self.steps.iter().any(|s| &s.name == key) {
                return Err(ScriptError::ScriptInvalid(
                    self.name.clone(),
                    format!("enabled_steps references unknown step: {key}"),
                ));
            }
        }
        for hook in [&self.initialize, &self.finalize] {
            if let Some(step) = hook {
                if step.name.trim().is_empty() {
                    return Err(ScriptError::ScriptInvalid(
                        self.name.clone(),
                        "hook step must have a non-empty name".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}
