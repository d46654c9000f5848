//! Command-line flags and the interactive REPL front end.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::bridge::{BridgeClient, RealBridgeClient};
use crate::config::AppConfig;
use crate::device::DeviceManager;
use crate::executor::StepExecutor;
use crate::matcher::ImageMatcher;
use crate::scheduler::Scheduler;
use crate::script::ScriptStore;

/// Fleet-wide automation controller for Android emulator instances reachable
/// through a host debug bridge.
#[derive(Parser, Debug)]
#[command(name = "fleet-automation-controller", version, about)]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Run this script immediately after initialization, then continue into
    /// the interactive shell (or exit, if the scheduler isn't enabled).
    #[arg(short = 'r', long = "run")]
    pub run: Option<String>,

    /// Enable debug-level logging regardless of the config file.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

/// Everything the REPL needs wired together: the device manager, script
/// store, and scheduler, plus the raw bridge handle for ad-hoc commands.
///
/// `config` is re-readable via the `reload` command; `directories`/`logging`
/// take effect immediately for anything that reads them per-call (e.g. the
/// `screenshot` command's output path), but `bridge`/`devices`/`scheduler`
/// were already baked into their respective subsystems at startup and need
/// a process restart to pick up a changed value — `reload` logs this.
pub struct App {
    pub config: parking_lot::RwLock<AppConfig>,
    config_path: PathBuf,
    pub bridge: Arc<dyn BridgeClient>,
    pub device_manager: Arc<DeviceManager>,
    pub script_store: Arc<ScriptStore>,
    pub scheduler: Arc<Scheduler>,
}

impl App {
    pub async fn initialize(args: &Args) -> anyhow::Result<Self> {
        let mut config = AppConfig::load(&args.config)?;
        if args.debug {
            config.logging.level = crate::config::LogLevel::Debug;
        }
        config.ensure_directories()?;
        crate::logging::init(&config.logging)?;

        let bridge: Arc<dyn BridgeClient> = Arc::new(RealBridgeClient::new(&config.bridge));
        let device_manager = Arc::new(DeviceManager::new(
            bridge.clone(),
            config.devices.clone(),
            config.directories.logs.join("devices"),
        ));
        device_manager.load_roster(&config.devices.roster_file).await?;

        let matcher = Arc::new(ImageMatcher::new(
            config.directories.templates.clone(),
            config.matcher.default_threshold,
            config.matcher.max_find_all_results,
        ));
        let executor = Arc::new(StepExecutor::new(
            device_manager.clone(),
            matcher,
            config.bridge.clone(),
            config.directories.output.clone(),
        ));

        let script_store = Arc::new(ScriptStore::new(config.directories.configs.clone()));
        let (loaded, failed) = script_store.load_all()?;
        tracing::info!(loaded = loaded.len(), failed = failed.len(), "scripts loaded");
        for (path, err) in &failed {
            tracing::warn!(path = %path.display(), error = %err, "script failed to load");
        }

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            device_manager.clone(),
            script_store.clone(),
            executor,
        ));

        let health_manager = device_manager.clone();
        tokio::spawn(async move { health_manager.health_loop().await });

        Ok(Self {
            config: parking_lot::RwLock::new(config),
            config_path: args.config.clone(),
            bridge,
            device_manager,
            script_store,
            scheduler,
        })
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.device_manager.disconnect_all().await;
        tracing::info!("shutdown complete");
    }

    /// `--run NAME` on the command line: short-circuits straight into
    /// `run_automation`, exactly like the interactive `start` command.
    pub async fn run_specific(&self, name: &str) -> anyhow::Result<()> {
        self.scheduler.run_automation(Some(name.to_string())).await?;
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.start().await?;
        Ok(())
    }

    /// Drives the `rustyline`-backed interactive shell until `exit`/EOF.
    pub async fn repl(&self) -> anyhow::Result<()> {
        let mut editor = DefaultEditor::new()?;
        loop {
            match editor.readline("fleet> ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(line);
                    if self.handle_command(line).await? {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(e) => {
                    tracing::error!(error = %e, "readline error");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Returns `true` if the shell should exit.
    async fn handle_command(&self, line: &str) -> anyhow::Result<bool> {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        let arg = parts.next();

        match command {
            "help" => {
                println!(
                    "commands: help status start [script] stop pause resume reload connect <id> disconnect <id> screenshot <id> clear exit"
                );
            }
            "status" => self.print_status().await,
            "start" => {
                let name = arg.map(str::to_string);
                let scheduler = self.scheduler.clone();
                tokio::spawn(async move {
                    match scheduler.run_automation(name).await {
                        Ok(()) => tracing::info!("run complete"),
                        Err(e) => tracing::warn!(error = %e, "run failed"),
                    }
                });
                println!("run started in background (use 'status' to check progress)");
            }
            "stop" => self.scheduler.stop().await,
            "pause" => self.scheduler.pause(),
            "resume" => self.scheduler.resume(),
            "reload" => {
                match AppConfig::load(&self.config_path) {
                    Ok(new_config) => {
                        *self.config.write() = new_config;
                        println!("config reloaded (bridge/devices/scheduler settings need a restart to take effect)");
                    }
                    Err(e) => println!("config reload failed, keeping previous config: {e}"),
                }
                match self.script_store.reload() {
                    Ok((loaded, failed)) => println!("reloaded {} scripts, {} failed", loaded.len(), failed.len()),
                    Err(e) => println!("script reload failed: {e}"),
                }
            }
            "connect" => {
                let Some(id) = arg else {
                    println!("usage: connect <id>");
                    return Ok(false);
                };
                match self.device_manager.connect(id).await {
                    Ok(()) => println!("{id} connected"),
                    Err(e) => println!("{id} connect failed: {e}"),
                }
            }
            "disconnect" => {
                let Some(id) = arg else {
                    println!("usage: disconnect <id>");
                    return Ok(false);
                };
                match self.device_manager.disconnect(id).await {
                    Ok(()) => println!("{id} disconnected"),
                    Err(e) => println!("{id} disconnect failed: {e}"),
                }
            }
            "screenshot" => {
                let Some(id) = arg else {
                    println!("usage: screenshot <id>");
                    return Ok(false);
                };
                let output_dir = self.config.read().directories.output.clone();
                let path = output_dir.join(format!(
                    "screenshot_{}_{}.png",
                    id.replace(':', "_"),
                    chrono::Utc::now().timestamp_millis()
                ));
                match self.bridge.screenshot(id, path.to_str().unwrap_or_default()).await {
                    Ok(()) => println!("saved {}", path.display()),
                    Err(e) => println!("screenshot failed: {e}"),
                }
            }
            "clear" => {
                print!("\x1B[2J\x1B[1;1H");
            }
            "exit" | "quit" => return Ok(true),
            other => println!("unknown command: {other} (try 'help')"),
        }
        Ok(false)
    }

    async fn print_status(&self) {
        let ids = self.device_manager.device_ids().await;
        println!(
            "scheduler: running={} paused={}",
            self.scheduler.is_running(),
            self.scheduler.is_paused()
        );
        println!("devices: {}", ids.len());
        for id in ids {
            if let Some(record) = self.device_manager.get(&id).await {
                println!(
                    "  {id:<24} {:?} action={}",
                    record.state,
                    record.current_action.as_deref().unwrap_or("-")
                );
            }
        }
        println!("scripts: {}", self.script_store.list().join(", "));
    }
}
