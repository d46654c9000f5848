// Fleet Automation Controller library
// Fleet-wide automation controller for Android emulator instances reachable
// through a host debug bridge: a scheduler, a device manager, and a step
// executor, wired together behind a CLI/REPL front end.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod control;
pub mod device;
pub mod executor;
pub mod logging;
pub mod matcher;
pub mod scheduler;
pub mod script;
