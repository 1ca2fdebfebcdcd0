//! CLI module
//!
//! Arguments, configuration and the interactive console.

pub mod args;
pub mod command;
pub mod config;
pub mod progress;

pub use args::CliArgs;
pub use command::{parse_command, Command};
pub use config::Config;
pub use progress::{format_bytes, format_speed, render_status, ProgressDisplay};
