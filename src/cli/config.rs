//! CLI configuration module
//!
//! Turns parsed arguments into validated client settings.

use anyhow::Result;
use std::path::PathBuf;

use crate::cli::args::CliArgs;
use crate::error::TorrentError;
use crate::session::SessionConfig;

/// Configuration for the console client
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory scanned for .torrent files
    pub torrent_dir: PathBuf,
    /// Root of all downloads
    pub download_dir: PathBuf,
    /// Port reported to trackers
    pub port: u16,
    pub verbose: bool,
    pub quiet: bool,
}

impl Config {
    pub fn from_args(args: &CliArgs) -> Self {
        Self {
            torrent_dir: args.torrent_dir.clone(),
            download_dir: args.download_dir.clone(),
            port: args.port,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "port").into());
        }
        if self.torrent_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("torrent_dir cannot be empty", "torrent_dir").into());
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("download_dir cannot be empty", "download_dir").into());
        }
        Ok(())
    }

    /// Engine settings: defaults with the configured port
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            port: self.port,
            ..SessionConfig::default()
        }
    }
}
