//! CLI arguments module
//!
//! Command-line argument parsing with clap.

use clap::Parser;
use std::path::PathBuf;

use crate::session::DEFAULT_PORT;

/// CLI arguments for the console client
#[derive(Debug, Parser)]
#[command(name = "peerload")]
#[command(about = "Download the torrents found in a directory from an interactive console", long_about = None)]
pub struct CliArgs {
    /// Directory scanned for .torrent files
    #[arg(long, value_name = "DIR", default_value = "torrents")]
    pub torrent_dir: PathBuf,

    /// Directory downloads are written to, one subdirectory per torrent
    #[arg(long, value_name = "DIR", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Port reported to trackers
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Log level implied by the verbosity flags
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["peerload"]).unwrap();
        assert_eq!(args.torrent_dir, PathBuf::from("torrents"));
        assert_eq!(args.download_dir, PathBuf::from("downloads"));
        assert_eq!(args.port, 57893);
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_flags() {
        let args = CliArgs::try_parse_from(["peerload", "--torrent-dir", "in", "-p", "7000", "-v"]).unwrap();
        assert_eq!(args.torrent_dir, PathBuf::from("in"));
        assert_eq!(args.port, 7000);
        assert!(args.is_verbose());
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        let args = CliArgs::try_parse_from(["peerload", "-q"]).unwrap();
        assert!(args.is_quiet());
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
