//! Progress display module
//!
//! Renders torrent status for the console.

use std::io::{self, Write};

use crate::session::TorrentStatus;

const BAR_WIDTH: usize = 30;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.1} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

fn progress_bar(downloaded: u64, total: u64) -> String {
    let fraction = if total == 0 { 1.0 } else { downloaded as f64 / total as f64 };
    let filled = ((fraction * BAR_WIDTH as f64) as usize).min(BAR_WIDTH);
    format!("[{}{}] {:5.1}%", "=".repeat(filled), " ".repeat(BAR_WIDTH - filled), fraction * 100.0)
}

fn state_label(status: &TorrentStatus) -> &'static str {
    if status.completed {
        "done"
    } else if status.active {
        "active"
    } else {
        "paused"
    }
}

/// One block per torrent: header line, progress line and its files
pub fn render_status(statuses: &[TorrentStatus]) -> String {
    if statuses.is_empty() {
        return "No torrents loaded.\n".to_string();
    }

    let mut out = String::new();
    for (i, status) in statuses.iter().enumerate() {
        out.push_str(&format!("{:>2}. {} [{}]\n", i + 1, status.name, state_label(status)));
        out.push_str(&format!(
            "    {} {} / {} | {} | peers: {} | up: {}\n",
            progress_bar(status.downloaded, status.total_length),
            format_bytes(status.downloaded),
            format_bytes(status.total_length),
            format_speed(status.speed),
            status.peers,
            format_bytes(status.uploaded),
        ));
        for (j, (path, length)) in status.files.iter().enumerate() {
            out.push_str(&format!("      {:>2}) {} ({})\n", j + 1, path, format_bytes(*length)));
        }
    }
    out
}

pub fn help_text() -> &'static str {
    "Commands:\n  \
     <n>            start or pause torrent n\n  \
     <n> <f1,f2,..> start torrent n with only the listed files\n  \
     status         show all torrents\n  \
     help           show this help\n  \
     exit           save state and quit\n"
}

/// Console output, silenced by quiet mode except for errors
pub struct ProgressDisplay {
    quiet: bool,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn print_status(&self, statuses: &[TorrentStatus]) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut stdout = io::stdout().lock();
        stdout.write_all(render_status(statuses).as_bytes())?;
        stdout.flush()
    }

    pub fn print_help(&self) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut stdout = io::stdout().lock();
        stdout.write_all(help_text().as_bytes())?;
        stdout.flush()
    }

    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("Error: {}", message);
        Ok(())
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
