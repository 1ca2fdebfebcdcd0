//! Client
//!
//! The set of torrent sessions driven from the console.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::TorrentError;
use crate::session::{TorrentSession, TorrentStatus};

/// Every torrent the console knows about, numbered from 1
pub struct Client {
    sessions: Vec<Arc<TorrentSession>>,
}

impl Client {
    pub fn new(sessions: Vec<TorrentSession>) -> Self {
        Self {
            sessions: sessions.into_iter().map(Arc::new).collect(),
        }
    }

    /// Open one session per `*.torrent` file in `torrent_dir`, sorted by file
    /// name, each downloading into `download_dir/<file stem>`.
    #[cfg(feature = "download")]
    pub async fn load(
        torrent_dir: &std::path::Path,
        download_dir: &std::path::Path,
        config: crate::session::SessionConfig,
    ) -> Result<Self> {
        use crate::torrent::TorrentParser;
        use crate::tracker::HttpTracker;
        use tracing::debug;

        tokio::fs::create_dir_all(torrent_dir).await.map_err(|e| {
            TorrentError::storage_error_full("Failed to create torrent directory", torrent_dir.display().to_string(), e.to_string())
        })?;

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(torrent_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "torrent") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut sessions = Vec::with_capacity(paths.len());
        for path in paths {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            debug!("Loading torrent {}", path.display());

            let info = TorrentParser::parse_file(&path)
                .map_err(|e| e.context(format!("Failed to load {}", path.display())))?;
            let tracker = HttpTracker::new(&info.announce)?;
            let session =
                TorrentSession::open(name.clone(), info, download_dir.join(&name), Box::new(tracker), config.clone())
                    .await?;
            sessions.push(session);
        }

        info!("Loaded {} torrents from {}", sessions.len(), torrent_dir.display());
        Ok(Self::new(sessions))
    }

    pub fn sessions(&self) -> &[Arc<TorrentSession>] {
        &self.sessions
    }

    /// Toggle torrent `number` (1-based).
    ///
    /// An active torrent is paused. An inactive one starts downloading the
    /// given 1-based file numbers, or every file when none are given.
    pub fn set_active(&self, number: usize, files: Option<Vec<usize>>) -> Result<()> {
        let session = number
            .checked_sub(1)
            .and_then(|index| self.sessions.get(index))
            .ok_or_else(|| TorrentError::user_input_error(format!("No torrent with number {}", number)))?;

        let selection = match files {
            Some(numbers) if !numbers.is_empty() => {
                let mut indices = Vec::with_capacity(numbers.len());
                for file_number in numbers {
                    let index = file_number
                        .checked_sub(1)
                        .ok_or_else(|| TorrentError::user_input_error("File numbers start at 1"))?;
                    indices.push(index);
                }
                Some(indices)
            }
            _ => None,
        };

        if !session.toggle_active() {
            info!("Pausing '{}'", session.name());
            return Ok(());
        }

        info!("Starting '{}'", session.name());
        let session = Arc::clone(session);
        tokio::spawn(async move {
            if let Err(e) = session.run_active(selection).await {
                error!("Torrent '{}' stopped with error: {}", session.name(), e);
            }
        });
        Ok(())
    }

    /// Stop every session and persist its state
    pub async fn exit(&self) {
        for session in &self.sessions {
            session.deactivate();
            if let Err(e) = session.stop().await {
                error!("Failed to save state of '{}': {}", session.name(), e);
            }
        }
        info!("All torrents stopped");
    }

    pub async fn status(&self) -> Vec<TorrentStatus> {
        let mut statuses = Vec::with_capacity(self.sessions.len());
        for session in &self.sessions {
            statuses.push(session.status().await);
        }
        statuses
    }
}
