//! Engine timing and limits

use std::time::Duration;

use crate::peer::ConnectionConfig;

/// Default listening port advertised to trackers
pub const DEFAULT_PORT: u16 = 57893;

/// Settings shared by every torrent session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Pause between orchestrator cycles
    pub loop_interval: Duration,
    /// A requested piece is handed out again after this long
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub message_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_idles: u32,
    /// Re-announce interval used until the tracker sends one
    pub fallback_announce_interval: Duration,
    pub port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(5),
            message_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            max_idles: 24,
            fallback_announce_interval: Duration::from_secs(120),
            port: DEFAULT_PORT,
        }
    }
}

impl SessionConfig {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            message_timeout: self.message_timeout,
            max_idles: self.max_idles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_connection_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.connection_config(), ConnectionConfig::default());
        assert_eq!(config.loop_interval, Duration::from_secs(2));
        assert_eq!(config.request_timeout, Duration::from_secs(90));
        assert_eq!(config.port, 57893);
    }
}
