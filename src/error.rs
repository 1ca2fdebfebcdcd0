//! Error types for the transfer engine
//!
//! Every fallible operation in the crate returns `anyhow::Result`, with a
//! `TorrentError` at the root of the chain so callers can match on the kind.

use std::fmt;

/// Error type for engine operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Malformed bencode, metadata, or wire data
    FormatError {
        message: String,
        source: Option<String>,
    },

    /// Failure on a single peer connection
    ConnectionError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Piece data that failed its integrity check
    VerificationError {
        message: String,
        piece: Option<u32>,
    },

    /// File I/O and persistence errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce failures
    TrackerError {
        message: String,
        source: Option<String>,
    },

    /// Invalid configuration
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Invalid console input
    UserInputError {
        message: String,
    },
}

impl TorrentError {
    /// Create a new FormatError
    pub fn format_error(message: impl Into<String>) -> Self {
        TorrentError::FormatError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new FormatError with source
    pub fn format_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::FormatError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ConnectionError with peer address
    pub fn connection_error(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::ConnectionError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new ConnectionError with peer and source
    pub fn connection_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ConnectionError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new VerificationError for a piece
    pub fn verification_error(message: impl Into<String>, piece: u32) -> Self {
        TorrentError::VerificationError {
            message: message.into(),
            piece: Some(piece),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    pub fn tracker_error(message: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            source: None,
        }
    }

    pub fn tracker_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn user_input_error(message: impl Into<String>) -> Self {
        TorrentError::UserInputError {
            message: message.into(),
        }
    }

    /// True for errors raised by malformed input data
    pub fn is_format(&self) -> bool {
        matches!(self, TorrentError::FormatError { .. })
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::FormatError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Format error: {} (source: {})", message, src)
                } else {
                    write!(f, "Format error: {}", message)
                }
            }
            TorrentError::ConnectionError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Connection error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Connection error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Connection error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Connection error: {}", message),
                }
            }
            TorrentError::VerificationError { message, piece } => {
                if let Some(index) = piece {
                    write!(f, "Verification error: {} (piece: {})", message, index)
                } else {
                    write!(f, "Verification error: {}", message)
                }
            }
            TorrentError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            TorrentError::TrackerError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Tracker error: {} (source: {})", message, src)
                } else {
                    write!(f, "Tracker error: {}", message)
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::UserInputError { message } => write!(f, "Invalid input: {}", message),
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::storage_error_full("Failed to parse JSON data", "unknown".to_string(), err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::format_error_with_source("Failed to parse address", err.to_string())
    }
}
