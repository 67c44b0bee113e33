//! Error types for the client
//!
//! Every component reports failures as a [`TorrentError`] wrapped in an
//! `anyhow::Error`, so callers can downcast to classify what went wrong.

use std::fmt;

/// Error type shared by all components
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Metadata or bencode decoding errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Peer wire protocol violations
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// File I/O and storage errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Errors reported by a tracker or while talking to one
    TrackerError {
        message: String,
        tracker: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },

    /// An operation gave up after its time bound
    Timeout {
        operation: String,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
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

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with source
    pub fn tracker_error_full(message: impl Into<String>, tracker: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new Timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        TorrentError::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, TorrentError::Timeout { .. })
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::ParseError { source, .. }
            | TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::TrackerError { source, .. }
            | TorrentError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            TorrentError::Timeout { operation } => {
                *operation = format!("{} ({})", operation, ctx);
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            TorrentError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            TorrentError::PeerError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Peer error: {}", message),
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
            TorrentError::TrackerError { message, tracker, source } => {
                match (tracker, source) {
                    (Some(t), Some(s)) => write!(f, "Tracker error: {} (tracker: {}, source: {})", message, t, s),
                    (Some(t), None) => write!(f, "Tracker error: {} (tracker: {})", message, t),
                    (None, Some(s)) => write!(f, "Tracker error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Tracker error: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            TorrentError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
            TorrentError::Timeout { operation } => write!(f, "Timed out: {}", operation),
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            return TorrentError::timeout(err.to_string());
        }
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::validation_error(format!("Malformed resume state: {}", err))
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::config_error(format!("Unparseable URL: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::timeout("operation")
    }
}
