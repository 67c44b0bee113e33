//! Engine configuration
//!
//! Every tunable the engine, its sessions and its trackers use.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::error::TorrentError;

/// Tracker announce settings
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Timeout of one HTTP announce
    pub http_timeout: Duration,
    /// Largest HTTP announce response accepted
    pub max_response_size: usize,
    /// Receive timeout of one UDP connect attempt
    pub udp_connect_timeout: Duration,
    /// Receive timeout of one UDP announce attempt
    pub udp_announce_timeout: Duration,
    /// Attempts per UDP phase
    pub udp_attempts: u32,
    pub http_numwant: u32,
    pub udp_numwant: u32,
    /// Concurrent announces during the initial "started" fan-out
    pub announce_workers: usize,
    /// How often trackers are checked for a due announce
    pub scan_interval: Duration,
    /// Bound on the "stopped" announces made at shutdown
    pub stop_timeout: Duration,
    /// Wait after a failed announce, doubled on each further failure
    pub retry_backoff: Duration,
    /// Cap on the doubled retry wait
    pub max_retry_backoff: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(5),
            max_response_size: 64 * 1024,
            udp_connect_timeout: Duration::from_secs(2),
            udp_announce_timeout: Duration::from_secs(4),
            udp_attempts: 3,
            http_numwant: 100,
            udp_numwant: 200,
            announce_workers: 5,
            scan_interval: Duration::from_millis(1000),
            stop_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(60),
            max_retry_backoff: Duration::from_secs(30 * 60),
        }
    }
}

/// Configuration for one torrent engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Directory the torrent's files are laid out under
    pub download_dir: PathBuf,
    /// Listening port, 0 for an ephemeral one
    pub listen_port: u16,
    /// Maximum number of peer sessions, inbound and outbound together
    pub max_peers: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Close a session after this long without receiving anything
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Period of end-game checks, session collection and re-advertising
    pub housekeeping_interval: Duration,
    /// How long the dialer sleeps when it has nothing to do
    pub dialer_wait: Duration,
    /// Download in index order for playback
    pub streaming: bool,
    /// Disk requests queued before writers have to wait
    pub disk_queue_capacity: usize,
    /// Bound on joining sessions and flushing the disk at stop
    pub shutdown_timeout: Duration,
    pub tracker: TrackerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            listen_port: 0,
            max_peers: 50,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(180),
            keepalive_interval: Duration::from_secs(120),
            housekeeping_interval: Duration::from_millis(500),
            dialer_wait: Duration::from_millis(200),
            streaming: false,
            disk_queue_capacity: 1024,
            shutdown_timeout: Duration::from_secs(5),
            tracker: TrackerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.download_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("cannot be empty", "download_dir").into());
        }
        if self.max_peers == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "max_peers").into());
        }
        if self.disk_queue_capacity == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "disk_queue_capacity").into());
        }
        if self.keepalive_interval >= self.idle_timeout {
            return Err(TorrentError::config_error_with_field(
                "must be shorter than idle_timeout",
                "keepalive_interval"
            ).into());
        }
        for (value, field) in [
            (self.connect_timeout, "connect_timeout"),
            (self.handshake_timeout, "handshake_timeout"),
            (self.housekeeping_interval, "housekeeping_interval"),
            (self.dialer_wait, "dialer_wait"),
            (self.tracker.http_timeout, "tracker.http_timeout"),
            (self.tracker.udp_connect_timeout, "tracker.udp_connect_timeout"),
            (self.tracker.udp_announce_timeout, "tracker.udp_announce_timeout"),
            (self.tracker.scan_interval, "tracker.scan_interval"),
            (self.tracker.retry_backoff, "tracker.retry_backoff"),
        ] {
            if value.is_zero() {
                return Err(TorrentError::config_error_with_field("must be positive", field).into());
            }
        }
        if self.tracker.udp_attempts == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "tracker.udp_attempts").into());
        }
        if self.tracker.announce_workers == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "tracker.announce_workers").into());
        }
        if self.tracker.max_retry_backoff < self.tracker.retry_backoff {
            return Err(TorrentError::config_error_with_field(
                "must not be shorter than tracker.retry_backoff",
                "tracker.max_retry_backoff"
            ).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_peers, 50);
        assert_eq!(config.tracker.udp_attempts, 3);
        assert_eq!(config.tracker.scan_interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = EngineConfig {
            max_peers: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_peers"));

        let config = EngineConfig {
            keepalive_interval: Duration::from_secs(200),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.tracker.udp_connect_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::ConfigError { .. })
        ));

        let mut config = EngineConfig::default();
        config.tracker.max_retry_backoff = Duration::from_secs(10);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tracker.max_retry_backoff"));
    }
}
