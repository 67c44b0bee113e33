//! CLI configuration module
//!
//! Turns download arguments into an [`EngineConfig`] plus the settings only
//! the binary cares about.

use crate::cli::args::DownloadArgs;
use crate::config::EngineConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::Result;

/// Configuration for one download run
#[derive(Debug, Clone)]
pub struct Config {
    pub torrent_file: PathBuf,
    pub engine: EngineConfig,
    /// Seed after download
    pub seed: bool,
    /// Seed time, zero for no limit
    pub seed_time: Duration,
    pub resume_dir: Option<PathBuf>,
    pub peers: Vec<SocketAddr>,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &DownloadArgs, quiet: bool) -> Self {
        let engine = EngineConfig {
            download_dir: args
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("./downloads")),
            listen_port: args.port,
            max_peers: args.max_connections,
            streaming: args.streaming,
            ..EngineConfig::default()
        };

        Self {
            torrent_file: args.torrent_file.clone(),
            engine,
            seed: args.seed,
            seed_time: Duration::from_secs(args.seed_time * 60),
            resume_dir: args.resume_dir.clone(),
            peers: args.peers.clone(),
            quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.torrent_file.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("torrent file cannot be empty"));
        }
        if let Some(dir) = &self.resume_dir {
            if dir.as_os_str().is_empty() {
                return Err(anyhow::anyhow!("resume_dir cannot be empty"));
            }
        }
        self.engine.validate()
    }

    /// Get the seed time limit (None for unlimited)
    pub fn seed_time_limit(&self) -> Option<Duration> {
        if self.seed_time == Duration::ZERO {
            None
        } else {
            Some(self.seed_time)
        }
    }

    pub fn is_seeding_enabled(&self) -> bool {
        self.seed
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> DownloadArgs {
        DownloadArgs {
            torrent_file: PathBuf::from("test.torrent"),
            output_dir: Some(PathBuf::from("/tmp/downloads")),
            port: 6882,
            max_connections: 100,
            streaming: true,
            seed: true,
            seed_time: 60,
            resume_dir: None,
            peers: vec!["127.0.0.1:6881".parse().unwrap()],
        }
    }

    #[test]
    fn test_config_from_args() {
        let config = Config::from_args(&args(), false);

        assert_eq!(config.engine.download_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.engine.listen_port, 6882);
        assert_eq!(config.engine.max_peers, 100);
        assert!(config.engine.streaming);
        assert!(config.is_seeding_enabled());
        assert_eq!(config.seed_time_limit(), Some(Duration::from_secs(3600)));
        assert_eq!(config.peers.len(), 1);
        assert!(!config.is_quiet());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_output_dir() {
        let mut args = args();
        args.output_dir = None;
        args.seed_time = 0;
        let config = Config::from_args(&args, true);
        assert_eq!(config.engine.download_dir, PathBuf::from("./downloads"));
        assert_eq!(config.seed_time_limit(), None);
    }

    #[test]
    fn test_config_validate_invalid() {
        let mut args = args();
        args.max_connections = 0;
        assert!(Config::from_args(&args, false).validate().is_err());

        let mut args = self::args();
        args.resume_dir = Some(PathBuf::new());
        assert!(Config::from_args(&args, false).validate().is_err());
    }
}
