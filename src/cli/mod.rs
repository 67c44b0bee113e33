//! CLI module
//!
//! Command-line interface of the client binary.

pub mod args;
pub mod config;
pub mod progress;

pub use args::{CliArgs, Command, CreateArgs, DownloadArgs};
pub use config::Config;
pub use progress::{DownloadStats, ProgressDisplay};
