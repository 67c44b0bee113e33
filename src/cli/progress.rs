//! Progress display module
//!
//! Renders engine snapshots as a one-line progress bar.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::engine::EngineStats;

/// What the progress line shows, derived from two engine snapshots
#[derive(Debug, Clone, Default)]
pub struct DownloadStats {
    /// Verified bytes
    pub completed: u64,
    pub total: u64,
    /// Bytes received from peers, including discarded ones
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes per second
    pub download_speed: f64,
    pub upload_speed: f64,
    pub peers: usize,
    pub verified_pieces: usize,
    pub total_pieces: usize,
    pub end_game: bool,
    /// 0.0 to 1.0
    pub progress: f64,
}

impl DownloadStats {
    /// Stats for `current`, with speeds measured against `previous`
    /// taken `elapsed` earlier
    pub fn from_snapshots(previous: &EngineStats, current: &EngineStats, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = |now: u64, before: u64| {
            if secs > 0.0 {
                now.saturating_sub(before) as f64 / secs
            } else {
                0.0
            }
        };

        Self {
            completed: current.total_size - current.left,
            total: current.total_size,
            downloaded: current.downloaded,
            uploaded: current.uploaded,
            download_speed: rate(current.downloaded, previous.downloaded),
            upload_speed: rate(current.uploaded, previous.uploaded),
            peers: current.active_peers,
            verified_pieces: current.verified_pieces,
            total_pieces: current.total_pieces,
            end_game: current.end_game,
            progress: current.progress(),
        }
    }

    /// Format bytes to human readable string
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_index])
    }

    /// Format speed to human readable string
    pub fn format_speed(bytes_per_sec: f64) -> String {
        format!("{}/s", Self::format_bytes(bytes_per_sec as u64))
    }

    /// Format duration to human readable string
    pub fn format_duration(duration: Duration) -> String {
        let total_secs = duration.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Time left at `speed` for the bytes still missing
    pub fn calculate_eta(completed: u64, total: u64, speed: f64) -> Option<Duration> {
        if speed <= 0.0 || completed >= total {
            return None;
        }

        let remaining = total.saturating_sub(completed) as f64;
        Some(Duration::from_secs_f64(remaining / speed))
    }

    /// The progress line without terminal control codes
    pub fn render_line(&self) -> String {
        let bar_width: usize = 40;
        let filled = ((self.progress * bar_width as f64) as usize).min(bar_width);
        let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);

        let eta = Self::calculate_eta(self.completed, self.total, self.download_speed)
            .map(Self::format_duration)
            .unwrap_or_else(|| "∞".to_string());

        format!(
            "[{}] {:.1}% | {}/{} pieces | ↓ {} | ↑ {} | Peers: {}{} | ETA: {}",
            bar,
            self.progress * 100.0,
            self.verified_pieces,
            self.total_pieces,
            Self::format_speed(self.download_speed),
            Self::format_speed(self.upload_speed),
            self.peers,
            if self.end_game { " | end-game" } else { "" },
            eta,
        )
    }
}

/// Progress display for CLI
#[derive(Debug)]
pub struct ProgressDisplay {
    start_time: Instant,
    last_update: Option<Instant>,
    update_interval: Duration,
    /// Quiet mode (no progress output)
    quiet: bool,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_millis(500))
    }

    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: None,
            update_interval: interval,
            quiet,
        }
    }

    /// Redraw the progress line, at most once per update interval
    pub fn update(&mut self, stats: &DownloadStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        if self.last_update.is_some_and(|last| last.elapsed() < self.update_interval) {
            return Ok(());
        }
        self.last_update = Some(Instant::now());

        let mut stdout = io::stdout().lock();
        write!(stdout, "\r\x1b[2K{}", stats.render_line())?;
        stdout.flush()
    }

    /// Print completion message
    pub fn print_complete(&self, stats: &DownloadStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        print!("\r\x1b[2K");
        io::stdout().flush()?;

        println!("Download Complete!");
        println!("  Size: {}", DownloadStats::format_bytes(stats.total));
        println!("  Received: {}", DownloadStats::format_bytes(stats.downloaded));
        println!("  Uploaded: {}", DownloadStats::format_bytes(stats.uploaded));
        println!("  Elapsed Time: {}", DownloadStats::format_duration(self.start_time.elapsed()));

        Ok(())
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("\r\x1b[2KError: {}", message);
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(downloaded: u64, uploaded: u64, left: u64) -> EngineStats {
        EngineStats {
            downloaded,
            uploaded,
            total_size: 1000,
            left,
            verified_pieces: 3,
            total_pieces: 4,
            active_peers: 2,
            ..EngineStats::default()
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(DownloadStats::format_bytes(0), "0.00 B");
        assert_eq!(DownloadStats::format_bytes(1024), "1.00 KB");
        assert_eq!(DownloadStats::format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(DownloadStats::format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(DownloadStats::format_speed(1024.0), "1.00 KB/s");
        assert_eq!(DownloadStats::format_speed(1024.0 * 1024.0), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(DownloadStats::format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(DownloadStats::format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(DownloadStats::format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_calculate_eta() {
        assert_eq!(DownloadStats::calculate_eta(50, 100, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(DownloadStats::calculate_eta(100, 100, 10.0), None);
        assert_eq!(DownloadStats::calculate_eta(50, 100, 0.0), None);
    }

    #[test]
    fn test_speeds_from_snapshots() {
        let stats = DownloadStats::from_snapshots(
            &snapshot(100, 0, 900),
            &snapshot(600, 200, 250),
            Duration::from_secs(2),
        );
        assert_eq!(stats.download_speed, 250.0);
        assert_eq!(stats.upload_speed, 100.0);
        assert_eq!(stats.completed, 750);
        assert_eq!(stats.progress, 0.75);
        assert_eq!(stats.peers, 2);

        let line = stats.render_line();
        assert!(line.contains("75.0%"));
        assert!(line.contains("3/4 pieces"));
        assert!(line.contains("ETA: 1s"));
        assert!(!line.contains("end-game"));
    }

    #[test]
    fn test_zero_elapsed_has_no_speed() {
        let stats = DownloadStats::from_snapshots(&snapshot(0, 0, 1000), &snapshot(10, 0, 1000), Duration::ZERO);
        assert_eq!(stats.download_speed, 0.0);
        assert!(stats.render_line().contains("ETA: ∞"));
    }

    #[test]
    fn test_progress_display_quiet() {
        let mut display = ProgressDisplay::new(true);
        assert!(display.is_quiet());
        assert!(display.update(&DownloadStats::default()).is_ok());
    }
}
