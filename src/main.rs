//! btclient - Main entry point
//!
//! Downloads and seeds torrents, and creates .torrent files.

use anyhow::{Context, Result};
use btclient::cli::{Command, CreateArgs, DownloadArgs};
use btclient::{
    CliArgs, Config, DownloadStats, Engine, EngineStats, ProgressDisplay, ResumeManager,
    TorrentBuilder, TorrentInfo, TorrentParser,
};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How often resume state is written while downloading
const RESUME_SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    match &args.command {
        Command::Download(download) => run_download(download, args.is_quiet()).await,
        Command::Create(create) => run_create(create),
    }
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());
    let info = TorrentParser::parse_file(path)
        .with_context(|| format!("Failed to load torrent file '{}'", path.display()))?;
    info!("Successfully loaded torrent file: {}", info.name);
    Ok(info)
}

/// Display torrent information
fn display_torrent_info(torrent_info: &TorrentInfo, config: &Config) {
    if config.is_quiet() {
        return;
    }
    println!("Torrent Information:");
    println!("  Name: {}", torrent_info.name);
    println!(
        "  Size: {} ({})",
        torrent_info.total_size(),
        DownloadStats::format_bytes(torrent_info.total_size())
    );
    println!("  Files: {}", torrent_info.files.len());
    println!("  Pieces: {}", torrent_info.piece_count());
    println!(
        "  Piece length: {}",
        DownloadStats::format_bytes(torrent_info.piece_length as u64)
    );
    println!("  Info hash: {}", torrent_info.info_hash_hex());
    println!("  Trackers: {}", torrent_info.announce_list.len());
    if let Some(comment) = &torrent_info.comment {
        println!("  Comment: {}", comment);
    }
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.engine.download_dir.display());
    println!("  Listen port: {}", config.engine.listen_port);
    println!("  Max connections: {}", config.engine.max_peers);
    println!("  Streaming: {}", if config.engine.streaming { "enabled" } else { "disabled" });
    println!("  Seeding: {}", if config.is_seeding_enabled() { "enabled" } else { "disabled" });
    if let Some(time) = config.seed_time_limit() {
        println!("  Seed time: {}", DownloadStats::format_duration(time));
    }
    println!();
}

async fn run_download(args: &DownloadArgs, quiet: bool) -> Result<()> {
    let config = Config::from_args(args, quiet);
    config.validate().context("Invalid configuration")?;

    let torrent_info = load_torrent_file(&config.torrent_file)?;
    display_torrent_info(&torrent_info, &config);

    let mut engine = Engine::new(torrent_info, config.engine.clone()).context("Failed to set up torrent")?;
    let resume = config.resume_dir.clone().map(ResumeManager::new);
    restore_state(&engine, resume.as_ref()).await;

    engine.add_peers(config.peers.iter().copied());
    let listen_addr = engine.start().await.context("Failed to start torrent")?;

    let mut progress = ProgressDisplay::new(config.is_quiet());
    progress.print_status(&format!("Listening on {}", listen_addr))?;

    let interrupted = match download_loop(&engine, resume.as_ref(), &mut progress).await {
        Ok(interrupted) => interrupted,
        Err(e) => {
            progress.print_error(&format!("Download failed: {}", e))?;
            shutdown(&mut engine, resume.as_ref()).await?;
            return Err(e);
        }
    };

    if !interrupted && config.is_seeding_enabled() {
        info!("Seeding enabled. Starting seed phase...");
        seed_loop(&engine, &config, &mut progress).await?;
    }

    shutdown(&mut engine, resume.as_ref()).await
}

/// Load resume state, falling back to hashing what is on disk
async fn restore_state(engine: &Engine, resume: Option<&ResumeManager>) {
    if let Some(resume) = resume {
        match resume.load_resume_data(&engine.context().info_hash).await {
            Ok(Some(data)) => match engine.restore(data) {
                Ok(()) => return,
                Err(e) => warn!("Ignoring resume state: {}", e),
            },
            Ok(None) => debug!("No resume state in {}", resume.resume_dir().display()),
            Err(e) => warn!("Cannot read resume state: {}", e),
        }
    }

    let verified = engine.verify_existing();
    if verified > 0 {
        info!("{} pieces already present on disk", verified);
    }
}

/// Run until the download completes or ctrl-c; returns whether interrupted
async fn download_loop(
    engine: &Engine,
    resume: Option<&ResumeManager>,
    progress: &mut ProgressDisplay,
) -> Result<bool> {
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = (engine.snapshot_stats(), Instant::now());
    let mut last_save = Instant::now();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("Cannot listen for ctrl-c")?;
                progress.print_status("Interrupted, stopping...")?;
                return Ok(true);
            }
            _ = tick.tick() => {}
        }

        let current = engine.snapshot_stats();
        let stats = DownloadStats::from_snapshots(&last.0, &current, last.1.elapsed());
        last = (current, Instant::now());

        if current.complete {
            info!("Download complete!");
            progress.print_complete(&stats)?;
            if let Some(resume) = resume {
                save_resume(engine, resume).await;
            }
            return Ok(false);
        }
        progress.update(&stats)?;

        if let Some(resume) = resume {
            if last_save.elapsed() >= RESUME_SAVE_INTERVAL {
                save_resume(engine, resume).await;
                last_save = Instant::now();
            }
        }
    }
}

/// Serve the finished torrent until the seed time runs out or ctrl-c
async fn seed_loop(engine: &Engine, config: &Config, progress: &mut ProgressDisplay) -> Result<()> {
    let limit = config.seed_time_limit();
    let seed_start = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut last: EngineStats = engine.snapshot_stats();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("Cannot listen for ctrl-c")?;
                break;
            }
            _ = tick.tick() => {}
        }
        if limit.is_some_and(|limit| seed_start.elapsed() >= limit) {
            info!("Seed time limit reached");
            break;
        }
        let current = engine.snapshot_stats();
        progress.update(&DownloadStats::from_snapshots(&last, &current, Duration::from_secs(1)))?;
        last = current;
    }

    info!("Seeding phase complete");
    Ok(())
}

async fn save_resume(engine: &Engine, resume: &ResumeManager) {
    if let Err(e) = resume.save_resume_data(&engine.resume_data()).await {
        warn!("Failed to save resume state: {}", e);
    }
}

/// Stop the engine; a second ctrl-c forces it
async fn shutdown(engine: &mut Engine, resume: Option<&ResumeManager>) -> Result<()> {
    let stopped = {
        let stop = engine.stop();
        tokio::pin!(stop);
        tokio::select! {
            result = &mut stop => Some(result),
            _ = tokio::signal::ctrl_c() => None,
        }
    };

    let result = match stopped {
        Some(result) => result,
        None => {
            engine.force_stop().await;
            Ok(())
        }
    };
    if let Some(resume) = resume {
        save_resume(engine, resume).await;
    }
    if let Err(e) = &result {
        warn!("Shutdown was not clean: {}", e);
    }
    info!("btclient finished");
    result
}

fn run_create(args: &CreateArgs) -> Result<()> {
    let mut builder = TorrentBuilder::new(&args.source).trackers(args.trackers.iter().cloned());
    if let Some(kib) = args.piece_length {
        let piece_length = kib
            .checked_mul(1024)
            .ok_or_else(|| anyhow::anyhow!("piece length {} KiB is too large", kib))?;
        builder = builder.piece_length(piece_length);
    }
    if let Some(comment) = &args.comment {
        builder = builder.comment(comment.clone());
    }

    let info = builder
        .write_to(&args.output)
        .with_context(|| format!("Failed to create torrent from '{}'", args.source.display()))?;

    println!("Created {}", args.output.display());
    println!("  Name: {}", info.name);
    println!("  Size: {}", DownloadStats::format_bytes(info.total_size()));
    println!("  Pieces: {} x {}", info.piece_count(), DownloadStats::format_bytes(info.piece_length as u64));
    println!("  Info hash: {}", info.info_hash_hex());
    Ok(())
}
