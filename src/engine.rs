//! Torrent engine
//!
//! Wires one torrent's piece store, disk worker, peer sessions and trackers
//! together and owns their lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::TorrentContext;
use crate::error::TorrentError;
use crate::peer::SessionManager;
use crate::storage::{DiskIo, DiskWorker, FileLayout, PieceStore, ResumeData, Storage, StoreEvent};
use crate::torrent::TorrentInfo;
use crate::tracker::{Announcer, TrackerClient};

/// Client prefix of generated peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-BC0100-";

/// Generate a peer id: the client prefix and 12 random alphanumerics
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.sample(Alphanumeric);
    }
    peer_id
}

/// Point-in-time view of a running torrent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub total_size: u64,
    pub left: u64,
    pub verified_pieces: usize,
    pub total_pieces: usize,
    /// Sessions past the handshake
    pub active_peers: usize,
    /// Sessions including those still connecting
    pub sessions: usize,
    pub candidates: usize,
    pub end_game: bool,
    pub complete: bool,
}

impl EngineStats {
    /// Fraction of the content verified, 0.0 to 1.0
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 1.0;
        }
        (self.total_size - self.left) as f64 / self.total_size as f64
    }
}

#[derive(Debug, Default)]
struct Tasks {
    disk: Option<JoinHandle<()>>,
    announcer: Option<JoinHandle<()>>,
    loops: Vec<JoinHandle<()>>,
}

/// One torrent being downloaded or seeded
#[derive(Debug)]
pub struct Engine {
    info: TorrentInfo,
    config: EngineConfig,
    ctx: Arc<TorrentContext>,
    disk: Arc<DiskIo>,
    disk_worker: Option<DiskWorker>,
    events: Option<mpsc::UnboundedReceiver<StoreEvent>>,
    manager: SessionManager,
    announcer: Announcer,
    shutdown: watch::Sender<bool>,
    tasks: Tasks,
    listen_addr: Option<SocketAddr>,
}

impl Engine {
    /// Build an engine for `info`
    ///
    /// A tracker URL that does not parse rejects the torrent; trackers with
    /// unsupported schemes are skipped.
    pub fn new(info: TorrentInfo, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let mut trackers = Vec::new();
        for url in &info.announce_list {
            match TrackerClient::from_url(url, &config.tracker)? {
                Some(client) => trackers.push(Arc::new(client)),
                None => warn!("Skipping tracker with unsupported scheme: {}", url),
            }
        }

        let layout = info.layout()?;
        let files = Arc::new(FileLayout::new(&config.download_dir, &info.files)?);
        let (disk, disk_worker) = DiskIo::new(files, layout, config.disk_queue_capacity);
        let disk = Arc::new(disk);
        let storage: Arc<dyn Storage> = disk.clone();
        let (store, events) = PieceStore::new(layout, info.pieces.clone(), storage)?;

        let peer_id = generate_peer_id();
        let ctx = Arc::new(TorrentContext::new(info.info_hash, peer_id, Arc::new(store)));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let manager = SessionManager::new(Arc::clone(&ctx), &config, shutdown_rx);
        let announcer = Announcer::new(trackers, Arc::clone(&ctx), manager.clone(), config.tracker.clone());

        info!(
            "Torrent '{}' ({}): {} pieces, {} trackers, peer id {}",
            info.name,
            info.info_hash_hex(),
            info.piece_count(),
            announcer.trackers().len(),
            String::from_utf8_lossy(&peer_id)
        );

        Ok(Self {
            info,
            config,
            ctx,
            disk,
            disk_worker: Some(disk_worker),
            events: Some(events),
            manager,
            announcer,
            shutdown,
            tasks: Tasks::default(),
            listen_addr: None,
        })
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<TorrentContext> {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.ctx.store
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.ctx.peer_id
    }

    /// Address the listener is bound to, once started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn is_running(&self) -> bool {
        self.listen_addr.is_some() && !*self.shutdown.borrow()
    }

    pub fn is_complete(&self) -> bool {
        self.ctx.store.is_complete()
    }

    /// Restore piece state saved by an earlier run
    pub fn restore(&self, resume: ResumeData) -> Result<()> {
        if !resume.matches(&self.ctx.info_hash) {
            return Err(TorrentError::validation_error_with_field(
                "resume state belongs to another torrent",
                "info_hash",
            )
            .into());
        }
        self.ctx.store.restore(resume.snapshot)?;
        info!(
            "Restored {} verified pieces from resume state",
            self.ctx.store.verified_count()
        );
        Ok(())
    }

    /// Current piece state for saving
    pub fn resume_data(&self) -> ResumeData {
        ResumeData::new(
            &self.ctx.info_hash,
            self.config.download_dir.display().to_string(),
            self.ctx.store.snapshot(),
        )
    }

    /// Hash whatever already exists in the download directory
    pub fn verify_existing(&self) -> usize {
        self.ctx.store.verify_existing()
    }

    /// Queue peers to dial
    pub fn add_peers(&self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        self.manager.add_candidates(addrs)
    }

    /// Switch between rarity and streaming piece selection
    pub fn set_streaming(&self, streaming: bool) {
        info!("Streaming mode {}", if streaming { "on" } else { "off" });
        self.manager.set_streaming(streaming);
    }

    /// Bind the listener, create the files and start every background task
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let (Some(worker), Some(events)) = (self.disk_worker.take(), self.events.take()) else {
            return Err(TorrentError::config_error("engine was already started").into());
        };

        let bind = SocketAddr::from(([0, 0, 0, 0], self.config.listen_port));
        let listener = TcpListener::bind(bind).await.map_err(|e| {
            TorrentError::network_error_full("Cannot bind listener", bind.to_string(), e.to_string())
        })?;
        let listen_addr = listener.local_addr()?;
        self.ctx.set_listen_port(listen_addr.port());

        self.disk.files().create_files()?;
        self.tasks.disk = Some(worker.spawn(Arc::clone(&self.ctx.store)));

        let manager = self.manager.clone();
        self.tasks.loops.push(tokio::spawn(manager.clone().run_listener(listener)));
        self.tasks.loops.push(tokio::spawn(manager.clone().run_dialer()));
        self.tasks.loops.push(tokio::spawn(manager.clone().run_housekeeping()));
        self.tasks.loops.push(tokio::spawn(manager.run_events(events)));
        self.tasks.announcer = Some(tokio::spawn(self.announcer.clone().run(self.shutdown.subscribe())));

        self.listen_addr = Some(listen_addr);
        info!("Listening for peers on {}", listen_addr);
        Ok(listen_addr)
    }

    /// Stop cooperatively
    ///
    /// Trackers get their "stopped" announce, sessions are closed and the
    /// disk queue is flushed, each within the configured bounds. Returns the
    /// first failure after doing all of it.
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping torrent '{}'", self.info.name);
        let _ = self.shutdown.send(true);
        let mut result = Ok(());

        if let Some(mut task) = self.tasks.announcer.take() {
            let bound = self.config.tracker.stop_timeout + self.config.shutdown_timeout;
            if time::timeout(bound, &mut task).await.is_err() {
                warn!("Announcer did not stop in time");
                self.announcer.end_announces();
                task.abort();
            }
        }

        if let Err(e) = self.manager.shutdown_sessions(self.config.shutdown_timeout).await {
            result = Err(e);
        }

        for mut task in self.tasks.loops.drain(..) {
            if time::timeout(self.config.shutdown_timeout, &mut task).await.is_err() {
                task.abort();
            }
        }

        if let Some(mut task) = self.tasks.disk.take() {
            match time::timeout(self.config.shutdown_timeout, self.disk.flush()).await {
                Ok(Ok(())) => debug!("Disk queue flushed"),
                Ok(Err(e)) => {
                    warn!("Disk flush failed: {}", e);
                    result = result.and(Err(e));
                }
                Err(_) => {
                    warn!("Disk flush timed out");
                    result = result.and(Err(TorrentError::timeout("flushing disk queue").into()));
                }
            }
            self.disk.shutdown().await;
            if time::timeout(self.config.shutdown_timeout, &mut task).await.is_err() {
                warn!("Disk worker did not exit in time");
            }
        }

        info!("Torrent '{}' stopped", self.info.name);
        result
    }

    /// Stop without waiting on the network
    ///
    /// Tracker requests in flight are cancelled and every task is aborted.
    /// Disk work already queued is still handed to the worker.
    pub async fn force_stop(&mut self) {
        warn!("Force stopping torrent '{}'", self.info.name);
        let _ = self.shutdown.send(true);
        self.announcer.end_announces();
        if let Some(task) = self.tasks.announcer.take() {
            task.abort();
        }
        self.manager.abort_sessions();
        for task in self.tasks.loops.drain(..) {
            task.abort();
        }
        if let Some(task) = self.tasks.disk.take() {
            if time::timeout(self.config.shutdown_timeout, self.disk.shutdown()).await.is_err() {
                warn!("Disk queue full at force stop");
            }
            drop(task);
        }
    }

    pub fn snapshot_stats(&self) -> EngineStats {
        let store = &self.ctx.store;
        EngineStats {
            downloaded: self.ctx.stats.downloaded(),
            uploaded: self.ctx.stats.uploaded(),
            total_size: self.info.total_size(),
            left: store.left(),
            verified_pieces: store.verified_count(),
            total_pieces: store.piece_count() as usize,
            active_peers: self.ctx.active_peers(),
            sessions: self.manager.session_count(),
            candidates: self.manager.candidate_count(),
            end_game: store.is_end_game(),
            complete: store.is_complete(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
