//! Session manager module
//!
//! Owns the set of live peer sessions and the address bookkeeping around it:
//! addresses already seen, blacklisted hosts and the queue of candidates
//! waiting to be dialed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::connection::{self, ConnectionTimeouts};
use super::session::{PeerSession, SessionCommand};
use super::state::PeerHandle;
use crate::config::EngineConfig;
use crate::context::TorrentContext;
use crate::error::TorrentError;
use crate::storage::StoreEvent;

#[derive(Debug)]
struct SessionEntry {
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct PeerBook {
    sessions: HashMap<SocketAddr, SessionEntry>,
    seen: HashSet<SocketAddr>,
    blacklist: HashSet<IpAddr>,
    candidates: VecDeque<SocketAddr>,
}

#[derive(Debug)]
struct Inner {
    ctx: Arc<TorrentContext>,
    max_peers: usize,
    housekeeping_interval: Duration,
    dialer_wait: Duration,
    timeouts: ConnectionTimeouts,
    streaming: AtomicBool,
    book: Mutex<PeerBook>,
    wake: Notify,
    shutdown: watch::Receiver<bool>,
}

/// Manages all peer sessions for a torrent
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager; sessions stop when `shutdown` turns true
    pub fn new(ctx: Arc<TorrentContext>, config: &EngineConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                max_peers: config.max_peers,
                housekeeping_interval: config.housekeeping_interval,
                dialer_wait: config.dialer_wait,
                timeouts: ConnectionTimeouts::from(config),
                streaming: AtomicBool::new(config.streaming),
                book: Mutex::new(PeerBook::default()),
                wake: Notify::new(),
                shutdown,
            }),
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Queue addresses for dialing, skipping any seen before or blacklisted
    ///
    /// Returns how many were new.
    pub fn add_candidates(&self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        let mut added = 0;
        {
            let mut book = self.inner.book.lock();
            for addr in addrs {
                if addr.port() == 0 || book.blacklist.contains(&addr.ip()) || !book.seen.insert(addr) {
                    continue;
                }
                book.candidates.push_back(addr);
                added += 1;
            }
        }
        if added > 0 {
            debug!("Added {} peer candidates", added);
            self.inner.wake.notify_one();
        }
        added
    }

    pub fn candidate_count(&self) -> usize {
        self.inner.book.lock().candidates.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.book.lock().sessions.len()
    }

    /// Ban a host and close every session with it
    pub fn blacklist_address(&self, addr: SocketAddr) {
        let ip = addr.ip();
        let mut book = self.inner.book.lock();
        if book.blacklist.insert(ip) {
            warn!("Blacklisting {}", ip);
        }
        book.candidates.retain(|c| c.ip() != ip);
        for (peer, entry) in book.sessions.iter() {
            if peer.ip() == ip {
                let _ = entry.commands.send(SessionCommand::Close);
            }
        }
    }

    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.inner.book.lock().blacklist.contains(&ip)
    }

    /// Send a command to every live session
    pub fn broadcast(&self, command: SessionCommand) {
        let book = self.inner.book.lock();
        for entry in book.sessions.values() {
            let _ = entry.commands.send(command.clone());
        }
    }

    /// Switch every session, and every later one, between selector variants
    pub fn set_streaming(&self, streaming: bool) {
        self.inner.streaming.store(streaming, Ordering::SeqCst);
        self.broadcast(SessionCommand::SetStreaming(streaming));
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::SeqCst)
    }

    /// React to a piece store notification
    pub fn handle_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::PieceVerified { index } => {
                self.broadcast(SessionCommand::Have(index));
            }
            StoreEvent::PieceCorrupted { index, offender } => {
                if let Some(addr) = offender {
                    info!("Piece {} was corrupted by {}", index, addr);
                    self.blacklist_address(addr);
                }
            }
            StoreEvent::Completed => {
                info!("Download complete, seeding to {} peers", self.session_count());
            }
        }
    }

    fn spawn_session(&self, addr: SocketAddr, stream: Option<TcpStream>) {
        let inner = &self.inner;
        let handle = Arc::new(PeerHandle::new(addr));
        let session = PeerSession::new(Arc::clone(&inner.ctx), handle, self.is_streaming());
        let (conn, commands) = connection::channel(session, inner.shutdown.clone(), inner.timeouts);

        let manager = self.clone();
        let task = tokio::spawn(async move {
            let result = match stream {
                Some(stream) => conn.run(stream).await,
                None => conn.connect_and_run(addr).await,
            };
            if let Err(e) = result {
                match e.downcast_ref::<TorrentError>() {
                    Some(TorrentError::ProtocolError { .. }) => warn!("Session with {} failed: {}", addr, e),
                    _ => debug!("Session with {} ended: {}", addr, e),
                }
            }
            manager.inner.wake.notify_one();
        });

        let mut book = inner.book.lock();
        book.seen.insert(addr);
        book.sessions.insert(addr, SessionEntry { commands, task });
        trace!("Session with {} started ({} live)", addr, book.sessions.len());
    }

    /// Start an outbound session directly, bypassing the candidate queue
    pub fn connect(&self, addr: SocketAddr) {
        self.spawn_session(addr, None);
    }

    /// Dial candidates while under the peer cap
    pub async fn run_dialer(self) {
        let mut shutdown = self.inner.shutdown.clone();
        while !self.is_shutting_down() {
            let next = {
                let mut book = self.inner.book.lock();
                if book.sessions.len() < self.inner.max_peers {
                    book.candidates.pop_front()
                } else {
                    None
                }
            };
            if let Some(addr) = next {
                if !self.is_blacklisted(addr.ip()) {
                    self.spawn_session(addr, None);
                }
                continue;
            }

            tokio::select! {
                _ = self.inner.wake.notified() => {}
                _ = time::sleep(self.inner.dialer_wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Dialer stopped");
    }

    /// Accept inbound sessions up to the peer cap
    pub async fn run_listener(self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown.clone();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            if self.is_shutting_down() {
                break;
            }
            if self.is_blacklisted(addr.ip()) {
                debug!("Rejecting blacklisted peer {}", addr);
                continue;
            }
            let full = {
                let book = self.inner.book.lock();
                book.sessions.len() >= self.inner.max_peers || book.sessions.contains_key(&addr)
            };
            if full {
                debug!("Rejecting {}: no session slot", addr);
                continue;
            }
            debug!("Accepted connection from {}", addr);
            self.spawn_session(addr, Some(stream));
        }
        debug!("Listener stopped");
    }

    /// One housekeeping pass: start end-game when no piece is free, collect
    /// finished sessions and re-advertise returned pieces
    pub fn housekeeping(&self) -> usize {
        let store = &self.inner.ctx.store;
        if store.free_count() == 0 && !store.is_complete() && !store.is_end_game() {
            store.start_end_game();
        }

        let collected = {
            let mut book = self.inner.book.lock();
            let before = book.sessions.len();
            book.sessions.retain(|_, entry| !entry.task.is_finished());
            before - book.sessions.len()
        };
        if collected > 0 {
            trace!("Collected {} closed sessions", collected);
            self.inner.wake.notify_one();
        }

        for index in store.take_readvertised() {
            self.broadcast(SessionCommand::AddPiece(index));
        }
        collected
    }

    pub async fn run_housekeeping(self) {
        let mut shutdown = self.inner.shutdown.clone();
        let mut tick = time::interval(self.inner.housekeeping_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.housekeeping();
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Housekeeping stopped");
    }

    /// Forward piece store events until the store goes away or shutdown
    pub async fn run_events(self, mut events: mpsc::UnboundedReceiver<StoreEvent>) {
        let mut shutdown = self.inner.shutdown.clone();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_store_event(event),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Close every session and wait for them, aborting any still running
    /// after `timeout`
    pub async fn shutdown_sessions(&self, timeout: Duration) -> Result<()> {
        let entries: Vec<(SocketAddr, SessionEntry)> = self.inner.book.lock().sessions.drain().collect();
        if entries.is_empty() {
            return Ok(());
        }
        info!("Closing {} peer sessions", entries.len());

        let mut tasks = Vec::with_capacity(entries.len());
        for (_, entry) in entries {
            let _ = entry.commands.send(SessionCommand::Close);
            tasks.push(entry.task);
        }

        let deadline = time::Instant::now() + timeout;
        let mut stragglers = 0;
        for mut task in tasks {
            if time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                stragglers += 1;
            }
        }
        if stragglers > 0 {
            warn!("Aborted {} sessions that did not close in time", stragglers);
            return Err(TorrentError::timeout("closing peer sessions").into());
        }
        Ok(())
    }

    /// Abort every session task without waiting
    pub fn abort_sessions(&self) {
        let entries: Vec<SessionEntry> = self.inner.book.lock().sessions.drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.task.abort();
        }
    }
}
