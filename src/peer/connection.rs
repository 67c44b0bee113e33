//! Peer connection module
//!
//! Drives a [`PeerSession`] over a TCP stream: reads feed the session, the
//! session's output is written back, and timers enforce the handshake
//! deadline, idle timeout and keep-alives.

use std::net::SocketAddr;

use anyhow::Result;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::session::{PeerSession, SessionCommand};
use crate::config::EngineConfig;
use crate::error::TorrentError;

/// Timer settings for one connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
    pub idle: Duration,
    pub keepalive: Duration,
}

impl From<&EngineConfig> for ConnectionTimeouts {
    fn from(config: &EngineConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            handshake: config.handshake_timeout,
            idle: config.idle_timeout,
            keepalive: config.keepalive_interval,
        }
    }
}

/// A peer session bound to its transport
pub struct PeerConnection {
    session: PeerSession,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    shutdown: watch::Receiver<bool>,
    timeouts: ConnectionTimeouts,
}

impl PeerConnection {
    pub fn new(
        session: PeerSession,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        shutdown: watch::Receiver<bool>,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        Self {
            session,
            commands,
            shutdown,
            timeouts,
        }
    }

    /// Dial a peer within the connect timeout
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
        debug!("Connecting to peer: {}", addr);
        let stream = time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TorrentError::timeout(format!("connect to {}", addr)))?
            .map_err(|e| {
                TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!("Cannot set TCP_NODELAY for {}: {}", addr, e);
        }
        Ok(stream)
    }

    /// Dial and run until the session ends
    pub async fn connect_and_run(self, addr: SocketAddr) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        let stream = tokio::select! {
            stream = Self::connect(addr, self.timeouts.connect) => stream?,
            _ = shutdown.changed() => return Ok(()),
        };
        self.run(stream).await
    }

    /// Exchange messages until an error, a close command or shutdown
    ///
    /// The session is closed on every exit path, returning its outstanding
    /// requests to the piece store.
    pub async fn run(mut self, stream: TcpStream) -> Result<()> {
        let result = self.drive(stream).await;
        self.session.close();
        let handle = self.session.handle();
        debug!(
            "Session with {} ended: {} bytes down, {} bytes up",
            handle.addr(),
            handle.downloaded(),
            handle.uploaded()
        );
        result
    }

    async fn drive(&mut self, stream: TcpStream) -> Result<()> {
        let addr = self.session.addr();
        let (mut reader, mut writer) = stream.into_split();
        let mut inbuf = BytesMut::with_capacity(64 * 1024);
        let mut outbox = Bytes::new();

        let started = Instant::now();
        let mut last_received = started;
        let mut last_sent = started;
        let mut tick = time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if outbox.is_empty() {
                if let Some(bytes) = self.session.poll_send() {
                    outbox = bytes;
                }
            }

            tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!("Shutdown, closing session with {}", addr);
                    return Ok(());
                }
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Close) | None => {
                        debug!("Session with {} closed by manager", addr);
                        return Ok(());
                    }
                    Some(command) => self.session.handle_command(command),
                },
                read = reader.read_buf(&mut inbuf) => {
                    let n = read.map_err(|e| {
                        TorrentError::peer_error_full("Read failed", addr.to_string(), e.to_string())
                    })?;
                    if n == 0 {
                        debug!("Peer {} closed the connection", addr);
                        return Ok(());
                    }
                    last_received = Instant::now();
                    self.session.receive(&inbuf)?;
                    inbuf.clear();
                }
                written = writer.write(&outbox), if !outbox.is_empty() => {
                    let n = written.map_err(|e| {
                        TorrentError::peer_error_full("Write failed", addr.to_string(), e.to_string())
                    })?;
                    if n == 0 {
                        return Err(TorrentError::peer_error_with_peer("Connection closed while writing", addr.to_string()).into());
                    }
                    outbox.advance(n);
                    last_sent = Instant::now();
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    if !self.session.is_active() && now.duration_since(started) > self.timeouts.handshake {
                        warn!("Handshake with {} timed out", addr);
                        return Err(TorrentError::timeout(format!("handshake with {}", addr)).into());
                    }
                    if now.duration_since(last_received) > self.timeouts.idle {
                        return Err(TorrentError::timeout(format!("no data from {}", addr)).into());
                    }
                    if outbox.is_empty() && self.session.is_active() && now.duration_since(last_sent) > self.timeouts.keepalive {
                        trace!("Keep-alive to {}", addr);
                        outbox = PeerSession::keepalive();
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("addr", &self.session.addr())
            .field("state", &self.session.state())
            .finish()
    }
}

/// Build a connection and the channel used to command it
pub fn channel(
    session: PeerSession,
    shutdown: watch::Receiver<bool>,
    timeouts: ConnectionTimeouts,
) -> (PeerConnection, mpsc::UnboundedSender<SessionCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PeerConnection::new(session, rx, shutdown, timeouts), tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TorrentContext;
    use crate::peer::PeerHandle;
    use crate::storage::{MemoryStorage, PieceLayout, PieceStore};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn session(addr: SocketAddr) -> PeerSession {
        let layout = PieceLayout::new(16384, 16384).unwrap();
        let storage = Arc::new(MemoryStorage::new(layout));
        let (store, _) = PieceStore::new(layout, vec![[0u8; 20]], storage).unwrap();
        let ctx = Arc::new(TorrentContext::new([5; 20], [6; 20], Arc::new(store)));
        PeerSession::new(ctx, Arc::new(PeerHandle::new(addr)), false)
    }

    async fn pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, remote) = listener.accept().await.unwrap();
        (client, server, remote)
    }

    #[tokio::test]
    async fn test_reset_by_peer_is_peer_error() {
        let (client, server, remote) = pair().await;
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (conn, _commands) = channel(session(remote), shutdown, ConnectionTimeouts::from(&EngineConfig::default()));
        let task = tokio::spawn(conn.run(server));

        client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);

        let err = time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::PeerError { peer: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_close_command_ends_session() {
        let (_client, server, remote) = pair().await;
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (conn, commands) = channel(session(remote), shutdown, ConnectionTimeouts::from(&EngineConfig::default()));
        let task = tokio::spawn(conn.run(server));

        commands.send(SessionCommand::Close).unwrap();
        let result = time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
