//! UDP tracker protocol
//!
//! A connect exchange yields a connection id, which the announce
//! exchange then presents. Both phases resend on a receive timeout a
//! bounded number of times.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, trace};
use url::Url;

use super::{parse_compact_peers, AnnounceRequest, AnnounceResponse};
use crate::config::TrackerConfig;
use crate::error::TorrentError;

pub const PROTOCOL_ID: u64 = 0x41727101980;
pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_ERROR: u32 = 3;

const CONNECT_REQUEST_LEN: usize = 16;
const ANNOUNCE_REQUEST_LEN: usize = 98;
const ANNOUNCE_RESPONSE_LEN: usize = 20;

/// A `udp://host:port` tracker
#[derive(Debug, Clone)]
pub struct UdpTracker {
    host: String,
    port: u16,
    connect_timeout: Duration,
    announce_timeout: Duration,
    attempts: u32,
    numwant: u32,
}

impl UdpTracker {
    pub fn new(url: &Url, config: &TrackerConfig) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| TorrentError::parse_error_with_source("UDP tracker URL has no host", url.as_str()))?;
        let port = url
            .port()
            .ok_or_else(|| TorrentError::parse_error_with_source("UDP tracker URL has no port", url.as_str()))?;

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            connect_timeout: config.udp_connect_timeout,
            announce_timeout: config.udp_announce_timeout,
            attempts: config.udp_attempts,
            numwant: config.udp_numwant,
        })
    }

    fn name(&self) -> String {
        format!("udp://{}:{}", self.host, self.port)
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let addr = self.resolve().await?;
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await.map_err(|e| {
            TorrentError::network_error_full("Cannot bind UDP socket", bind.to_string(), e.to_string())
        })?;
        socket.connect(addr).await.map_err(|e| {
            TorrentError::network_error_full("Cannot connect UDP socket", addr.to_string(), e.to_string())
        })?;

        let connection_id = self.connect(&socket).await?;
        trace!("{} connection id {:#x}", self.name(), connection_id);
        self.announce_on(&socket, connection_id, request).await
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let lookup = tokio::net::lookup_host((self.host.as_str(), self.port));
        let mut addrs = time::timeout(self.connect_timeout, lookup)
            .await
            .map_err(|_| TorrentError::timeout(format!("resolving {}", self.host)))?
            .map_err(|e| TorrentError::network_error_full("Cannot resolve tracker", self.host.clone(), e.to_string()))?;
        addrs
            .next()
            .ok_or_else(|| TorrentError::network_error_full("No address for tracker", self.host.clone(), "empty lookup").into())
    }

    async fn connect(&self, socket: &UdpSocket) -> Result<u64> {
        let transaction_id: u32 = rand::random();
        let mut request = BytesMut::with_capacity(CONNECT_REQUEST_LEN);
        request.put_u64(PROTOCOL_ID);
        request.put_u32(ACTION_CONNECT);
        request.put_u32(transaction_id);

        let name = self.name();
        self.exchange(socket, &request, self.connect_timeout, "connect", |mut packet| {
            if packet.len() < 8 {
                return Ok(None);
            }
            let action = packet.get_u32();
            if packet.get_u32() != transaction_id {
                return Ok(None);
            }
            if action == ACTION_ERROR {
                return Err(error_message(&name, packet));
            }
            if action != ACTION_CONNECT || packet.len() < 8 {
                return Ok(None);
            }
            Ok(Some(packet.get_u64()))
        })
        .await
    }

    async fn announce_on(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        announce: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let transaction_id: u32 = rand::random();
        let mut request = BytesMut::with_capacity(ANNOUNCE_REQUEST_LEN);
        request.put_u64(connection_id);
        request.put_u32(ACTION_ANNOUNCE);
        request.put_u32(transaction_id);
        request.put_slice(&announce.info_hash);
        request.put_slice(&announce.peer_id);
        request.put_u64(announce.downloaded);
        request.put_u64(announce.left);
        request.put_u64(announce.uploaded);
        request.put_u32(announce.event.udp_id());
        request.put_u32(0); // ip
        request.put_u32(rand::random()); // key
        request.put_u32(self.numwant);
        request.put_u16(announce.port);

        let name = self.name();
        self.exchange(socket, &request, self.announce_timeout, "announce", |mut packet| {
            if packet.len() < 8 {
                return Ok(None);
            }
            let action = packet.get_u32();
            if packet.get_u32() != transaction_id {
                return Ok(None);
            }
            if action == ACTION_ERROR {
                return Err(error_message(&name, packet));
            }
            if action != ACTION_ANNOUNCE || packet.len() < ANNOUNCE_RESPONSE_LEN - 8 {
                return Ok(None);
            }
            let interval = packet.get_u32();
            let leechers = packet.get_u32();
            let seeders = packet.get_u32();
            Ok(Some(AnnounceResponse {
                interval: Some(Duration::from_secs(u64::from(interval))),
                seeders: Some(seeders),
                leechers: Some(leechers),
                peers: parse_compact_peers(packet),
            }))
        })
        .await
    }

    /// Send `request` until `accept` takes a reply or the attempts run out
    ///
    /// `accept` returns `Ok(None)` for packets that are not an answer to
    /// this request.
    async fn exchange<T>(
        &self,
        socket: &UdpSocket,
        request: &[u8],
        timeout: Duration,
        phase: &str,
        mut accept: impl FnMut(&[u8]) -> Result<Option<T>>,
    ) -> Result<T> {
        let mut buf = vec![0u8; 2048];
        for attempt in 1..=self.attempts {
            socket.send(request).await.map_err(|e| {
                TorrentError::network_error_full("UDP send failed", self.name(), e.to_string())
            })?;

            let n = match time::timeout(timeout, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Err(TorrentError::network_error_full("UDP receive failed", self.name(), e.to_string()).into())
                }
                Err(_) => {
                    debug!("{} {} attempt {}/{} timed out", self.name(), phase, attempt, self.attempts);
                    continue;
                }
            };
            if let Some(value) = accept(&buf[..n])? {
                return Ok(value);
            }
            trace!("{} ignoring unexpected {} byte packet", self.name(), n);
        }

        Err(TorrentError::timeout(format!("UDP {} with {} after {} attempts", phase, self.name(), self.attempts)).into())
    }
}

fn error_message(tracker: &str, message: &[u8]) -> anyhow::Error {
    TorrentError::tracker_error_full(
        "Tracker returned an error",
        tracker,
        String::from_utf8_lossy(message).into_owned(),
    )
    .into()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerEvent;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [7; 20],
            peer_id: [8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: TrackerEvent::Started,
        }
    }

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            udp_connect_timeout: Duration::from_millis(50),
            udp_announce_timeout: Duration::from_millis(50),
            ..TrackerConfig::default()
        }
    }

    #[test]
    fn test_url_requires_port() {
        let config = TrackerConfig::default();
        let tracker = UdpTracker::new(&Url::parse("udp://tracker.example.org:6969/announce").unwrap(), &config).unwrap();
        assert_eq!(tracker.name(), "udp://tracker.example.org:6969");
        assert!(UdpTracker::new(&Url::parse("udp://tracker.example.org").unwrap(), &config).is_err());
    }

    #[tokio::test]
    async fn test_announce_against_tracker() {
        let peers = vec!["10.1.2.3:6881".parse().unwrap(), "10.1.2.4:51413".parse().unwrap()];
        let (addr, announces) = testing::spawn_tracker(1800, peers.clone()).await;
        let url = Url::parse(&format!("udp://{}", addr)).unwrap();
        let tracker = UdpTracker::new(&url, &fast_config()).unwrap();

        let response = tracker.announce(&request()).await.unwrap();
        assert_eq!(response.peers, peers);
        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(response.leechers, Some(1));
        assert_eq!(response.seeders, Some(2));
        assert_eq!(announces.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_times_out_after_three_attempts() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("udp://{}", silent.local_addr().unwrap())).unwrap();
        let tracker = UdpTracker::new(&url, &fast_config()).unwrap();

        let err = tracker.announce(&request()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::Timeout { .. })
        ));

        let mut buf = [0u8; 64];
        for _ in 0..3 {
            let n = silent.recv(&mut buf).await.unwrap();
            assert_eq!(n, CONNECT_REQUEST_LEN);
            assert_eq!(&buf[..8], &PROTOCOL_ID.to_be_bytes());
        }
        assert!(time::timeout(Duration::from_millis(50), silent.recv(&mut buf)).await.is_err());
    }

    #[tokio::test]
    async fn test_error_action_aborts() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("udp://{}", server.local_addr().unwrap())).unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_ERROR);
            reply.put_slice(&buf[12..16]);
            reply.put_slice(b"banned");
            server.send_to(&reply, from).await.unwrap();
        });

        let tracker = UdpTracker::new(&url, &fast_config()).unwrap();
        let err = tracker.announce(&request()).await.unwrap_err();
        assert!(err.to_string().contains("banned"));
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::TrackerError { .. })
        ));
    }
}
