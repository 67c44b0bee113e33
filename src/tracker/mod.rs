//! Tracker module
//!
//! HTTP and UDP announce protocols, the per-tracker announce state
//! machine and the task that announces to every tracker of a torrent.

pub mod announce;
pub mod announcer;
pub mod http;
pub mod udp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub use announce::{AnnounceState, TrackerClient, TrackerProtocol};
pub use announcer::Announcer;
pub use http::HttpTracker;
pub use udp::UdpTracker;

/// Interval used when a tracker does not send one
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);

/// Announce event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerEvent {
    #[default]
    None,
    Completed,
    Started,
    Stopped,
}

impl TrackerEvent {
    /// Value of the HTTP `event` parameter, empty for `None`
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
        }
    }

    pub fn udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

/// Everything an announce reports to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
}

/// A successful announce
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Time to wait before the next regular announce
    pub interval: Option<Duration>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

/// Peers packed as 4-byte IPv4 address and 2-byte port
///
/// A trailing partial record is ignored.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}
