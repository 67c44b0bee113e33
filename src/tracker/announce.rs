//! Per-tracker announce state
//!
//! Event transitions: `Started` until the first successful announce, then
//! `None`. `Stopped` is only sent if `Started` went out, and `Completed` is
//! dropped while `Started` or `Stopped` is pending. A failed announce
//! holds off the next one for a wait that doubles per failure.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::http::HttpTracker;
use super::udp::UdpTracker;
use super::{AnnounceRequest, AnnounceResponse, TrackerEvent, DEFAULT_INTERVAL};
use crate::config::TrackerConfig;
use crate::context::TorrentContext;
use crate::error::TorrentError;

/// Transport of one tracker, chosen from the URL scheme
#[derive(Debug, Clone)]
pub enum TrackerProtocol {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl TrackerProtocol {
    /// Protocol for `url`
    ///
    /// Fails if the URL does not parse; returns `None` for schemes no
    /// protocol handles.
    pub fn from_url(url: &str, config: &TrackerConfig) -> Result<Option<Self>> {
        let parsed = Url::parse(url)
            .map_err(|e| TorrentError::parse_error_with_source(format!("Invalid tracker URL '{}'", url), e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => Ok(Some(TrackerProtocol::Http(HttpTracker::new(parsed, config)?))),
            "udp" => Ok(Some(TrackerProtocol::Udp(UdpTracker::new(&parsed, config)?))),
            _ => Ok(None),
        }
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        match self {
            TrackerProtocol::Http(tracker) => tracker.announce(request).await,
            TrackerProtocol::Udp(tracker) => tracker.announce(request).await,
        }
    }
}

/// Event and timing bookkeeping of one tracker
#[derive(Debug, Clone)]
pub struct AnnounceState {
    event: TrackerEvent,
    started_sent: bool,
    next_announce: Option<Instant>,
    failures: u32,
    retry_at: Option<Instant>,
    downloaded_start: u64,
    uploaded_start: u64,
}

impl Default for AnnounceState {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnounceState {
    pub fn new() -> Self {
        Self {
            event: TrackerEvent::Started,
            started_sent: false,
            next_announce: None,
            failures: 0,
            retry_at: None,
            downloaded_start: 0,
            uploaded_start: 0,
        }
    }

    pub fn event(&self) -> TrackerEvent {
        self.event
    }

    pub fn started_sent(&self) -> bool {
        self.started_sent
    }

    /// Consecutive failed announces
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether a regular announce at `now` should go out
    ///
    /// A pending event does not override the retry wait.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.retry_at.is_some_and(|at| now < at) {
            return false;
        }
        self.event != TrackerEvent::None || self.next_announce.map_or(true, |at| now >= at)
    }

    /// Record a failed announce; the wait is `min` doubled per earlier
    /// failure, at most `max`
    pub fn on_failure(&mut self, now: Instant, min: Duration, max: Duration) -> Duration {
        let wait = min
            .checked_mul(1u32 << self.failures.min(16))
            .map_or(max, |wait| wait.min(max));
        self.failures = self.failures.saturating_add(1);
        self.retry_at = Some(now + wait);
        wait
    }

    /// Record a successful announce
    ///
    /// The first success after `Started` snapshots the transfer counters as
    /// the baseline later reports are relative to.
    pub fn on_success(&mut self, now: Instant, interval: Duration, downloaded: u64, uploaded: u64) {
        if self.event == TrackerEvent::Started {
            self.started_sent = true;
            self.downloaded_start = downloaded;
            self.uploaded_start = uploaded;
        }
        self.event = TrackerEvent::None;
        self.next_announce = Some(now + interval);
        self.failures = 0;
        self.retry_at = None;
    }

    /// Switch to `Stopped`, unless `Started` never went out
    pub fn request_stopped(&mut self) -> bool {
        if self.event == TrackerEvent::Started {
            return false;
        }
        self.event = TrackerEvent::Stopped;
        true
    }

    /// Switch to `Completed`, unless `Started` or `Stopped` is pending
    pub fn request_completed(&mut self) -> bool {
        if matches!(self.event, TrackerEvent::Started | TrackerEvent::Stopped) {
            return false;
        }
        self.event = TrackerEvent::Completed;
        true
    }

    /// Start over as if the torrent was just added
    pub fn reset(&mut self) {
        self.started_sent = false;
        self.event = TrackerEvent::Started;
        self.failures = 0;
        self.retry_at = None;
    }

    /// Transfer totals relative to the baseline, zero before `Started` went out
    pub fn reported(&self, downloaded: u64, uploaded: u64) -> (u64, u64) {
        if !self.started_sent {
            return (0, 0);
        }
        (
            downloaded.saturating_sub(self.downloaded_start),
            uploaded.saturating_sub(self.uploaded_start),
        )
    }
}

/// One tracker of a torrent
///
/// Announces on the same tracker are serialized.
#[derive(Debug)]
pub struct TrackerClient {
    url: String,
    protocol: TrackerProtocol,
    state: Mutex<AnnounceState>,
    cancel: Notify,
    retry_backoff: Duration,
    max_retry_backoff: Duration,
}

impl TrackerClient {
    pub fn new(url: impl Into<String>, protocol: TrackerProtocol, config: &TrackerConfig) -> Self {
        Self {
            url: url.into(),
            protocol,
            state: Mutex::new(AnnounceState::new()),
            cancel: Notify::new(),
            retry_backoff: config.retry_backoff,
            max_retry_backoff: config.max_retry_backoff,
        }
    }

    /// Client for `url`, `None` for unsupported schemes
    pub fn from_url(url: &str, config: &TrackerConfig) -> Result<Option<Self>> {
        Ok(TrackerProtocol::from_url(url, config)?.map(|protocol| Self::new(url, protocol, config)))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn state(&self) -> AnnounceState {
        self.state.lock().await.clone()
    }

    /// Regular announce
    ///
    /// Returns `None` without any network traffic while no event is
    /// pending and the tracker's interval has not elapsed, or while a
    /// failed announce is being backed off. Returns `None` on failure.
    pub async fn announce_none(&self, ctx: &TorrentContext) -> Option<Vec<SocketAddr>> {
        let mut state = self.state.lock().await;
        if !state.is_due(Instant::now()) {
            return None;
        }
        self.announce_locked(&mut state, ctx).await
    }

    /// Announce `Started` right away
    pub async fn announce_started(&self, ctx: &TorrentContext) -> Option<Vec<SocketAddr>> {
        let mut state = self.state.lock().await;
        state.reset();
        self.announce_locked(&mut state, ctx).await
    }

    /// Announce `Stopped` if `Started` went out
    pub async fn announce_stopped(&self, ctx: &TorrentContext) {
        let mut state = self.state.lock().await;
        if state.request_stopped() {
            self.announce_locked(&mut state, ctx).await;
        }
    }

    /// Queue `Completed` for the next regular announce
    pub async fn announce_completed(&self) {
        let mut state = self.state.lock().await;
        state.request_completed();
    }

    /// Abort an announce in progress
    pub fn end_announce(&self) {
        self.cancel.notify_waiters();
    }

    async fn announce_locked(&self, state: &mut AnnounceState, ctx: &TorrentContext) -> Option<Vec<SocketAddr>> {
        let downloaded = ctx.stats.downloaded();
        let uploaded = ctx.stats.uploaded();
        let (reported_down, reported_up) = state.reported(downloaded, uploaded);
        let request = AnnounceRequest {
            info_hash: ctx.info_hash,
            peer_id: ctx.peer_id,
            port: ctx.listen_port(),
            uploaded: reported_up,
            downloaded: reported_down,
            left: ctx.left(),
            event: state.event(),
        };
        debug!("Announcing {:?} to {}", request.event, self.url);

        let result = tokio::select! {
            result = self.protocol.announce(&request) => result,
            _ = self.cancel.notified() => Err(TorrentError::timeout(format!("announce to {} cancelled", self.url)).into()),
        };

        match result {
            Ok(response) => {
                info!(
                    "Tracker {} returned {} peers (seeders {:?}, leechers {:?})",
                    self.url,
                    response.peers.len(),
                    response.seeders,
                    response.leechers
                );
                let interval = response.interval.unwrap_or(DEFAULT_INTERVAL);
                state.on_success(Instant::now(), interval, downloaded, uploaded);
                Some(response.peers)
            }
            Err(e) => {
                let wait = state.on_failure(Instant::now(), self.retry_backoff, self.max_retry_backoff);
                warn!("Announce to {} failed: {} (retrying in {:?})", self.url, e, wait);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::storage::{MemoryStorage, PieceLayout, PieceStore};
    use crate::tracker::udp::testing;

    fn context() -> TorrentContext {
        let layout = PieceLayout::new(16384, 16384).unwrap();
        let storage = Arc::new(MemoryStorage::new(layout));
        let (store, _events) = PieceStore::new(layout, vec![[0u8; 20]], storage).unwrap();
        TorrentContext::new([1; 20], [2; 20], Arc::new(store))
    }

    #[test]
    fn test_from_url() {
        let config = TrackerConfig::default();
        assert!(matches!(
            TrackerProtocol::from_url("udp://tracker.example.org:6969/announce", &config).unwrap(),
            Some(TrackerProtocol::Udp(_))
        ));
        assert!(matches!(
            TrackerProtocol::from_url("https://tracker.example.org/announce", &config).unwrap(),
            Some(TrackerProtocol::Http(_))
        ));
        assert!(TrackerProtocol::from_url("wss://tracker.example.org", &config).unwrap().is_none());
        assert!(TrackerProtocol::from_url("not a url", &config).is_err());
    }

    #[test]
    fn test_interval_short_circuits() {
        let t = Instant::now();
        let mut state = AnnounceState::new();
        assert!(state.is_due(t));

        state.on_success(t, Duration::from_secs(1800), 0, 0);
        assert_eq!(state.event(), TrackerEvent::None);
        assert!(!state.is_due(t + Duration::from_secs(60)));
        assert!(state.is_due(t + Duration::from_secs(1800)));

        assert!(state.request_completed());
        assert!(state.is_due(t + Duration::from_secs(60)));
    }

    #[test]
    fn test_event_suppression() {
        let t = Instant::now();
        let mut state = AnnounceState::new();
        assert!(!state.request_stopped());
        assert!(!state.request_completed());
        assert_eq!(state.event(), TrackerEvent::Started);

        state.on_success(t, DEFAULT_INTERVAL, 0, 0);
        assert!(state.request_stopped());
        assert!(!state.request_completed());
        assert_eq!(state.event(), TrackerEvent::Stopped);
    }

    #[test]
    fn test_reported_counters_are_relative() {
        let mut state = AnnounceState::new();
        assert_eq!(state.reported(500, 100), (0, 0));

        state.on_success(Instant::now(), DEFAULT_INTERVAL, 500, 100);
        assert!(state.started_sent());
        assert_eq!(state.reported(1500, 150), (1000, 50));

        // later successes keep the baseline
        state.on_success(Instant::now(), DEFAULT_INTERVAL, 1500, 150);
        assert_eq!(state.reported(1600, 150), (1100, 50));
    }

    #[test]
    fn test_failures_back_off() {
        let t = Instant::now();
        let min = Duration::from_secs(60);
        let max = Duration::from_secs(300);
        let mut state = AnnounceState::new();

        assert_eq!(state.on_failure(t, min, max), Duration::from_secs(60));
        assert_eq!(state.event(), TrackerEvent::Started);
        assert!(!state.is_due(t + Duration::from_secs(59)));
        assert!(state.is_due(t + Duration::from_secs(60)));

        assert_eq!(state.on_failure(t, min, max), Duration::from_secs(120));
        assert_eq!(state.on_failure(t, min, max), Duration::from_secs(240));
        assert_eq!(state.on_failure(t, min, max), max);
        for _ in 0..40 {
            assert_eq!(state.on_failure(t, min, max), max);
        }
        assert!(!state.is_due(t + Duration::from_secs(299)));

        state.on_success(t, Duration::from_secs(1800), 0, 0);
        assert_eq!(state.failures(), 0);
        assert!(state.request_completed());
        assert!(state.is_due(t));
    }

    #[tokio::test]
    async fn test_failed_tracker_is_not_hammered() {
        let (addr, connects) = testing::spawn_failing_tracker().await;
        let ctx = context();
        let client = TrackerClient::from_url(&format!("udp://{}", addr), &TrackerConfig::default())
            .unwrap()
            .unwrap();

        assert_eq!(client.announce_none(&ctx).await, None);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(client.state().await.failures(), 1);

        // "started" is still pending but the retry wait holds
        assert_eq!(client.announce_none(&ctx).await, None);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(client.state().await.event(), TrackerEvent::Started);
    }

    #[tokio::test]
    async fn test_announce_none_waits_for_interval() {
        let peer: SocketAddr = "10.0.0.9:6881".parse().unwrap();
        let (addr, announces) = testing::spawn_tracker(1800, vec![peer]).await;
        let ctx = context();
        let client = TrackerClient::from_url(&format!("udp://{}", addr), &TrackerConfig::default())
            .unwrap()
            .unwrap();

        assert_eq!(client.announce_none(&ctx).await, Some(vec![peer]));
        assert_eq!(client.state().await.event(), TrackerEvent::None);

        assert_eq!(client.announce_none(&ctx).await, None);
        assert_eq!(announces.load(Ordering::SeqCst), 1);

        client.announce_completed().await;
        assert_eq!(client.announce_none(&ctx).await, Some(vec![peer]));
        assert_eq!(announces.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_announce_started_ignores_interval() {
        let peer: SocketAddr = "10.0.0.9:6881".parse().unwrap();
        let (addr, announces) = testing::spawn_tracker(1800, vec![peer]).await;
        let ctx = context();
        let client = TrackerClient::from_url(&format!("udp://{}", addr), &TrackerConfig::default())
            .unwrap()
            .unwrap();

        assert!(client.announce_none(&ctx).await.is_some());
        assert_eq!(client.announce_none(&ctx).await, None);
        assert_eq!(client.announce_started(&ctx).await, Some(vec![peer]));
        assert_eq!(announces.load(Ordering::SeqCst), 2);
        assert!(client.state().await.started_sent());
    }

    #[tokio::test]
    async fn test_stopped_suppressed_before_started() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ctx = context();
        let client = TrackerClient::from_url(&format!("udp://{}", silent.local_addr().unwrap()), &TrackerConfig::default())
            .unwrap()
            .unwrap();

        client.announce_stopped(&ctx).await;
        let mut buf = [0u8; 64];
        assert!(tokio::time::timeout(Duration::from_millis(50), silent.recv(&mut buf)).await.is_err());
    }

    #[tokio::test]
    async fn test_end_announce_cancels() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ctx = Arc::new(context());
        let client = Arc::new(
            TrackerClient::from_url(&format!("udp://{}", silent.local_addr().unwrap()), &TrackerConfig::default())
                .unwrap()
                .unwrap(),
        );

        let task = {
            let client = client.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { client.announce_none(&ctx).await })
        };
        let mut buf = [0u8; 64];
        silent.recv(&mut buf).await.unwrap();
        client.end_announce();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_none());
        assert_eq!(client.state().await.event(), TrackerEvent::Started);
    }
}
