//! Announce loop of one torrent
//!
//! Announces "started" to every tracker through a bounded worker pool, then
//! runs periodic passes through the same pool that only reach trackers whose
//! interval elapsed or that have an event pending. On shutdown "stopped" goes
//! to every tracker within a time bound.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::announce::TrackerClient;
use crate::config::TrackerConfig;
use crate::context::TorrentContext;
use crate::peer::SessionManager;

/// Announces for one torrent and feeds the returned peers to its sessions
#[derive(Debug, Clone)]
pub struct Announcer {
    trackers: Vec<Arc<TrackerClient>>,
    ctx: Arc<TorrentContext>,
    manager: SessionManager,
    config: TrackerConfig,
}

impl Announcer {
    pub fn new(
        trackers: Vec<Arc<TrackerClient>>,
        ctx: Arc<TorrentContext>,
        manager: SessionManager,
        config: TrackerConfig,
    ) -> Self {
        Self {
            trackers,
            ctx,
            manager,
            config,
        }
    }

    pub fn trackers(&self) -> &[Arc<TrackerClient>] {
        &self.trackers
    }

    /// Abort every announce in progress
    pub fn end_announces(&self) {
        for tracker in &self.trackers {
            tracker.end_announce();
        }
    }

    /// Run until `shutdown` turns true, then announce "stopped"
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.trackers.is_empty() {
            debug!("No trackers to announce to");
            return;
        }
        if *shutdown.borrow() {
            return;
        }

        tokio::select! {
            _ = self.announce_due() => {}
            _ = shutdown.changed() => {
                self.announce_stopped().await;
                return;
            }
        }

        let mut was_complete = self.ctx.store.is_complete();
        let mut tick = time::interval(self.config.scan_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }

            if !was_complete && self.ctx.store.is_complete() {
                was_complete = true;
                info!("Download complete, queueing completed announces");
                for tracker in &self.trackers {
                    tracker.announce_completed().await;
                }
            }

            tokio::select! {
                _ = self.announce_due() => {}
                _ = shutdown.changed() => break,
            }
        }

        self.announce_stopped().await;
    }

    /// Regular announce to every due tracker, a bounded number at a time
    ///
    /// The first call reaches every tracker since "started" is pending.
    async fn announce_due(&self) {
        let permits = Arc::new(Semaphore::new(self.config.announce_workers));
        let mut tasks = JoinSet::new();

        for tracker in &self.trackers {
            let tracker = tracker.clone();
            let ctx = self.ctx.clone();
            let manager = self.manager.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if let Some(peers) = tracker.announce_none(&ctx).await {
                    let added = manager.add_candidates(peers);
                    debug!("{} new peers from {}", added, tracker.url());
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Announce task failed: {}", e);
            }
        }
    }

    async fn announce_stopped(&self) {
        let mut tasks = JoinSet::new();
        for tracker in &self.trackers {
            let tracker = tracker.clone();
            let ctx = self.ctx.clone();
            tasks.spawn(async move { tracker.announce_stopped(&ctx).await });
        }

        let all = async { while tasks.join_next().await.is_some() {} };
        if time::timeout(self.config.stop_timeout, all).await.is_err() {
            warn!("Stopped announces did not finish in {:?}", self.config.stop_timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::{MemoryStorage, PieceLayout, PieceStore};
    use crate::tracker::udp::testing;

    fn fast_scan() -> TrackerConfig {
        TrackerConfig {
            scan_interval: Duration::from_millis(20),
            ..TrackerConfig::default()
        }
    }

    fn context() -> Arc<TorrentContext> {
        let layout = PieceLayout::new(16384, 16384).unwrap();
        let storage = Arc::new(MemoryStorage::new(layout));
        let (store, _events) = PieceStore::new(layout, vec![[0u8; 20]], storage).unwrap();
        Arc::new(TorrentContext::new([1; 20], [2; 20], Arc::new(store)))
    }

    #[tokio::test]
    async fn test_started_then_stopped() {
        let peer: SocketAddr = "10.0.0.9:6881".parse().unwrap();
        let (addr, announces) = testing::spawn_tracker(1800, vec![peer]).await;
        let config = fast_scan();
        let tracker = TrackerClient::from_url(&format!("udp://{}", addr), &config).unwrap().unwrap();

        let ctx = context();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = SessionManager::new(ctx.clone(), &EngineConfig::default(), shutdown_rx.clone());
        let announcer = Announcer::new(vec![Arc::new(tracker)], ctx, manager.clone(), config);
        let task = tokio::spawn(announcer.run(shutdown_rx));

        for _ in 0..100 {
            if manager.candidate_count() > 0 {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.candidate_count(), 1);

        // several scan passes go by without another announce
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(announces.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(announces.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_tracker_backs_off_between_passes() {
        let (failing, connects) = testing::spawn_failing_tracker().await;
        let peer: SocketAddr = "10.0.0.9:6881".parse().unwrap();
        let (working, announces) = testing::spawn_tracker(1800, vec![peer]).await;
        let config = fast_scan();
        let trackers = [failing, working]
            .iter()
            .map(|addr| Arc::new(TrackerClient::from_url(&format!("udp://{}", addr), &config).unwrap().unwrap()))
            .collect();

        let ctx = context();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = SessionManager::new(ctx.clone(), &EngineConfig::default(), shutdown_rx.clone());
        let announcer = Announcer::new(trackers, ctx, manager.clone(), config);
        let task = tokio::spawn(announcer.run(shutdown_rx));

        // many scan passes, all inside the first retry wait
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(announces.load(Ordering::SeqCst), 1);
        assert_eq!(manager.candidate_count(), 1);

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        // "stopped" only goes to the tracker that saw "started"
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(announces.load(Ordering::SeqCst), 2);
    }
}
