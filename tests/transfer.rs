use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use btclient::{Engine, EngineConfig, ResumeManager, TorrentBuilder, TorrentInfo, TorrentParser};

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

fn engine_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        download_dir: dir.to_path_buf(),
        housekeeping_interval: Duration::from_millis(50),
        dialer_wait: Duration::from_millis(20),
        ..EngineConfig::default()
    }
}

fn make_torrent(dir: &Path, name: &str, data: &[u8]) -> TorrentInfo {
    let source = dir.join(name);
    std::fs::write(&source, data).unwrap();
    let bytes = TorrentBuilder::new(&source).piece_length(32768).build().unwrap();
    TorrentParser::parse_bytes(&bytes).unwrap()
}

async fn wait_complete(engine: &Engine, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while !engine.is_complete() {
        assert!(tokio::time::Instant::now() < deadline, "transfer did not finish: {:?}", engine.snapshot_stats());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loopback_transfer() {
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();
    let data = content(200_000);
    let info = make_torrent(seed_dir.path(), "payload.bin", &data);

    let mut seeder = Engine::new(info.clone(), engine_config(seed_dir.path())).unwrap();
    assert_eq!(seeder.verify_existing(), info.piece_count());
    assert!(seeder.is_complete());
    let seed_addr = seeder.start().await.unwrap();

    let mut leecher = Engine::new(info.clone(), engine_config(leech_dir.path())).unwrap();
    assert_eq!(leecher.verify_existing(), 0);
    leecher.start().await.unwrap();
    leecher.add_peers([loopback(seed_addr)]);

    wait_complete(&leecher, Duration::from_secs(30)).await;

    let stats = leecher.snapshot_stats();
    assert_eq!(stats.left, 0);
    assert_eq!(stats.verified_pieces, info.piece_count());
    assert!(stats.downloaded >= data.len() as u64);

    leecher.stop().await.unwrap();
    seeder.stop().await.unwrap();

    let received = std::fs::read(leech_dir.path().join("payload.bin")).unwrap();
    assert_eq!(received, data);
    assert!(seeder.snapshot_stats().uploaded >= data.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streaming_transfer_and_resume() {
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let data = content(150_000);
    let info = make_torrent(seed_dir.path(), "clip.bin", &data);

    let mut seeder = Engine::new(info.clone(), engine_config(seed_dir.path())).unwrap();
    seeder.verify_existing();
    let seed_addr = seeder.start().await.unwrap();

    let mut leecher = Engine::new(info.clone(), engine_config(leech_dir.path())).unwrap();
    leecher.set_streaming(true);
    leecher.start().await.unwrap();
    leecher.add_peers([loopback(seed_addr)]);
    wait_complete(&leecher, Duration::from_secs(30)).await;
    leecher.stop().await.unwrap();
    seeder.stop().await.unwrap();

    let resume = ResumeManager::new(state_dir.path().to_path_buf());
    resume.save_resume_data(&leecher.resume_data()).await.unwrap();
    assert!(resume.has_resume_data(&info.info_hash));

    // a fresh engine picks the state up without touching the network
    let restarted = Engine::new(info.clone(), engine_config(leech_dir.path())).unwrap();
    let saved = resume.load_resume_data(&info.info_hash).await.unwrap().unwrap();
    restarted.restore(saved).unwrap();
    assert!(restarted.is_complete());
    assert_eq!(std::fs::read(leech_dir.path().join("clip.bin")).unwrap(), data);
}
