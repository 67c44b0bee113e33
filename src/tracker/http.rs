//! HTTP tracker protocol

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use super::{parse_compact_peers, AnnounceRequest, AnnounceResponse, TrackerEvent};
use crate::config::TrackerConfig;
use crate::error::TorrentError;
use crate::torrent::bencode::{self, Value};

/// An `http://` or `https://` tracker
#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: Client,
    url: Url,
    numwant: u32,
    max_response_size: usize,
}

impl HttpTracker {
    pub fn new(url: Url, config: &TrackerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| TorrentError::tracker_error_full("Cannot build HTTP client", url.as_str(), e.to_string()))?;

        Ok(Self {
            client,
            url,
            numwant: config.http_numwant,
            max_response_size: config.max_response_size,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Full announce URL with the query string
    ///
    /// Built by hand since the binary hash and peer id must be
    /// percent-encoded byte by byte.
    pub fn announce_url(&self, request: &AnnounceRequest) -> String {
        let mut url = self.url.to_string();
        url.push(if self.url.query().is_some() { '&' } else { '?' });
        url.push_str(&format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            urlencoding::encode_binary(&request.info_hash),
            urlencoding::encode_binary(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        ));
        if request.event != TrackerEvent::None {
            url.push_str("&event=");
            url.push_str(request.event.as_str());
        }
        url.push_str(&format!("&numwant={}", self.numwant));
        url
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let url = self.announce_url(request);
        debug!("HTTP announce: {}", url);

        let mut response = self.client.get(&url).send().await.map_err(|e| self.request_error(e))?;
        if !response.status().is_success() {
            return Err(TorrentError::tracker_error_full(
                "Unexpected HTTP status",
                self.url.as_str(),
                response.status().to_string(),
            )
            .into());
        }
        if response.content_length().is_some_and(|len| len > self.max_response_size as u64) {
            return Err(TorrentError::tracker_error("Response too large", self.url.as_str()).into());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.request_error(e))? {
            if body.len() + chunk.len() > self.max_response_size {
                return Err(TorrentError::tracker_error("Response too large", self.url.as_str()).into());
            }
            body.extend_from_slice(&chunk);
        }

        parse_response(&body, self.url.as_str())
    }

    fn request_error(&self, e: reqwest::Error) -> anyhow::Error {
        if e.is_timeout() {
            TorrentError::timeout(format!("HTTP announce to {}", self.url)).into()
        } else {
            TorrentError::tracker_error_full("HTTP request failed", self.url.as_str(), e.to_string()).into()
        }
    }
}

/// Decode a bencoded announce response
///
/// `peers` may be a compact string or a list of `{ip, port}`
/// dictionaries. Entries whose ip is not a literal address are skipped.
pub fn parse_response(body: &[u8], tracker: &str) -> Result<AnnounceResponse> {
    let root = bencode::decode(body)
        .map_err(|e| TorrentError::tracker_error_full("Malformed response", tracker, e.to_string()))?;
    if root.as_dict().is_none() {
        return Err(TorrentError::tracker_error("Response is not a dictionary", tracker).into());
    }

    if let Some(reason) = root.get("failure reason").and_then(Value::as_string) {
        return Err(TorrentError::tracker_error_full("Tracker refused announce", tracker, reason).into());
    }
    if let Some(message) = root.get("warning message").and_then(Value::as_string) {
        warn!("Tracker {} warning: {}", tracker, message);
    }

    let seconds = |key: &str| {
        root.get(key)
            .and_then(Value::as_int)
            .and_then(|s| u64::try_from(s).ok())
            .map(Duration::from_secs)
    };
    let count = |key: &str| root.get(key).and_then(Value::as_int).and_then(|c| u32::try_from(c).ok());

    let peers = match root.get("peers") {
        Some(peers) => match peers.as_bytes() {
            Some(compact) => parse_compact_peers(compact),
            None => peers
                .as_list()
                .unwrap_or_default()
                .iter()
                .filter_map(|peer| {
                    let ip: IpAddr = peer.get("ip")?.as_string()?.parse().ok()?;
                    let port = u16::try_from(peer.get("port")?.as_int()?).ok()?;
                    Some(SocketAddr::new(ip, port))
                })
                .collect(),
        },
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval: seconds("interval").or_else(|| seconds("min interval")),
        seeders: count("complete"),
        leechers: count("incomplete"),
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::bencode::encode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one connection with `response` written verbatim; the handle
    /// yields the request head that came in
    async fn serve_once(response: Vec<u8>) -> (Url, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/announce", listener.local_addr().unwrap())).unwrap();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            stream.write_all(&response).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&head).into_owned()
        });
        (url, task)
    }

    fn http_response(status: &str, body: &[u8], with_length: bool) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {}\r\nConnection: close\r\n", status).into_bytes();
        if with_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        out
    }

    fn request(event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xAB; 20],
            peer_id: *b"-BC0100-abcdefghijkl",
            port: 6881,
            uploaded: 10,
            downloaded: 20,
            left: 30,
            event,
        }
    }

    #[test]
    fn test_announce_url() {
        let url = Url::parse("http://tracker.example.com/announce").unwrap();
        let tracker = HttpTracker::new(url, &TrackerConfig::default()).unwrap();

        let started = tracker.announce_url(&request(TrackerEvent::Started));
        assert!(started.starts_with("http://tracker.example.com/announce?info_hash=%AB%AB"));
        assert!(started.contains("&peer_id=-BC0100-abcdefghijkl&port=6881"));
        assert!(started.contains("&uploaded=10&downloaded=20&left=30&compact=1&event=started&numwant=100"));

        let regular = tracker.announce_url(&request(TrackerEvent::None));
        assert!(!regular.contains("event="));

        let url = Url::parse("http://tracker.example.com/announce?passkey=x").unwrap();
        let tracker = HttpTracker::new(url, &TrackerConfig::default()).unwrap();
        assert!(tracker.announce_url(&request(TrackerEvent::None)).contains("passkey=x&info_hash="));
    }

    #[test]
    fn test_parse_compact_response() {
        let body = encode(&Value::dict_from([
            ("interval", Value::int(1800)),
            ("complete", Value::int(5)),
            ("incomplete", Value::int(2)),
            ("peers", Value::bytes(vec![192, 168, 1, 1, 0x1A, 0xE1])),
        ]));
        let response = parse_response(&body, "test").unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(response.seeders, Some(5));
        assert_eq!(response.leechers, Some(2));
        assert_eq!(response.peers, vec!["192.168.1.1:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let peer = |ip: &str, port| Value::dict_from([("ip", Value::bytes(ip)), ("port", Value::int(port))]);
        let body = encode(&Value::dict_from([
            ("min interval", Value::int(60)),
            (
                "peers",
                Value::list(vec![peer("10.0.0.1", 6881), peer("tracker.invalid", 1), peer("::1", 51413)]),
            ),
        ]));
        let response = parse_response(&body, "test").unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(60)));
        assert_eq!(
            response.peers,
            vec!["10.0.0.1:6881".parse().unwrap(), "[::1]:51413".parse().unwrap()]
        );
    }

    #[test]
    fn test_failure_reason() {
        let body = encode(&Value::dict_from([("failure reason", Value::bytes("unregistered torrent"))]));
        let err = parse_response(&body, "test").unwrap_err();
        assert!(err.to_string().contains("unregistered torrent"));
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::TrackerError { .. })
        ));
    }

    #[tokio::test]
    async fn test_announce_over_http() {
        let body = encode(&Value::dict_from([
            ("interval", Value::int(900)),
            ("peers", Value::bytes(vec![10, 0, 0, 7, 0x1A, 0xE1, 10, 0, 0, 8, 0x1A, 0xE2])),
        ]));
        let (url, server) = serve_once(http_response("200 OK", &body, true)).await;
        let tracker = HttpTracker::new(url, &TrackerConfig::default()).unwrap();

        let response = tracker.announce(&request(TrackerEvent::Started)).await.unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(900)));
        assert_eq!(
            response.peers,
            vec!["10.0.0.7:6881".parse().unwrap(), "10.0.0.8:6882".parse().unwrap()]
        );

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /announce?info_hash=%AB%AB"));
        assert!(head.contains("&event=started&numwant=100 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_error_status_is_tracker_error() {
        let (url, _server) = serve_once(http_response("500 Internal Server Error", b"oops", true)).await;
        let tracker = HttpTracker::new(url, &TrackerConfig::default()).unwrap();

        let err = tracker.announce(&request(TrackerEvent::None)).await.unwrap_err();
        assert!(err.to_string().contains("500"));
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::TrackerError { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_response_is_rejected() {
        let config = TrackerConfig {
            max_response_size: 64,
            ..TrackerConfig::default()
        };
        let body = vec![b'x'; 200];

        // declared length
        let (url, _server) = serve_once(http_response("200 OK", &body, true)).await;
        let err = HttpTracker::new(url, &config)
            .unwrap()
            .announce(&request(TrackerEvent::None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Response too large"));

        // body read until close
        let (url, _server) = serve_once(http_response("200 OK", &body, false)).await;
        let err = HttpTracker::new(url, &config)
            .unwrap()
            .announce(&request(TrackerEvent::None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Response too large"));
    }

    #[tokio::test]
    async fn test_silent_tracker_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/announce", listener.local_addr().unwrap())).unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        let config = TrackerConfig {
            http_timeout: Duration::from_millis(100),
            ..TrackerConfig::default()
        };

        let err = HttpTracker::new(url, &config)
            .unwrap()
            .announce(&request(TrackerEvent::None))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::Timeout { .. })
        ));
    }
}
