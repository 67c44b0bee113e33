//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use anyhow::Result;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::torrent::bencode::{self, Value};
use crate::torrent::info::{TorrentFile, TorrentInfo};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode(data)?;
        if root.as_dict().is_none() {
            return Err(TorrentError::parse_error("root must be a dictionary").into());
        }
        Self::convert_to_torrent_info(&root, data)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn convert_to_torrent_info(root: &Value, data: &[u8]) -> Result<TorrentInfo> {
        let announce = root.get("announce").and_then(Value::as_string);

        let mut announce_list: Vec<String> = announce.iter().cloned().collect();
        for tier in root.get("announce-list").and_then(Value::as_list).unwrap_or_default() {
            for url in tier.as_list().unwrap_or_default() {
                if let Some(url) = url.as_string() {
                    if !announce_list.contains(&url) {
                        announce_list.push(url);
                    }
                }
            }
        }

        let info = root
            .get("info")
            .filter(|v| v.as_dict().is_some())
            .ok_or_else(|| TorrentError::parse_error("missing info dictionary"))?;
        let info_hash = TorrentInfo::generate_info_hash(&data[info.span.clone()]);

        let name = required_string(info, "name")?;
        if name.is_empty() {
            return Err(TorrentError::parse_error("torrent name is empty").into());
        }

        let piece_length = required_int(info, "piece length")?;
        let piece_length = u32::try_from(piece_length)
            .ok()
            .filter(|&len| len > 0)
            .ok_or_else(|| TorrentError::parse_error_with_source("invalid piece length", piece_length.to_string()))?;

        let pieces = info
            .get("pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::parse_error("missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces)?;

        let files = if let Some(length) = info.get("length") {
            let length = length
                .as_int()
                .and_then(|l| u64::try_from(l).ok())
                .ok_or_else(|| TorrentError::parse_error("invalid length field"))?;
            vec![TorrentFile {
                path: vec![name.clone()],
                length,
            }]
        } else if let Some(entries) = info.get("files").and_then(Value::as_list) {
            let mut files = Vec::with_capacity(entries.len());
            for entry in entries {
                let length = u64::try_from(required_int(entry, "length")?)
                    .map_err(|_| TorrentError::parse_error("negative file length"))?;
                let components = entry
                    .get("path")
                    .and_then(Value::as_list)
                    .ok_or_else(|| TorrentError::parse_error("missing file path"))?;
                if components.is_empty() {
                    return Err(TorrentError::parse_error("file path is empty").into());
                }

                let mut path = vec![name.clone()];
                for component in components {
                    let component = component
                        .as_string()
                        .ok_or_else(|| TorrentError::parse_error("file path component is not a string"))?;
                    path.push(component);
                }
                files.push(TorrentFile { path, length });
            }
            if files.is_empty() {
                return Err(TorrentError::parse_error("file list is empty").into());
            }
            files
        } else {
            return Err(TorrentError::parse_error("neither length nor files found in info dictionary").into());
        };

        let total_size: u64 = files.iter().map(|f| f.length).sum();
        let expected = total_size.div_ceil(u64::from(piece_length));
        if expected != pieces.len() as u64 {
            return Err(TorrentError::parse_error(format!(
                "{} piece hashes for {} bytes at piece length {} (expected {})",
                pieces.len(),
                total_size,
                piece_length,
                expected
            ))
            .into());
        }

        info!("Successfully converted torrent info: {}", name);
        Ok(TorrentInfo {
            announce,
            announce_list,
            info_hash,
            piece_length,
            pieces,
            name,
            files,
            comment: root.get("comment").and_then(Value::as_string),
            created_by: root.get("created by").and_then(Value::as_string),
        })
    }
}

fn required_string(dict: &Value, key: &str) -> Result<String> {
    dict.get(key)
        .and_then(Value::as_string)
        .ok_or_else(|| TorrentError::parse_error(format!("missing {} field", key)).into())
}

fn required_int(dict: &Value, key: &str) -> Result<i64> {
    dict.get(key)
        .and_then(Value::as_int)
        .ok_or_else(|| TorrentError::parse_error(format!("missing {} field", key)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::bencode::encode;

    fn torrent(info: Value) -> Vec<u8> {
        encode(&Value::dict_from([
            ("announce", Value::bytes("http://tracker.example.com/announce")),
            (
                "announce-list",
                Value::list(vec![
                    Value::list(vec![Value::bytes("http://tracker.example.com/announce")]),
                    Value::list(vec![Value::bytes("udp://tracker.example.org:6969")]),
                ]),
            ),
            ("info", info),
        ]))
    }

    #[test]
    fn test_parse_single_file() {
        let info = Value::dict_from([
            ("name", Value::bytes("movie.mkv")),
            ("piece length", Value::int(32768)),
            ("length", Value::int(100_000)),
            ("pieces", Value::bytes(vec![7u8; 80])),
        ]);
        let info_bytes = encode(&info);
        let data = torrent(info);

        let parsed = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(parsed.name, "movie.mkv");
        assert_eq!(parsed.piece_length, 32768);
        assert_eq!(parsed.piece_count(), 4);
        assert_eq!(parsed.files, vec![TorrentFile { path: vec!["movie.mkv".into()], length: 100_000 }]);
        assert_eq!(parsed.info_hash, TorrentInfo::generate_info_hash(&info_bytes));
        assert_eq!(
            parsed.announce_list,
            vec!["http://tracker.example.com/announce", "udp://tracker.example.org:6969"]
        );
    }

    #[test]
    fn test_parse_multi_file() {
        let file = |path: &[&str], length| {
            Value::dict_from([
                ("length", Value::int(length)),
                ("path", Value::list(path.iter().map(|p| Value::bytes(*p)).collect())),
            ])
        };
        let info = Value::dict_from([
            ("name", Value::bytes("album")),
            ("piece length", Value::int(16384)),
            ("pieces", Value::bytes(vec![1u8; 40])),
            ("files", Value::list(vec![file(&["cd1", "a.flac"], 20_000), file(&["b.flac"], 100)])),
        ]);

        let parsed = TorrentParser::parse_bytes(&torrent(info)).unwrap();
        assert!(parsed.is_multi_file());
        assert_eq!(parsed.files[0].path, vec!["album", "cd1", "a.flac"]);
        assert_eq!(parsed.files[1].path, vec!["album", "b.flac"]);
        assert_eq!(parsed.total_size(), 20_100);
    }

    #[test]
    fn test_info_hash_uses_source_bytes() {
        // keys out of order, so re-encoding would change the bytes
        let mut data = b"d4:infod4:name1:x6:lengthi5e12:piece lengthi16384e6:pieces20:".to_vec();
        data.extend_from_slice(&[b'a'; 20]);
        data.extend_from_slice(b"ee");

        let parsed = TorrentParser::parse_bytes(&data).unwrap();
        let info_bytes = &data[7..data.len() - 1];
        assert_eq!(parsed.info_hash, TorrentInfo::generate_info_hash(info_bytes));

        let reencoded = encode(&bencode::decode(info_bytes).unwrap());
        assert_ne!(parsed.info_hash, TorrentInfo::generate_info_hash(&reencoded));
        assert_eq!(parsed.announce, None);
        assert!(parsed.announce_list.is_empty());
    }

    #[test]
    fn test_rejects_bad_metadata() {
        let piece_mismatch = Value::dict_from([
            ("name", Value::bytes("x")),
            ("piece length", Value::int(16384)),
            ("length", Value::int(40_000)),
            ("pieces", Value::bytes(vec![0u8; 40])),
        ]);
        let err = TorrentParser::parse_bytes(&torrent(piece_mismatch)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::ParseError { .. })
        ));

        let zero_piece_length = Value::dict_from([
            ("name", Value::bytes("x")),
            ("piece length", Value::int(0)),
            ("length", Value::int(1)),
            ("pieces", Value::bytes(vec![0u8; 20])),
        ]);
        assert!(TorrentParser::parse_bytes(&torrent(zero_piece_length)).is_err());

        assert!(TorrentParser::parse_bytes(b"li1ee").is_err());
        assert!(TorrentParser::parse_bytes(b"d8:announce3:urle").is_err());
    }
}
