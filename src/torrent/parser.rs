//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use anyhow::Result;
use tracing::{debug, error, info, trace};

use crate::bencode::{self, Dict, Value};
use crate::error::TorrentError;
use crate::torrent::info::{FileLayout, TorrentFile, TorrentInfo};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode(data)?;
        Self::from_value(&root)
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

    /// Convert an already decoded metainfo value
    pub fn from_value(root: &Value) -> Result<TorrentInfo> {
        let root_dict = root
            .as_dict()
            .ok_or_else(|| TorrentError::format_error("Root must be a dictionary"))?;

        let announce = required_str(root_dict, b"announce")?;

        let info_value = root_dict
            .get(b"info")
            .ok_or_else(|| TorrentError::format_error("Missing info dictionary"))?;
        let info_dict = info_value
            .as_dict()
            .ok_or_else(|| TorrentError::format_error("info must be a dictionary"))?;

        let name = required_str(info_dict, b"name")?;
        validate_segment(&name)?;

        let piece_length = required_int(info_dict, b"piece length")?;
        if piece_length == 0 {
            return Err(TorrentError::format_error("piece length must be positive").into());
        }

        let pieces_bytes = info_dict
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::format_error("Missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let layout = if let Some(files) = info_dict.get(b"files") {
            let entries = files
                .as_list()
                .ok_or_else(|| TorrentError::format_error("files must be a list"))?;
            let files = entries.iter().map(parse_file_entry).collect::<Result<Vec<_>>>()?;
            FileLayout::Multiple { files }
        } else {
            FileLayout::Single {
                length: required_int(info_dict, b"length")?,
            }
        };

        // Re-encoding preserves key order, so this matches the hash of the raw bytes.
        let info_hash = TorrentInfo::generate_info_hash(&bencode::encode(info_value));

        let torrent = TorrentInfo {
            announce,
            info_hash,
            piece_length,
            pieces,
            name,
            layout,
        };

        let expected_pieces = torrent.total_length().div_ceil(piece_length);
        if expected_pieces != torrent.piece_count() as u64 {
            return Err(TorrentError::format_error(format!(
                "{} piece hashes for {} bytes at piece length {}",
                torrent.piece_count(),
                torrent.total_length(),
                piece_length
            ))
            .into());
        }

        info!(
            "Successfully parsed torrent '{}' ({} pieces, info hash {})",
            torrent.name,
            torrent.piece_count(),
            torrent.info_hash_hex()
        );
        Ok(torrent)
    }
}

fn parse_file_entry(entry: &Value) -> Result<TorrentFile> {
    let dict = entry
        .as_dict()
        .ok_or_else(|| TorrentError::format_error("File entry must be a dictionary"))?;

    let length = required_int(dict, b"length")?;
    let segments = dict
        .get(b"path")
        .and_then(Value::as_list)
        .ok_or_else(|| TorrentError::format_error("Missing file path"))?;
    if segments.is_empty() {
        return Err(TorrentError::format_error("File path is empty").into());
    }

    let mut path = Vec::with_capacity(segments.len());
    for segment in segments {
        let segment = segment
            .as_str()
            .ok_or_else(|| TorrentError::format_error("Path segment must be UTF-8 text"))?;
        validate_segment(segment)?;
        path.push(segment.to_string());
    }

    Ok(TorrentFile { path, length })
}

/// Reject path segments that could escape the download directory
fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains(['/', '\\']) {
        return Err(TorrentError::format_error_with_source("Unsafe path segment", segment.to_string()).into());
    }
    Ok(())
}

fn required_str(dict: &Dict, key: &[u8]) -> Result<String> {
    dict.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing(key).into())
}

fn required_int(dict: &Dict, key: &[u8]) -> Result<u64> {
    let value = dict
        .get(key)
        .and_then(Value::as_int)
        .ok_or_else(|| missing(key))?;
    u64::try_from(value).map_err(|_| {
        TorrentError::format_error(format!("{} must not be negative", String::from_utf8_lossy(key))).into()
    })
}

fn missing(key: &[u8]) -> TorrentError {
    TorrentError::format_error(format!("Missing or mistyped field '{}'", String::from_utf8_lossy(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_metainfo() -> Vec<u8> {
        let info = Dict::new()
            .with("length", 32768i64)
            .with("name", "data.bin")
            .with("piece length", 16384i64)
            .with("pieces", vec![7u8; 40]);
        let root = Dict::new()
            .with("announce", "http://tracker.test/announce")
            .with("info", info);
        bencode::encode(&Value::Dict(root))
    }

    #[test]
    fn test_parse_single_file() {
        let info = TorrentParser::parse_bytes(&single_file_metainfo()).unwrap();
        assert_eq!(info.announce, "http://tracker.test/announce");
        assert_eq!(info.name, "data.bin");
        assert_eq!(info.piece_length, 16384);
        assert_eq!(info.piece_count(), 2);
        assert_eq!(info.layout, FileLayout::Single { length: 32768 });
    }

    #[test]
    fn test_info_hash_covers_raw_info_bytes() {
        let raw = single_file_metainfo();
        let info = TorrentParser::parse_bytes(&raw).unwrap();

        let marker = b"4:infod";
        let start = raw.windows(marker.len()).position(|w| w == marker).unwrap() + 6;
        let info_bytes = &raw[start..raw.len() - 1];
        assert_eq!(info.info_hash, TorrentInfo::generate_info_hash(info_bytes));
    }

    #[test]
    fn test_parse_multi_file() {
        let files = Value::List(vec![
            Value::Dict(Dict::new().with("length", 10i64).with("path", Value::List(vec!["dir".into(), "a.txt".into()]))),
            Value::Dict(Dict::new().with("length", 6i64).with("path", Value::List(vec!["b.txt".into()]))),
        ]);
        let info = Dict::new()
            .with("files", files)
            .with("name", "bundle")
            .with("piece length", 8i64)
            .with("pieces", vec![0u8; 40]);
        let root = Dict::new().with("announce", "http://t/a").with("info", info);

        let torrent = TorrentParser::parse_bytes(&bencode::encode(&Value::Dict(root))).unwrap();
        assert!(torrent.is_multi_file());
        assert_eq!(torrent.total_length(), 16);
        assert_eq!(torrent.files()[0].path, vec!["dir", "a.txt"]);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let files = Value::List(vec![Value::Dict(
            Dict::new().with("length", 4i64).with("path", Value::List(vec!["..".into(), "x".into()])),
        )]);
        let info = Dict::new()
            .with("files", files)
            .with("name", "evil")
            .with("piece length", 4i64)
            .with("pieces", vec![0u8; 20]);
        let root = Dict::new().with("announce", "http://t/a").with("info", info);

        assert!(TorrentParser::parse_bytes(&bencode::encode(&Value::Dict(root))).is_err());
    }

    #[test]
    fn test_missing_info() {
        let root = Dict::new().with("announce", "http://t/a");
        let err = TorrentParser::parse_bytes(&bencode::encode(&Value::Dict(root))).unwrap_err();
        assert!(err.to_string().contains("info"));
    }

    #[test]
    fn test_piece_count_mismatch() {
        let info = Dict::new()
            .with("length", 100i64)
            .with("name", "x")
            .with("piece length", 10i64)
            .with("pieces", vec![0u8; 20]);
        let root = Dict::new().with("announce", "http://t/a").with("info", info);
        assert!(TorrentParser::parse_bytes(&bencode::encode(&Value::Dict(root))).is_err());
    }
}
