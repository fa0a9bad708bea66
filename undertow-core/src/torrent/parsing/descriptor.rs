//! Torrent descriptor parsing and fingerprint calculation

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use super::types::{TorrentFile, TorrentMetadata};
use crate::torrent::{InfoHash, TorrentError};

type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

/// Parser for bencoded `.torrent` descriptors.
pub struct DescriptorParser;

impl DescriptorParser {
    /// Parses descriptor bytes into metadata.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode or missing fields
    pub fn parse(descriptor_bytes: &[u8]) -> ParseResult<TorrentMetadata> {
        let parsed = bencode_rs::Value::parse(descriptor_bytes).map_err(|e| {
            TorrentError::InvalidTorrentFile {
                reason: format!("Bencode parsing failed: {e:?}"),
            }
        })?;

        let Some(root) = parsed.first() else {
            return Err(invalid("Empty bencode data"));
        };

        let bencode_rs::Value::Dictionary(dict) = root else {
            return Err(invalid("Root element must be dictionary"));
        };

        Self::metadata_from_root(dict, descriptor_bytes)
    }

    fn metadata_from_root(dict: &BencodeDict<'_>, raw: &[u8]) -> ParseResult<TorrentMetadata> {
        let Some(bencode_rs::Value::Dictionary(info)) = dict.get(b"info".as_slice()) else {
            return Err(invalid("Missing 'info' field"));
        };

        let info_hash = Self::fingerprint(raw)?;
        let name = Self::string_field(info, b"name")?;
        let piece_length = Self::integer_field(info, b"piece length")?;
        let pieces = Self::bytes_field(info, b"pieces")?;
        if pieces.len() % 20 != 0 {
            return Err(invalid("Invalid pieces length"));
        }

        let files = match (
            Self::integer_field(info, b"length"),
            info.get(b"files".as_slice()),
        ) {
            (Ok(length), _) => vec![TorrentFile {
                path: vec![name.clone()],
                length: length as u64,
            }],
            (Err(_), Some(bencode_rs::Value::List(entries))) => Self::file_list(entries)?,
            _ => return Err(invalid("Missing 'files' or 'length' field")),
        };

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length: piece_length as u32,
            piece_count: pieces.len() / 20,
            total_length: files.iter().map(|file| file.length).sum(),
            files,
            announce_urls: Self::announce_urls(dict),
        })
    }

    /// SHA-1 over the raw bytes of the `info` dictionary.
    fn fingerprint(raw: &[u8]) -> ParseResult<InfoHash> {
        let marker = b"4:info";
        let start = raw
            .windows(marker.len())
            .position(|window| window == marker)
            .map(|position| position + marker.len())
            .ok_or_else(|| invalid("Could not find info dictionary in data"))?;

        let length = Self::dictionary_length(&raw[start..])?;

        let mut hasher = Sha1::new();
        hasher.update(&raw[start..start + length]);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hasher.finalize());

        Ok(InfoHash::new(hash))
    }

    /// Length in bytes of the bencoded dictionary at the start of `data`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - Data does not start with a complete dictionary
    pub fn dictionary_length(data: &[u8]) -> ParseResult<usize> {
        if data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }

        let mut pos = 1;
        let mut depth = 1;

        while pos < data.len() && depth > 0 {
            match data[pos] {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                }
                b'e' => {
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    let end = data[pos..]
                        .iter()
                        .position(|&byte| byte == b'e')
                        .ok_or_else(|| invalid("Unterminated integer"))?;
                    pos += end + 1;
                }
                b'0'..=b'9' => {
                    let colon = data[pos..]
                        .iter()
                        .position(|&byte| byte == b':')
                        .ok_or_else(|| invalid("Invalid string format"))?;
                    let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                        .ok()
                        .and_then(|digits| digits.parse().ok())
                        .ok_or_else(|| invalid("Invalid string length"))?;
                    pos += colon + 1 + length;
                }
                _ => return Err(invalid("Invalid bencode character")),
            }
        }

        if depth != 0 || pos > data.len() {
            return Err(invalid("Incomplete bencode dictionary"));
        }

        Ok(pos)
    }

    fn string_field(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::bytes_field(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            invalid(&format!(
                "Invalid UTF-8 in field: {:?}",
                String::from_utf8_lossy(key)
            ))
        })
    }

    fn bytes_field<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(invalid(&format!(
                "Missing or invalid field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn integer_field(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) if *value >= 0 => Ok(*value),
            _ => Err(invalid(&format!(
                "Missing or invalid integer field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn file_list(entries: &[bencode_rs::Value<'_>]) -> ParseResult<Vec<TorrentFile>> {
        entries
            .iter()
            .map(|entry| {
                let bencode_rs::Value::Dictionary(file) = entry else {
                    return Err(invalid("Invalid file entry type"));
                };
                let length = Self::integer_field(file, b"length")? as u64;
                let Some(bencode_rs::Value::List(components)) = file.get(b"path".as_slice())
                else {
                    return Err(invalid("Missing or invalid path in file"));
                };

                let path = components
                    .iter()
                    .map(|component| match component {
                        bencode_rs::Value::Bytes(bytes) => String::from_utf8(bytes.to_vec())
                            .map_err(|_| invalid("Invalid UTF-8 in file path")),
                        _ => Err(invalid("Invalid path component type")),
                    })
                    .collect::<ParseResult<Vec<_>>>()?;

                Ok(TorrentFile { path, length })
            })
            .collect()
    }

    /// Trackers from `announce` and `announce-list`, deduplicated.
    ///
    /// Trackerless descriptors are valid; peers then come from DHT.
    fn announce_urls(dict: &BencodeDict<'_>) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();

        if let Ok(announce) = Self::string_field(dict, b"announce") {
            urls.push(announce);
        }

        if let Some(bencode_rs::Value::List(tiers)) = dict.get(b"announce-list".as_slice()) {
            for tier in tiers {
                let bencode_rs::Value::List(tier_urls) = tier else {
                    continue;
                };
                for value in tier_urls {
                    if let bencode_rs::Value::Bytes(bytes) = value
                        && let Ok(url) = String::from_utf8(bytes.to_vec())
                        && !urls.contains(&url)
                    {
                        urls.push(url);
                    }
                }
            }
        }

        urls
    }
}

fn invalid(reason: &str) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_FILE: &[u8] = b"d8:announce9:test:80804:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";

    #[test]
    fn test_single_file_descriptor() {
        let metadata = DescriptorParser::parse(SINGLE_FILE).unwrap();

        assert_eq!(metadata.name, "test.txt");
        assert_eq!(metadata.piece_length, 32768);
        assert_eq!(metadata.piece_count, 1);
        assert_eq!(metadata.total_length, 1000);
        assert_eq!(metadata.files.len(), 1);
        assert_eq!(metadata.files[0].relative_path(), "test.txt");
        assert_eq!(metadata.announce_urls, vec!["test:8080"]);
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_derived() {
        let first = DescriptorParser::parse(SINGLE_FILE).unwrap();
        let again = DescriptorParser::parse(SINGLE_FILE).unwrap();
        assert_eq!(first.info_hash, again.info_hash);

        let other = b"d8:announce9:test:80804:infod6:lengthi2000e4:name9:test2.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";
        let other = DescriptorParser::parse(other).unwrap();
        assert_ne!(first.info_hash, other.info_hash);
    }

    #[test]
    fn test_missing_info_field() {
        let result = DescriptorParser::parse(b"d8:announce9:test:8080e");
        let error = result.unwrap_err();
        assert!(error.to_string().contains("Missing 'info' field"));
    }

    #[test]
    fn test_invalid_pieces_length() {
        let data = b"d8:announce9:test:80804:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces19:1234567890123456789ee";
        let error = DescriptorParser::parse(data).unwrap_err();
        assert!(error.to_string().contains("Invalid pieces length"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(DescriptorParser::parse(b"invalid torrent data").is_err());
        assert!(DescriptorParser::parse(b"l4:teste").is_err());
    }

    #[test]
    fn test_dictionary_length() {
        for data in [
            b"d3:keyi42ee".as_slice(),
            b"d3:keyd4:namei42eee",
            b"d4:listl4:testi42eee",
        ] {
            assert_eq!(DescriptorParser::dictionary_length(data).unwrap(), data.len());
        }

        assert!(DescriptorParser::dictionary_length(b"l4:teste").is_err());
        assert!(DescriptorParser::dictionary_length(b"d3:key").is_err());
        assert!(DescriptorParser::dictionary_length(b"d3:key999:").is_err());
    }
}
