//! Test data creation for session testing.
//!
//! Deterministic magnet links and bencoded descriptors so tests across the
//! workspace agree on fingerprints without touching the network.

use bytes::Bytes;

use super::{InfoHash, MagnetParser};

/// Fingerprint derived from a single seed byte.
pub fn test_info_hash(seed: u8) -> InfoHash {
    let mut hash = [seed; 20];
    hash[19] = seed.wrapping_mul(31).wrapping_add(7);
    InfoHash::new(hash)
}

/// Magnet link for `info_hash` with a display name and no trackers.
pub fn test_magnet(info_hash: InfoHash, name: &str) -> String {
    MagnetParser::build_magnet_uri(info_hash, Some(name), &[])
}

/// Bencoded multi-file descriptor for `name` with the given files.
///
/// Files are laid out in the order given; one 20-byte piece hash is emitted
/// per 32 KiB of content.
pub fn create_test_descriptor(name: &str, files: &[(&str, u64)]) -> Bytes {
    const PIECE_LENGTH: u64 = 32_768;

    let total: u64 = files.iter().map(|(_, size)| size).sum();
    let piece_count = total.div_ceil(PIECE_LENGTH).max(1) as usize;

    let mut info = Vec::new();
    info.push(b'd');
    push_str(&mut info, "files");
    info.push(b'l');
    for (path, size) in files {
        info.push(b'd');
        push_str(&mut info, "length");
        push_int(&mut info, *size);
        push_str(&mut info, "path");
        info.push(b'l');
        for component in path.split('/') {
            push_str(&mut info, component);
        }
        info.extend_from_slice(b"ee");
    }
    info.push(b'e');
    push_str(&mut info, "name");
    push_str(&mut info, name);
    push_str(&mut info, "piece length");
    push_int(&mut info, PIECE_LENGTH);
    push_str(&mut info, "pieces");
    push_bytes(&mut info, &vec![0xab; piece_count * 20]);
    info.push(b'e');

    let mut descriptor = Vec::with_capacity(info.len() + 64);
    descriptor.push(b'd');
    push_str(&mut descriptor, "announce");
    push_str(&mut descriptor, "udp://tracker.example.com:1337/announce");
    push_str(&mut descriptor, "info");
    descriptor.extend_from_slice(&info);
    descriptor.push(b'e');
    Bytes::from(descriptor)
}

/// Creates a scratch directory for a session's state and downloads.
///
/// Only available when tempfile is available (in tests or with test-utils feature).
#[cfg(any(test, feature = "test-utils"))]
pub fn create_test_session_dir() -> (tempfile::TempDir, crate::config::UndertowConfig) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let config = crate::config::UndertowConfig::for_testing(temp_dir.path());
    (temp_dir, config)
}

fn push_str(out: &mut Vec<u8>, value: &str) {
    push_bytes(out, value.as_bytes());
}

fn push_bytes(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(value.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(value);
}

fn push_int(out: &mut Vec<u8>, value: u64) {
    out.push(b'i');
    out.extend_from_slice(value.to_string().as_bytes());
    out.push(b'e');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::DescriptorParser;

    #[test]
    fn test_descriptor_parses_with_all_files() {
        let bytes = create_test_descriptor("album", &[("cd1/a.flac", 40_000), ("b.flac", 10)]);
        let metadata = DescriptorParser::parse(&bytes).unwrap();

        assert_eq!(metadata.name, "album");
        assert_eq!(metadata.files.len(), 2);
        assert_eq!(metadata.files[0].relative_path(), "cd1/a.flac");
        assert_eq!(metadata.total_length, 40_010);
        assert_eq!(metadata.piece_count, 2);
    }

    #[test]
    fn test_descriptor_fingerprint_depends_on_content() {
        let first = DescriptorParser::parse(&create_test_descriptor("x", &[("a", 1)])).unwrap();
        let second = DescriptorParser::parse(&create_test_descriptor("x", &[("a", 2)])).unwrap();
        assert_ne!(first.info_hash, second.info_hash);
    }

    #[test]
    fn test_magnet_round_trips_fingerprint() {
        let info_hash = test_info_hash(9);
        let magnet = MagnetParser::parse_magnet_link(&test_magnet(info_hash, "demo")).unwrap();
        assert_eq!(magnet.info_hash, info_hash);
        assert_eq!(magnet.display_name.as_deref(), Some("demo"));
    }
}
