//! Parsed forms of magnet links and torrent descriptors

use crate::torrent::InfoHash;

/// Metadata extracted from a torrent descriptor (`.torrent` file).
///
/// Carries what the session manager shows before the engine reports
/// anything: name, file list, total size and trackers.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_count: usize,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
    pub announce_urls: Vec<String>,
}

/// Individual file within a torrent.
///
/// Path components are relative to the transfer's save directory.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

impl TorrentFile {
    /// Joins the path components with `/`.
    pub fn relative_path(&self) -> String {
        self.path.join("/")
    }
}

/// Magnet link components.
///
/// Contains only what a magnet URI can carry: the fingerprint and optional
/// display name, size hint and tracker URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub exact_length: Option<u64>,
    pub trackers: Vec<String>,
    pub uri: String,
}
