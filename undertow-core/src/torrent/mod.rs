//! Torrent identity and source resolution.
//!
//! Everything the session manager needs to know about a transfer before the
//! engine has seen it: the content fingerprint, the magnet or descriptor it
//! came from, and the tuple handed over by the discovery layer.

pub mod parsing;
pub mod source;
pub mod test_data;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use parsing::{DescriptorParser, MagnetLink, MagnetParser, TorrentFile, TorrentMetadata};
pub use source::{DiscoveredTorrent, TransferSource};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary. Used as the stable transfer id
/// throughout the session manager and as the key for persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Short prefix used in placeholder names and log lines.
    pub fn short(&self) -> String {
        self.to_string()[..16].to_string()
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(TorrentError::InvalidInfoHash {
                reason: format!("Invalid hash length: {} (expected 40)", s.len()),
            });
        }

        let decoded = hex::decode(s).map_err(|e| TorrentError::InvalidInfoHash {
            reason: format!("Invalid hex character in hash {s}: {e}"),
        })?;

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&decoded);
        Ok(Self(hash))
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors raised while turning a user-supplied source into a transfer source.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid magnet link: {reason}")]
    InvalidMagnetLink { reason: String },

    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Invalid info hash: {reason}")]
    InvalidInfoHash { reason: String },

    #[error("Unsupported source: {source_uri}")]
    UnsupportedSource { source_uri: String },

    #[error("I/O error reading {path}: {error}")]
    Io {
        path: String,
        #[source]
        error: std::io::Error,
    },
}
