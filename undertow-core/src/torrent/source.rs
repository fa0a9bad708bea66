//! Transfer sources.
//!
//! A source is resolved exactly once, when the transfer is added or
//! restored. After that the session manager only asks it for identity,
//! the descriptor to persist, and what to show until metadata arrives.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use super::parsing::{DescriptorParser, MagnetLink, MagnetParser, TorrentMetadata};
use super::{InfoHash, TorrentError};

/// Search result handed over by the discovery layer.
///
/// The session manager does not care which provider produced it; only
/// `source_uri` is interpreted, the rest is display information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredTorrent {
    pub name: String,
    pub size_hint: Option<String>,
    pub source_uri: String,
}

impl DiscoveredTorrent {
    pub fn new(name: impl Into<String>, source_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_hint: None,
            source_uri: source_uri.into(),
        }
    }

    pub fn with_size_hint(mut self, size_hint: impl Into<String>) -> Self {
        self.size_hint = Some(size_hint.into());
        self
    }
}

impl From<&str> for DiscoveredTorrent {
    fn from(source_uri: &str) -> Self {
        Self::new(String::new(), source_uri)
    }
}

/// A parsed magnet link or torrent descriptor.
#[derive(Debug, Clone)]
pub enum TransferSource {
    Magnet(MagnetLink),
    Descriptor {
        path: PathBuf,
        bytes: Bytes,
        metadata: TorrentMetadata,
    },
}

impl TransferSource {
    /// Resolves a magnet URI, `file://` URL or filesystem path.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMagnetLink` / `InvalidInfoHash` - Bad magnet URI
    /// - `TorrentError::InvalidTorrentFile` - Descriptor could not be decoded
    /// - `TorrentError::UnsupportedSource` - Some other URL scheme
    /// - `TorrentError::Io` - Descriptor file could not be read
    pub async fn resolve(source_uri: &str) -> Result<Self, TorrentError> {
        let trimmed = source_uri.trim();
        if trimmed.is_empty() {
            return Err(TorrentError::UnsupportedSource {
                source_uri: source_uri.to_string(),
            });
        }

        if trimmed.get(..7).is_some_and(|scheme| scheme.eq_ignore_ascii_case("magnet:")) {
            return MagnetParser::parse_magnet_link(trimmed).map(Self::Magnet);
        }

        let path = if trimmed.starts_with("file://") {
            Url::parse(trimmed)
                .ok()
                .and_then(|url| url.to_file_path().ok())
                .ok_or_else(|| TorrentError::UnsupportedSource {
                    source_uri: trimmed.to_string(),
                })?
        } else if trimmed.contains("://") {
            return Err(TorrentError::UnsupportedSource {
                source_uri: trimmed.to_string(),
            });
        } else {
            PathBuf::from(trimmed)
        };

        Self::read_descriptor(&path).await
    }

    /// Reads and parses a descriptor file from disk.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::InvalidTorrentFile` - Contents are not a valid descriptor
    pub async fn read_descriptor(path: &Path) -> Result<Self, TorrentError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|error| TorrentError::Io {
                path: path.display().to_string(),
                error,
            })?;
        Self::from_descriptor_bytes(path.to_path_buf(), Bytes::from(bytes))
    }

    /// Parses descriptor bytes already in memory.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Contents are not a valid descriptor
    pub fn from_descriptor_bytes(path: PathBuf, bytes: Bytes) -> Result<Self, TorrentError> {
        let metadata = DescriptorParser::parse(&bytes)?;
        Ok(Self::Descriptor {
            path,
            bytes,
            metadata,
        })
    }

    /// Content fingerprint; the transfer id.
    pub fn fingerprint(&self) -> InfoHash {
        match self {
            Self::Magnet(magnet) => magnet.info_hash,
            Self::Descriptor { metadata, .. } => metadata.info_hash,
        }
    }

    /// String persisted as the transfer's source URI.
    pub fn source_descriptor(&self) -> String {
        match self {
            Self::Magnet(magnet) => magnet.uri.clone(),
            Self::Descriptor { path, .. } => path.display().to_string(),
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            Self::Magnet(magnet) => magnet.display_name.as_deref(),
            Self::Descriptor { metadata, .. } => Some(&metadata.name),
        }
    }

    /// Best size known before the engine reports one.
    pub fn display_size(&self) -> Option<u64> {
        match self {
            Self::Magnet(magnet) => magnet.exact_length,
            Self::Descriptor { metadata, .. } => Some(metadata.total_length),
        }
    }

    pub fn trackers(&self) -> &[String] {
        match self {
            Self::Magnet(magnet) => &magnet.trackers,
            Self::Descriptor { metadata, .. } => &metadata.announce_urls,
        }
    }

    /// Full metadata, available up front only for descriptors.
    pub fn metadata(&self) -> Option<&TorrentMetadata> {
        match self {
            Self::Magnet(_) => None,
            Self::Descriptor { metadata, .. } => Some(metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Test&xl=4096";
    const DESCRIPTOR: &[u8] = b"d8:announce9:test:80804:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";

    #[tokio::test]
    async fn test_resolve_magnet() {
        let source = TransferSource::resolve(MAGNET).await.unwrap();

        assert_eq!(
            source.fingerprint().to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(source.display_name(), Some("Test"));
        assert_eq!(source.display_size(), Some(4096));
        assert_eq!(source.source_descriptor(), MAGNET);
        assert!(source.metadata().is_none());
    }

    #[tokio::test]
    async fn test_resolve_descriptor_path_and_file_url() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.torrent");
        tokio::fs::write(&path, DESCRIPTOR).await.unwrap();

        let by_path = TransferSource::resolve(path.to_str().unwrap()).await.unwrap();
        assert_eq!(by_path.display_name(), Some("test.txt"));
        assert_eq!(by_path.display_size(), Some(1000));
        assert_eq!(by_path.metadata().unwrap().files.len(), 1);

        let url = Url::from_file_path(&path).unwrap();
        let by_url = TransferSource::resolve(url.as_str()).await.unwrap();
        assert_eq!(by_url.fingerprint(), by_path.fingerprint());
    }

    #[tokio::test]
    async fn test_resolve_rejects_unusable_sources() {
        assert!(matches!(
            TransferSource::resolve("https://example.com/file.torrent").await,
            Err(TorrentError::UnsupportedSource { .. })
        ));
        assert!(matches!(
            TransferSource::resolve("/nonexistent/file.torrent").await,
            Err(TorrentError::Io { .. })
        ));
        assert!(TransferSource::resolve("   ").await.is_err());
    }

    #[test]
    fn test_discovered_torrent_from_str() {
        let discovered = DiscoveredTorrent::from(MAGNET);
        assert!(discovered.name.is_empty());
        assert_eq!(discovered.source_uri, MAGNET);

        let sized = DiscoveredTorrent::new("Name", MAGNET).with_size_hint("1.2 GB");
        assert_eq!(sized.size_hint.as_deref(), Some("1.2 GB"));
    }
}
