//! Magnet link parsing

use url::Url;

use super::types::MagnetLink;
use crate::torrent::{InfoHash, TorrentError};

const BTIH_PREFIX: &str = "urn:btih:";

/// Magnet link parsing utilities.
pub struct MagnetParser;

impl MagnetParser {
    /// Parses magnet link to extract torrent information.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMagnetLink` - Malformed magnet URI or missing `xt`
    /// - `TorrentError::InvalidInfoHash` - `xt` present but not a 40-char hex hash
    pub fn parse_magnet_link(magnet_url: &str) -> Result<MagnetLink, TorrentError> {
        magnet_url::Magnet::new(magnet_url).map_err(|e| TorrentError::InvalidMagnetLink {
            reason: format!("{e}"),
        })?;

        let query = Url::parse(magnet_url).map_err(|e| TorrentError::InvalidMagnetLink {
            reason: e.to_string(),
        })?;

        let info_hash = Self::extract_info_hash(&query)?;
        let mut display_name = None;
        let mut exact_length = None;
        let mut trackers: Vec<String> = Vec::new();

        // query_pairs applies form decoding, so `+` and `%20` both become spaces
        for (key, value) in query.query_pairs() {
            match key.as_ref() {
                "dn" if !value.trim().is_empty() => display_name = Some(value.into_owned()),
                "xl" => exact_length = value.parse::<u64>().ok(),
                "tr" if !trackers.iter().any(|known| known.as_str() == value.as_ref()) => {
                    trackers.push(value.into_owned())
                }
                _ => {}
            }
        }

        Ok(MagnetLink {
            info_hash,
            display_name,
            exact_length,
            trackers,
            uri: magnet_url.to_string(),
        })
    }

    /// Builds a magnet URI for a bare fingerprint plus trackers.
    pub fn build_magnet_uri(info_hash: InfoHash, name: Option<&str>, trackers: &[String]) -> String {
        let mut uri = format!("magnet:?xt={BTIH_PREFIX}{info_hash}");
        if let Some(name) = name {
            uri.push_str("&dn=");
            uri.push_str(&urlencoding::encode(name));
        }
        for tracker in trackers {
            uri.push_str("&tr=");
            uri.push_str(&urlencoding::encode(tracker));
        }
        uri
    }

    fn extract_info_hash(query: &Url) -> Result<InfoHash, TorrentError> {
        for (key, value) in query.query_pairs() {
            if key != "xt" {
                continue;
            }
            if let Some(hash) = value.strip_prefix(BTIH_PREFIX) {
                return hash.parse();
            }
        }

        Err(TorrentError::InvalidMagnetLink {
            reason: format!("Missing or invalid info hash in magnet link: {query}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnet_link_parsing() {
        let magnet_url = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Test%20Torrent&tr=http://tracker.example.com/announce";
        let magnet = MagnetParser::parse_magnet_link(magnet_url).unwrap();

        assert_eq!(
            magnet.info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(magnet.display_name, Some("Test Torrent".to_string()));
        assert_eq!(magnet.trackers, vec!["http://tracker.example.com/announce"]);
        assert_eq!(magnet.uri, magnet_url);
    }

    #[test]
    fn test_display_name_plus_signs_become_spaces() {
        let magnet_url = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Night+Of+The+Comet+1984";
        let magnet = MagnetParser::parse_magnet_link(magnet_url).unwrap();
        assert_eq!(
            magnet.display_name.as_deref(),
            Some("Night Of The Comet 1984")
        );
    }

    #[test]
    fn test_invalid_magnet_link() {
        assert!(MagnetParser::parse_magnet_link("invalid://not-a-magnet").is_err());
    }

    #[test]
    fn test_magnet_link_without_info_hash() {
        let result = MagnetParser::parse_magnet_link(
            "magnet:?dn=Test%20Torrent&tr=http://tracker.example.com/announce",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_magnet_link_invalid_hash_length() {
        let result = MagnetParser::parse_magnet_link("magnet:?xt=urn:btih:tooshort&dn=Test");
        assert!(result.is_err());
    }

    #[test]
    fn test_build_magnet_uri_parses_back() {
        let info_hash = InfoHash::new([7u8; 20]);
        let uri = MagnetParser::build_magnet_uri(
            info_hash,
            Some("Some Name"),
            &["udp://tracker.example.com:1337/announce".to_string()],
        );

        let magnet = MagnetParser::parse_magnet_link(&uri).unwrap();
        assert_eq!(magnet.info_hash, info_hash);
        assert_eq!(magnet.display_name.as_deref(), Some("Some Name"));
        assert_eq!(magnet.trackers.len(), 1);
    }
}
