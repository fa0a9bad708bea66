//! Magnet link and torrent descriptor parsing.
//!
//! Magnet URIs go through magnet-url for validation; descriptors are decoded
//! with bencode-rs and fingerprinted with SHA-1 over the raw info dictionary.

pub mod descriptor;
pub mod magnet;
pub mod types;

pub use descriptor::DescriptorParser;
pub use magnet::MagnetParser;
pub use types::{MagnetLink, TorrentFile, TorrentMetadata};
