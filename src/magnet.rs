//! # Magnet Link Parsing
//!
//! This module extracts the tracker URL and info hash from a magnet URI.
//!
//! ## Magnet URI Format
//!
//! ```text
//! magnet:?xt=urn:btih:<40 hex digits>&dn=<name>&tr=<tracker url>
//! ```
//!
//! Only `xt` (the info hash) and `tr` (the tracker) matter here. A magnet
//! link carries no metainfo: the `info` dictionary must be fetched from a
//! peer through the metadata extension before any piece can be verified.
//! When several `tr` parameters are present the first one is used.

use anyhow::{anyhow, Result};
use url::Url;

const BTIH_PREFIX: &str = "urn:btih:";

/// Represents a parsed magnet link.
pub struct Magnet {
    /// URL of the tracker
    pub tracker_url: String,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
}

impl Magnet {
    /// Parse a magnet URI.
    ///
    /// # Arguments
    ///
    /// * `link` - The magnet URI.
    ///
    pub fn parse(link: &str) -> Result<Magnet> {
        let url = match Url::parse(link) {
            Ok(url) => url,
            Err(_) => return Err(anyhow!("could not parse magnet link")),
        };

        if url.scheme() != "magnet" {
            return Err(anyhow!("could not parse magnet link"));
        }

        let mut info_hash: Option<Vec<u8>> = None;
        let mut tracker_url: Option<String> = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    let hex_digest = value
                        .strip_prefix(BTIH_PREFIX)
                        .ok_or_else(|| anyhow!("magnet link has no btih info hash"))?;
                    if hex_digest.len() != 40 {
                        return Err(anyhow!("magnet info hash must be 40 hex digits"));
                    }
                    let digest = hex::decode(hex_digest)
                        .map_err(|_| anyhow!("magnet info hash must be 40 hex digits"))?;
                    info_hash = Some(digest);
                }
                // Keep the first tracker, ignore the others
                "tr" if tracker_url.is_none() => {
                    tracker_url = Some(value.into_owned());
                }
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| anyhow!("magnet link has no info hash"))?;
        let tracker_url = tracker_url.ok_or_else(|| anyhow!("magnet link has no tracker"))?;

        Ok(Magnet {
            tracker_url,
            info_hash,
        })
    }
}
