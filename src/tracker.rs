//! # Tracker Communication
//!
//! This module discovers peers by announcing to HTTP trackers.
//!
//! ## Announce Request
//!
//! The announce is an HTTP GET against the tracker URL with the query
//! parameters `info_hash` (raw 20 bytes, percent-encoded), `peer_id`,
//! `port`, `uploaded`, `downloaded`, `left` and `compact=1`. The response is
//! a bencoded dictionary whose `peers` entry packs one 6-byte record per
//! peer (4-byte IPv4, 2-byte big-endian port).
//!
//! ## Multiple Trackers
//!
//! All known tracker URLs are queried in parallel, one thread per tracker.
//! Responses are merged and the peers deduplicated by `(ip, port)`; a single
//! reachable tracker is enough for the announce to succeed.
//!
//! ## Peer Identity
//!
//! The 20-byte peer id is generated once per process from random bytes and
//! reused across every announce and handshake.

use crate::peer::{build_peers, Peer};

use anyhow::{anyhow, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

// Default port for BitTorrent client connections
pub const PORT: u16 = 6881;

/// BencodeTracker structure.
#[derive(Debug, Deserialize, Serialize)]
struct BencodeTracker {
    // Interval time to refresh the list of peers in seconds
    #[serde(default)]
    interval: u32,
    // Peers IP addresses
    peers: ByteBuf,
}

/// Returns the process-wide 20-byte peer id.
///
/// Generated from random bytes on first use; every later call returns the
/// same bytes.
pub fn peer_id() -> &'static [u8; 20] {
    static PEER_ID: OnceLock<[u8; 20]> = OnceLock::new();

    PEER_ID.get_or_init(|| {
        let mut peer_id = [0u8; 20];
        let mut rng = rand::thread_rng();
        for x in peer_id.iter_mut() {
            *x = rng.gen();
        }
        peer_id
    })
}

/// Request peers from trackers.
///
/// # Arguments
///
/// * `tracker_urls` - The tracker URLs to announce to.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `left` - Number of bytes left to download (1 for magnet flows, where
///   the length is not yet known).
///
pub fn request_peers(tracker_urls: &[String], info_hash: &[u8], left: u32) -> Result<Vec<Peer>> {
    if tracker_urls.is_empty() {
        return Err(anyhow!("no tracker URLs available"));
    }

    // Shared storage for peers bytes from successful tracker responses
    let all_peers_bytes = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();

    // Query all trackers in parallel
    for tracker_url in tracker_urls {
        let tracker_url = tracker_url.clone();
        let info_hash = info_hash.to_vec();
        let all_peers_bytes = Arc::clone(&all_peers_bytes);

        let handle = thread::spawn(move || {
            let peers_bytes = match announce(&tracker_url, &info_hash, left) {
                Ok(peers_bytes) => peers_bytes,
                Err(e) => {
                    debug!("tracker {} failed: {}", tracker_url, e);
                    return;
                }
            };

            // Store the peers bytes
            if let Ok(mut guard) = all_peers_bytes.lock() {
                guard.push(peers_bytes);
            }
        });

        handles.push(handle);
    }

    // Wait for all threads to complete
    for handle in handles {
        let _ = handle.join();
    }

    // Collect all peers from the responses
    let all_peers_bytes = all_peers_bytes
        .lock()
        .map_err(|_| anyhow!("could not collect tracker responses"))?;
    let mut all_peers = Vec::new();
    for peers_bytes in all_peers_bytes.iter() {
        match build_peers(peers_bytes) {
            Ok(mut peers) => all_peers.append(&mut peers),
            Err(_) => continue, // skip invalid peers
        }
    }

    if all_peers.is_empty() {
        return Err(anyhow!("could not get peers from any tracker"));
    }

    // Deduplicate peers by (ip, port)
    let mut unique_peers = HashSet::new();
    let mut deduped_peers = Vec::new();
    for peer in all_peers {
        if unique_peers.insert((peer.ip, peer.port)) {
            deduped_peers.push(peer);
        }
    }

    // Assign sequential IDs
    for (i, peer) in deduped_peers.iter_mut().enumerate() {
        peer.id = i as u32;
    }

    Ok(deduped_peers)
}

/// Announce to a single tracker and return its compact peer bytes.
fn announce(tracker_url: &str, info_hash: &[u8], left: u32) -> Result<Vec<u8>> {
    let full_url = build_tracker_url(tracker_url, info_hash, left)?;

    // Build blocking HTTP client
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
    {
        Ok(client) => client,
        Err(_) => return Err(anyhow!("could not build http client")),
    };

    // Send GET request to the tracker
    let response = match client.get(&full_url).send() {
        Ok(response) => match response.bytes() {
            Ok(bytes) => bytes,
            Err(_) => return Err(anyhow!("could not reach tracker")),
        },
        Err(_) => return Err(anyhow!("could not reach tracker")),
    };

    // Deserialize bencoded tracker response
    let tracker_bencode = match de::from_bytes::<BencodeTracker>(&response) {
        Ok(bencode) => bencode,
        Err(_) => return Err(anyhow!("could not decode tracker response")),
    };

    debug!(
        "tracker {} returned {} peer bytes (interval {}s)",
        tracker_url,
        tracker_bencode.peers.len(),
        tracker_bencode.interval
    );

    Ok(tracker_bencode.peers.to_vec())
}

/// Build tracker URL.
///
/// # Arguments
///
/// * `announce` - The tracker URL.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `left` - Number of bytes left to download.
///
fn build_tracker_url(announce: &str, info_hash: &[u8], left: u32) -> Result<String> {
    /// Each byte is encoded as %XX where XX is the hexadecimal representation
    fn percent_encode_binary(data: &[u8]) -> String {
        const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
        let mut encoded = String::with_capacity(data.len() * 3);

        for &byte in data {
            encoded.push('%');
            // Extract high nibble (first 4 bits) and convert to hex digit
            encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            // Extract low nibble (last 4 bits) and convert to hex digit
            encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
        }

        encoded
    }

    // Parse tracker URL from torrent
    let base_url = match Url::parse(announce) {
        Ok(url) => url,
        Err(_) => return Err(anyhow!("could not parse tracker url")),
    };

    // Build query string manually to handle binary data properly
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id()),
        PORT,
        left
    );

    let mut url = base_url.to_string();
    if url.contains('?') {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_stable() {
        let first = peer_id();
        let second = peer_id();
        assert_eq!(first, second);
        assert_eq!(first.len(), 20);
    }

    #[test]
    fn tracker_url_percent_encodes_info_hash() {
        let info_hash = vec![0x00, 0x10, 0xab, 0xff];
        let url = build_tracker_url("http://tracker.example/announce", &info_hash, 92063).unwrap();

        assert!(url.starts_with("http://tracker.example/announce?"));
        assert!(url.contains("info_hash=%00%10%AB%FF"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=0"));
        assert!(url.contains("downloaded=0"));
        assert!(url.contains("left=92063"));
        assert!(url.contains("compact=1"));
    }

    #[test]
    fn tracker_url_appends_to_existing_query() {
        let url = build_tracker_url("http://tracker.example/announce?key=abc", &[0x01], 1).unwrap();
        assert!(url.contains("?key=abc&info_hash=%01"));
    }

    #[test]
    fn tracker_url_rejects_garbage() {
        assert!(build_tracker_url("not a url", &[0x01], 1).is_err());
    }

    #[test]
    fn request_peers_requires_urls() {
        assert!(request_peers(&[], &[0u8; 20], 1).is_err());
    }
}
