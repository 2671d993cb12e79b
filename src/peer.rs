//! # BitTorrent Peer Information
//!
//! This module defines the `Peer` structure and the parsing of peer
//! addresses, both from the compact binary lists trackers return and from
//! `ip:port` text given on the command line.
//!
//! ## Compact Peer Format
//!
//! The compact format consists of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! - IP address in network byte order (big-endian)
//! - Port number in network byte order (big-endian)

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::fmt;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddrV4};

const PEER_SIZE: usize = 6;

type PeerId = u32;

/// Represents a BitTorrent peer in the swarm.
///
/// Contains the network information needed to connect to a peer and a unique
/// identifier for internal tracking purposes.
#[derive(Clone)]
pub struct Peer {
    /// Unique identifier assigned to this peer for internal tracking
    pub id: PeerId,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    /// Creates a new peer with default/placeholder values.
    ///
    /// Used as a template when parsing peer lists from tracker responses.
    /// The actual values are filled in during parsing.
    pub fn new() -> Peer {
        Peer {
            id: 0,
            ip: Ipv4Addr::new(1, 1, 1, 1),
            port: 0,
        }
    }

    /// Parses a peer from `"a.b.c.d:port"` text.
    ///
    /// # Arguments
    ///
    /// * `addr` - The peer address as given on the command line.
    ///
    pub fn from_addr(addr: &str) -> Result<Peer> {
        let socket: SocketAddrV4 = match addr.parse() {
            Ok(socket) => socket,
            Err(_) => return Err(anyhow!("could not parse peer address")),
        };

        Ok(Peer {
            id: 0,
            ip: *socket.ip(),
            port: socket.port(),
        })
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parses a compact peer list from a tracker response into Peer structures.
///
/// # Arguments
///
/// * `tracker_peers` - Compact binary peer list where each peer is 6 bytes:
///   - Bytes 0-3: IPv4 address (big-endian)
///   - Bytes 4-5: Port number (big-endian)
///
/// # Errors
///
/// Returns an error if the peer list length is not a multiple of 6 bytes.
pub fn build_peers(tracker_peers: &[u8]) -> Result<Vec<Peer>> {
    // Check tracker peers are valid
    if !tracker_peers.len().is_multiple_of(PEER_SIZE) {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    // Get number of peers
    let nb_peers = tracker_peers.len() / PEER_SIZE;

    // Build peers
    let mut peers: Vec<Peer> = vec![Peer::new(); nb_peers];

    for (i, peer) in peers.iter_mut().enumerate().take(nb_peers) {
        // Create peer ID
        peer.id = i as u32;

        let offset = i * PEER_SIZE;

        // Read peer IP address
        peer.ip = Ipv4Addr::new(
            tracker_peers[offset],
            tracker_peers[offset + 1],
            tracker_peers[offset + 2],
            tracker_peers[offset + 3],
        );

        // Read peer port
        let port_bytes = &tracker_peers[offset + 4..offset + 6];
        let mut port_cursor = Cursor::new(port_bytes);
        peer.port = port_cursor.read_u16::<BigEndian>()?;
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_peers_expands_six_byte_records() {
        let compact = vec![192, 168, 1, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80];
        let peers = build_peers(&compact).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(peers[1].port, 80);
    }

    #[test]
    fn build_peers_rejects_truncated_records() {
        assert!(build_peers(&[192, 168, 1, 1, 0x1a]).is_err());
    }

    #[test]
    fn build_peers_recompacts_to_identity() {
        let compact = vec![1, 2, 3, 4, 0x1f, 0x90, 5, 6, 7, 8, 0, 80];
        let peers = build_peers(&compact).unwrap();

        // Re-compacting the expansion yields the original bytes
        let mut recompacted = Vec::new();
        for peer in &peers {
            recompacted.extend_from_slice(&peer.ip.octets());
            recompacted.extend_from_slice(&peer.port.to_be_bytes());
        }
        assert_eq!(recompacted, compact);
    }

    #[test]
    fn from_addr_parses_and_displays() {
        let peer = Peer::from_addr("178.62.85.20:51489").unwrap();
        assert_eq!(peer.ip, Ipv4Addr::new(178, 62, 85, 20));
        assert_eq!(peer.port, 51489);
        assert_eq!(peer.to_string(), "178.62.85.20:51489");
    }

    #[test]
    fn from_addr_rejects_garbage() {
        assert!(Peer::from_addr("not-an-address").is_err());
        assert!(Peer::from_addr("1.2.3.4").is_err());
    }
}
