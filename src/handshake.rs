//! # BitTorrent Handshake Protocol
//!
//! This module implements the handshake exchanged immediately after a TCP
//! connection is established between peers.
//!
//! ## Message Format
//!
//! The handshake is a fixed 68-byte message for the standard protocol string:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of protocol string (19)
//! - **pstr**: Variable - Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - Extension negotiation bits
//! - **info_hash**: 20 bytes - SHA-1 hash of torrent info dictionary
//! - **peer_id**: 20 bytes - Unique identifier for the peer
//!
//! ## Reserved Bytes
//!
//! Bit 0x10 of reserved byte 5 advertises support for extended messaging
//! (BEP-10). The magnet flow sets it when dialing and requires the remote
//! peer to assert it back, since fetching metadata needs the extension
//! protocol. All other bits are left at zero.

use anyhow::{anyhow, Result};

const PROTOCOL_ID: &str = "BitTorrent protocol";

// Reserved byte carrying the extended-messaging bit (BEP-10)
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// Represents a BitTorrent handshake message.
pub struct Handshake {
    /// Length of the protocol identifier string (usually 19)
    pub pstrlen: usize,
    /// Protocol identifier bytes ("BitTorrent protocol")
    pub pstr: Vec<u8>,
    /// 8 reserved bytes for protocol extensions
    pub reserved: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte unique identifier for this peer
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Creates a new handshake message with all reserved bits cleared.
    ///
    /// # Arguments
    ///
    /// * `peer_id` - 20-byte unique identifier for this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary.
    ///
    pub fn new(peer_id: Vec<u8>, info_hash: Vec<u8>) -> Self {
        let pstr = String::from(PROTOCOL_ID).into_bytes();
        let pstrlen = pstr.len();
        let reserved: Vec<u8> = vec![0; 8];

        Handshake {
            pstrlen,
            pstr,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Creates a new handshake message advertising extended-messaging support.
    ///
    /// Used by the magnet flow, which needs the BEP-10 envelope to request
    /// the metadata dictionary from the peer.
    pub fn with_extensions(peer_id: Vec<u8>, info_hash: Vec<u8>) -> Self {
        let mut handshake = Handshake::new(peer_id, info_hash);
        handshake.reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        handshake
    }

    /// Returns whether this handshake asserts extended-messaging support.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Serialize handshake.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut serialized: Vec<u8> = Vec::with_capacity(49 + self.pstrlen);

        // Add pstrlen
        serialized.push(self.pstrlen as u8);

        // Add pstr
        serialized.extend_from_slice(&self.pstr);

        // Add reserved
        serialized.extend_from_slice(&self.reserved);

        // Add info hash
        serialized.extend_from_slice(&self.info_hash);

        // Add peer id
        serialized.extend_from_slice(&self.peer_id);

        Ok(serialized)
    }
}

/// Deserialize a handshake from the bytes following the pstrlen prefix.
///
/// The buffer must hold exactly `pstrlen + 48` bytes: the protocol string,
/// 8 reserved bytes, the 20-byte info hash and the 20-byte peer id.
///
/// # Arguments
///
/// * `buf` - Byte buffer containing the handshake without its length prefix.
/// * `pstrlen` - Length of the protocol string (first byte of the handshake).
///
pub fn deserialize_handshake(buf: &[u8], pstrlen: usize) -> Result<Handshake> {
    if buf.len() != pstrlen + 48 {
        return Err(anyhow!("received invalid handshake length from peer"));
    }

    // Get pstr
    let pstr = buf[0..pstrlen].to_vec();
    // Get reserved
    let reserved = buf[pstrlen..(pstrlen + 8)].to_vec();
    // Get info hash
    let info_hash = buf[(pstrlen + 8)..(pstrlen + 8 + 20)].to_vec();
    // Get peer id
    let peer_id = buf[(pstrlen + 8 + 20)..].to_vec();

    let handshake = Handshake {
        pstrlen,
        pstr,
        reserved,
        info_hash,
        peer_id,
    };

    Ok(handshake)
}
