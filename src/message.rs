//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message framing and the typed payloads of the
//! peer wire protocol. All communication after the handshake uses these
//! messages.
//!
//! ## Message Structure
//!
//! Every message follows the same format:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Total length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! ## Message Types
//!
//! | ID | Name | Description |
//! |----|------|-------------|
//! | 0 | CHOKE | Peer will not send pieces (no payload) |
//! | 1 | UNCHOKE | Peer will send pieces (no payload) |
//! | 2 | INTERESTED | Client wants to download (no payload) |
//! | 3 | NOT INTERESTED | Client doesn't want to download (no payload) |
//! | 4 | HAVE | Peer has a piece (payload: piece index) |
//! | 5 | BITFIELD | Peer's piece availability (payload: bitfield) |
//! | 6 | REQUEST | Request a block (payload: index, begin, length) |
//! | 7 | PIECE | Block data (payload: index, begin, data) |
//! | 8 | CANCEL | Cancel a request (payload: index, begin, length) |
//! | 20 | EXTENSION | BEP-10 envelope (payload: sub-id, bencoded body) |
//!
//! ## Keep-Alive Messages
//!
//! A keep-alive message has length 0 and no ID or payload. Internally it is
//! carried with a sentinel ID (255) distinct from every real message ID.
//!
//! ## Extension Envelope (BEP-10)
//!
//! Extended messages share wire ID 20 and carry their own sub-ID space:
//! the first payload byte selects the sub-protocol, the rest is a bencoded
//! body. The `ut_metadata` (BEP-9) handshake and data messages are both
//! shaped this way; a data message appends the raw metadata bytes after its
//! bencoded header, so body decoding tolerates trailing input.

use crate::bencode;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use serde_bencode::value::Value;
use std::io::Cursor;

type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
#[allow(dead_code)]
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_EXTENSION: MessageId = 20;
pub const MESSAGE_KEEPALIVE: MessageId = 255; // Special value for keep-alive (length 0)

// Refuse to allocate frames above this size. Large enough for a block
// message (16 KiB + header), a metadata data message and any realistic
// bitfield, small enough to reject garbage length prefixes.
pub const MESSAGE_SIZE_MAX: usize = 1 << 20;

#[derive(Default, Debug, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without payload.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    ///
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    /// * `payload` - The content of the message.
    ///
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize message.
    ///
    /// A keep-alive serializes to a bare zero length prefix.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut serialized: Vec<u8> = vec![];

        if self.id == MESSAGE_KEEPALIVE {
            serialized.write_u32::<BigEndian>(0)?;
            return Ok(serialized);
        }

        // Add message length
        let message_len = 1 + self.payload.len();
        serialized.write_u32::<BigEndian>(message_len as u32)?;

        // Add message id
        serialized.push(self.id);

        // Add message payload
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }
}

/// Deserialize a message from the bytes following the length prefix.
///
/// # Arguments
///
/// * `message_buf` - The message id and payload bytes.
///
pub fn deserialize_message(message_buf: &[u8]) -> Result<Message> {
    // A zero-length frame is a keep-alive
    if message_buf.is_empty() {
        return Ok(Message::new(MESSAGE_KEEPALIVE));
    }

    // Get message id
    let id: MessageId = message_buf[0];
    // Get message payload
    let payload: MessagePayload = message_buf[1..].to_vec();

    Ok(Message::new_with_payload(id, payload))
}

/// Payload of a REQUEST (or CANCEL) message: three big-endian u32 fields.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestPayload {
    /// Zero-based piece index
    pub index: u32,
    /// Zero-based byte offset within the piece
    pub begin: u32,
    /// Number of bytes requested
    pub length: u32,
}

impl RequestPayload {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        RequestPayload {
            index,
            begin,
            length,
        }
    }

    /// Serialize the payload as three big-endian u32 fields.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut serialized: Vec<u8> = Vec::with_capacity(12);
        serialized.write_u32::<BigEndian>(self.index)?;
        serialized.write_u32::<BigEndian>(self.begin)?;
        serialized.write_u32::<BigEndian>(self.length)?;
        Ok(serialized)
    }
}

/// Payload of a PIECE message: two big-endian u32 fields, then block bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct PiecePayload {
    /// Zero-based piece index
    pub index: u32,
    /// Zero-based byte offset within the piece
    pub begin: u32,
    /// Raw block bytes
    pub block: Vec<u8>,
}

/// Deserialize a PIECE payload.
///
/// # Arguments
///
/// * `payload` - The payload bytes of a PIECE message.
///
pub fn deserialize_piece_payload(payload: &[u8]) -> Result<PiecePayload> {
    if payload.len() < 8 {
        return Err(anyhow!("received invalid MESSAGE_PIECE from peer"));
    }

    let mut cursor = Cursor::new(&payload[0..8]);
    let index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()?;
    let block = payload[8..].to_vec();

    Ok(PiecePayload {
        index,
        begin,
        block,
    })
}

/// Body of the BEP-10 extension handshake: advertises our `ut_metadata` id.
#[derive(Serialize)]
struct ExtensionHandshake {
    m: ExtensionIds,
}

#[derive(Serialize)]
struct ExtensionIds {
    ut_metadata: u8,
}

/// Body of a `ut_metadata` request (`msg_type` 0 asks for a metadata piece).
#[derive(Serialize)]
struct MetadataRequest {
    msg_type: u8,
    piece: u32,
}

// Our advertised ut_metadata sub-id, echoed back by peers in data messages
const UT_METADATA_ID: u8 = 1;

/// A BEP-10 extended message: one sub-protocol id byte, then a bencoded body.
pub struct ExtensionPayload {
    /// Extension sub-protocol identifier (0 is the extension handshake)
    pub message_id: u8,
    /// Bencoded body bytes, possibly followed by raw trailing data
    pub body: Vec<u8>,
}

impl ExtensionPayload {
    /// Build the extension handshake advertising `ut_metadata` support.
    pub fn handshake() -> Result<ExtensionPayload> {
        let body = ExtensionHandshake {
            m: ExtensionIds {
                ut_metadata: UT_METADATA_ID,
            },
        };

        Ok(ExtensionPayload {
            message_id: 0,
            body: bencode::encode(&body)?,
        })
    }

    /// Build a metadata request for one metadata piece.
    ///
    /// # Arguments
    ///
    /// * `extension_id` - The `ut_metadata` id the peer advertised.
    /// * `piece` - The metadata piece index to request.
    ///
    pub fn metadata_request(extension_id: u8, piece: u32) -> Result<ExtensionPayload> {
        let body = MetadataRequest { msg_type: 0, piece };

        Ok(ExtensionPayload {
            message_id: extension_id,
            body: bencode::encode(&body)?,
        })
    }

    /// Serialize the extension payload.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut serialized: Vec<u8> = Vec::with_capacity(1 + self.body.len());
        serialized.push(self.message_id);
        serialized.extend_from_slice(&self.body);
        Ok(serialized)
    }

    /// Deserialize an extension payload from a MESSAGE_EXTENSION payload.
    pub fn deserialize(payload: &[u8]) -> Result<ExtensionPayload> {
        if payload.is_empty() {
            return Err(anyhow!("received invalid extension message from peer"));
        }

        Ok(ExtensionPayload {
            message_id: payload[0],
            body: payload[1..].to_vec(),
        })
    }

    /// Decode the leading bencoded value of the body.
    ///
    /// Metadata data messages append the raw metadata after the header, so
    /// trailing bytes are expected and ignored here.
    pub fn decode_body(&self) -> Result<Value> {
        bencode::decode(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{as_int, dict_get};

    #[test]
    fn serialize_message_with_payload() {
        let message = Message::new_with_payload(MESSAGE_HAVE, vec![0, 0, 0, 7]);
        let serialized = message.serialize().unwrap();
        assert_eq!(serialized, vec![0, 0, 0, 5, 4, 0, 0, 0, 7]);
    }

    #[test]
    fn serialize_keepalive_is_zero_length_frame() {
        let serialized = Message::new(MESSAGE_KEEPALIVE).serialize().unwrap();
        assert_eq!(serialized, vec![0, 0, 0, 0]);
    }

    #[test]
    fn message_round_trips() {
        let message = Message::new_with_payload(MESSAGE_BITFIELD, vec![0b1010_0000]);
        let serialized = message.serialize().unwrap();
        // Strip the length prefix, as the session reader does
        let decoded = deserialize_message(&serialized[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn keepalive_round_trips() {
        let decoded = deserialize_message(&[]).unwrap();
        assert_eq!(decoded.id, MESSAGE_KEEPALIVE);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn request_payload_is_three_big_endian_u32() {
        let payload = RequestPayload::new(1, 16384, 16384).serialize().unwrap();
        assert_eq!(
            payload,
            vec![0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn piece_payload_splits_header_and_block() {
        let mut payload = vec![0, 0, 0, 2, 0, 0, 0x40, 0];
        payload.extend_from_slice(b"block bytes");

        let decoded = deserialize_piece_payload(&payload).unwrap();
        assert_eq!(decoded.index, 2);
        assert_eq!(decoded.begin, 16384);
        assert_eq!(decoded.block, b"block bytes");
    }

    #[test]
    fn piece_payload_rejects_short_header() {
        assert!(deserialize_piece_payload(&[0, 0, 0, 1]).is_err());
    }

    #[test]
    fn extension_handshake_advertises_ut_metadata() {
        let payload = ExtensionPayload::handshake().unwrap();
        assert_eq!(payload.message_id, 0);
        assert_eq!(payload.body, b"d1:md11:ut_metadatai1eee");
    }

    #[test]
    fn metadata_request_body() {
        let payload = ExtensionPayload::metadata_request(3, 0).unwrap();
        assert_eq!(payload.message_id, 3);
        assert_eq!(payload.body, b"d8:msg_typei0e5:piecei0ee");
    }

    #[test]
    fn extension_payload_round_trips() {
        let payload = ExtensionPayload::handshake().unwrap();
        let serialized = payload.serialize().unwrap();
        let decoded = ExtensionPayload::deserialize(&serialized).unwrap();
        assert_eq!(decoded.message_id, 0);
        assert_eq!(decoded.body, payload.body);
    }

    #[test]
    fn decode_body_ignores_trailing_metadata() {
        let mut body = b"d8:msg_typei1e5:piecei0e10:total_sizei4ee".to_vec();
        body.extend_from_slice(b"meta");

        let payload = ExtensionPayload {
            message_id: 1,
            body,
        };
        let decoded = payload.decode_body().unwrap();
        assert_eq!(dict_get(&decoded, "msg_type").and_then(as_int), Some(1));
        assert_eq!(dict_get(&decoded, "total_size").and_then(as_int), Some(4));
    }
}
