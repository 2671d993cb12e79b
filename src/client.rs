//! # BitTorrent Peer Session
//!
//! This module implements the client side of one peer connection: the TCP
//! dial, the handshake exchange, and the message traffic that brings the
//! session to the point where blocks can be requested.
//!
//! ## Session Progression
//!
//! ```text
//! connect -> handshake -> bitfield -> interested -> unchoke -> block requests
//! ```
//!
//! Magnet flows insert the BEP-10 steps between the bitfield and the
//! interest negotiation: an extension handshake advertising `ut_metadata`,
//! then a metadata request whose reply carries the torrent's `info`
//! dictionary.
//!
//! ## Bitfield Encoding
//!
//! The bitfield is a compact representation of piece availability:
//!
//! - Each byte represents 8 pieces
//! - Bit 7 (MSB) = piece index 0, bit 0 (LSB) = piece index 7
//! - Set bits indicate available pieces, clear bits indicate missing pieces
//!
//! `have` messages received later update the same map.
//!
//! ## Error Handling
//!
//! Every read is an exact-length fill: a short read means the peer closed
//! the connection and fails the operation. Frames with a length prefix above
//! the codec cap are refused before any allocation. A `choke` received while
//! waiting for a block fails the transfer so the task can be re-enqueued.

use crate::handshake::*;
use crate::message::*;
use crate::peer::*;
use crate::tracker;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

/// Represents a session with a remote BitTorrent peer.
///
/// Owns the TCP connection for its lifetime and tracks the per-connection
/// protocol state: the peer's piece availability and the choke flag.
pub struct Client {
    /// Information about the remote peer (IP, port, ID)
    peer: Peer,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Bitfield indicating which pieces the peer has (compact boolean array)
    bitfield: Vec<u8>,
    /// Whether the peer has choked this client (preventing downloads)
    choked: bool,
    /// Whether the peer asserted extended-messaging support (BEP-10)
    extensions: bool,
    /// 20-byte identifier the peer sent in its handshake
    remote_peer_id: Vec<u8>,
}

impl Client {
    /// Creates a new client and establishes a TCP connection to a peer.
    ///
    /// # Arguments
    ///
    /// * `peer` - Peer information including IP address and port.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary.
    ///
    pub fn new(peer: Peer, info_hash: Vec<u8>) -> Result<Client> {
        // Open connection with remote peer
        let peer_socket = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = match TcpStream::connect_timeout(&peer_socket, Duration::from_secs(15)) {
            Ok(conn) => conn,
            Err(_) => return Err(anyhow!("could not connect to peer")),
        };

        info!("Connected to peer {}", peer);

        let client = Client {
            peer,
            info_hash,
            conn,
            bitfield: vec![],
            choked: true,
            extensions: false,
            remote_peer_id: vec![],
        };

        Ok(client)
    }

    /// Dials a peer for a magnet flow and negotiates the metadata extension.
    ///
    /// Performs the base handshake with the extension bit set, reads the
    /// bitfield, then runs the BEP-10 handshake. Returns the ready session
    /// and the peer's advertised `ut_metadata` id.
    pub fn dial_magnet(peer: Peer, info_hash: Vec<u8>) -> Result<(Client, u8)> {
        let mut client = Client::new(peer, info_hash)?;
        client.set_connection_timeout(30)?;
        client.handshake_with_peer(true)?;
        client.read_bitfield()?;
        let extension_id = client.extension_handshake()?;

        Ok((client, extension_id))
    }

    /// Returns the 20-byte peer id the remote side sent in its handshake.
    pub fn remote_peer_id(&self) -> &[u8] {
        &self.remote_peer_id
    }

    /// Returns whether this client is choked by the peer.
    ///
    /// A choked client cannot request pieces from the peer until unchoked.
    #[allow(dead_code)]
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Checks if the peer has a specific piece available for download.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index to check.
    ///
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = index / 8;
        let offset = index % 8;

        // Prevent unbounded values
        if byte_index < self.bitfield.len() as u32 {
            // Check for piece index into bitfield
            return self.bitfield[byte_index as usize] >> (7 - offset) as u8 & 1 != 0;
        }
        false
    }

    /// Marks a piece as available in the peer's bitfield.
    ///
    /// Resizes the bitfield if the piece index exceeds current capacity.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index to mark as available.
    ///
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = index / 8;
        let offset = index % 8;

        // Resize bitfield if needed to accommodate the piece index
        if byte_index >= self.bitfield.len() as u32 {
            let additional_bytes = (byte_index as usize) - self.bitfield.len() + 1;
            self.bitfield.extend(vec![0; additional_bytes]);
        }

        // Set piece index into bitfield
        self.bitfield[byte_index as usize] |= (1 << (7 - offset)) as u8;
    }

    /// Sets read and write timeouts on the TCP connection.
    ///
    /// # Arguments
    ///
    /// * `secs` - Timeout duration in seconds.
    ///
    pub fn set_connection_timeout(&self, secs: u64) -> Result<()> {
        // Set write timeout
        if self
            .conn
            .set_write_timeout(Some(Duration::from_secs(secs)))
            .is_err()
        {
            return Err(anyhow!("could not set write timeout"));
        }

        // Set read timeout
        if self
            .conn
            .set_read_timeout(Some(Duration::from_secs(secs)))
            .is_err()
        {
            return Err(anyhow!("could not set read timeout"));
        }

        Ok(())
    }

    /// Performs the BitTorrent handshake with the remote peer.
    ///
    /// Sends our handshake, reads the peer's reply and validates the echoed
    /// info hash. For magnet flows the extension bit is set on our side and
    /// required on the peer's: fetching metadata is impossible without it.
    ///
    /// # Arguments
    ///
    /// * `request_extensions` - Whether to advertise and require BEP-10
    ///   extended messaging.
    ///
    pub fn handshake_with_peer(&mut self, request_extensions: bool) -> Result<()> {
        // Create handshake
        let peer_id = tracker::peer_id().to_vec();
        let info_hash = self.info_hash.clone();
        let handshake = if request_extensions {
            Handshake::with_extensions(peer_id, info_hash)
        } else {
            Handshake::new(peer_id, info_hash)
        };

        // Send handshake to remote peer
        let handshake_encoded: Vec<u8> = handshake.serialize()?;
        if self.conn.write_all(&handshake_encoded).is_err() {
            return Err(anyhow!("could not send handshake to peer"));
        }

        // Read handshake received from remote peer
        let handshake_len: usize = self.read_handshake_len()?;
        let mut handshake_buf: Vec<u8> = vec![0; 48 + handshake_len];
        if self.conn.read_exact(&mut handshake_buf).is_err() {
            return Err(anyhow!("could not read handshake received from peer"));
        }

        // Check info hash received from remote peer
        let handshake_decoded: Handshake = deserialize_handshake(&handshake_buf, handshake_len)?;
        if handshake_decoded.info_hash != self.info_hash {
            return Err(anyhow!("invalid handshake received from peer"));
        }

        self.extensions = handshake_decoded.supports_extensions();
        self.remote_peer_id = handshake_decoded.peer_id;

        if request_extensions && !self.extensions {
            return Err(anyhow!("extension not supported"));
        }

        Ok(())
    }

    /// Reads the first byte of the peer's handshake to determine protocol
    /// string length.
    fn read_handshake_len(&mut self) -> Result<usize> {
        // Read 1 byte into buffer
        let mut buf = [0; 1];
        if self.conn.read_exact(&mut buf).is_err() {
            return Err(anyhow!(
                "could not read handshake length received from peer"
            ));
        }

        // Get handshake length
        let handshake_len = buf[0];
        if handshake_len == 0 {
            return Err(anyhow!("invalid handshake length received from peer"));
        }

        Ok(handshake_len as usize)
    }

    /// Reads and parses one message from the peer.
    ///
    /// Messages have a 4-byte big-endian length prefix, followed by the
    /// message ID and payload. Length 0 is a keep-alive.
    pub fn read_message(&mut self) -> Result<Message> {
        let message_len: usize = self.read_message_len()?;

        // If message length is 0, it's a keep-alive
        if message_len == 0 {
            debug!("Receive KEEP_ALIVE from peer {}", self.peer);
            return Ok(Message::new(MESSAGE_KEEPALIVE));
        }

        // Refuse frames no legitimate message produces
        if message_len > MESSAGE_SIZE_MAX {
            return Err(anyhow!("refusing oversize message from peer"));
        }

        // Read message
        let mut message_buf: Vec<u8> = vec![0; message_len];
        if self.conn.read_exact(&mut message_buf).is_err() {
            return Err(anyhow!("could not read message received from peer"));
        }

        // Deserialize message
        let message: Message = deserialize_message(&message_buf)?;

        Ok(message)
    }

    /// Reads the 4-byte length prefix of an incoming message.
    fn read_message_len(&mut self) -> Result<usize> {
        // Read bytes into buffer
        let mut buf = vec![0; 4];
        if self.conn.read_exact(&mut buf).is_err() {
            return Err(anyhow!("could not read message length received from peer"));
        }

        // Get message length
        let mut cursor = Cursor::new(buf);
        let message_len = cursor.read_u32::<BigEndian>()?;

        Ok(message_len as usize)
    }

    /// Serializes and sends a message to the peer.
    fn send_message(&mut self, message: &Message) -> Result<()> {
        let message_encoded = message.serialize()?;
        if self.conn.write_all(&message_encoded).is_err() {
            return Err(anyhow!("could not send message to peer"));
        }
        Ok(())
    }

    /// Reads the peer's BITFIELD message.
    ///
    /// The bitfield must be the first message after the handshake; anything
    /// else is a protocol violation.
    pub fn read_bitfield(&mut self) -> Result<()> {
        let message: Message = self.read_message()?;
        if message.id != MESSAGE_BITFIELD {
            return Err(anyhow!("expected MESSAGE_BITFIELD from peer"));
        }

        info!("Receive MESSAGE_BITFIELD from peer {}", self.peer);

        // Update bitfield
        self.bitfield = message.payload;

        Ok(())
    }

    /// Sends an INTERESTED message to the peer.
    ///
    /// Required before the peer will honor REQUEST messages.
    pub fn send_interested(&mut self) -> Result<()> {
        info!("Send MESSAGE_INTERESTED to peer {}", self.peer);

        self.send_message(&Message::new(MESSAGE_INTERESTED))
    }

    /// Waits for the peer to unchoke this client.
    ///
    /// Keep-alives, `have` updates and redundant chokes are tolerated while
    /// waiting; any other message is a protocol violation.
    pub fn await_unchoke(&mut self) -> Result<()> {
        loop {
            let message: Message = self.read_message()?;
            match message.id {
                MESSAGE_UNCHOKE => {
                    info!("Receive MESSAGE_UNCHOKE from peer {}", self.peer);
                    self.choked = false;
                    return Ok(());
                }
                MESSAGE_CHOKE => self.choked = true,
                MESSAGE_HAVE => self.read_have(message)?,
                MESSAGE_KEEPALIVE => continue,
                _ => {
                    return Err(anyhow!(
                        "received unexpected message while waiting for unchoke"
                    ))
                }
            }
        }
    }

    /// Sends a HAVE message to notify the peer that we now have a piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based index of the verified piece.
    ///
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        let mut payload: Vec<u8> = vec![];
        payload.write_u32::<BigEndian>(index)?;

        info!("Send MESSAGE_HAVE to peer {}", self.peer);

        self.send_message(&Message::new_with_payload(MESSAGE_HAVE, payload))
    }

    /// Processes a HAVE message from the peer and updates their bitfield.
    ///
    /// # Arguments
    ///
    /// * `message` - HAVE message containing the piece index in payload.
    ///
    pub fn read_have(&mut self, message: Message) -> Result<()> {
        // Check if message id and payload are valid
        if message.id != MESSAGE_HAVE || message.payload.len() != 4 {
            return Err(anyhow!("received invalid MESSAGE_HAVE from peer"));
        }

        // Get piece index
        let mut payload_cursor = Cursor::new(&message.payload);
        let index = payload_cursor.read_u32::<BigEndian>()?;

        debug!("Receive MESSAGE_HAVE {} from peer {}", index, self.peer);

        // Update bitfield
        self.set_piece(index);

        Ok(())
    }

    /// Sends a REQUEST message asking the peer for one block.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Zero-based byte offset within the piece.
    /// * `length` - Number of bytes to request (at most 16 KiB).
    ///
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let payload = RequestPayload::new(index, begin, length).serialize()?;

        info!(
            "Send MESSAGE_REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );

        self.send_message(&Message::new_with_payload(MESSAGE_REQUEST, payload))
    }

    /// Reads messages until the block requested as `(index, begin)` arrives.
    ///
    /// Interleaved messages other than a matching PIECE are tolerated:
    /// `have` updates the bitfield, keep-alives and stray blocks are
    /// dropped. A `choke` fails the transfer, since the peer will not honor
    /// the outstanding request.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index of the outstanding request.
    /// * `begin` - Byte offset of the outstanding request.
    ///
    pub fn read_block(&mut self, index: u32, begin: u32) -> Result<Vec<u8>> {
        loop {
            let message: Message = self.read_message()?;
            match message.id {
                MESSAGE_PIECE => {
                    let piece_payload = deserialize_piece_payload(&message.payload)?;
                    if piece_payload.index != index || piece_payload.begin != begin {
                        debug!(
                            "Ignoring stray block {} [{}] from peer {}",
                            piece_payload.index, piece_payload.begin, self.peer
                        );
                        continue;
                    }

                    info!(
                        "Download piece {} [{}:{}] from peer {}",
                        index,
                        begin,
                        begin + piece_payload.block.len() as u32,
                        self.peer
                    );

                    return Ok(piece_payload.block);
                }
                MESSAGE_CHOKE => {
                    self.choked = true;
                    return Err(anyhow!("peer choked during block transfer"));
                }
                MESSAGE_UNCHOKE => self.choked = false,
                MESSAGE_HAVE => self.read_have(message)?,
                MESSAGE_KEEPALIVE => continue,
                _ => {
                    debug!(
                        "Ignoring message {} while awaiting block from peer {}",
                        message.id, self.peer
                    );
                }
            }
        }
    }

    /// Performs the BEP-10 extension handshake.
    ///
    /// Sends an extended message advertising our `ut_metadata` id and reads
    /// the peer's reply, which advertises theirs.
    pub fn extension_handshake(&mut self) -> Result<u8> {
        let payload = ExtensionPayload::handshake()?.serialize()?;

        info!("Send extension handshake to peer {}", self.peer);

        self.send_message(&Message::new_with_payload(MESSAGE_EXTENSION, payload))?;

        loop {
            let message: Message = self.read_message()?;
            match message.id {
                MESSAGE_EXTENSION => {
                    let extension = ExtensionPayload::deserialize(&message.payload)?;
                    if extension.message_id != 0 {
                        return Err(anyhow!("received invalid extension handshake from peer"));
                    }

                    let body = extension.decode_body()?;
                    let extension_id = crate::bencode::dict_get(&body, "m")
                        .and_then(|m| crate::bencode::dict_get(m, "ut_metadata"))
                        .and_then(crate::bencode::as_int)
                        .ok_or_else(|| anyhow!("peer did not advertise ut_metadata"))?;

                    info!(
                        "Peer {} advertised ut_metadata id {}",
                        self.peer, extension_id
                    );

                    return Ok(extension_id as u8);
                }
                MESSAGE_HAVE => self.read_have(message)?,
                MESSAGE_KEEPALIVE => continue,
                _ => {
                    return Err(anyhow!(
                        "received unexpected message during extension handshake"
                    ))
                }
            }
        }
    }

    /// Requests metadata piece 0 and returns the raw metadata bytes.
    ///
    /// The data reply carries a bencoded header (`msg_type`, `piece`,
    /// `total_size`) followed by the metadata itself; the metadata is the
    /// last `total_size` bytes of the payload.
    ///
    /// # Arguments
    ///
    /// * `extension_id` - The `ut_metadata` id the peer advertised.
    ///
    pub fn request_metadata(&mut self, extension_id: u8) -> Result<Vec<u8>> {
        let payload = ExtensionPayload::metadata_request(extension_id, 0)?.serialize()?;

        info!("Send metadata request to peer {}", self.peer);

        self.send_message(&Message::new_with_payload(MESSAGE_EXTENSION, payload))?;

        loop {
            let message: Message = self.read_message()?;
            match message.id {
                MESSAGE_EXTENSION => {
                    let extension = ExtensionPayload::deserialize(&message.payload)?;
                    let body = extension.decode_body()?;

                    let msg_type = crate::bencode::dict_get(&body, "msg_type")
                        .and_then(crate::bencode::as_int)
                        .ok_or_else(|| anyhow!("received invalid metadata message from peer"))?;
                    if msg_type != 1 {
                        return Err(anyhow!("peer rejected metadata request"));
                    }

                    let total_size = crate::bencode::dict_get(&body, "total_size")
                        .and_then(crate::bencode::as_int)
                        .ok_or_else(|| anyhow!("received invalid metadata message from peer"))?;
                    let total_size = total_size as usize;
                    if total_size == 0 || total_size > extension.body.len() {
                        return Err(anyhow!("received invalid metadata size from peer"));
                    }

                    info!(
                        "Receive {} metadata bytes from peer {}",
                        total_size, self.peer
                    );

                    return Ok(extension.body[extension.body.len() - total_size..].to_vec());
                }
                MESSAGE_HAVE => self.read_have(message)?,
                MESSAGE_KEEPALIVE => continue,
                _ => {
                    debug!(
                        "Ignoring message {} while awaiting metadata from peer {}",
                        message.id, self.peer
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker;

    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    const INFO_HASH: [u8; 20] = [0x42; 20];
    const REMOTE_ID: [u8; 20] = [0x99; 20];

    /// Reply to the client's 68-byte handshake, optionally asserting the
    /// extension bit, then send a bitfield.
    fn answer_handshake(conn: &mut TcpStream, extensions: bool, bitfield: Vec<u8>) {
        let mut incoming = [0u8; 68];
        conn.read_exact(&mut incoming).unwrap();
        assert_eq!(&incoming[28..48], &INFO_HASH);

        let mut reply = Handshake::new(REMOTE_ID.to_vec(), INFO_HASH.to_vec());
        if extensions {
            reply = Handshake::with_extensions(REMOTE_ID.to_vec(), INFO_HASH.to_vec());
        }
        conn.write_all(&reply.serialize().unwrap()).unwrap();

        let bitfield_message = Message::new_with_payload(MESSAGE_BITFIELD, bitfield);
        conn.write_all(&bitfield_message.serialize().unwrap())
            .unwrap();
    }

    /// Read one length-prefixed frame from the client.
    fn read_frame(conn: &mut TcpStream) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        conn.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut frame = vec![0u8; len];
        conn.read_exact(&mut frame).unwrap();
        frame
    }

    fn local_peer(port: u16) -> Peer {
        Peer {
            id: 0,
            ip: Ipv4Addr::LOCALHOST,
            port,
        }
    }

    #[test]
    fn handshake_and_bitfield() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let fake_peer = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            answer_handshake(&mut conn, false, vec![0b1010_0000]);
            // Hold the socket open until the client is done
            let mut sink = [0u8; 16];
            let _ = conn.read(&mut sink);
        });

        let mut client = Client::new(local_peer(port), INFO_HASH.to_vec()).unwrap();
        client.handshake_with_peer(false).unwrap();
        assert_eq!(client.remote_peer_id(), &REMOTE_ID);

        client.read_bitfield().unwrap();
        assert!(client.has_piece(0));
        assert!(!client.has_piece(1));
        assert!(client.has_piece(2));
        assert!(!client.has_piece(100));

        drop(client);
        fake_peer.join().unwrap();
    }

    #[test]
    fn handshake_requires_extension_support() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let fake_peer = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            answer_handshake(&mut conn, false, vec![0xff]);
        });

        let mut client = Client::new(local_peer(port), INFO_HASH.to_vec()).unwrap();
        let error = client.handshake_with_peer(true).unwrap_err();
        assert!(error.to_string().contains("extension not supported"));

        fake_peer.join().unwrap();
    }

    #[test]
    fn handshake_rejects_wrong_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let fake_peer = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut incoming = [0u8; 68];
            conn.read_exact(&mut incoming).unwrap();
            let reply = Handshake::new(REMOTE_ID.to_vec(), vec![0x00; 20]);
            conn.write_all(&reply.serialize().unwrap()).unwrap();
        });

        let mut client = Client::new(local_peer(port), INFO_HASH.to_vec()).unwrap();
        assert!(client.handshake_with_peer(false).is_err());

        fake_peer.join().unwrap();
    }

    #[test]
    fn extension_handshake_and_metadata_fetch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let metadata = b"d6:lengthi1337e4:name4:spam12:piece lengthi16384e6:pieces20:\
                         aaaaaaaaaaaaaaaaaaaae"
            .to_vec();
        let metadata_clone = metadata.clone();

        let fake_peer = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            answer_handshake(&mut conn, true, vec![0xff]);

            // Extension handshake: expect sub-id 0, advertise ut_metadata 3
            let frame = read_frame(&mut conn);
            assert_eq!(frame[0], MESSAGE_EXTENSION);
            assert_eq!(frame[1], 0);
            let reply = ExtensionPayload {
                message_id: 0,
                body: b"d1:md11:ut_metadatai3eee".to_vec(),
            };
            let reply_message =
                Message::new_with_payload(MESSAGE_EXTENSION, reply.serialize().unwrap());
            conn.write_all(&reply_message.serialize().unwrap()).unwrap();

            // Metadata request: expect the advertised sub-id, send the data
            let frame = read_frame(&mut conn);
            assert_eq!(frame[0], MESSAGE_EXTENSION);
            assert_eq!(frame[1], 3);

            let mut body = format!(
                "d8:msg_typei1e5:piecei0e10:total_sizei{}ee",
                metadata_clone.len()
            )
            .into_bytes();
            body.extend_from_slice(&metadata_clone);
            let data = ExtensionPayload {
                message_id: 1,
                body,
            };
            let data_message =
                Message::new_with_payload(MESSAGE_EXTENSION, data.serialize().unwrap());
            conn.write_all(&data_message.serialize().unwrap()).unwrap();
        });

        let (mut client, extension_id) =
            Client::dial_magnet(local_peer(port), INFO_HASH.to_vec()).unwrap();
        assert_eq!(extension_id, 3);

        let fetched = client.request_metadata(extension_id).unwrap();
        assert_eq!(fetched, metadata);

        fake_peer.join().unwrap();
    }

    #[test]
    fn read_block_skips_interleaved_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let fake_peer = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            answer_handshake(&mut conn, false, vec![0xff]);

            // interested -> unchoke
            let frame = read_frame(&mut conn);
            assert_eq!(frame[0], MESSAGE_INTERESTED);
            conn.write_all(&Message::new(MESSAGE_UNCHOKE).serialize().unwrap())
                .unwrap();

            // request -> keep-alive, have, stray block, then the real block
            let frame = read_frame(&mut conn);
            assert_eq!(frame[0], MESSAGE_REQUEST);

            conn.write_all(&Message::new(MESSAGE_KEEPALIVE).serialize().unwrap())
                .unwrap();
            let have = Message::new_with_payload(MESSAGE_HAVE, vec![0, 0, 0, 9]);
            conn.write_all(&have.serialize().unwrap()).unwrap();

            let mut stray = vec![0, 0, 0, 1, 0, 0, 0, 0];
            stray.extend_from_slice(b"nope");
            let stray_message = Message::new_with_payload(MESSAGE_PIECE, stray);
            conn.write_all(&stray_message.serialize().unwrap()).unwrap();

            let mut payload = vec![0, 0, 0, 0, 0, 0, 0, 0];
            payload.extend_from_slice(b"real block");
            let block_message = Message::new_with_payload(MESSAGE_PIECE, payload);
            conn.write_all(&block_message.serialize().unwrap()).unwrap();
        });

        let mut client = Client::new(local_peer(port), INFO_HASH.to_vec()).unwrap();
        client.handshake_with_peer(false).unwrap();
        client.read_bitfield().unwrap();
        client.send_interested().unwrap();
        client.await_unchoke().unwrap();

        client.send_request(0, 0, 10).unwrap();
        let block = client.read_block(0, 0).unwrap();
        assert_eq!(block, b"real block");
        // The interleaved have was applied
        assert!(client.has_piece(9));

        fake_peer.join().unwrap();
    }

    #[test]
    fn read_block_fails_on_choke() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let fake_peer = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            answer_handshake(&mut conn, false, vec![0xff]);
            conn.write_all(&Message::new(MESSAGE_CHOKE).serialize().unwrap())
                .unwrap();
        });

        let mut client = Client::new(local_peer(port), INFO_HASH.to_vec()).unwrap();
        client.handshake_with_peer(false).unwrap();
        client.read_bitfield().unwrap();

        let error = client.read_block(0, 0).unwrap_err();
        assert!(error.to_string().contains("choked"));

        fake_peer.join().unwrap();
    }

    #[test]
    fn peer_id_matches_wire_identity() {
        // The process-wide id is what every handshake carries
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let fake_peer = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut incoming = [0u8; 68];
            conn.read_exact(&mut incoming).unwrap();
            let reply = Handshake::new(REMOTE_ID.to_vec(), INFO_HASH.to_vec());
            conn.write_all(&reply.serialize().unwrap()).unwrap();
            incoming[48..68].to_vec()
        });

        let mut client = Client::new(local_peer(port), INFO_HASH.to_vec()).unwrap();
        client.handshake_with_peer(false).unwrap();

        let sent_id = fake_peer.join().unwrap();
        assert_eq!(sent_id, tracker::peer_id().to_vec());
    }
}
