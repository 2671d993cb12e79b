//! # BitTorrent Worker Thread
//!
//! This module implements the worker that downloads pieces from a single
//! peer. Each worker owns one connection and consumes tasks from the shared
//! work channel until it drains.
//!
//! ## Download Process
//!
//! 1. **Connection**: Establish TCP connection and perform the handshake
//! 2. **Bitfield**: Learn which pieces the peer has
//! 3. **Interest**: Send interested, wait for unchoke
//! 4. **Task loop**: Take a task, request its blocks in order, stream them
//!    into the piece file and a running SHA-1
//! 5. **Verification**: Compare the digest against the expected piece hash
//!
//! ## Error Handling
//!
//! - Dial and handshake failures retry a few times before the worker gives up
//! - A failed verification truncates the piece file and restarts the piece
//!   from its first block, up to a bounded number of attempts
//! - Tasks the peer cannot serve, exhausted tasks and the in-flight task of
//!   a dying connection are re-enqueued for other workers

use crate::client::*;
use crate::peer::*;
use crate::piece::*;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{Receiver, Sender};
use std::fs::{self, File};
use std::io::Write;
use std::thread;
use std::time::Duration;

// Attempts to bring a session up before giving up on the peer
const NB_CONNECT_RETRIES_MAX: u32 = 3;
const RETRY_DELAY_SECS: u64 = 5;

// Attempts to download one piece before handing it to another worker
const NB_PIECE_ATTEMPTS_MAX: u32 = 5;

/// Manages downloading from a single BitTorrent peer.
///
/// Each worker runs in its own thread and handles the complete download
/// lifecycle for one peer, from connection establishment to piece
/// verification.
pub struct Worker {
    /// Information about the remote peer (IP, port, ID)
    peer: Peer,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// Channel for receiving piece tasks and returning unfinished ones
    work_chan: (Sender<PieceTask>, Receiver<PieceTask>),
    /// Channel for reporting completed pieces
    done_chan: Sender<PieceDone>,
}

impl Worker {
    /// Creates a new worker for one peer.
    ///
    /// # Arguments
    ///
    /// * `peer` - Peer information including IP address and port.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent info dictionary.
    /// * `work_chan` - Tuple of (sender, receiver) for piece tasks.
    /// * `done_chan` - Sender for completed piece reports.
    ///
    pub fn new(
        peer: Peer,
        info_hash: Vec<u8>,
        work_chan: (Sender<PieceTask>, Receiver<PieceTask>),
        done_chan: Sender<PieceDone>,
    ) -> Worker {
        Worker {
            peer,
            info_hash,
            work_chan,
            done_chan,
        }
    }

    /// Run the worker until the work channel drains or the session dies.
    pub fn run(&self) {
        let mut client = match self.connect() {
            Ok(client) => client,
            Err(e) => {
                debug!("Giving up on peer {}: {}", self.peer, e);
                return;
            }
        };

        loop {
            // Receive a task from the work channel
            let task: PieceTask = match self.work_chan.1.recv() {
                Ok(task) => task,
                Err(_) => {
                    info!("Worker for peer {} exiting: no work left", self.peer);
                    return;
                }
            };

            // Check if remote peer has piece
            if !client.has_piece(task.index) {
                // Resend task to work channel
                if self.work_chan.0.send(task).is_err() {
                    return;
                }
                continue;
            }

            match self.download_task(&mut client, &task) {
                Ok(true) => {
                    // Notify peer that piece was downloaded
                    if client.send_have(task.index).is_err() {
                        warn!("could not notify peer {} of downloaded piece", self.peer);
                    }

                    // Report completion
                    let done = PieceDone::new(task.index, task.length);
                    if self.done_chan.send(done).is_err() {
                        return;
                    }
                }
                Ok(false) => {
                    // Verification kept failing, let another worker try
                    warn!(
                        "piece {} failed verification {} times from peer {}, re-enqueueing",
                        task.index, NB_PIECE_ATTEMPTS_MAX, self.peer
                    );
                    if self.work_chan.0.send(task).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // Connection-level failure, hand the task back and exit
                    debug!("Worker for peer {} exiting: {}", self.peer, e);
                    let _ = self.work_chan.0.send(task);
                    return;
                }
            }
        }
    }

    /// Bring a session up to the point where blocks can be requested.
    ///
    /// Dial and handshake failures are retried a few times with a delay,
    /// reconnecting from scratch each time.
    fn connect(&self) -> Result<Client> {
        let mut retry_count = 0;

        loop {
            match self.try_connect() {
                Ok(client) => {
                    debug!("Session ready with peer {}", self.peer);
                    return Ok(client);
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= NB_CONNECT_RETRIES_MAX {
                        return Err(e);
                    }
                    debug!(
                        "Session with peer {} failed (attempt {}/{}), retrying in {} seconds: {}",
                        self.peer, retry_count, NB_CONNECT_RETRIES_MAX, RETRY_DELAY_SECS, e
                    );
                    thread::sleep(Duration::from_secs(RETRY_DELAY_SECS));
                }
            }
        }
    }

    /// One session bring-up attempt.
    fn try_connect(&self) -> Result<Client> {
        let mut client = Client::new(self.peer.clone(), self.info_hash.clone())?;
        client.set_connection_timeout(30)?;
        client.handshake_with_peer(false)?;
        client.read_bitfield()?;
        client.send_interested()?;
        client.await_unchoke()?;
        Ok(client)
    }

    /// Download one piece, retrying on verification failure.
    ///
    /// Returns `Ok(true)` when the piece verified, `Ok(false)` when every
    /// attempt produced a bad digest, and an error when the connection is no
    /// longer usable.
    fn download_task(&self, client: &mut Client, task: &PieceTask) -> Result<bool> {
        for attempt in 1..=NB_PIECE_ATTEMPTS_MAX {
            let digest = self.download_attempt(client, task)?;

            if digest == task.hash {
                info!(
                    "Successfully verified integrity of piece {} from peer {}",
                    task.index, self.peer
                );
                return Ok(true);
            }

            warn!(
                "piece {} from peer {} failed verification (attempt {}/{})",
                task.index, self.peer, attempt, NB_PIECE_ATTEMPTS_MAX
            );
        }

        // Leave no unverified piece file behind
        let _ = fs::remove_file(&task.path);

        Ok(false)
    }

    /// Download every block of a piece into its file, returning the digest.
    ///
    /// The piece file is truncated on entry, so a retry restarts from the
    /// first block.
    fn download_attempt(&self, client: &mut Client, task: &PieceTask) -> Result<Vec<u8>> {
        let mut piece_file = match File::create(&task.path) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not create piece file")),
        };

        let mut hasher = Sha1::new();

        let nb_blocks = block_count(task.length);
        for block_index in 0..nb_blocks {
            let begin = block_index * BLOCK_SIZE_MAX;
            let length = block_size(task.length, block_index);

            // Request the block, then wait for it
            client.send_request(task.index, begin, length)?;
            let block = client.read_block(task.index, begin)?;

            if block.len() as u32 != length {
                return Err(anyhow!("received block with unexpected length from peer"));
            }

            // Append the block to the file and the running digest
            if piece_file.write_all(&block).is_err() {
                return Err(anyhow!("could not write piece file"));
            }
            hasher.update(&block);
        }

        info!(
            "Successfully downloaded piece {} from peer {}",
            task.index, self.peer
        );

        Ok(hasher.finish().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::Handshake;
    use crate::message::*;

    use crossbeam_channel::unbounded;
    use std::io::Read;
    use std::net::{Ipv4Addr, TcpListener};

    /// A minimal seeding peer: answers the handshake, claims every piece,
    /// unchokes on interest and serves block requests from `pieces`.
    ///
    /// When `flip_first_block` is set, the first block served has one bit
    /// flipped, forcing a verification failure and a retry.
    fn spawn_seeder(
        pieces: Vec<Vec<u8>>,
        flip_first_block: bool,
    ) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();

            // Handshake
            let mut incoming = [0u8; 68];
            conn.read_exact(&mut incoming).unwrap();
            let info_hash = incoming[28..48].to_vec();
            let reply = Handshake::new(vec![0x77; 20], info_hash);
            conn.write_all(&reply.serialize().unwrap()).unwrap();

            // Bitfield claiming every piece
            let nb_bytes = pieces.len().div_ceil(8);
            let bitfield = Message::new_with_payload(MESSAGE_BITFIELD, vec![0xff; nb_bytes]);
            conn.write_all(&bitfield.serialize().unwrap()).unwrap();

            let mut flipped = !flip_first_block;
            loop {
                // Read one frame, exit when the worker hangs up
                let mut len_buf = [0u8; 4];
                if conn.read_exact(&mut len_buf).is_err() {
                    return;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len == 0 {
                    continue;
                }
                let mut frame = vec![0u8; len];
                if conn.read_exact(&mut frame).is_err() {
                    return;
                }

                match frame[0] {
                    MESSAGE_INTERESTED => {
                        conn.write_all(&Message::new(MESSAGE_UNCHOKE).serialize().unwrap())
                            .unwrap();
                    }
                    MESSAGE_REQUEST => {
                        let index = u32::from_be_bytes(frame[1..5].try_into().unwrap());
                        let begin = u32::from_be_bytes(frame[5..9].try_into().unwrap());
                        let length = u32::from_be_bytes(frame[9..13].try_into().unwrap());

                        let piece = &pieces[index as usize];
                        let mut block =
                            piece[begin as usize..(begin + length) as usize].to_vec();
                        if !flipped {
                            block[0] ^= 0x01;
                            flipped = true;
                        }

                        let mut payload = Vec::with_capacity(8 + block.len());
                        payload.extend_from_slice(&index.to_be_bytes());
                        payload.extend_from_slice(&begin.to_be_bytes());
                        payload.extend_from_slice(&block);
                        let message = Message::new_with_payload(MESSAGE_PIECE, payload);
                        conn.write_all(&message.serialize().unwrap()).unwrap();
                    }
                    _ => {} // have and friends
                }
            }
        });

        (port, handle)
    }

    fn sha1(data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finish().to_vec()
    }

    fn run_worker_over(pieces: Vec<Vec<u8>>, flip_first_block: bool) {
        let (port, seeder) = spawn_seeder(pieces.clone(), flip_first_block);

        let dir = tempfile::tempdir().unwrap();
        let work_chan = unbounded::<PieceTask>();
        let done_chan = unbounded::<PieceDone>();

        let mut paths = Vec::new();
        for (index, piece) in pieces.iter().enumerate() {
            let path = dir.path().join(format!("piece-{}", index));
            paths.push(path.clone());
            let task = PieceTask::new(index as u32, sha1(piece), piece.len() as u32, path);
            work_chan.0.send(task).unwrap();
        }

        let peer = Peer {
            id: 0,
            ip: Ipv4Addr::LOCALHOST,
            port,
        };
        let worker = Worker::new(
            peer,
            vec![0x42; 20],
            (work_chan.0.clone(), work_chan.1.clone()),
            done_chan.0.clone(),
        );
        drop(done_chan.0);

        // The worker and seeder threads block on their sockets once the
        // queue drains; they are detached, not joined, like in the engine.
        thread::spawn(move || worker.run());
        drop(seeder);

        // Collect one completion per piece
        for _ in 0..pieces.len() {
            done_chan.1.recv().unwrap();
        }

        for (piece, path) in pieces.iter().zip(&paths) {
            let written = fs::read(path).unwrap();
            assert_eq!(&written, piece);
        }
    }

    #[test]
    fn worker_downloads_and_verifies_pieces() {
        // Two blocks in the first piece, a short tail in the second
        let piece0: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        let piece1: Vec<u8> = (0..5000u32).map(|i| (i % 13) as u8).collect();
        run_worker_over(vec![piece0, piece1], false);
    }

    #[test]
    fn worker_retries_after_corrupt_block() {
        let piece0: Vec<u8> = (0..18000u32).map(|i| (i % 241) as u8).collect();
        run_worker_over(vec![piece0], true);
    }
}
