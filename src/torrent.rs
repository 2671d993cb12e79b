//! # BitTorrent Torrent Management
//!
//! This module owns the torrent metainfo model and coordinates downloads
//! from metadata to assembled file.
//!
//! ## Torrent Metainfo Format
//!
//! Torrent files contain metadata in bencoded format:
//!
//! - **announce**: Tracker URL for peer discovery
//! - **announce-list**: Optional tracker tiers (BEP 12)
//! - **info**: Dictionary with file information and piece hashes
//! - **pieces**: Concatenated SHA-1 hashes for integrity verification
//! - **piece length**: Size of each piece (typically 256KB-1MB)
//! - **length**: Total file size
//! - **name**: Suggested filename
//!
//! The info hash, the torrent's global identity, is the SHA-1 of the
//! bencoded `info` dictionary. It only matches across clients because the
//! encoding is canonical: dictionary keys are emitted in sorted order.
//!
//! ## Download Coordination
//!
//! 1. **Announce** to the trackers and collect peers
//! 2. **Enqueue** one task per piece on a shared channel
//! 3. **Spawn** one worker thread per peer
//! 4. **Count** completions reported on the done channel
//! 5. **Assemble** the per-piece files into the output
//!
//! Magnet flows miss the `info` dictionary: it is fetched from the first
//! reachable peer through the metadata extension and verified against the
//! magnet's info hash before the same pipeline runs.

use crate::assemble::assemble;
use crate::bencode;
use crate::client::Client;
use crate::magnet::Magnet;
use crate::peer::Peer;
use crate::piece::*;
use crate::tracker;
use crate::worker::Worker;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{unbounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_bencode::de;
use serde_bytes::ByteBuf;

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

/// Represents a BitTorrent torrent and manages the download process.
///
/// Contains all metadata from the torrent file (or from a magnet link's
/// fetched metadata) and coordinates the download from peer discovery
/// through file assembly.
#[derive(Default, Clone)]
pub struct Torrent {
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    tiers: Vec<Vec<String>>,
    /// Primary tracker URL
    announce: String,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: Vec<u8>,
    /// Vector of 20-byte SHA-1 hashes, one for each piece
    pieces_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u32,
    /// Suggested filename from torrent metadata
    name: String,
}

/// BencodeInfo structure.
///
/// Field order matches canonical bencode key order, so re-encoding
/// reproduces the exact bytes the info hash is computed over.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Size of the file in bytes
    #[serde(rename = "length")]
    length: u32,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Concatenation of all pieces 20-byte SHA-1 hashes
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
}

/// BencodeTorrent structure.
#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    #[serde(default)]
    // URL of the tracker
    announce: String,
    #[serde(rename = "announce-list", default)]
    // List of tracker URL tiers
    announce_list: Vec<Vec<String>>,
    // Informations about file
    info: BencodeInfo,
}

impl BencodeTorrent {
    /// Turn the announce fields into tracker tiers plus a primary URL.
    ///
    /// `announce-list` wins over the bare `announce` URL when both are
    /// present. Within a tier the URLs are randomized, so clients spread
    /// their announces across equivalent trackers; the primary URL is the
    /// first entry as written in the metainfo, before any randomization.
    fn announce_tiers(&self) -> Result<(Vec<Vec<String>>, String)> {
        if self.announce_list.is_empty() {
            if self.announce.is_empty() {
                return Err(anyhow!("torrent has no announce or announce-list"));
            }
            // A lone announce URL is a single one-entry tier
            return Ok((vec![vec![self.announce.clone()]], self.announce.clone()));
        }

        let primary = match self.announce_list.iter().flatten().next() {
            Some(url) => url.clone(),
            None => return Err(anyhow!("torrent has no announce or announce-list")),
        };

        let mut rng = rand::thread_rng();
        let tiers = self
            .announce_list
            .iter()
            .map(|tier| {
                let mut tier = tier.clone();
                tier.shuffle(&mut rng);
                tier
            })
            .collect();

        Ok((tiers, primary))
    }
}

impl BencodeInfo {
    /// Hash bencoded informations to uniquely identify a file.
    fn hash(&self) -> Result<Vec<u8>> {
        // Serialize bencoded informations
        let buf: Vec<u8> = bencode::encode(self)?;

        // Hash bencoded informations
        let mut hasher = Sha1::new();
        hasher.update(&buf);

        // Read hash digest
        let hash = hasher.finish().to_vec();

        Ok(hash)
    }

    /// Split bencoded pieces into vectors of SHA-1 hashes.
    fn split_pieces_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let nb_pieces = self.pieces.len();

        // Check torrent pieces
        if !nb_pieces.is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent is invalid"));
        }
        let nb_hashes = nb_pieces / SHA1_HASH_SIZE;
        let mut hashes: Vec<Vec<u8>> = Vec::with_capacity(nb_hashes);

        // Split pieces
        for i in 0..nb_hashes {
            hashes.push(self.pieces[i * SHA1_HASH_SIZE..(i + 1) * SHA1_HASH_SIZE].to_vec());
        }

        Ok(hashes)
    }
}

impl Torrent {
    /// Open a torrent from a metainfo file.
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the torrent.
    ///
    pub fn open(filepath: &Path) -> Result<Torrent> {
        // Open torrent
        let mut file = match File::open(filepath) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open torrent")),
        };

        // Read torrent content in a buffer
        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(anyhow!("could not read torrent"));
        }

        Torrent::from_bytes(&buf)
    }

    /// Build a torrent from metainfo bytes.
    fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        // Deserialize bencoded data from torrent
        let bencode = match de::from_bytes::<BencodeTorrent>(buf) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode torrent")),
        };

        let (tiers, announce) = bencode.announce_tiers()?;

        Torrent::build(tiers, announce, &bencode.info)
    }

    /// Resolve a magnet link into a full torrent.
    ///
    /// Announces with `left=1` (the length is unknown), then dials peers
    /// until one completes the metadata extension exchange. The fetched
    /// metadata must hash to the magnet's info hash.
    pub fn from_magnet(magnet: &Magnet) -> Result<Torrent> {
        let tracker_urls = vec![magnet.tracker_url.clone()];
        let peers = tracker::request_peers(&tracker_urls, &magnet.info_hash, 1)?;

        let mut last_error = anyhow!("no peers available");
        for peer in peers {
            let (mut client, extension_id) =
                match Client::dial_magnet(peer.clone(), magnet.info_hash.clone()) {
                    Ok(session) => session,
                    Err(e) => {
                        debug!("could not negotiate metadata with peer {}: {}", peer, e);
                        last_error = e;
                        continue;
                    }
                };

            let metadata = match client.request_metadata(extension_id) {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!("could not fetch metadata from peer {}: {}", peer, e);
                    last_error = e;
                    continue;
                }
            };

            // Decode the metadata into an info dictionary
            let info = match de::from_bytes::<BencodeInfo>(&metadata) {
                Ok(info) => info,
                Err(_) => return Err(anyhow!("could not decode metadata received from peer")),
            };

            // The metadata must hash to the identity the magnet announced
            let info_hash = info.hash()?;
            if info_hash != magnet.info_hash {
                return Err(anyhow!("metadata does not match magnet info hash"));
            }

            let tiers = vec![vec![magnet.tracker_url.clone()]];
            return Torrent::build(tiers, magnet.tracker_url.clone(), &info);
        }

        Err(last_error)
    }

    /// Build a torrent from trackers and a decoded info dictionary.
    fn build(tiers: Vec<Vec<String>>, announce: String, info: &BencodeInfo) -> Result<Torrent> {
        if info.piece_length == 0 {
            return Err(anyhow!("torrent is invalid"));
        }

        let pieces_hashes = info.split_pieces_hashes()?;

        // One hash per piece
        let nb_pieces = info.length.div_ceil(info.piece_length) as usize;
        if pieces_hashes.len() != nb_pieces {
            return Err(anyhow!("torrent is invalid"));
        }

        Ok(Torrent {
            tiers,
            announce,
            info_hash: info.hash()?,
            pieces_hashes,
            piece_length: info.piece_length,
            length: info.length,
            name: info.name.clone(),
        })
    }

    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the primary tracker URL.
    pub fn announce(&self) -> &str {
        &self.announce
    }

    /// Returns the total file size in bytes.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Returns the nominal piece size in bytes.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Returns the 20-byte info hash.
    pub fn info_hash(&self) -> &[u8] {
        &self.info_hash
    }

    /// Returns the per-piece SHA-1 hashes.
    pub fn pieces_hashes(&self) -> &[Vec<u8>] {
        &self.pieces_hashes
    }

    /// Flatten all tiers into a unique list of tracker URLs.
    fn tracker_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for tier in &self.tiers {
            for url in tier {
                if seen.insert(url.clone()) {
                    urls.push(url.clone());
                }
            }
        }
        urls
    }

    /// Request peers from the torrent's trackers.
    pub fn peers(&self) -> Result<Vec<Peer>> {
        tracker::request_peers(&self.tracker_urls(), &self.info_hash, self.length)
    }

    /// Download the whole torrent to the output path.
    ///
    /// Each piece lands in its own `"<output>-<index>"` file; once every
    /// piece has completed, the per-piece files are concatenated into the
    /// output and removed.
    ///
    /// # Arguments
    ///
    /// * `output` - Path of the final file.
    ///
    pub fn download(&self, output: &Path) -> Result<()> {
        info!(
            "Downloading {:?} ({} pieces)",
            self.name,
            self.pieces_hashes.len()
        );

        let mut tasks = Vec::with_capacity(self.pieces_hashes.len());
        let mut piece_paths = Vec::with_capacity(self.pieces_hashes.len());
        for index in 0..self.pieces_hashes.len() as u32 {
            let path = PathBuf::from(format!("{}-{}", output.display(), index));
            piece_paths.push(path.clone());
            tasks.push(PieceTask::new(
                index,
                self.pieces_hashes[index as usize].clone(),
                piece_size(index, self.piece_length, self.length),
                path,
            ));
        }

        self.run_tasks(tasks)?;

        assemble(output, &piece_paths)
    }

    /// Download a single piece to the output path.
    ///
    /// # Arguments
    ///
    /// * `output` - Path the piece bytes are written to.
    /// * `index` - The piece index.
    ///
    pub fn download_piece(&self, output: &Path, index: u32) -> Result<()> {
        if index as usize >= self.pieces_hashes.len() {
            return Err(anyhow!("piece index out of range"));
        }

        let task = PieceTask::new(
            index,
            self.pieces_hashes[index as usize].clone(),
            piece_size(index, self.piece_length, self.length),
            output.to_path_buf(),
        );

        self.run_tasks(vec![task])
    }

    /// Fan the tasks out across one worker per peer and await completion.
    fn run_tasks(&self, tasks: Vec<PieceTask>) -> Result<()> {
        let peers = self.peers()?;
        let nb_tasks = tasks.len();
        let total_bytes: u64 = tasks.iter().map(|task| task.length as u64).sum();

        // Create work and done channels
        let work_chan: (Sender<PieceTask>, Receiver<PieceTask>) = unbounded();
        let done_chan: (Sender<PieceDone>, Receiver<PieceDone>) = unbounded();

        // Enqueue tasks in piece-index order
        for task in tasks {
            if work_chan.0.send(task).is_err() {
                return Err(anyhow!("could not send piece to channel"));
            }
        }

        // Init workers
        for peer in peers {
            let worker = Worker::new(
                peer,
                self.info_hash.clone(),
                work_chan.clone(),
                done_chan.0.clone(),
            );

            // Start worker in a new thread
            thread::spawn(move || {
                worker.run();
            });
        }

        // Workers hold the only done senders from here on, so the receive
        // below fails instead of hanging once every worker has exited
        let done_recv = done_chan.1;
        drop(done_chan.0);
        drop(work_chan);

        // Create progress bar
        let pb = ProgressBar::new(total_bytes);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
                .progress_chars("#>-"),
        );

        // Count completed pieces
        let mut nb_pieces_downloaded = 0;
        while nb_pieces_downloaded < nb_tasks {
            let done: PieceDone = match done_recv.recv() {
                Ok(done) => done,
                Err(_) => {
                    pb.finish_and_clear();
                    return Err(anyhow!(
                        "all peer connections failed before the download completed"
                    ));
                }
            };

            debug!("Piece {} completed", done.index);

            // Update progress bar
            pb.inc(done.length as u64);

            // Update number of pieces downloaded
            nb_pieces_downloaded += 1;
        }

        pb.finish_and_clear();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A metainfo document with length=92063, piece_length=32768: 3 pieces
    fn sample_metainfo() -> (Vec<u8>, Vec<u8>) {
        let mut info = b"d6:lengthi92063e4:name9:file.name12:piece lengthi32768e6:pieces60:"
            .to_vec();
        info.extend_from_slice(&[0xab; 60]);
        info.push(b'e');

        let mut metainfo = b"d8:announce31:http://tracker.example/announce4:info".to_vec();
        metainfo.extend_from_slice(&info);
        metainfo.push(b'e');

        (metainfo, info)
    }

    fn sha1(data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finish().to_vec()
    }

    #[test]
    fn from_bytes_parses_metainfo() {
        let (metainfo, _) = sample_metainfo();
        let torrent = Torrent::from_bytes(&metainfo).unwrap();

        assert_eq!(torrent.announce(), "http://tracker.example/announce");
        assert_eq!(torrent.name(), "file.name");
        assert_eq!(torrent.length(), 92063);
        assert_eq!(torrent.piece_length(), 32768);
        assert_eq!(torrent.pieces_hashes().len(), 3);
        assert_eq!(torrent.pieces_hashes()[1], vec![0xab; 20]);
    }

    #[test]
    fn info_hash_round_trips_canonical_encoding() {
        // Decoding and re-encoding the info dictionary must reproduce the
        // exact input bytes, so the hash matches other clients
        let (metainfo, info) = sample_metainfo();
        let torrent = Torrent::from_bytes(&metainfo).unwrap();

        assert_eq!(torrent.info_hash(), sha1(&info));
    }

    #[test]
    fn from_bytes_rejects_bad_piece_count() {
        // Two hashes for a three-piece file
        let mut info = b"d6:lengthi92063e4:name9:file.name12:piece lengthi32768e6:pieces40:"
            .to_vec();
        info.extend_from_slice(&[0xab; 40]);
        info.push(b'e');

        let mut metainfo = b"d8:announce31:http://tracker.example/announce4:info".to_vec();
        metainfo.extend_from_slice(&info);
        metainfo.push(b'e');

        assert!(Torrent::from_bytes(&metainfo).is_err());
    }

    #[test]
    fn from_bytes_rejects_ragged_pieces() {
        // Pieces length not a multiple of 20
        let mut info = b"d6:lengthi92063e4:name9:file.name12:piece lengthi32768e6:pieces10:"
            .to_vec();
        info.extend_from_slice(&[0xab; 10]);
        info.push(b'e');

        let mut metainfo = b"d8:announce31:http://tracker.example/announce4:info".to_vec();
        metainfo.extend_from_slice(&info);
        metainfo.push(b'e');

        assert!(Torrent::from_bytes(&metainfo).is_err());
    }

    #[test]
    fn from_bytes_rejects_missing_keys() {
        // No length attribute (the shape of a multi-file torrent)
        let metainfo =
            b"d8:announce31:http://tracker.example/announce4:infod4:name4:spamee".to_vec();
        assert!(Torrent::from_bytes(&metainfo).is_err());
    }

    #[test]
    fn from_bytes_requires_a_tracker() {
        let (_, info) = sample_metainfo();
        let mut metainfo = b"d4:info".to_vec();
        metainfo.extend_from_slice(&info);
        metainfo.push(b'e');

        assert!(Torrent::from_bytes(&metainfo).is_err());
    }

    #[test]
    fn announce_list_feeds_tracker_urls() {
        let (_, info) = sample_metainfo();
        let mut metainfo = b"d13:announce-listll31:http://tracker.example/announce\
                              30:http://backup.example/announceel31:http://tracker.example/announceee4:info"
            .to_vec();
        metainfo.extend_from_slice(&info);
        metainfo.push(b'e');

        let torrent = Torrent::from_bytes(&metainfo).unwrap();
        let urls = torrent.tracker_urls();

        // Flattened and deduplicated across tiers
        assert_eq!(urls.len(), 2);
        assert!(urls.contains(&"http://tracker.example/announce".to_string()));
        assert!(urls.contains(&"http://backup.example/announce".to_string()));
    }
}
