//! # BitTorrent Piece Management
//!
//! This module defines the task records exchanged over the download channels
//! and the piece/block sizing arithmetic.
//!
//! ## Pieces and Blocks
//!
//! A piece is the verification unit of the torrent: every piece has a SHA-1
//! hash in the metainfo, and every piece except possibly the last has the
//! same size. Pieces are transferred in 16 KiB blocks, the unit of wire
//! requests; the last block of a piece carries whatever remains.
//!
//! ## Task Lifecycle
//!
//! The orchestrator enqueues one `PieceTask` per piece. A worker consumes a
//! task, downloads the blocks into the task's file, verifies the digest, and
//! reports a `PieceDone`. Tasks carry indices, hashes and target paths, never
//! data; failed tasks are re-enqueued for another worker.

use std::path::PathBuf;

// Standard block size for piece downloads (16KB)
pub const BLOCK_SIZE_MAX: u32 = 16384;

/// Describes one piece to download.
#[derive(Debug, Clone)]
pub struct PieceTask {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece (20 bytes)
    pub hash: Vec<u8>,
    /// Total length of the piece in bytes
    pub length: u32,
    /// File the verified piece bytes are written to
    pub path: PathBuf,
}

/// Reports one completed, verified piece.
#[derive(Debug, Clone)]
pub struct PieceDone {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Total length of the piece in bytes
    pub length: u32,
}

impl PieceTask {
    pub fn new(index: u32, hash: Vec<u8>, length: u32, path: PathBuf) -> PieceTask {
        PieceTask {
            index,
            hash,
            length,
            path,
        }
    }
}

impl PieceDone {
    pub fn new(index: u32, length: u32) -> PieceDone {
        PieceDone { index, length }
    }
}

/// Get the actual size of a piece.
///
/// Every piece spans `piece_length` bytes except the last, which is clamped
/// to the end of the file.
///
/// # Arguments
///
/// * `index` - The piece index.
/// * `piece_length` - The nominal piece size from the metainfo.
/// * `total_length` - The total file size in bytes.
///
pub fn piece_size(index: u32, piece_length: u32, total_length: u32) -> u32 {
    let begin: u32 = index * piece_length;
    let mut end: u32 = begin + piece_length;

    // Prevent unbounded values
    if end > total_length {
        end = total_length;
    }

    end - begin
}

/// Get the number of blocks in a piece.
pub fn block_count(piece_size: u32) -> u32 {
    piece_size.div_ceil(BLOCK_SIZE_MAX)
}

/// Get the actual size of a block within a piece.
///
/// # Arguments
///
/// * `piece_size` - The actual size of the piece.
/// * `block_index` - The block index within the piece.
///
pub fn block_size(piece_size: u32, block_index: u32) -> u32 {
    let begin = block_index * BLOCK_SIZE_MAX;
    let remaining = piece_size - begin;

    if remaining < BLOCK_SIZE_MAX {
        remaining
    } else {
        BLOCK_SIZE_MAX
    }
}
