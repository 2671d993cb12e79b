//! # Marten BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent protocol implementation
//! - Magnet link support via the metadata extension (BEP-9/BEP-10)
//! - Basic multitracker support
//! - Multi-peer concurrent downloading
//! - Piece verification with SHA-1 hashing
//! - Progress tracking with visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! marten info <torrent_file>
//! marten download -o <output_file> <torrent_file>
//! marten magnet_download -o <output_file> <magnet_link>
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, loads metainfo, coordinates download
//! - **Worker threads**: Each handles communication with one peer
//! - **Channels**: Coordinate piece work distribution and completion counting

#[macro_use]
extern crate log;

mod assemble;
mod bencode;
mod client;
mod handshake;
mod magnet;
mod message;
mod peer;
mod piece;
mod torrent;
mod tracker;
mod worker;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use client::Client;
use magnet::Magnet;
use peer::Peer;
use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a bencoded string and print it as JSON
    Decode {
        /// The bencoded value
        value: String,
    },

    /// Print the metainfo of a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Print the peers announced by the torrent's trackers
    Peers {
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Handshake with one peer and print its peer id
    Handshake {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Peer address as ip:port
        peer: String,
    },

    /// Download a single piece
    #[command(name = "download_piece")]
    DownloadPiece {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Piece index
        piece: u32,
    },

    /// Download the whole file
    Download {
        /// Output filename (defaults to name from torrent)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Print the tracker URL and info hash of a magnet link
    #[command(name = "magnet_parse")]
    MagnetParse {
        /// The magnet link
        link: String,
    },

    /// Handshake with one peer from a magnet link and print its ids
    #[command(name = "magnet_handshake")]
    MagnetHandshake {
        /// The magnet link
        link: String,
    },

    /// Fetch and print the metainfo behind a magnet link
    #[command(name = "magnet_info")]
    MagnetInfo {
        /// The magnet link
        link: String,
    },

    /// Download a single piece from a magnet link
    #[command(name = "magnet_download_piece")]
    MagnetDownloadPiece {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// The magnet link
        link: String,
        /// Piece index
        piece: u32,
    },

    /// Download the whole file from a magnet link
    #[command(name = "magnet_download")]
    MagnetDownload {
        /// Output filename (defaults to name from metadata)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// The magnet link
        link: String,
    },
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    // Use default name if empty
    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Pick the output path, falling back to the torrent's sanitized name.
fn output_path(output: Option<PathBuf>, torrent: &Torrent) -> PathBuf {
    match output {
        Some(path) => path,
        None => PathBuf::from(sanitize_filename(torrent.name())),
    }
}

fn cmd_decode(value: &str) -> Result<()> {
    let decoded = bencode::decode(value.as_bytes())?;
    println!("{}", bencode::to_json(&decoded));
    Ok(())
}

fn print_info(torrent: &Torrent) {
    println!("Tracker URL: {}", torrent.announce());
    println!("Length: {}", torrent.length());
    println!("Info Hash: {}", hex::encode(torrent.info_hash()));
    println!("Piece Length: {}", torrent.piece_length());
    println!("Piece Hashes:");
    for piece_hash in torrent.pieces_hashes() {
        println!("{}", hex::encode(piece_hash));
    }
}

fn cmd_info(torrent_path: &Path) -> Result<()> {
    let torrent = Torrent::open(torrent_path)?;
    print_info(&torrent);
    Ok(())
}

fn cmd_peers(torrent_path: &Path) -> Result<()> {
    let torrent = Torrent::open(torrent_path)?;
    for peer in torrent.peers()? {
        println!("{}", peer);
    }
    Ok(())
}

fn cmd_handshake(torrent_path: &Path, peer_addr: &str) -> Result<()> {
    let torrent = Torrent::open(torrent_path)?;
    let peer = Peer::from_addr(peer_addr)?;

    let mut client = Client::new(peer, torrent.info_hash().to_vec())?;
    client.set_connection_timeout(30)?;
    client.handshake_with_peer(false)?;

    println!("Peer ID: {}", hex::encode(client.remote_peer_id()));
    Ok(())
}

fn cmd_download_piece(output: &Path, torrent_path: &Path, piece: u32) -> Result<()> {
    let torrent = Torrent::open(torrent_path)?;
    torrent.download_piece(output, piece)
}

fn cmd_download(output: Option<PathBuf>, torrent_path: &Path) -> Result<()> {
    let torrent = Torrent::open(torrent_path)?;
    torrent.download(&output_path(output, &torrent))
}

fn cmd_magnet_parse(link: &str) -> Result<()> {
    let magnet = Magnet::parse(link)?;
    println!("Tracker URL: {}", magnet.tracker_url);
    println!("Info Hash: {}", hex::encode(&magnet.info_hash));
    Ok(())
}

fn cmd_magnet_handshake(link: &str) -> Result<()> {
    let magnet = Magnet::parse(link)?;
    let tracker_urls = vec![magnet.tracker_url.clone()];
    let peers = tracker::request_peers(&tracker_urls, &magnet.info_hash, 1)?;

    let mut last_error = anyhow!("no peers available");
    for peer in peers {
        match Client::dial_magnet(peer.clone(), magnet.info_hash.clone()) {
            Ok((client, extension_id)) => {
                println!("Peer ID: {}", hex::encode(client.remote_peer_id()));
                println!("Peer Metadata Extension ID: {}", extension_id);
                return Ok(());
            }
            Err(e) => {
                debug!("could not handshake with peer {}: {}", peer, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

fn cmd_magnet_info(link: &str) -> Result<()> {
    let magnet = Magnet::parse(link)?;
    let torrent = Torrent::from_magnet(&magnet)?;
    print_info(&torrent);
    Ok(())
}

fn cmd_magnet_download_piece(output: &Path, link: &str, piece: u32) -> Result<()> {
    let magnet = Magnet::parse(link)?;
    let torrent = Torrent::from_magnet(&magnet)?;
    torrent.download_piece(output, piece)
}

fn cmd_magnet_download(output: Option<PathBuf>, link: &str) -> Result<()> {
    let magnet = Magnet::parse(link)?;
    let torrent = Torrent::from_magnet(&magnet)?;
    torrent.download(&output_path(output, &torrent))
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Decode { value } => cmd_decode(&value),
        Command::Info { torrent } => cmd_info(&torrent),
        Command::Peers { torrent } => cmd_peers(&torrent),
        Command::Handshake { torrent, peer } => cmd_handshake(&torrent, &peer),
        Command::DownloadPiece {
            output,
            torrent,
            piece,
        } => cmd_download_piece(&output, &torrent, piece),
        Command::Download { output, torrent } => cmd_download(output, &torrent),
        Command::MagnetParse { link } => cmd_magnet_parse(&link),
        Command::MagnetHandshake { link } => cmd_magnet_handshake(&link),
        Command::MagnetInfo { link } => cmd_magnet_info(&link),
        Command::MagnetDownloadPiece {
            output,
            link,
            piece,
        } => cmd_magnet_download_piece(&output, &link, piece),
        Command::MagnetDownload { output, link } => cmd_magnet_download(output, &link),
    }
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filename_strips_separators() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("debian.iso"), "debian.iso");
        assert_eq!(sanitize_filename("  "), "download");
    }
}
