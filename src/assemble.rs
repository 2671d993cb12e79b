//! # Output Assembly
//!
//! This module concatenates the verified per-piece files into the final
//! output file.
//!
//! Workers complete pieces in whatever order the swarm serves them, each
//! into its own `"<path>-<index>"` file. Copying those files back in index
//! order restores the original byte order regardless of completion order.
//! Each temporary is deleted right after it has been copied.

use anyhow::{anyhow, Result};

use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Concatenate the per-piece files into the output file, in index order.
///
/// # Arguments
///
/// * `output` - Path of the final file.
/// * `piece_paths` - Per-piece file paths, ordered by piece index.
///
pub fn assemble(output: &Path, piece_paths: &[impl AsRef<Path>]) -> Result<()> {
    let mut output_file = match File::create(output) {
        Ok(file) => file,
        Err(e) => return Err(anyhow!("could not create output file: {}", e)),
    };

    for piece_path in piece_paths {
        let piece_path = piece_path.as_ref();

        let mut piece_file = match File::open(piece_path) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open piece file {:?}", piece_path)),
        };

        // Stream the piece into the output, then drop the temporary
        if io::copy(&mut piece_file, &mut output_file).is_err() {
            return Err(anyhow!("could not copy piece file {:?}", piece_path));
        }
        if fs::remove_file(piece_path).is_err() {
            return Err(anyhow!("could not remove piece file {:?}", piece_path));
        }
    }

    info!(
        "Assembled {} pieces into {:?}",
        piece_paths.len(),
        output
    );

    Ok(())
}
