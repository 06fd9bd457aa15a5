//! Content-hash change detection for incremental indexing.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Size of the blocks streamed through the hasher.
const HASH_BLOCK_SIZE: usize = 4096;

/// Compute the SHA-256 of a file, streaming it in fixed-size blocks.
pub fn compute_file_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_BLOCK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, hex encoded.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Whether a file with `current_hash` must be re-indexed given the hash
/// stored for it. Only an exact match without `force` skips the file.
pub fn should_reindex(force: bool, stored_hash: Option<&str>, current_hash: &str) -> bool {
    if force {
        return true;
    }
    match stored_hash {
        Some(stored) => stored != current_hash,
        None => true,
    }
}

/// Paths that were indexed before but were not seen in the latest discovery.
pub fn find_deleted_files(indexed: &HashSet<String>, discovered: &HashSet<String>) -> Vec<String> {
    let mut deleted: Vec<String> = indexed.difference(discovered).cloned().collect();
    deleted.sort();
    deleted
}
