//! Navigation math for the indirect tries.
//!
//! A trie level with shift `s` covers the key bits above `s`; descending a
//! level subtracts the bits the chosen slot already consumed. The shift
//! tables live in [`crate::config::constants`] and are exposed per subtree by
//! the uber page.

use eyre::{ensure, Result};

use crate::config::{INDIRECT_REFERENCE_COUNT, MAX_TRIE_KEY};
use crate::error::StorageError;

/// Slot offsets visited from the level-0 reference down to the leaf, one per
/// trie level.
pub fn level_offsets(key: u64, shifts: &[u64]) -> Result<Vec<usize>> {
    ensure!(
        key <= MAX_TRIE_KEY,
        StorageError::InvalidArgument(format!("key {key} exceeds trie key space"))
    );
    let mut offsets = Vec::with_capacity(shifts.len());
    let mut remaining = key;
    for &shift in shifts {
        let offset = (remaining >> shift) as usize;
        remaining -= (offset as u64) << shift;
        debug_assert!(offset < INDIRECT_REFERENCE_COUNT);
        offsets.push(offset);
    }
    Ok(offsets)
}
