//! # Storage Constants
//!
//! This module centralizes the numeric constants of the page store. Constants
//! that depend on each other are co-located and their relationships documented
//! so a change to one is checked against the others.
//!
//! ## Dependency Graph
//!
//! ```text
//! RECORD_PAGE_EXPONENT (10)
//!       │
//!       ├─> RECORDS_PER_PAGE (derived: 1 << 10 = 1024 records per leaf)
//!       │     page_key(record_key) = record_key >> RECORD_PAGE_EXPONENT
//!       │     offset(record_key)   = record_key & (RECORDS_PER_PAGE - 1)
//!       │
//!       └─> RECORD_TRIE_SHIFTS
//!             The trie addresses page keys, i.e. record keys with the low
//!             RECORD_PAGE_EXPONENT bits stripped.
//!
//! INDIRECT_EXPONENT (9)
//!       │
//!       ├─> INDIRECT_REFERENCE_COUNT (derived: 1 << 9 = 512 slots per page)
//!       │
//!       └─> RECORD_TRIE_SHIFTS / REVISION_TRIE_SHIFTS
//!             Each trie level consumes INDIRECT_EXPONENT key bits, so the
//!             shift tables step down by 9 and end at 0. With TRIE_HEIGHT = 5
//!             a trie addresses 2^45 page keys (or revisions).
//!
//! FIRST_BEACON (12)
//!       │
//!       └─> Data file layout: bytes 0..8 hold the file key of the most
//!           recent uber page, bytes 8..12 are reserved, page bodies start
//!           at byte 12. No page may ever be written below this offset.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. Every shift table is strictly decreasing and ends at 0.
//! 2. Adjacent shifts differ by exactly `INDIRECT_EXPONENT`.
//! 3. `RECORDS_PER_PAGE` and `INDIRECT_REFERENCE_COUNT` are powers of two.

/// Exponent of the record-page capacity. A leaf holds `1 << 10` records.
pub const RECORD_PAGE_EXPONENT: u64 = 10;

/// Number of records a record page can hold.
pub const RECORDS_PER_PAGE: usize = 1 << RECORD_PAGE_EXPONENT;

/// Exponent of the indirect-page fanout.
pub const INDIRECT_EXPONENT: u64 = 9;

/// Number of references an indirect page holds.
pub const INDIRECT_REFERENCE_COUNT: usize = 1 << INDIRECT_EXPONENT;

/// Number of indirect levels between a subtree root reference and its leaves.
pub const TRIE_HEIGHT: usize = 5;

/// Per-level shift table for the record-page tries. `shift[level]` is the
/// number of key bits remaining below that level.
pub const RECORD_TRIE_SHIFTS: [u64; TRIE_HEIGHT] = [36, 27, 18, 9, 0];

/// Per-level shift table for the revision-root trie rooted in the uber page.
pub const REVISION_TRIE_SHIFTS: [u64; TRIE_HEIGHT] = [36, 27, 18, 9, 0];

/// Largest key addressable by a trie of `TRIE_HEIGHT` levels.
pub const MAX_TRIE_KEY: u64 = (1 << (RECORD_TRIE_SHIFTS[0] + INDIRECT_EXPONENT)) - 1;

/// Sentinel file key meaning "not yet persisted".
pub const NULL_ID: i64 = -1;

/// Byte offset in the data file where page bodies start. Bytes 0..8 hold the
/// file key of the most recent uber page, bytes 8..12 are reserved.
pub const FIRST_BEACON: u64 = 12;

/// Upper bound accepted for a serialized page body. Larger length prefixes
/// are treated as corruption.
pub const MAX_PAGE_BODY_SIZE: usize = 1 << 30;

/// Default number of revisions a non-FULL policy may need to restore a page.
pub const DEFAULT_REVISIONS_TO_RESTORE: u32 = 4;

/// Number of independent shards in the page cache.
pub const CACHE_SHARD_COUNT: usize = 64;

/// Default page-cache capacity in pages.
pub const DEFAULT_PAGE_CACHE_CAPACITY: usize = 1024;

/// Name of the data file inside a resource directory.
pub const DATA_FILE_NAME: &str = "data.strata";

/// Name of the dense revision → revision-root-offset index file.
pub const OFFSETS_FILE_NAME: &str = "revisions-offsets.strata";

/// Name of the intent-log directory inside a resource directory.
pub const LOG_DIR_NAME: &str = "log";

/// Sentinel file inside a transaction's log directory. Present while the
/// transaction is uncommitted; removed as the last step of a commit.
pub const UNFINISHED_SENTINEL: &str = "unfinished";

const _: () = assert!(RECORD_TRIE_SHIFTS[TRIE_HEIGHT - 1] == 0);
const _: () = assert!(REVISION_TRIE_SHIFTS[TRIE_HEIGHT - 1] == 0);
const _: () = {
    let mut level = 1;
    while level < TRIE_HEIGHT {
        assert!(RECORD_TRIE_SHIFTS[level - 1] - RECORD_TRIE_SHIFTS[level] == INDIRECT_EXPONENT);
        assert!(REVISION_TRIE_SHIFTS[level - 1] - REVISION_TRIE_SHIFTS[level] == INDIRECT_EXPONENT);
        level += 1;
    }
};
