//! # File I/O
//!
//! A resource is persisted as two files: the data file, holding
//! length-framed page bodies behind a 12-byte header whose first eight bytes
//! are the file key of the most recent uber page; and the revisions-offset
//! file, a dense array of `i64` revision-root file keys, one per committed
//! revision.
//!
//! Two reader implementations exist. [`FileReader`] performs buffered
//! random-access reads through an owned handle and locates revision roots by
//! walking the trie. [`MmapReader`] maps both files and uses the
//! revisions-offset file as a dense index, skipping the walk. Either way a
//! page body passes through the byte pipe before the codec sees it.
//!
//! Writing is append-only and single-threaded: [`FileWriter`] appends page
//! bodies, updates the uber beacon in place, and extends the offsets file by
//! exactly one entry per commit. A page is fully on disk and fsynced before
//! any reference to it is written — the beacon update is the linearization
//! point of a commit.

pub mod bytepipe;
mod file;
mod mmap;

pub use file::{FileReader, FileWriter};
pub use mmap::MmapReader;

use eyre::Result;

use crate::page::{Page, UberPage};

/// Read access to a resource's persisted pages.
pub trait Reader {
    /// Reads and decodes the page at absolute file offset `key`.
    fn read_page(&mut self, key: i64) -> Result<Page>;

    /// Reads the uber page the beacon currently points at, returning its
    /// file key alongside.
    fn read_uber_page(&mut self) -> Result<(i64, UberPage)>;

    /// File key of the revision root for `revision`, if this reader keeps a
    /// dense index. `None` means the caller walks the trie instead.
    fn revision_root_offset(&mut self, revision: u32) -> Result<Option<i64>>;
}
