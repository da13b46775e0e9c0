//! # Configuration Module
//!
//! Centralized constants plus the per-resource configuration carried by every
//! session. Interdependent constants live in [`constants`] with their
//! relationships documented in one place; `ResourceConfig` captures the
//! choices that vary per resource (versioning policy, reader flavor, byte
//! pipe, cache sizing).

pub mod constants;
pub use constants::*;

use std::path::{Path, PathBuf};

use crate::io::bytepipe::ByteHandlerPipeline;
use crate::versioning::Versioning;

/// Which reader implementation read transactions use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderKind {
    /// Buffered random-access reads through an owned file handle.
    #[default]
    File,
    /// Memory-mapped reads; the revisions-offset file doubles as a dense
    /// revision index that skips the trie walk.
    MemoryMapped,
}

/// Per-resource configuration.
///
/// Built with chained setters, defaults matching a freshly created resource:
///
/// ```ignore
/// let config = ResourceConfig::new("/tmp/db/resource1")
///     .with_versioning(Versioning::SlidingSnapshot)
///     .with_revisions_to_restore(8);
/// ```
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    path: PathBuf,
    versioning: Versioning,
    revisions_to_restore: u32,
    reader_kind: ReaderKind,
    cache_capacity: usize,
    byte_pipe: ByteHandlerPipeline,
}

impl ResourceConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            versioning: Versioning::default(),
            revisions_to_restore: DEFAULT_REVISIONS_TO_RESTORE,
            reader_kind: ReaderKind::default(),
            cache_capacity: DEFAULT_PAGE_CACHE_CAPACITY,
            byte_pipe: ByteHandlerPipeline::deflate(),
        }
    }

    pub fn with_versioning(mut self, versioning: Versioning) -> Self {
        self.versioning = versioning;
        self
    }

    pub fn with_revisions_to_restore(mut self, revisions: u32) -> Self {
        self.revisions_to_restore = revisions.max(1);
        self
    }

    pub fn with_reader(mut self, kind: ReaderKind) -> Self {
        self.reader_kind = kind;
        self
    }

    pub fn with_cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages.max(CACHE_SHARD_COUNT);
        self
    }

    pub fn with_byte_pipe(mut self, pipe: ByteHandlerPipeline) -> Self {
        self.byte_pipe = pipe;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_file(&self) -> PathBuf {
        self.path.join(DATA_FILE_NAME)
    }

    pub fn offsets_file(&self) -> PathBuf {
        self.path.join(OFFSETS_FILE_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path.join(LOG_DIR_NAME)
    }

    pub fn versioning(&self) -> Versioning {
        self.versioning
    }

    pub fn revisions_to_restore(&self) -> u32 {
        self.revisions_to_restore
    }

    pub fn reader_kind(&self) -> ReaderKind {
        self.reader_kind
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    pub fn byte_pipe(&self) -> &ByteHandlerPipeline {
        &self.byte_pipe
    }
}
