//! # Resource Sessions
//!
//! A [`Resource`] is the handle to one versioned store on disk: the data
//! file, the revisions-offset file, and the intent-log directory. The
//! session owns the process-wide state shared by its transactions — the
//! page cache, the commit lock, and the writer slot — as explicit handles;
//! nothing here is a global.
//!
//! Creating a resource bootstraps revision 0 (empty subtrees, empty name
//! page) so a fresh resource is immediately readable. Opening an existing
//! resource garbage-collects intent logs left behind by transactions that
//! never committed; their on-disk effect is nil because the uber beacon
//! never moved.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use crate::cache::PageCache;
use crate::config::{ReaderKind, ResourceConfig};
use crate::error::StorageError;
use crate::io::{FileReader, MmapReader, Reader};
use crate::txn::{PageReadTrx, PageWriteTrx, TrxLog};

/// State shared by every transaction of a resource.
pub(crate) struct ResourceShared {
    pub(crate) config: ResourceConfig,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) writer_active: AtomicBool,
}

/// Session handle for one resource. Cheap to clone; all clones share the
/// cache, commit lock, and writer slot.
#[derive(Clone)]
pub struct Resource {
    shared: Arc<ResourceShared>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Resource {
    /// Creates the resource directory and commits the bootstrap revision 0.
    pub fn create(config: ResourceConfig) -> Result<Self> {
        ensure!(
            !config.data_file().exists(),
            StorageError::InvalidArgument(format!(
                "resource at '{}' already exists",
                config.path().display()
            ))
        );
        std::fs::create_dir_all(config.path()).wrap_err_with(|| {
            format!(
                "failed to create resource directory '{}'",
                config.path().display()
            )
        })?;

        let resource = Self::assemble(config);
        let mut bootstrap = PageWriteTrx::begin(Arc::clone(&resource.shared), true)?;
        bootstrap
            .commit()
            .wrap_err("failed to commit bootstrap revision")?;
        drop(bootstrap);
        Ok(resource)
    }

    /// Opens an existing resource, validating its anchor and collecting
    /// stale intent logs.
    pub fn open(config: ResourceConfig) -> Result<Self> {
        ensure!(
            config.data_file().exists(),
            StorageError::InvalidArgument(format!(
                "no resource at '{}'",
                config.path().display()
            ))
        );
        TrxLog::discard_unfinished(&config.log_dir())?;

        // Probe the anchor so corruption surfaces at open, not first use.
        let mut probe = FileReader::open(config.data_file(), config.byte_pipe().clone())?;
        probe.read_uber_page().wrap_err_with(|| {
            format!("resource at '{}' is corrupt", config.path().display())
        })?;

        Ok(Self::assemble(config))
    }

    fn assemble(config: ResourceConfig) -> Self {
        let cache = Arc::new(PageCache::new(config.cache_capacity()));
        Self {
            shared: Arc::new(ResourceShared {
                config,
                cache,
                commit_lock: Mutex::new(()),
                writer_active: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.shared.config
    }

    pub fn path(&self) -> &Path {
        self.shared.config.path()
    }

    /// Opens a read transaction at `revision`, or at the latest committed
    /// revision when `None`.
    pub fn begin_read(&self, revision: Option<u32>) -> Result<PageReadTrx> {
        let config = &self.shared.config;
        let reader: Box<dyn Reader> = match config.reader_kind() {
            ReaderKind::File => Box::new(FileReader::open(
                config.data_file(),
                config.byte_pipe().clone(),
            )?),
            ReaderKind::MemoryMapped => Box::new(MmapReader::open(
                config.data_file(),
                config.offsets_file(),
                config.byte_pipe().clone(),
            )?),
        };
        PageReadTrx::open(
            reader,
            Arc::clone(&self.shared.cache),
            config.versioning(),
            config.revisions_to_restore(),
            revision,
        )
    }

    /// Opens the resource's single write transaction. Fails with
    /// `InvalidState` while another one is active.
    pub fn begin_write(&self) -> Result<PageWriteTrx> {
        PageWriteTrx::begin(Arc::clone(&self.shared), false)
    }
}
