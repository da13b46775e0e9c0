//! # Page Read Transaction
//!
//! A read-only view of one committed revision. The transaction pins the
//! uber page and the revision root it was opened against; every lookup
//! resolves the record's leaf through the indirect trie, collects the
//! leaf's version history, and merges it with the resource's revisioning
//! policy. Committed pages are immutable, so any number of read
//! transactions run concurrently without synchronization — each owns its
//! reader handle and shares only the (concurrent-safe) page cache.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::cache::PageCache;
use crate::config::{RECORD_PAGE_EXPONENT, REVISION_TRIE_SHIFTS, NULL_ID};
use crate::error::StorageError;
use crate::io::Reader;
use crate::page::{
    NameKind, Page, PageKind, PageReference, RecordPage, RevisionRootPage, UberPage,
};
use crate::record::Record;
use crate::trie;
use crate::versioning::Versioning;

/// Reads a page through the shared cache, falling back to the reader.
pub(crate) fn read_page_cached(
    reader: &mut dyn Reader,
    cache: &PageCache,
    key: i64,
) -> Result<Arc<Page>> {
    if let Some(page) = cache.get(key) {
        return Ok(page);
    }
    let page = Arc::new(reader.read_page(key)?);
    cache.insert(key, Arc::clone(&page));
    Ok(page)
}

/// Walks one trie from `start`, returning the leaf reference or `None` as
/// soon as an edge is not materialized.
pub(crate) fn resolve_leaf(
    reader: &mut dyn Reader,
    cache: &PageCache,
    start: &PageReference,
    key: u64,
    shifts: &[u64],
) -> Result<Option<PageReference>> {
    let offsets = trie::level_offsets(key, shifts)?;
    let mut reference = start.thin();
    for offset in offsets {
        if !reference.is_persisted() {
            return Ok(None);
        }
        let page = read_page_cached(reader, cache, reference.key)?;
        reference = page.as_indirect()?.reference(offset).thin();
    }
    Ok(Some(reference))
}

/// Loads the revision root for `revision`, preferring the reader's dense
/// index over the trie walk.
pub(crate) fn load_revision_root(
    reader: &mut dyn Reader,
    cache: &PageCache,
    uber: &UberPage,
    revision: u32,
) -> Result<RevisionRootPage> {
    ensure!(
        revision <= uber.revision(),
        StorageError::InvalidArgument(format!(
            "revision {revision} does not exist (latest is {})",
            uber.revision()
        ))
    );
    let key = match reader.revision_root_offset(revision)? {
        Some(key) => key,
        None => {
            let leaf = resolve_leaf(
                reader,
                cache,
                uber.indirect_reference(),
                revision as u64,
                &REVISION_TRIE_SHIFTS,
            )?;
            match leaf {
                Some(reference) if reference.is_persisted() => reference.key,
                _ => bail!(StorageError::Corruption(format!(
                    "revision {revision} is missing from the revision trie"
                ))),
            }
        }
    };
    match &*read_page_cached(reader, cache, key)? {
        Page::RevisionRoot(root) => Ok(root.clone()),
        other => bail!(StorageError::Corruption(format!(
            "revision trie leaf points at a {:?} page",
            other.kind()
        ))),
    }
}

pub struct PageReadTrx {
    reader: Box<dyn Reader>,
    cache: Arc<PageCache>,
    versioning: Versioning,
    revisions_to_restore: u32,
    uber: UberPage,
    root: RevisionRootPage,
    closed: bool,
}

impl std::fmt::Debug for PageReadTrx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReadTrx")
            .field("versioning", &self.versioning)
            .field("revisions_to_restore", &self.revisions_to_restore)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PageReadTrx {
    /// Opens a snapshot of `revision` (or the latest committed revision).
    pub(crate) fn open(
        mut reader: Box<dyn Reader>,
        cache: Arc<PageCache>,
        versioning: Versioning,
        revisions_to_restore: u32,
        revision: Option<u32>,
    ) -> Result<Self> {
        let (_, uber) = reader.read_uber_page()?;
        let revision = revision.unwrap_or_else(|| uber.revision());
        let root = load_revision_root(reader.as_mut(), &cache, &uber, revision)?;
        Ok(Self {
            reader,
            cache,
            versioning,
            revisions_to_restore,
            uber,
            root,
            closed: false,
        })
    }

    /// Snapshot of a resource that has never committed: an in-memory
    /// bootstrap uber page and an empty revision root. Only the bootstrap
    /// write transaction uses this.
    pub(crate) fn bootstrap(
        reader: Box<dyn Reader>,
        cache: Arc<PageCache>,
        versioning: Versioning,
        revisions_to_restore: u32,
    ) -> Self {
        Self {
            reader,
            cache,
            versioning,
            revisions_to_restore,
            uber: UberPage::bootstrap(),
            root: RevisionRootPage::new(0),
            closed: false,
        }
    }

    fn assert_not_closed(&self) -> Result<()> {
        ensure!(
            !self.closed,
            StorageError::InvalidState("transaction is closed".into())
        );
        Ok(())
    }

    fn assert_record_subtree(kind: PageKind) -> Result<()> {
        ensure!(
            kind.is_record_subtree(),
            StorageError::InvalidArgument(format!("{kind:?} is not a record subtree"))
        );
        Ok(())
    }

    /// Number of the revision this snapshot observes.
    pub fn revision_number(&self) -> u32 {
        self.root.revision()
    }

    pub fn uber_page(&self) -> &UberPage {
        &self.uber
    }

    pub(crate) fn revision_root(&self) -> &RevisionRootPage {
        &self.root
    }

    pub(crate) fn versioning(&self) -> Versioning {
        self.versioning
    }

    pub(crate) fn revisions_to_restore(&self) -> u32 {
        self.revisions_to_restore
    }

    /// Highest record key allocated in `kind`'s subtree, −1 if none.
    pub fn max_record_key(&self, kind: PageKind) -> Result<i64> {
        self.assert_not_closed()?;
        Self::assert_record_subtree(kind)?;
        Ok(self
            .root
            .max_record_key(kind)
            .expect("checked record subtree"))
    }

    /// Looks up `record_key` in `kind`'s subtree. Tombstoned and absent
    /// records are both `None`.
    pub fn get_record(&mut self, record_key: i64, kind: PageKind) -> Result<Option<Record>> {
        self.assert_not_closed()?;
        Self::assert_record_subtree(kind)?;
        ensure!(
            record_key >= 0,
            StorageError::InvalidArgument(format!("record key {record_key} is negative"))
        );

        let page_key = (record_key as u64) >> RECORD_PAGE_EXPONENT;
        let leaf = match self.resolve_record_leaf(page_key, kind)? {
            Some(leaf) if leaf.is_persisted() => leaf,
            _ => return Ok(None),
        };
        let versions = self.collect_history(leaf.key)?;
        let complete = self.versioning.combine_for_read(&versions);
        Ok(complete
            .get(record_key)
            .filter(|record| !record.is_deleted())
            .cloned())
    }

    /// Reads a page through the shared cache.
    pub(crate) fn read_page(&mut self, key: i64) -> Result<Arc<Page>> {
        read_page_cached(self.reader.as_mut(), &self.cache, key)
    }

    /// Resolves the leaf reference of `page_key` in `kind`'s subtree.
    pub(crate) fn resolve_record_leaf(
        &mut self,
        page_key: u64,
        kind: PageKind,
    ) -> Result<Option<PageReference>> {
        let start = self
            .root
            .subtree_reference(kind)
            .expect("checked record subtree")
            .thin();
        let shifts = *self.uber.page_count_exp(kind);
        resolve_leaf(
            self.reader.as_mut(),
            &self.cache,
            &start,
            page_key,
            &shifts,
        )
    }

    /// Collects the version history of a leaf: newest first, following
    /// back-pointers until the nearest full dump, the policy's window
    /// bound, or the head of the chain.
    pub(crate) fn collect_history(&mut self, leaf_key: i64) -> Result<SmallVec<[RecordPage; 4]>> {
        let window = self.versioning.restore_window(self.revisions_to_restore);
        let mut versions: SmallVec<[RecordPage; 4]> = SmallVec::new();
        let mut key = leaf_key;
        loop {
            let page = read_page_cached(self.reader.as_mut(), &self.cache, key)?;
            let record_page = page.as_record()?.clone();
            let full_dump = record_page.is_full_dump();
            let previous = record_page.previous();
            versions.push(record_page);
            if full_dump || versions.len() >= window || previous == NULL_ID {
                break;
            }
            key = previous;
        }
        Ok(versions)
    }

    /// Looks up an interned name.
    pub fn get_name(&mut self, name_key: i32, kind: NameKind) -> Result<Option<String>> {
        self.assert_not_closed()?;
        let reference = self.root.name_reference();
        if !reference.is_persisted() {
            return Ok(None);
        }
        let key = reference.key;
        let page = read_page_cached(self.reader.as_mut(), &self.cache, key)?;
        match &*page {
            Page::Name(name_page) => Ok(name_page.get_name(name_key, kind).map(str::to_owned)),
            other => bail!(StorageError::Corruption(format!(
                "name reference points at a {:?} page",
                other.kind()
            ))),
        }
    }

    /// Materializes the current name page, if any.
    pub(crate) fn name_page(&mut self) -> Result<Option<crate::page::NamePage>> {
        let reference = self.root.name_reference();
        if !reference.is_persisted() {
            return Ok(None);
        }
        let key = reference.key;
        let page = read_page_cached(self.reader.as_mut(), &self.cache, key)?;
        match &*page {
            Page::Name(name_page) => Ok(Some(name_page.clone())),
            other => bail!(StorageError::Corruption(format!(
                "name reference points at a {:?} page",
                other.kind()
            ))),
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
