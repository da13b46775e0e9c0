//! # Page Write Transaction
//!
//! All mutation funnels through one write transaction per resource. The
//! transaction never touches committed pages: it stages record-page
//! containers in the intent log, materializes copy-on-write paths of
//! indirect pages in memory, and publishes everything in a single commit.
//!
//! ## Container slot protocol
//!
//! Record mutations follow a strict open/close discipline:
//!
//! 1. `prepare_entry_for_modification` materializes the record's container,
//!    copies the record into the `modified` overlay, and parks the container
//!    in the transaction's single *current* slot.
//! 2. The caller edits the returned record in place.
//! 3. `finish_entry_modification` writes the container back to its subtree
//!    log and frees the slot.
//!
//! Opening a second container while one is parked, or finishing when none
//! is, fails with `InvalidState`. `create_entry` and `remove_entry` run the
//! whole cycle internally.
//!
//! ## Commit
//!
//! Commit happens under the resource's commit lock:
//!
//! 1. Build the copy-on-write trie path for every staged container and for
//!    the new revision root's slot in the uber trie.
//! 2. Walk the dirty tree post-order: children are fully on disk before any
//!    page referencing them serializes, so every page is written exactly
//!    once and the file never references unwritten state.
//! 3. Fsync the data file, then flip the uber beacon — the linearization
//!    point — and fsync again.
//! 4. Append the revision root's offset to the revisions-offset file and
//!    drop the intent log.
//!
//! A crash anywhere before the beacon flip leaves the previous revision
//! intact; the appended pages are unreferenced garbage and the surviving
//! intent log is replayed or collected on the next open.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{bail, ensure, Result, WrapErr};

use crate::config::{NULL_ID, RECORD_PAGE_EXPONENT, REVISION_TRIE_SHIFTS};
use crate::error::StorageError;
use crate::io::bytepipe::ByteHandlerPipeline;
use crate::io::{FileReader, FileWriter};
use crate::page::{
    IndirectPage, NameKind, NamePage, Page, PageKind, PageReference, RecordPageContainer,
    RevisionRootPage, UberPage, RECORD_SUBTREES,
};
use crate::record::Record;
use crate::resource::ResourceShared;
use crate::trie;
use crate::txn::{PageReadTrx, TrxLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrxState {
    Active,
    Committed,
    Closed,
}

struct CurrentContainer {
    kind: PageKind,
    page_key: u64,
    container: RecordPageContainer,
}

#[derive(Default)]
struct CommitOutcome {
    revision_root_key: Option<i64>,
    uber: Option<UberPage>,
}

pub struct PageWriteTrx {
    shared: Arc<ResourceShared>,
    read_trx: PageReadTrx,
    writer: FileWriter,
    log: Option<TrxLog>,
    new_uber: UberPage,
    new_root: RevisionRootPage,
    new_revision: u32,
    base_revision: u32,
    current: Option<CurrentContainer>,
    state: TrxState,
}

impl std::fmt::Debug for PageWriteTrx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWriteTrx")
            .field("new_revision", &self.new_revision)
            .field("base_revision", &self.base_revision)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PageWriteTrx {
    /// Begins the resource's single write transaction. `bootstrap` is set
    /// only for the internal commit of revision 0 on a fresh resource.
    pub(crate) fn begin(shared: Arc<ResourceShared>, bootstrap: bool) -> Result<Self> {
        ensure!(
            !shared.writer_active.swap(true, Ordering::AcqRel),
            StorageError::InvalidState(
                "another write transaction is active on this resource".into()
            )
        );
        let trx = Self::begin_inner(&shared, bootstrap);
        if trx.is_err() {
            shared.writer_active.store(false, Ordering::Release);
        }
        trx
    }

    fn begin_inner(shared: &Arc<ResourceShared>, bootstrap: bool) -> Result<Self> {
        let config = &shared.config;
        let pipe: ByteHandlerPipeline = config.byte_pipe().clone();
        let writer = FileWriter::open(config.data_file(), config.offsets_file(), pipe.clone())?;

        // The transaction's snapshot always reads through a buffered handle;
        // the data file grows underneath it during commit.
        let reader = Box::new(FileReader::open(config.data_file(), pipe)?);
        let (read_trx, new_uber, new_root, base_revision, new_revision) = if bootstrap {
            let read_trx = PageReadTrx::bootstrap(
                reader,
                Arc::clone(&shared.cache),
                config.versioning(),
                config.revisions_to_restore(),
            );
            (read_trx, UberPage::bootstrap(), RevisionRootPage::new(0), 0, 0)
        } else {
            let read_trx = PageReadTrx::open(
                reader,
                Arc::clone(&shared.cache),
                config.versioning(),
                config.revisions_to_restore(),
                None,
            )?;
            let base = read_trx.revision_number();
            let next = base + 1;
            let uber = read_trx.uber_page().to_next_revision(next);
            let root = read_trx.revision_root().to_next_revision(next);
            (read_trx, uber, root, base, next)
        };

        let log = TrxLog::create(&config.log_dir(), new_revision)?;

        let mut trx = Self {
            shared: Arc::clone(shared),
            read_trx,
            writer,
            log: Some(log),
            new_uber,
            new_root,
            new_revision,
            base_revision,
            current: None,
            state: TrxState::Active,
        };
        trx.materialize_name_page()?;
        Ok(trx)
    }

    /// The name page is mutable for the whole transaction, so it is
    /// materialized into the new root eagerly and rewritten every commit.
    fn materialize_name_page(&mut self) -> Result<()> {
        let page = match self.read_trx.name_page()? {
            Some(page) => page,
            None => NamePage::new(),
        };
        self.new_root.name_reference_mut().page = Some(Box::new(Page::Name(page)));
        Ok(())
    }

    fn assert_active(&self) -> Result<()> {
        ensure!(
            self.state == TrxState::Active,
            StorageError::InvalidState(format!(
                "write transaction is {}",
                match self.state {
                    TrxState::Committed => "already committed",
                    _ => "closed",
                }
            ))
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

    fn log_mut(&mut self) -> &mut TrxLog {
        self.log.as_mut().expect("active transaction owns its log")
    }

    /// Revision this transaction will commit.
    pub fn revision_number(&self) -> u32 {
        self.new_revision
    }

    /// Revision this transaction was opened against.
    pub fn base_revision(&self) -> u32 {
        self.base_revision
    }

    pub fn uber_page(&self) -> &UberPage {
        &self.new_uber
    }

    /// Highest record key allocated in `kind`'s subtree, −1 if none.
    pub fn max_record_key(&self, kind: PageKind) -> Result<i64> {
        Self::assert_record_subtree(kind)?;
        Ok(self
            .new_root
            .max_record_key(kind)
            .expect("checked record subtree"))
    }

    /// Materializes (or fetches the staged) container for `page_key`.
    fn prepare_record_page(
        &mut self,
        page_key: u64,
        kind: PageKind,
    ) -> Result<RecordPageContainer> {
        if let Some(container) = self.log_mut().get_container(kind, page_key)? {
            return Ok(container);
        }

        let leaf = self.read_trx.resolve_record_leaf(page_key, kind)?;
        let container = match leaf {
            Some(reference) if reference.is_persisted() => {
                let versions = self.read_trx.collect_history(reference.key)?;
                self.read_trx.versioning().combine_for_modification(
                    &versions,
                    self.read_trx.revisions_to_restore(),
                    self.new_revision,
                )
            }
            _ => RecordPageContainer::fresh(page_key, self.new_revision, kind),
        };
        self.log_mut().put_container(kind, page_key, &container)?;
        Ok(container)
    }

    /// Opens `record_key`'s container into the current slot and returns the
    /// staged record for in-place modification. The caller must close the
    /// cycle with [`finish_entry_modification`](Self::finish_entry_modification).
    pub fn prepare_entry_for_modification(
        &mut self,
        record_key: i64,
        kind: PageKind,
    ) -> Result<&mut Record> {
        self.assert_active()?;
        Self::assert_record_subtree(kind)?;
        ensure!(
            record_key >= 0,
            StorageError::InvalidArgument(format!("record key {record_key} is negative"))
        );
        ensure!(
            self.current.is_none(),
            StorageError::InvalidState(
                "another record page container is already open for updates".into()
            )
        );

        let page_key = (record_key as u64) >> RECORD_PAGE_EXPONENT;
        let mut container = self.prepare_record_page(page_key, kind)?;
        if !container.modified().contains(record_key) {
            let record = container
                .complete()
                .get(record_key)
                .filter(|record| !record.is_deleted())
                .cloned()
                .ok_or_else(|| {
                    eyre::Report::from(StorageError::NotFound(format!(
                        "record {record_key} does not exist in {kind:?}"
                    )))
                })?;
            container.modified_mut().set(record);
        }

        self.current = Some(CurrentContainer {
            kind,
            page_key,
            container,
        });
        Ok(self
            .current
            .as_mut()
            .expect("slot populated above")
            .container
            .modified_mut()
            .get_mut(record_key)
            .expect("record staged above"))
    }

    /// Writes the current container back to its subtree log and frees the
    /// slot.
    pub fn finish_entry_modification(&mut self, record_key: i64, kind: PageKind) -> Result<()> {
        self.assert_active()?;
        Self::assert_record_subtree(kind)?;
        let page_key = (record_key.max(0) as u64) >> RECORD_PAGE_EXPONENT;
        let current = self.current.take().ok_or_else(|| {
            eyre::Report::from(StorageError::InvalidState(
                "no record page container is open for updates".into(),
            ))
        })?;
        if current.kind != kind || current.page_key != page_key {
            let message = format!(
                "open container covers {:?} page {}, not {kind:?} page {page_key}",
                current.kind, current.page_key
            );
            self.current = Some(current);
            bail!(StorageError::InvalidState(message));
        }
        self.log_mut()
            .put_container(kind, page_key, &current.container)
    }

    /// Creates a record under a freshly allocated key and returns it.
    pub fn create_entry(&mut self, data: Vec<u8>, kind: PageKind) -> Result<Record> {
        self.assert_active()?;
        Self::assert_record_subtree(kind)?;
        ensure!(
            self.current.is_none(),
            StorageError::InvalidState(
                "another record page container is already open for updates".into()
            )
        );

        let record_key = self
            .new_root
            .increment_max_record_key(kind)
            .expect("checked record subtree");
        let page_key = (record_key as u64) >> RECORD_PAGE_EXPONENT;
        let mut container = self.prepare_record_page(page_key, kind)?;
        let record = Record::new(record_key, data);
        container.modified_mut().set(record.clone());
        container.complete_mut().set(record.clone());
        self.log_mut().put_container(kind, page_key, &container)?;
        Ok(record)
    }

    /// Replaces the record with a tombstone in both container views.
    pub fn remove_entry(&mut self, record_key: i64, kind: PageKind) -> Result<()> {
        self.assert_active()?;
        Self::assert_record_subtree(kind)?;
        ensure!(
            record_key >= 0,
            StorageError::InvalidArgument(format!("record key {record_key} is negative"))
        );
        ensure!(
            self.current.is_none(),
            StorageError::InvalidState(
                "another record page container is already open for updates".into()
            )
        );

        let page_key = (record_key as u64) >> RECORD_PAGE_EXPONENT;
        let mut container = self.prepare_record_page(page_key, kind)?;
        let exists = container
            .modified()
            .get(record_key)
            .or_else(|| container.complete().get(record_key))
            .is_some_and(|record| !record.is_deleted());
        ensure!(
            exists,
            StorageError::NotFound(format!("record {record_key} does not exist in {kind:?}"))
        );

        let tombstone = Record::tombstone(record_key);
        container.modified_mut().set(tombstone.clone());
        container.complete_mut().set(tombstone);
        self.log_mut().put_container(kind, page_key, &container)
    }

    /// Reads through the transaction's own staged state, falling back to the
    /// base-revision snapshot.
    pub fn get_record(&mut self, record_key: i64, kind: PageKind) -> Result<Option<Record>> {
        self.assert_active()?;
        Self::assert_record_subtree(kind)?;
        ensure!(
            record_key >= 0,
            StorageError::InvalidArgument(format!("record key {record_key} is negative"))
        );

        let page_key = (record_key as u64) >> RECORD_PAGE_EXPONENT;
        if let Some(container) = self.log_mut().get_container(kind, page_key)? {
            let record = container
                .modified()
                .get(record_key)
                .or_else(|| container.complete().get(record_key));
            return Ok(record.filter(|record| !record.is_deleted()).cloned());
        }
        self.read_trx.get_record(record_key, kind)
    }

    fn name_page_mut(&mut self) -> &mut NamePage {
        match self.new_root.name_reference_mut().page.as_deref_mut() {
            Some(Page::Name(page)) => page,
            _ => unreachable!("name page is materialized at transaction start"),
        }
    }

    fn name_page(&self) -> &NamePage {
        match self.new_root.name_reference().page.as_deref() {
            Some(Page::Name(page)) => page,
            _ => unreachable!("name page is materialized at transaction start"),
        }
    }

    /// Interns `name` into the new revision's name page.
    pub fn create_name_key(&mut self, name: Option<&str>, kind: NameKind) -> Result<i32> {
        self.assert_active()?;
        Ok(self.name_page_mut().create_name_key(name, kind))
    }

    pub fn get_name(&mut self, name_key: i32, kind: NameKind) -> Result<Option<String>> {
        self.assert_active()?;
        Ok(self.name_page().get_name(name_key, kind).map(str::to_owned))
    }

    pub fn remove_name(&mut self, name_key: i32, kind: NameKind) -> Result<()> {
        self.assert_active()?;
        self.name_page_mut().remove_name(name_key, kind);
        Ok(())
    }

    /// Commits the staged revision and returns the new uber page. The
    /// transaction is finished afterwards; only `close` remains valid.
    pub fn commit(&mut self) -> Result<UberPage> {
        self.assert_active()?;
        ensure!(
            self.current.is_none(),
            StorageError::InvalidState(
                "a record page container is still open for updates".into()
            )
        );

        let shared = Arc::clone(&self.shared);
        let _guard = shared.commit_lock.lock();

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);
        self.new_root.set_commit_timestamp(millis);

        // Copy-on-write paths for every staged record page.
        for kind in RECORD_SUBTREES {
            let page_keys = self
                .log
                .as_ref()
                .expect("active transaction owns its log")
                .container_keys(kind);
            let shifts = *self.read_trx.uber_page().page_count_exp(kind);
            for page_key in page_keys {
                let offsets = trie::level_offsets(page_key, &shifts)?;
                let root_reference = self
                    .new_root
                    .subtree_reference_mut(kind)
                    .expect("record subtree");
                let leaf = prepare_leaf(
                    root_reference,
                    &offsets,
                    self.new_revision,
                    &mut self.read_trx,
                    self.log.as_mut().expect("active transaction owns its log"),
                )?;
                leaf.kind = kind;
                leaf.key_value_page_key = page_key as i64;
            }
        }

        // Slot the new revision root into the uber trie.
        let offsets = trie::level_offsets(self.new_revision as u64, &REVISION_TRIE_SHIFTS)?;
        let root_leaf = prepare_leaf(
            self.new_uber.indirect_reference_mut(),
            &offsets,
            self.new_revision,
            &mut self.read_trx,
            self.log.as_mut().expect("active transaction owns its log"),
        )?;
        root_leaf.kind = PageKind::RevisionRoot;
        let new_root = std::mem::replace(
            &mut self.new_root,
            RevisionRootPage::new(self.new_revision),
        );
        root_leaf.page = Some(Box::new(Page::RevisionRoot(new_root)));

        // Post-order write of the dirty tree, uber page last.
        let new_uber =
            std::mem::replace(&mut self.new_uber, UberPage::bootstrap());
        let mut uber_reference = PageReference::new(PageKind::Uber);
        uber_reference.page = Some(Box::new(Page::Uber(new_uber)));

        let mut outcome = CommitOutcome::default();
        commit_reference(
            &mut uber_reference,
            &mut self.writer,
            self.log.as_mut().expect("active transaction owns its log"),
            &mut outcome,
        )?;
        let uber_key = uber_reference.key;
        let revision_root_key = outcome.revision_root_key.ok_or_else(|| {
            eyre::Report::from(StorageError::Corruption(
                "commit wrote no revision root".into(),
            ))
        })?;

        // Everything the new uber page reaches is durable before the beacon
        // flips, and the flip is durable before the offsets index admits the
        // revision.
        self.writer.sync_data().wrap_err("commit failed to sync pages")?;
        self.writer.write_uber_beacon(uber_key)?;
        self.writer.sync_data().wrap_err("commit failed to sync beacon")?;
        self.writer
            .append_revision_offset(self.new_revision, revision_root_key)?;
        self.writer.sync_offsets()?;

        self.log
            .take()
            .expect("active transaction owns its log")
            .finish()?;
        self.state = TrxState::Committed;

        Ok(outcome.uber.expect("commit wrote the uber page"))
    }

    /// Closes the transaction. If it never committed, the staged state is
    /// discarded and the on-disk resource is untouched.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            TrxState::Closed => Ok(()),
            TrxState::Committed => {
                self.state = TrxState::Closed;
                self.shared.writer_active.store(false, Ordering::Release);
                Ok(())
            }
            TrxState::Active => {
                self.state = TrxState::Closed;
                self.current = None;
                let result = match self.log.take() {
                    Some(log) => log.discard(),
                    None => Ok(()),
                };
                self.shared.writer_active.store(false, Ordering::Release);
                result
            }
        }
    }
}

impl Drop for PageWriteTrx {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Descends the trie from `start`, materializing a copy-on-write indirect
/// page at every level, and returns the leaf reference. Each materialized
/// page is mirrored into the intent log for durability.
fn prepare_leaf<'a>(
    start: &'a mut PageReference,
    offsets: &[usize],
    new_revision: u32,
    read_trx: &mut PageReadTrx,
    log: &mut TrxLog,
) -> Result<&'a mut PageReference> {
    let mut reference = start;
    for &offset in offsets {
        if reference.page.is_none() {
            let page = if reference.is_persisted() {
                read_trx
                    .read_page(reference.key)?
                    .as_indirect()?
                    .to_next_revision(new_revision)
            } else {
                IndirectPage::new(new_revision)
            };
            let log_key = log.put_page(&Page::Indirect(page.clone()))?;
            reference.kind = PageKind::Indirect;
            reference.log_key = log_key as i64;
            reference.page = Some(Box::new(Page::Indirect(page)));
        }
        reference = match reference.page.as_deref_mut() {
            Some(Page::Indirect(page)) => page.reference_mut(offset),
            _ => bail!(StorageError::Corruption(
                "trie descent hit a non-indirect page".into()
            )),
        };
    }
    Ok(reference)
}

/// Post-order commit of one reference: children first, then the page
/// itself; the reference's file key is the returned offset. References
/// without staged state are left untouched, so unchanged subtrees stay
/// shared with older revisions.
fn commit_reference(
    reference: &mut PageReference,
    writer: &mut FileWriter,
    log: &mut TrxLog,
    outcome: &mut CommitOutcome,
) -> Result<()> {
    if reference.key_value_page_key != NULL_ID {
        let page_key = reference.key_value_page_key as u64;
        let container = log.get_container(reference.kind, page_key)?.ok_or_else(|| {
            eyre::Report::from(StorageError::Corruption(format!(
                "staged leaf for page {page_key} has no container"
            )))
        })?;
        let page = if container.modified().is_full_dump() {
            container.full_page()
        } else {
            container.modified().clone()
        };
        if page.is_empty() && !page.is_full_dump() {
            // Nothing diverged; the leaf keeps referencing the old version.
            return Ok(());
        }
        reference.key = writer.write_page(&Page::Record(page))?;
        return Ok(());
    }

    let Some(boxed) = reference.page.take() else {
        return Ok(());
    };
    let mut page = *boxed;
    for child in page.references_mut() {
        commit_reference(child, writer, log, outcome)?;
    }
    let key = writer.write_page(&page)?;
    reference.key = key;
    match &page {
        Page::RevisionRoot(_) => outcome.revision_root_key = Some(key),
        Page::Uber(uber) => outcome.uber = Some(uber.clone()),
        _ => {}
    }
    Ok(())
}
