//! # Record Pages and Containers
//!
//! A record page is a leaf of a record subtree: a mapping from record key to
//! record, capped at [`RECORDS_PER_PAGE`](crate::config::RECORDS_PER_PAGE)
//! entries whose keys all share the same page key. On disk a record page is
//! either a *full dump* (the complete mapping as of its revision) or a
//! *delta* holding only the entries that diverged, with a back-pointer to
//! the predecessor version it diverged from. The revisioning policy decides
//! which, and how far back the pointer reaches.
//!
//! ## Containers
//!
//! During a write transaction every touched record page is staged as a
//! [`RecordPageContainer`]: the `complete` page is the read view materialized
//! from history, the `modified` page is the delta overlay the transaction
//! accumulates. `modified`'s entries are always a subset of `complete`'s
//! entries plus newly created keys; deletion inserts a tombstone into both
//! so it shadows history in either view.

use hashbrown::HashMap;

use crate::config::NULL_ID;
use crate::page::PageKind;
use crate::record::Record;

#[derive(Debug, Clone)]
pub struct RecordPage {
    page_key: u64,
    revision: u32,
    kind: PageKind,
    full_dump: bool,
    /// File key of the predecessor version this delta diverged from
    /// (`NULL_ID` for full dumps). Under DIFFERENTIAL this skips straight to
    /// the nearest full dump.
    previous: i64,
    /// File offset this version was read from; `NULL_ID` until persisted.
    /// Never serialized — set by the reader so the policies can link new
    /// deltas to their predecessors.
    persisted_at: i64,
    entries: HashMap<i64, Record>,
}

impl RecordPage {
    pub fn new(page_key: u64, revision: u32, kind: PageKind) -> Self {
        debug_assert!(kind.is_record_subtree());
        Self {
            page_key,
            revision,
            kind,
            full_dump: false,
            previous: NULL_ID,
            persisted_at: NULL_ID,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn from_parts(
        page_key: u64,
        revision: u32,
        kind: PageKind,
        full_dump: bool,
        previous: i64,
        entries: HashMap<i64, Record>,
    ) -> Self {
        Self {
            page_key,
            revision,
            kind,
            full_dump,
            previous,
            persisted_at: NULL_ID,
            entries,
        }
    }

    pub fn page_key(&self) -> u64 {
        self.page_key
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub(crate) fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn is_full_dump(&self) -> bool {
        self.full_dump
    }

    pub fn set_full_dump(&mut self, full_dump: bool) {
        self.full_dump = full_dump;
    }

    pub fn previous(&self) -> i64 {
        self.previous
    }

    pub fn set_previous(&mut self, previous: i64) {
        self.previous = previous;
    }

    pub fn persisted_at(&self) -> i64 {
        self.persisted_at
    }

    pub(crate) fn set_persisted_at(&mut self, offset: i64) {
        self.persisted_at = offset;
    }

    pub fn get(&self, record_key: i64) -> Option<&Record> {
        self.entries.get(&record_key)
    }

    pub fn get_mut(&mut self, record_key: i64) -> Option<&mut Record> {
        self.entries.get_mut(&record_key)
    }

    pub fn contains(&self, record_key: i64) -> bool {
        self.entries.contains_key(&record_key)
    }

    /// Inserts or replaces the entry under the record's key.
    pub fn set(&mut self, record: Record) {
        self.entries.insert(record.node_key(), record);
    }

    /// Copies `record` in only if its key is not already present.
    pub fn set_if_absent(&mut self, record: &Record) {
        self.entries
            .entry(record.node_key())
            .or_insert_with(|| record.clone());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&i64, &Record)> {
        self.entries.iter()
    }

    /// Entries sorted by record key. The codec iterates this so identical
    /// pages serialize to identical bytes.
    pub fn sorted_entries(&self) -> Vec<(&i64, &Record)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_unstable_by_key(|(key, _)| **key);
        entries
    }

    /// Overlay of `self` with `overlay`'s entries winning, as a full dump.
    pub(crate) fn merged_with(&self, overlay: &RecordPage) -> RecordPage {
        let mut merged = self.clone();
        for (_, record) in overlay.entries() {
            merged.set(record.clone());
        }
        merged.revision = overlay.revision;
        merged.full_dump = true;
        merged.previous = NULL_ID;
        merged.persisted_at = NULL_ID;
        merged
    }
}

/// Staging pair for one record page inside a write transaction.
#[derive(Debug, Clone)]
pub struct RecordPageContainer {
    complete: RecordPage,
    modified: RecordPage,
}

impl RecordPageContainer {
    pub fn new(complete: RecordPage, modified: RecordPage) -> Self {
        debug_assert_eq!(complete.page_key(), modified.page_key());
        Self { complete, modified }
    }

    /// Container for a page that has never existed: both views empty, the
    /// first version of a page is always a full dump.
    pub fn fresh(page_key: u64, revision: u32, kind: PageKind) -> Self {
        let complete = RecordPage::new(page_key, revision, kind);
        let mut modified = RecordPage::new(page_key, revision, kind);
        modified.set_full_dump(true);
        Self { complete, modified }
    }

    pub fn complete(&self) -> &RecordPage {
        &self.complete
    }

    pub fn complete_mut(&mut self) -> &mut RecordPage {
        &mut self.complete
    }

    pub fn modified(&self) -> &RecordPage {
        &self.modified
    }

    pub fn modified_mut(&mut self) -> &mut RecordPage {
        &mut self.modified
    }

    /// The page a milestone commit writes: the complete view overlaid with
    /// this transaction's changes, tagged as a full dump.
    pub fn full_page(&self) -> RecordPage {
        self.complete.merged_with(&self.modified)
    }
}
