//! The uber page.
//!
//! The uber page is the single mutable anchor of a resource: the data file's
//! first eight bytes always hold the file key of the most recently committed
//! uber page, and everything else is reachable from there. It owns the trie
//! of revision-root pages (keyed by revision number) and knows the per-kind
//! trie shift tables.

use crate::config::{RECORD_TRIE_SHIFTS, REVISION_TRIE_SHIFTS, TRIE_HEIGHT};
use crate::page::{PageKind, PageReference};

#[derive(Debug, Clone)]
pub struct UberPage {
    /// Number of the most recently committed revision.
    revision: u32,
    /// Set between resource creation and the bootstrap commit of revision 0.
    bootstrap: bool,
    /// Root of the revision-root trie.
    indirect_reference: PageReference,
}

impl UberPage {
    /// Uber page of a resource that has never committed.
    pub fn bootstrap() -> Self {
        Self {
            revision: 0,
            bootstrap: true,
            indirect_reference: PageReference::new(PageKind::Indirect),
        }
    }

    pub(crate) fn from_parts(
        revision: u32,
        bootstrap: bool,
        indirect_reference: PageReference,
    ) -> Self {
        Self {
            revision,
            bootstrap,
            indirect_reference,
        }
    }

    /// Copy-on-write successor anchoring `revision`.
    pub fn to_next_revision(&self, revision: u32) -> Self {
        Self {
            revision,
            bootstrap: false,
            indirect_reference: self.indirect_reference.thin(),
        }
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    pub fn indirect_reference(&self) -> &PageReference {
        &self.indirect_reference
    }

    pub fn indirect_reference_mut(&mut self) -> &mut PageReference {
        &mut self.indirect_reference
    }

    pub fn references_mut(&mut self) -> &mut [PageReference] {
        std::slice::from_mut(&mut self.indirect_reference)
    }

    /// Per-level shift table of the trie addressing `kind`. The revision
    /// trie is addressed through `PageKind::Uber`; the record subtrees use
    /// the record table.
    pub fn page_count_exp(&self, kind: PageKind) -> &'static [u64; TRIE_HEIGHT] {
        match kind {
            PageKind::Uber | PageKind::RevisionRoot => &REVISION_TRIE_SHIFTS,
            _ => &RECORD_TRIE_SHIFTS,
        }
    }
}
