//! Interior pages of the tries.
//!
//! An indirect page is a fixed array of [`PageReference`] slots. Copying one
//! into the next revision keeps every child's file key (unchanged subtrees
//! stay shared on disk) and drops all in-memory state.

use crate::config::INDIRECT_REFERENCE_COUNT;
use crate::page::{PageKind, PageReference};

#[derive(Debug, Clone)]
pub struct IndirectPage {
    revision: u32,
    references: Vec<PageReference>,
}

impl IndirectPage {
    /// A fresh page with all slots unpersisted.
    pub fn new(revision: u32) -> Self {
        Self {
            revision,
            references: (0..INDIRECT_REFERENCE_COUNT)
                .map(|_| PageReference::new(PageKind::Indirect))
                .collect(),
        }
    }

    /// Copy-on-write successor: same child file keys, new revision, no
    /// materialized children.
    pub fn to_next_revision(&self, revision: u32) -> Self {
        Self {
            revision,
            references: self.references.iter().map(PageReference::thin).collect(),
        }
    }

    pub(crate) fn from_parts(revision: u32, references: Vec<PageReference>) -> Self {
        debug_assert_eq!(references.len(), INDIRECT_REFERENCE_COUNT);
        Self {
            revision,
            references,
        }
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn reference(&self, offset: usize) -> &PageReference {
        &self.references[offset]
    }

    pub fn reference_mut(&mut self, offset: usize) -> &mut PageReference {
        &mut self.references[offset]
    }

    pub fn references(&self) -> &[PageReference] {
        &self.references
    }

    pub fn references_mut(&mut self) -> &mut [PageReference] {
        &mut self.references
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NULL_ID;

    #[test]
    fn fresh_page_has_no_persisted_slots() {
        let page = IndirectPage::new(3);
        assert_eq!(page.revision(), 3);
        assert_eq!(page.references().len(), INDIRECT_REFERENCE_COUNT);
        assert!(page.references().iter().all(|r| r.key == NULL_ID));
    }

    #[test]
    fn cow_copy_keeps_file_keys_and_drops_pages() {
        let mut page = IndirectPage::new(1);
        page.reference_mut(17).key = 4242;
        page.reference_mut(17).page = Some(Box::new(crate::page::Page::Indirect(
            IndirectPage::new(1),
        )));

        let next = page.to_next_revision(2);
        assert_eq!(next.revision(), 2);
        assert_eq!(next.reference(17).key, 4242);
        assert!(next.reference(17).page.is_none());
    }
}
