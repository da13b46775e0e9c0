//! # Pages and Page References
//!
//! Everything the store persists is a page. The closed [`PageKind`] set
//! admits a tagged enum with exhaustive dispatch; there is no open page
//! hierarchy. Parent pages own their children through [`PageReference`]
//! edges, which carry the child's file key, an optional intent-log key, the
//! child's kind tag, and — for record-page leaves — the leaf's page key.
//!
//! ## Immutability
//!
//! A page that has been written is never touched again. "Modifying" a page
//! means materializing a copy into the owning reference (`page: Some(..)`),
//! mutating the copy, and writing it to a fresh file offset at commit. A
//! reference whose `page` slot is populated is exactly a dirty reference;
//! the commit walk serializes those and only those.

mod indirect;
mod name;
mod record_page;
mod revision_root;
mod uber;

pub mod codec;

pub use indirect::IndirectPage;
pub use name::{hash_name, NameKind, NamePage};
pub use record_page::{RecordPage, RecordPageContainer};
pub use revision_root::RevisionRootPage;
pub use uber::UberPage;

use eyre::bail;
use eyre::Result;

use crate::config::NULL_ID;
use crate::error::StorageError;

/// The closed set of page kinds, plus the tombstone discriminator used in
/// record serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    Uber,
    Indirect,
    RevisionRoot,
    Name,
    PathSummary,
    Cas,
    Path,
    Node,
    TextValue,
    AttributeValue,
    /// Never a page on its own: tags serialized tombstone records.
    DeletedRecord,
}

/// The record subtrees a revision root fans out to, in `subtree_index` order.
pub const RECORD_SUBTREES: [PageKind; 4] = [
    PageKind::Node,
    PageKind::PathSummary,
    PageKind::TextValue,
    PageKind::AttributeValue,
];

impl PageKind {
    pub fn tag(self) -> u8 {
        match self {
            PageKind::Uber => 1,
            PageKind::Indirect => 2,
            PageKind::RevisionRoot => 3,
            PageKind::Name => 4,
            PageKind::PathSummary => 5,
            PageKind::Cas => 6,
            PageKind::Path => 7,
            PageKind::Node => 8,
            PageKind::TextValue => 9,
            PageKind::AttributeValue => 10,
            PageKind::DeletedRecord => 11,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => PageKind::Uber,
            2 => PageKind::Indirect,
            3 => PageKind::RevisionRoot,
            4 => PageKind::Name,
            5 => PageKind::PathSummary,
            6 => PageKind::Cas,
            7 => PageKind::Path,
            8 => PageKind::Node,
            9 => PageKind::TextValue,
            10 => PageKind::AttributeValue,
            11 => PageKind::DeletedRecord,
            _ => bail!(StorageError::Corruption(format!(
                "unknown page kind tag {tag:#04x}"
            ))),
        })
    }

    /// Whether record operations may address this kind. `Cas` and `Path`
    /// are valid codec tags but have no subtree in this core.
    pub fn is_record_subtree(self) -> bool {
        self.subtree_index().is_some()
    }

    /// Dense index into per-subtree tables (max-key counters, subtree
    /// references, intent-log stores).
    pub fn subtree_index(self) -> Option<usize> {
        match self {
            PageKind::Node => Some(0),
            PageKind::PathSummary => Some(1),
            PageKind::TextValue => Some(2),
            PageKind::AttributeValue => Some(3),
            _ => None,
        }
    }

    /// File name of this subtree's intent-log store.
    pub fn log_store_name(self) -> Option<&'static str> {
        match self {
            PageKind::Node => Some("node"),
            PageKind::PathSummary => Some("path"),
            PageKind::TextValue => Some("textValue"),
            PageKind::AttributeValue => Some("attributeValue"),
            _ => None,
        }
    }
}

/// An ownership edge from a parent page to a child page.
#[derive(Debug, Clone)]
pub struct PageReference {
    /// Absolute byte offset of the serialized child in the data file, or
    /// `NULL_ID` while the child has never been persisted.
    pub key: i64,
    /// Key of the child in the transaction intent log, or `NULL_ID`.
    pub log_key: i64,
    /// Materialized child. Populated exactly while the child is dirty in a
    /// write transaction (or freshly deserialized for the uber page).
    pub page: Option<Box<Page>>,
    /// Kind tag of the child.
    pub kind: PageKind,
    /// The child's page key when the child is a record-page leaf, `NULL_ID`
    /// otherwise.
    pub key_value_page_key: i64,
}

impl PageReference {
    pub fn new(kind: PageKind) -> Self {
        Self {
            key: NULL_ID,
            log_key: NULL_ID,
            page: None,
            kind,
            key_value_page_key: NULL_ID,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.key != NULL_ID
    }

    /// Copy of this reference without the materialized page: keeps the file
    /// key, kind, and leaf page key, drops in-memory state. Used when a
    /// reference crosses from one page copy to another (trie descent, COW
    /// snapshots) where sharing the child object would alias dirty state.
    pub fn thin(&self) -> Self {
        Self {
            key: self.key,
            log_key: NULL_ID,
            page: None,
            kind: self.kind,
            key_value_page_key: self.key_value_page_key,
        }
    }
}

/// A deserialized or in-construction page.
#[derive(Debug, Clone)]
pub enum Page {
    Uber(UberPage),
    Indirect(IndirectPage),
    RevisionRoot(RevisionRootPage),
    Name(NamePage),
    Record(RecordPage),
}

impl Page {
    pub fn kind(&self) -> PageKind {
        match self {
            Page::Uber(_) => PageKind::Uber,
            Page::Indirect(_) => PageKind::Indirect,
            Page::RevisionRoot(_) => PageKind::RevisionRoot,
            Page::Name(_) => PageKind::Name,
            Page::Record(page) => page.kind(),
        }
    }

    /// Child references of this page, in serialization order. Leaves return
    /// an empty slice.
    pub fn references_mut(&mut self) -> &mut [PageReference] {
        match self {
            Page::Uber(page) => page.references_mut(),
            Page::Indirect(page) => page.references_mut(),
            Page::RevisionRoot(page) => page.references_mut(),
            Page::Name(_) | Page::Record(_) => &mut [],
        }
    }

    pub fn as_indirect(&self) -> Result<&IndirectPage> {
        match self {
            Page::Indirect(page) => Ok(page),
            other => bail!(StorageError::Corruption(format!(
                "expected an indirect page, found {:?}",
                other.kind()
            ))),
        }
    }

    pub fn as_record(&self) -> Result<&RecordPage> {
        match self {
            Page::Record(page) => Ok(page),
            other => bail!(StorageError::Corruption(format!(
                "expected a record page, found {:?}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            PageKind::Uber,
            PageKind::Indirect,
            PageKind::RevisionRoot,
            PageKind::Name,
            PageKind::PathSummary,
            PageKind::Cas,
            PageKind::Path,
            PageKind::Node,
            PageKind::TextValue,
            PageKind::AttributeValue,
            PageKind::DeletedRecord,
        ] {
            assert_eq!(PageKind::from_tag(kind.tag()).unwrap(), kind);
        }
        assert!(PageKind::from_tag(0).is_err());
        assert!(PageKind::from_tag(200).is_err());
    }

    #[test]
    fn record_subtrees_are_dense() {
        for (index, kind) in RECORD_SUBTREES.iter().enumerate() {
            assert_eq!(kind.subtree_index(), Some(index));
            assert!(kind.is_record_subtree());
            assert!(kind.log_store_name().is_some());
        }
        assert!(!PageKind::Cas.is_record_subtree());
        assert!(!PageKind::Path.is_record_subtree());
        assert!(!PageKind::Uber.is_record_subtree());
    }

    #[test]
    fn thin_reference_drops_in_memory_state() {
        let mut reference = PageReference::new(PageKind::Indirect);
        reference.key = 99;
        reference.log_key = 3;
        reference.page = Some(Box::new(Page::Indirect(IndirectPage::new(1))));
        let thin = reference.thin();
        assert_eq!(thin.key, 99);
        assert_eq!(thin.log_key, NULL_ID);
        assert!(thin.page.is_none());
    }
}
