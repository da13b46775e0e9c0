//! # Revisioning Policies
//!
//! A record page is persisted either as a full dump or as a delta against
//! older versions of itself. The policy decides which, trading read
//! amplification (how many versions a lookup must merge) against write
//! amplification (how much each commit rewrites):
//!
//! | policy           | write emits                | read merges            |
//! |------------------|----------------------------|------------------------|
//! | FULL             | the complete page          | 1 page                 |
//! | DIFFERENTIAL     | diff since last full dump  | at most 2 pages        |
//! | INCREMENTAL      | diff since last revision   | up to the restore depth|
//! | SLIDING_SNAPSHOT | diff since last revision   | a bounded window       |
//!
//! ## Merge semantics
//!
//! All policies agree on the merge: given versions newest first, an entry is
//! taken from the newest version containing it, a tombstone in a newer
//! version shadows any older entry, and merging stops at the nearest full
//! dump.
//!
//! ## Full dumps
//!
//! Under DIFFERENTIAL a full dump is emitted once the new revision is a full
//! restore-depth past the last dump; under INCREMENTAL once the version
//! chain has grown to the restore depth. The first version of any page is
//! always a full dump. SLIDING_SNAPSHOT never dumps again: each write
//! instead carries forward the entries of the version about to slide out of
//! the window whose keys no newer in-window version covers, so the newest
//! `revisions_to_restore` versions always reconstruct the page.

use crate::config::NULL_ID;
use crate::page::{RecordPage, RecordPageContainer};

/// How historical versions of a record page are laid out and recombined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Versioning {
    Full,
    Differential,
    #[default]
    Incremental,
    SlidingSnapshot,
}

impl Versioning {
    /// Most versions a read of one page may need, given the restore depth.
    pub fn restore_window(self, revisions_to_restore: u32) -> usize {
        match self {
            Versioning::Full => 1,
            Versioning::Differential => 2,
            Versioning::Incremental | Versioning::SlidingSnapshot => {
                revisions_to_restore.max(1) as usize
            }
        }
    }

    /// Merges historical versions (newest first, ending at the nearest full
    /// dump or the window bound) into the complete in-memory page.
    pub fn combine_for_read(self, versions: &[RecordPage]) -> RecordPage {
        debug_assert!(!versions.is_empty());
        let mut complete = versions[0].clone();
        for older in &versions[1..] {
            for (_, record) in older.entries() {
                complete.set_if_absent(record);
            }
        }
        complete.set_full_dump(true);
        complete.set_previous(NULL_ID);
        complete.set_persisted_at(NULL_ID);
        complete
    }

    /// Builds the staging container for a transaction that is about to
    /// modify this page in `new_revision`. `modified` is pre-seeded with
    /// whatever the policy must re-emit and pre-linked to the version the
    /// commit's delta will point back at.
    pub fn combine_for_modification(
        self,
        versions: &[RecordPage],
        revisions_to_restore: u32,
        new_revision: u32,
    ) -> RecordPageContainer {
        debug_assert!(!versions.is_empty());
        let newest = &versions[0];
        let complete = self.combine_for_read(versions);
        let mut modified = RecordPage::new(newest.page_key(), new_revision, newest.kind());

        match self {
            Versioning::Full => {
                // Every write rewrites the page.
                modified = complete.clone();
                modified.set_revision(new_revision);
            }
            Versioning::Differential => {
                let dump = versions.iter().find(|page| page.is_full_dump());
                let needs_full_dump = match dump {
                    Some(dump) => new_revision - dump.revision() >= revisions_to_restore,
                    None => true,
                };
                if needs_full_dump {
                    modified = complete.clone();
                    modified.set_revision(new_revision);
                } else {
                    // A delta accumulates everything since the dump, so the
                    // newest delta seeds the next one.
                    if !newest.is_full_dump() {
                        for (_, record) in newest.entries() {
                            modified.set(record.clone());
                        }
                    }
                    modified.set_previous(dump.map(|d| d.persisted_at()).unwrap_or(NULL_ID));
                }
            }
            Versioning::Incremental => {
                if versions.len() as u32 >= revisions_to_restore {
                    modified = complete.clone();
                    modified.set_revision(new_revision);
                } else {
                    modified.set_previous(newest.persisted_at());
                }
            }
            Versioning::SlidingSnapshot => {
                if versions.len() as u32 >= revisions_to_restore {
                    // The oldest in-window version slides out: re-emit its
                    // entries that no newer in-window version covers.
                    let (oldest, newer) = versions.split_last().expect("versions is non-empty");
                    for (key, record) in oldest.entries() {
                        if !newer.iter().any(|version| version.contains(*key)) {
                            modified.set(record.clone());
                        }
                    }
                }
                modified.set_previous(newest.persisted_at());
            }
        }

        RecordPageContainer::new(complete, modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageKind;
    use crate::record::Record;

    /// Minimal in-memory rendition of the persisted version chain: "disk" is
    /// a vector of serialized-at-offset pages, history collection follows
    /// back-pointers exactly like a read transaction does.
    struct SimulatedPage {
        policy: Versioning,
        revisions_to_restore: u32,
        disk: Vec<RecordPage>,
        head: Option<usize>,
    }

    impl SimulatedPage {
        fn new(policy: Versioning, revisions_to_restore: u32) -> Self {
            Self {
                policy,
                revisions_to_restore,
                disk: Vec::new(),
                head: None,
            }
        }

        fn collect(&self) -> Vec<RecordPage> {
            let mut versions = Vec::new();
            let mut next = self.head;
            let cap = self.policy.restore_window(self.revisions_to_restore);
            while let Some(index) = next {
                let page = self.disk[index].clone();
                let full = page.is_full_dump();
                let previous = page.previous();
                versions.push(page);
                if full || versions.len() >= cap || previous == NULL_ID {
                    break;
                }
                next = Some(previous as usize);
            }
            versions
        }

        /// Applies one revision's worth of writes and "persists" the result.
        fn write(&mut self, revision: u32, records: Vec<Record>) {
            let mut container = if self.head.is_none() {
                RecordPageContainer::fresh(0, revision, PageKind::Node)
            } else {
                let versions = self.collect();
                self.policy
                    .combine_for_modification(&versions, self.revisions_to_restore, revision)
            };
            for record in records {
                container.modified_mut().set(record.clone());
                container.complete_mut().set(record);
            }
            let mut page = if container.modified().is_full_dump() {
                container.full_page()
            } else {
                container.modified().clone()
            };
            let offset = self.disk.len() as i64;
            page.set_persisted_at(offset);
            self.disk.push(page);
            self.head = Some(offset as usize);
        }

        fn read(&self) -> RecordPage {
            self.policy.combine_for_read(&self.collect())
        }
    }

    fn all_policies() -> [Versioning; 4] {
        [
            Versioning::Full,
            Versioning::Differential,
            Versioning::Incremental,
            Versioning::SlidingSnapshot,
        ]
    }

    #[test]
    fn merged_view_matches_logical_state_for_every_policy() {
        for policy in all_policies() {
            let mut simulated = SimulatedPage::new(policy, 4);
            let mut expected: std::collections::BTreeMap<i64, Option<Vec<u8>>> =
                Default::default();

            for revision in 1..=12u32 {
                let key = (revision % 5) as i64;
                if revision % 4 == 3 {
                    simulated.write(revision, vec![Record::tombstone(key)]);
                    expected.insert(key, None);
                } else {
                    let payload = vec![revision as u8; 4];
                    simulated.write(revision, vec![Record::new(key, payload.clone())]);
                    expected.insert(key, Some(payload));
                }

                let view = simulated.read();
                for (key, payload) in &expected {
                    let record = view.get(*key).unwrap_or_else(|| {
                        panic!("{policy:?}: key {key} missing at revision {revision}")
                    });
                    match payload {
                        Some(bytes) => {
                            assert_eq!(record.data(), Some(bytes.as_slice()), "{policy:?}")
                        }
                        None => assert!(record.is_deleted(), "{policy:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn incremental_dump_cadence() {
        let mut simulated = SimulatedPage::new(Versioning::Incremental, 4);
        for revision in 1..=5u32 {
            simulated.write(revision, vec![Record::new(0, vec![revision as u8])]);
        }
        let dumps: Vec<bool> = simulated.disk.iter().map(RecordPage::is_full_dump).collect();
        assert_eq!(dumps, vec![true, false, false, false, true]);
    }

    #[test]
    fn differential_reads_at_most_two_versions() {
        let mut simulated = SimulatedPage::new(Versioning::Differential, 4);
        for revision in 1..=10u32 {
            simulated.write(revision, vec![Record::new(revision as i64, vec![1])]);
            assert!(simulated.collect().len() <= 2, "revision {revision}");
        }
    }

    #[test]
    fn full_policy_always_dumps() {
        let mut simulated = SimulatedPage::new(Versioning::Full, 4);
        for revision in 1..=6u32 {
            simulated.write(revision, vec![Record::new(revision as i64, vec![2])]);
            assert_eq!(simulated.collect().len(), 1);
        }
        assert!(simulated.disk.iter().all(RecordPage::is_full_dump));
    }

    #[test]
    fn sliding_window_never_dumps_after_the_first() {
        let mut simulated = SimulatedPage::new(Versioning::SlidingSnapshot, 4);
        for revision in 1..=12u32 {
            simulated.write(revision, vec![Record::new((revision % 3) as i64, vec![3])]);
        }
        let dumps: Vec<bool> = simulated.disk.iter().map(RecordPage::is_full_dump).collect();
        assert!(dumps[0]);
        assert!(dumps[1..].iter().all(|dump| !dump));
        // The window stays self-contained: a key written once at revision 1
        // and never again must still be visible at revision 12.
        let mut simulated = SimulatedPage::new(Versioning::SlidingSnapshot, 4);
        simulated.write(1, vec![Record::new(99, b"sticky".to_vec())]);
        for revision in 2..=12u32 {
            simulated.write(revision, vec![Record::new(0, vec![revision as u8])]);
            assert_eq!(
                simulated.read().get(99).and_then(Record::data),
                Some(&b"sticky"[..]),
                "revision {revision}"
            );
        }
    }

    #[test]
    fn full_dump_restores_alone() {
        let mut dump = RecordPage::new(0, 8, PageKind::Node);
        dump.set(Record::new(1, b"a".to_vec()));
        dump.set(Record::tombstone(2));
        dump.set_full_dump(true);
        for policy in all_policies() {
            let restored = policy.combine_for_read(std::slice::from_ref(&dump));
            assert_eq!(restored.len(), dump.len());
            assert_eq!(restored.get(1), dump.get(1));
            assert_eq!(restored.get(2), dump.get(2));
            assert!(restored.is_full_dump());
        }
    }
}
