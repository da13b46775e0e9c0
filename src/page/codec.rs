//! # Page Codec
//!
//! Serializes each page variant to a byte stream and back. The format is
//! deterministic: identical pages produce byte-identical output, which the
//! tests and any content-hashing layered above rely on. Hash-map backed
//! pages therefore serialize their entries in sorted key order.
//!
//! ## Framing
//!
//! A serialized page is `[kind_tag: u8][kind-specific body]`. All multi-byte
//! integers are big-endian. The codec never sees file framing (`[length]`
//! prefixes) or the byte pipe — both belong to the I/O layer.
//!
//! ## Bodies
//!
//! ```text
//! uber          [revision: i32][bootstrap: u8][reference]
//! indirect      [revision: i32][512 x reference]
//! revision root [revision: i32][timestamp: i64][4 x max_key: i64][5 x reference]
//! name          4 x ([count: i32] then [key: i32][refs: u32][len: i32][utf8]...)
//! record        [page_key: i64][revision: i32][flags: u8][previous: i64]
//!               [subtree: u8][count: i32][record...]
//! reference     [file_key: i64][kind_tag: u8]
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use std::io::Read;

use crate::config::{INDIRECT_REFERENCE_COUNT, RECORDS_PER_PAGE};
use crate::error::StorageError;
use crate::page::name::{NameEntry, NAME_KINDS};
use crate::page::{
    IndirectPage, NamePage, Page, PageKind, PageReference, RecordPage, RevisionRootPage, UberPage,
    RECORD_SUBTREES,
};
use crate::record::Record;

const FLAG_FULL_DUMP: u8 = 0b0000_0001;

/// Serializes `page` into a fresh buffer.
pub fn serialize_page(page: &Page) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    out.write_u8(page.kind().tag())?;
    match page {
        Page::Uber(uber) => {
            out.write_i32::<BigEndian>(uber.revision() as i32)?;
            out.write_u8(uber.is_bootstrap() as u8)?;
            serialize_reference(uber.indirect_reference(), &mut out)?;
        }
        Page::Indirect(indirect) => {
            out.write_i32::<BigEndian>(indirect.revision() as i32)?;
            for reference in indirect.references() {
                serialize_reference(reference, &mut out)?;
            }
        }
        Page::RevisionRoot(root) => {
            out.write_i32::<BigEndian>(root.revision() as i32)?;
            out.write_i64::<BigEndian>(root.commit_timestamp())?;
            for kind in RECORD_SUBTREES {
                out.write_i64::<BigEndian>(root.max_record_key(kind).unwrap())?;
            }
            for reference in root.references() {
                serialize_reference(reference, &mut out)?;
            }
        }
        Page::Name(name) => {
            for kind in NAME_KINDS {
                let dictionary = name.dictionary(kind.dictionary_index());
                out.write_i32::<BigEndian>(dictionary.len() as i32)?;
                let mut entries: Vec<(&i32, &NameEntry)> = dictionary.iter().collect();
                entries.sort_unstable_by_key(|(key, _)| **key);
                for (key, entry) in entries {
                    out.write_i32::<BigEndian>(*key)?;
                    out.write_u32::<BigEndian>(entry.references)?;
                    out.write_i32::<BigEndian>(entry.name.len() as i32)?;
                    out.extend_from_slice(entry.name.as_bytes());
                }
            }
        }
        Page::Record(record_page) => {
            out.write_i64::<BigEndian>(record_page.page_key() as i64)?;
            out.write_i32::<BigEndian>(record_page.revision() as i32)?;
            let flags = if record_page.is_full_dump() {
                FLAG_FULL_DUMP
            } else {
                0
            };
            out.write_u8(flags)?;
            out.write_i64::<BigEndian>(record_page.previous())?;
            out.write_u8(record_page.kind().tag())?;
            out.write_i32::<BigEndian>(record_page.len() as i32)?;
            for (_, record) in record_page.sorted_entries() {
                record.serialize(&mut out)?;
            }
        }
    }
    Ok(out)
}

/// Deserializes one page from `bytes`, which must contain exactly one
/// serialized page.
pub fn deserialize_page(bytes: &[u8]) -> Result<Page> {
    let mut input = bytes;
    let tag = input.read_u8().wrap_err("empty page body")?;
    let kind = PageKind::from_tag(tag)?;
    match kind {
        PageKind::Uber => {
            let revision = input.read_i32::<BigEndian>()?;
            let bootstrap = input.read_u8()? != 0;
            let reference = deserialize_reference(&mut input)?;
            Ok(Page::Uber(UberPage::from_parts(
                revision as u32,
                bootstrap,
                reference,
            )))
        }
        PageKind::Indirect => {
            let revision = input.read_i32::<BigEndian>()?;
            let mut references = Vec::with_capacity(INDIRECT_REFERENCE_COUNT);
            for _ in 0..INDIRECT_REFERENCE_COUNT {
                references.push(deserialize_reference(&mut input)?);
            }
            Ok(Page::Indirect(IndirectPage::from_parts(
                revision as u32,
                references,
            )))
        }
        PageKind::RevisionRoot => {
            let revision = input.read_i32::<BigEndian>()?;
            let timestamp = input.read_i64::<BigEndian>()?;
            let mut max_record_keys = [0i64; RECORD_SUBTREES.len()];
            for slot in &mut max_record_keys {
                *slot = input.read_i64::<BigEndian>()?;
            }
            let mut references = Vec::with_capacity(RECORD_SUBTREES.len() + 1);
            for _ in 0..RECORD_SUBTREES.len() + 1 {
                references.push(deserialize_reference(&mut input)?);
            }
            Ok(Page::RevisionRoot(RevisionRootPage::from_parts(
                revision as u32,
                timestamp,
                max_record_keys,
                references,
            )))
        }
        PageKind::Name => {
            let mut page = NamePage::new();
            for name_kind in NAME_KINDS {
                let count = input.read_i32::<BigEndian>()?;
                ensure!(
                    count >= 0,
                    StorageError::Corruption(format!("negative dictionary size {count}"))
                );
                let dictionary = page.dictionary_mut(name_kind.dictionary_index());
                for _ in 0..count {
                    let key = input.read_i32::<BigEndian>()?;
                    let references = input.read_u32::<BigEndian>()?;
                    let len = input.read_i32::<BigEndian>()?;
                    ensure!(
                        len >= 0,
                        StorageError::Corruption(format!("negative name length {len}"))
                    );
                    let mut bytes = vec![0u8; len as usize];
                    input.read_exact(&mut bytes)?;
                    let name = String::from_utf8(bytes)
                        .map_err(|e| StorageError::Corruption(format!("name not UTF-8: {e}")))?;
                    dictionary.insert(key, NameEntry { name, references });
                }
            }
            Ok(Page::Name(page))
        }
        PageKind::Node | PageKind::PathSummary | PageKind::TextValue | PageKind::AttributeValue => {
            // The outer tag matches the subtree tag stored in the body; both
            // are written so a page is self-describing either way.
            deserialize_record_page(&mut input).map(Page::Record)
        }
        PageKind::Cas | PageKind::Path | PageKind::DeletedRecord => {
            bail!(StorageError::Corruption(format!(
                "kind {kind:?} cannot head a serialized page"
            )))
        }
    }
}

fn deserialize_record_page(input: &mut &[u8]) -> Result<RecordPage> {
    let page_key = input.read_i64::<BigEndian>()?;
    ensure!(
        page_key >= 0,
        StorageError::Corruption(format!("negative page key {page_key}"))
    );
    let revision = input.read_i32::<BigEndian>()?;
    let flags = input.read_u8()?;
    let previous = input.read_i64::<BigEndian>()?;
    let kind = PageKind::from_tag(input.read_u8()?)?;
    ensure!(
        kind.is_record_subtree(),
        StorageError::Corruption(format!("{kind:?} is not a record subtree"))
    );
    let count = input.read_i32::<BigEndian>()?;
    ensure!(
        (0..=RECORDS_PER_PAGE as i32).contains(&count),
        StorageError::Corruption(format!("record page entry count {count} out of range"))
    );
    let mut entries = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let record = Record::deserialize(input)?;
        entries.insert(record.node_key(), record);
    }
    Ok(RecordPage::from_parts(
        page_key as u64,
        revision as u32,
        kind,
        flags & FLAG_FULL_DUMP != 0,
        previous,
        entries,
    ))
}

fn serialize_reference(reference: &PageReference, out: &mut Vec<u8>) -> Result<()> {
    out.write_i64::<BigEndian>(reference.key)?;
    out.write_u8(reference.kind.tag())?;
    Ok(())
}

fn deserialize_reference(input: &mut &[u8]) -> Result<PageReference> {
    let key = input.read_i64::<BigEndian>()?;
    let kind = PageKind::from_tag(input.read_u8()?)?;
    let mut reference = PageReference::new(kind);
    reference.key = key;
    Ok(reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NULL_ID;
    use crate::page::NameKind;

    fn round_trip(page: &Page) -> Page {
        let bytes = serialize_page(page).unwrap();
        deserialize_page(&bytes).unwrap()
    }

    #[test]
    fn uber_page_round_trip() {
        let mut uber = UberPage::bootstrap();
        uber.indirect_reference_mut().key = 1234;
        let Page::Uber(back) = round_trip(&Page::Uber(uber)) else {
            panic!("wrong kind");
        };
        assert!(back.is_bootstrap());
        assert_eq!(back.revision(), 0);
        assert_eq!(back.indirect_reference().key, 1234);
    }

    #[test]
    fn indirect_page_round_trip() {
        let mut page = IndirectPage::new(9);
        page.reference_mut(0).key = 12;
        page.reference_mut(511).key = 99;
        page.reference_mut(511).kind = PageKind::Node;
        let Page::Indirect(back) = round_trip(&Page::Indirect(page)) else {
            panic!("wrong kind");
        };
        assert_eq!(back.revision(), 9);
        assert_eq!(back.reference(0).key, 12);
        assert_eq!(back.reference(511).key, 99);
        assert_eq!(back.reference(511).kind, PageKind::Node);
        assert_eq!(back.reference(1).key, NULL_ID);
    }

    #[test]
    fn revision_root_round_trip() {
        let mut root = RevisionRootPage::new(7);
        root.set_commit_timestamp(1_700_000_000_000);
        root.increment_max_record_key(PageKind::Node);
        root.subtree_reference_mut(PageKind::Node).unwrap().key = 55;
        root.name_reference_mut().key = 66;
        let Page::RevisionRoot(back) = round_trip(&Page::RevisionRoot(root)) else {
            panic!("wrong kind");
        };
        assert_eq!(back.revision(), 7);
        assert_eq!(back.commit_timestamp(), 1_700_000_000_000);
        assert_eq!(back.max_record_key(PageKind::Node), Some(0));
        assert_eq!(back.max_record_key(PageKind::TextValue), Some(NULL_ID));
        assert_eq!(back.subtree_reference(PageKind::Node).unwrap().key, 55);
        assert_eq!(back.name_reference().key, 66);
    }

    #[test]
    fn name_page_round_trip() {
        let mut page = NamePage::new();
        page.create_name_key(Some("chapter"), NameKind::Element);
        page.create_name_key(Some("chapter"), NameKind::Element);
        page.create_name_key(Some("lang"), NameKind::Attribute);
        let Page::Name(back) = round_trip(&Page::Name(page)) else {
            panic!("wrong kind");
        };
        let key = hash_name_of("chapter");
        assert_eq!(back.get_name(key, NameKind::Element), Some("chapter"));
        assert_eq!(back.references(key, NameKind::Element), 2);
    }

    fn hash_name_of(name: &str) -> i32 {
        crate::page::hash_name(name)
    }

    #[test]
    fn record_page_round_trip() {
        let mut page = RecordPage::new(3, 4, PageKind::TextValue);
        page.set(Record::new(3072, b"alpha".to_vec()));
        page.set(Record::tombstone(3073));
        page.set_full_dump(true);
        page.set_previous(4096);
        let Page::Record(back) = round_trip(&Page::Record(page)) else {
            panic!("wrong kind");
        };
        assert_eq!(back.page_key(), 3);
        assert_eq!(back.revision(), 4);
        assert_eq!(back.kind(), PageKind::TextValue);
        assert!(back.is_full_dump());
        assert_eq!(back.previous(), 4096);
        assert_eq!(back.get(3072).unwrap().data(), Some(&b"alpha"[..]));
        assert!(back.get(3073).unwrap().is_deleted());
        assert_eq!(back.persisted_at(), NULL_ID);
    }

    #[test]
    fn serialization_is_deterministic() {
        let mut a = RecordPage::new(0, 1, PageKind::Node);
        let mut b = RecordPage::new(0, 1, PageKind::Node);
        // insert in different orders
        for key in 0..100i64 {
            a.set(Record::new(key, vec![key as u8; 8]));
        }
        for key in (0..100i64).rev() {
            b.set(Record::new(key, vec![key as u8; 8]));
        }
        assert_eq!(
            serialize_page(&Page::Record(a)).unwrap(),
            serialize_page(&Page::Record(b)).unwrap()
        );

        let mut names_a = NamePage::new();
        let mut names_b = NamePage::new();
        for name in ["x", "y", "z"] {
            names_a.create_name_key(Some(name), NameKind::Element);
        }
        for name in ["z", "x", "y"] {
            names_b.create_name_key(Some(name), NameKind::Element);
        }
        assert_eq!(
            serialize_page(&Page::Name(names_a)).unwrap(),
            serialize_page(&Page::Name(names_b)).unwrap()
        );
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let err = deserialize_page(&[0xEE, 0, 0]).unwrap_err();
        assert!(matches!(
            StorageError::of(&err),
            Some(StorageError::Corruption(_))
        ));
    }
}
