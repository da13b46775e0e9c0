//! Record value type.
//!
//! A record is an opaque byte payload addressed by a non-negative 64-bit
//! record key. Deletion is represented by a tombstone record whose kind
//! discriminator serializes as the `DeletedRecord` tag; a tombstone in a
//! newer page version shadows any older payload for the same key.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use eyre::{bail, ensure, Result};
use std::io::Read;

use crate::error::StorageError;
use crate::page::PageKind;

/// Kind tag of a live data record in the serialized form. Tombstones use
/// `PageKind::DeletedRecord` instead.
const DATA_RECORD_TAG: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecordBody {
    Data(Vec<u8>),
    Deleted,
}

/// One record: a key plus either an opaque payload or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    node_key: i64,
    body: RecordBody,
}

impl Record {
    pub fn new(node_key: i64, data: Vec<u8>) -> Self {
        Self {
            node_key,
            body: RecordBody::Data(data),
        }
    }

    /// A tombstone shadowing `node_key` from its revision onward.
    pub fn tombstone(node_key: i64) -> Self {
        Self {
            node_key,
            body: RecordBody::Deleted,
        }
    }

    pub fn node_key(&self) -> i64 {
        self.node_key
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.body, RecordBody::Deleted)
    }

    /// Payload bytes; `None` for tombstones.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.body {
            RecordBody::Data(bytes) => Some(bytes),
            RecordBody::Deleted => None,
        }
    }

    /// Replaces the payload. Turns a tombstone back into a live record.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.body = RecordBody::Data(data);
    }

    pub(crate) fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_i64::<BigEndian>(self.node_key)?;
        match &self.body {
            RecordBody::Data(bytes) => {
                out.write_u8(DATA_RECORD_TAG)?;
                out.write_i32::<BigEndian>(bytes.len() as i32)?;
                out.extend_from_slice(bytes);
            }
            RecordBody::Deleted => {
                out.write_u8(PageKind::DeletedRecord.tag())?;
            }
        }
        Ok(())
    }

    pub(crate) fn deserialize<R: Read>(input: &mut R) -> Result<Self> {
        let node_key = input.read_i64::<BigEndian>()?;
        let tag = input.read_u8()?;
        if tag == DATA_RECORD_TAG {
            let len = input.read_i32::<BigEndian>()?;
            ensure!(
                len >= 0,
                StorageError::Corruption(format!("negative record length {len}"))
            );
            let mut bytes = vec![0u8; len as usize];
            input.read_exact(&mut bytes)?;
            Ok(Record::new(node_key, bytes))
        } else if tag == PageKind::DeletedRecord.tag() {
            Ok(Record::tombstone(node_key))
        } else {
            bail!(StorageError::Corruption(format!(
                "unknown record tag {tag:#04x} for key {node_key}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let record = Record::new(42, b"payload".to_vec());
        let mut buf = Vec::new();
        record.serialize(&mut buf).unwrap();
        let back = Record::deserialize(&mut buf.as_slice()).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.data(), Some(&b"payload"[..]));
    }

    #[test]
    fn tombstone_round_trip() {
        let record = Record::tombstone(7);
        let mut buf = Vec::new();
        record.serialize(&mut buf).unwrap();
        let back = Record::deserialize(&mut buf.as_slice()).unwrap();
        assert!(back.is_deleted());
        assert_eq!(back.node_key(), 7);
        assert_eq!(back.data(), None);
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0i64.to_be_bytes());
        buf.push(0x7f);
        let err = Record::deserialize(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(
            StorageError::of(&err),
            Some(StorageError::Corruption(_))
        ));
    }
}
