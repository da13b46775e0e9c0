//! Memory-mapped reader path.
//!
//! Maps the data file and the revisions-offset file and serves page reads as
//! slice copies out of the mapping. The offsets file doubles as a dense
//! `revision → file key` index, so loading a revision root never walks the
//! trie. The mappings are dropped on close; when the data file has grown
//! past the mapped region, [`MmapReader::set_data_segment`] re-installs a
//! fresh mapping.

use byteorder::{BigEndian, ByteOrder};
use eyre::{bail, ensure, Result, WrapErr};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::config::{FIRST_BEACON, MAX_PAGE_BODY_SIZE};
use crate::error::StorageError;
use crate::io::bytepipe::ByteHandlerPipeline;
use crate::io::Reader;
use crate::page::{codec, Page, UberPage};

pub struct MmapReader {
    data_path: PathBuf,
    offsets_path: PathBuf,
    data: Mmap,
    /// `None` while the offsets file is still empty (nothing committed).
    offsets: Option<Mmap>,
    pipe: ByteHandlerPipeline,
}

impl MmapReader {
    pub fn open<P: AsRef<Path>>(
        data_path: P,
        offsets_path: P,
        pipe: ByteHandlerPipeline,
    ) -> Result<Self> {
        let data_path = data_path.as_ref().to_path_buf();
        let offsets_path = offsets_path.as_ref().to_path_buf();
        let data = Self::map(&data_path)?
            .ok_or_else(|| eyre::eyre!("data file '{}' is empty", data_path.display()))?;
        ensure!(
            data.len() as u64 >= FIRST_BEACON,
            StorageError::Corruption(format!(
                "data file '{}' is shorter than its header",
                data_path.display()
            ))
        );
        let offsets = Self::map(&offsets_path)?;
        Ok(Self {
            data_path,
            offsets_path,
            data,
            offsets,
            pipe,
        })
    }

    fn map(path: &Path) -> Result<Option<Mmap>> {
        let file = File::open(path)
            .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        if len == 0 {
            // Mapping a zero-length file is an error on some platforms.
            return Ok(None);
        }
        // SAFETY: Mmap::map is unsafe because the mapping becomes stale if
        // the file is mutated underneath it. This is safe because:
        // 1. The store is append-only: bytes below the mapped length are
        //    immutable once the beacon referencing them has been written.
        // 2. The beacon itself is re-read through this mapping only at
        //    snapshot open, and a torn beacon read is rejected by the
        //    page-offset bounds checks.
        // 3. Growth past the mapped region is handled by remapping via
        //    set_data_segment, never by touching the live mapping.
        let mmap = unsafe {
            Mmap::map(&file).wrap_err_with(|| format!("failed to mmap '{}'", path.display()))?
        };
        Ok(Some(mmap))
    }

    /// Re-installs both mappings after the data file has grown past the
    /// mapped region.
    pub fn set_data_segment(&mut self) -> Result<()> {
        self.data = Self::map(&self.data_path)?
            .ok_or_else(|| eyre::eyre!("data file '{}' vanished", self.data_path.display()))?;
        self.offsets = Self::map(&self.offsets_path)?;
        Ok(())
    }

    fn read_body(&self, key: i64) -> Result<Vec<u8>> {
        ensure!(
            key >= FIRST_BEACON as i64,
            StorageError::InvalidArgument(format!("file key {key} is not a page offset"))
        );
        let start = key as usize;
        ensure!(
            start + 4 <= self.data.len(),
            StorageError::Corruption(format!(
                "file key {key} beyond mapped data segment ({} bytes)",
                self.data.len()
            ))
        );
        let len = BigEndian::read_i32(&self.data[start..start + 4]);
        ensure!(
            len > 0 && (len as usize) <= MAX_PAGE_BODY_SIZE,
            StorageError::Corruption(format!("page length {len} at offset {key} out of range"))
        );
        let body_start = start + 4;
        let body_end = body_start + len as usize;
        ensure!(
            body_end <= self.data.len(),
            StorageError::Corruption(format!(
                "page at offset {key} extends beyond mapped data segment"
            ))
        );
        self.pipe.deserialize(self.data[body_start..body_end].to_vec())
    }
}

impl Reader for MmapReader {
    fn read_page(&mut self, key: i64) -> Result<Page> {
        let body = self.read_body(key)?;
        let mut page = codec::deserialize_page(&body)
            .wrap_err_with(|| format!("failed to decode page at offset {key}"))?;
        if let Page::Record(record_page) = &mut page {
            record_page.set_persisted_at(key);
        }
        Ok(page)
    }

    fn read_uber_page(&mut self) -> Result<(i64, UberPage)> {
        let key = BigEndian::read_i64(&self.data[0..8]);
        ensure!(
            key >= FIRST_BEACON as i64,
            StorageError::Corruption(format!("uber beacon {key} does not point at a page"))
        );
        match self.read_page(key)? {
            Page::Uber(uber) => Ok((key, uber)),
            other => bail!(StorageError::Corruption(format!(
                "beacon points at a {:?} page",
                other.kind()
            ))),
        }
    }

    fn revision_root_offset(&mut self, revision: u32) -> Result<Option<i64>> {
        let offsets = self.offsets.as_ref().ok_or_else(|| {
            eyre::Report::from(StorageError::InvalidArgument(format!(
                "revision {revision} does not exist (no revisions committed)"
            )))
        })?;
        let start = revision as usize * 8;
        ensure!(
            start + 8 <= offsets.len(),
            StorageError::InvalidArgument(format!(
                "revision {revision} does not exist ({} committed)",
                offsets.len() / 8
            ))
        );
        Ok(Some(BigEndian::read_i64(&offsets[start..start + 8])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileReader, FileWriter};
    use crate::page::IndirectPage;
    use tempfile::tempdir;

    #[test]
    fn mmap_reads_what_file_writer_wrote() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let offsets = dir.path().join("offsets");
        let pipe = ByteHandlerPipeline::deflate();

        let mut writer = FileWriter::open(&data, &offsets, pipe.clone()).unwrap();
        let mut page = IndirectPage::new(2);
        page.reference_mut(100).key = 555;
        let page_key = writer.write_page(&Page::Indirect(page)).unwrap();
        let uber_key = writer
            .write_page(&Page::Uber(UberPage::bootstrap()))
            .unwrap();
        writer.write_uber_beacon(uber_key).unwrap();
        writer.append_revision_offset(0, page_key).unwrap();
        writer.sync_data().unwrap();
        writer.sync_offsets().unwrap();

        let mut reader = MmapReader::open(&data, &offsets, pipe.clone()).unwrap();
        let (key, _uber) = reader.read_uber_page().unwrap();
        assert_eq!(key, uber_key);
        assert_eq!(reader.revision_root_offset(0).unwrap(), Some(page_key));
        let read = reader.read_page(page_key).unwrap();
        assert_eq!(read.as_indirect().unwrap().reference(100).key, 555);

        // Agreement with the buffered path.
        let mut file_reader = FileReader::open(&data, pipe).unwrap();
        let via_file = file_reader.read_page(page_key).unwrap();
        assert_eq!(via_file.as_indirect().unwrap().reference(100).key, 555);
    }

    #[test]
    fn unknown_revision_is_invalid_argument() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let offsets = dir.path().join("offsets");
        let pipe = ByteHandlerPipeline::identity();

        let mut writer = FileWriter::open(&data, &offsets, pipe.clone()).unwrap();
        let uber_key = writer
            .write_page(&Page::Uber(UberPage::bootstrap()))
            .unwrap();
        writer.write_uber_beacon(uber_key).unwrap();
        writer.sync_data().unwrap();

        let mut reader = MmapReader::open(&data, &offsets, pipe).unwrap();
        let err = reader.revision_root_offset(5).unwrap_err();
        assert!(matches!(
            StorageError::of(&err),
            Some(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn set_data_segment_picks_up_growth() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let offsets = dir.path().join("offsets");
        let pipe = ByteHandlerPipeline::identity();

        let mut writer = FileWriter::open(&data, &offsets, pipe.clone()).unwrap();
        let first = writer
            .write_page(&Page::Indirect(IndirectPage::new(1)))
            .unwrap();
        writer.sync_data().unwrap();

        let mut reader = MmapReader::open(&data, &offsets, pipe).unwrap();
        assert!(reader.read_page(first).is_ok());

        let second = writer
            .write_page(&Page::Indirect(IndirectPage::new(2)))
            .unwrap();
        writer.sync_data().unwrap();

        // Stale mapping cannot see the new page; remapping can.
        assert!(reader.read_page(second).is_err());
        reader.set_data_segment().unwrap();
        let page = reader.read_page(second).unwrap();
        assert_eq!(page.as_indirect().unwrap().revision(), 2);
    }
}
