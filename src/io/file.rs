//! Buffered random-access reader/writer pair.

use byteorder::{BigEndian, ByteOrder};
use eyre::{bail, ensure, Result, WrapErr};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::config::{FIRST_BEACON, MAX_PAGE_BODY_SIZE};
use crate::error::StorageError;
use crate::io::bytepipe::ByteHandlerPipeline;
use crate::io::Reader;
use crate::page::{codec, Page, UberPage};

/// Buffered reader over the data file. Each read transaction owns one, so
/// seeks never interleave between transactions.
pub struct FileReader {
    data: File,
    data_len: u64,
    pipe: ByteHandlerPipeline,
}

impl FileReader {
    pub fn open<P: AsRef<Path>>(data_path: P, pipe: ByteHandlerPipeline) -> Result<Self> {
        let path = data_path.as_ref();
        let data = File::open(path)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;
        let data_len = data
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(
            data_len >= FIRST_BEACON,
            StorageError::Corruption(format!(
                "data file '{}' is shorter than its header ({data_len} bytes)",
                path.display()
            ))
        );
        Ok(Self {
            data,
            data_len,
            pipe,
        })
    }

    /// Picks up appended pages written since the reader was opened.
    fn refresh_len(&mut self) -> Result<()> {
        self.data_len = self.data.metadata().wrap_err("failed to stat data file")?.len();
        Ok(())
    }

    fn read_body(&mut self, key: i64) -> Result<Vec<u8>> {
        ensure!(
            key >= FIRST_BEACON as i64,
            StorageError::InvalidArgument(format!("file key {key} is not a page offset"))
        );
        if key as u64 >= self.data_len {
            self.refresh_len()?;
        }
        ensure!(
            (key as u64) + 4 <= self.data_len,
            StorageError::Corruption(format!(
                "file key {key} beyond end of data file ({} bytes)",
                self.data_len
            ))
        );
        self.data
            .seek(SeekFrom::Start(key as u64))
            .wrap_err("failed to seek to page")?;
        let mut len_bytes = [0u8; 4];
        self.data
            .read_exact(&mut len_bytes)
            .wrap_err("failed to read page length")?;
        let len = BigEndian::read_i32(&len_bytes);
        ensure!(
            len > 0 && (len as usize) <= MAX_PAGE_BODY_SIZE,
            StorageError::Corruption(format!("page length {len} at offset {key} out of range"))
        );
        let mut body = vec![0u8; len as usize];
        self.data
            .read_exact(&mut body)
            .wrap_err_with(|| format!("failed to read {len}-byte page at offset {key}"))?;
        self.pipe.deserialize(body)
    }
}

impl Reader for FileReader {
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
        self.refresh_len()?;
        self.data
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to beacon")?;
        let mut beacon = [0u8; 8];
        self.data
            .read_exact(&mut beacon)
            .wrap_err("failed to read uber beacon")?;
        let key = BigEndian::read_i64(&beacon);
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

    fn revision_root_offset(&mut self, _revision: u32) -> Result<Option<i64>> {
        // No dense index on this path; the transaction walks the trie.
        Ok(None)
    }
}

/// Append-only writer over the data file plus the revisions-offset file.
/// Exactly one exists per resource at a time, owned by the write
/// transaction.
pub struct FileWriter {
    data: File,
    offsets: File,
    pipe: ByteHandlerPipeline,
    end: u64,
}

impl FileWriter {
    pub fn open<P: AsRef<Path>>(
        data_path: P,
        offsets_path: P,
        pipe: ByteHandlerPipeline,
    ) -> Result<Self> {
        let data_path = data_path.as_ref();
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(data_path)
            .wrap_err_with(|| format!("failed to open data file '{}'", data_path.display()))?;
        let mut len = data.metadata().wrap_err("failed to stat data file")?.len();
        if len < FIRST_BEACON {
            // Fresh resource: zeroed beacon plus reserved bytes.
            data.set_len(FIRST_BEACON)
                .wrap_err("failed to reserve data file header")?;
            len = FIRST_BEACON;
        }

        let offsets_path = offsets_path.as_ref();
        let offsets = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(offsets_path)
            .wrap_err_with(|| {
                format!("failed to open offsets file '{}'", offsets_path.display())
            })?;

        Ok(Self {
            data,
            offsets,
            pipe,
            end: len,
        })
    }

    /// Serializes `page` through the codec and byte pipe and appends it,
    /// returning its file key.
    pub fn write_page(&mut self, page: &Page) -> Result<i64> {
        let body = self.pipe.serialize(codec::serialize_page(page)?)?;
        ensure!(
            body.len() <= MAX_PAGE_BODY_SIZE,
            StorageError::InvalidArgument(format!("page body of {} bytes too large", body.len()))
        );
        let key = self.end;
        let mut frame = Vec::with_capacity(4 + body.len());
        let mut len_bytes = [0u8; 4];
        BigEndian::write_i32(&mut len_bytes, body.len() as i32);
        frame.extend_from_slice(&len_bytes);
        frame.extend_from_slice(&body);

        self.data
            .seek(SeekFrom::Start(key))
            .wrap_err("failed to seek to end of data file")?;
        self.data
            .write_all(&frame)
            .wrap_err_with(|| format!("failed to append {}-byte page", frame.len()))?;
        self.end += frame.len() as u64;
        Ok(key as i64)
    }

    /// Atomically redirects the resource to the uber page at `key`. The
    /// caller must have synced every page the uber page reaches first.
    pub fn write_uber_beacon(&mut self, key: i64) -> Result<()> {
        ensure!(
            key >= FIRST_BEACON as i64 && (key as u64) < self.end,
            StorageError::InvalidArgument(format!("beacon target {key} is not a written page"))
        );
        let mut beacon = [0u8; 8];
        BigEndian::write_i64(&mut beacon, key);
        self.data
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to beacon")?;
        self.data
            .write_all(&beacon)
            .wrap_err("failed to write uber beacon")?;
        Ok(())
    }

    /// Appends `revisions_offset[revision] = key`. The offsets file is
    /// dense, so `revision` must be exactly the next slot.
    pub fn append_revision_offset(&mut self, revision: u32, key: i64) -> Result<()> {
        let position = revision as u64 * 8;
        let len = self
            .offsets
            .metadata()
            .wrap_err("failed to stat offsets file")?
            .len();
        ensure!(
            len == position,
            StorageError::Corruption(format!(
                "offsets file holds {} revisions, expected {revision}",
                len / 8
            ))
        );
        let mut entry = [0u8; 8];
        BigEndian::write_i64(&mut entry, key);
        self.offsets
            .seek(SeekFrom::Start(position))
            .wrap_err("failed to seek offsets file")?;
        self.offsets
            .write_all(&entry)
            .wrap_err("failed to append revision offset")?;
        Ok(())
    }

    pub fn sync_data(&self) -> Result<()> {
        self.data.sync_all().wrap_err("failed to sync data file")
    }

    pub fn sync_offsets(&self) -> Result<()> {
        self.offsets
            .sync_all()
            .wrap_err("failed to sync offsets file")
    }

    /// Current end of the data file (the key the next page will get).
    pub fn end(&self) -> u64 {
        self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::IndirectPage;
    use tempfile::tempdir;

    fn paths(dir: &tempfile::TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        (dir.path().join("data"), dir.path().join("offsets"))
    }

    #[test]
    fn write_then_read_page() {
        let dir = tempdir().unwrap();
        let (data, offsets) = paths(&dir);
        let pipe = ByteHandlerPipeline::deflate();

        let mut writer = FileWriter::open(&data, &offsets, pipe.clone()).unwrap();
        let mut page = IndirectPage::new(7);
        page.reference_mut(3).key = 1234;
        let key = writer.write_page(&Page::Indirect(page)).unwrap();
        assert_eq!(key, FIRST_BEACON as i64);
        writer.sync_data().unwrap();

        let mut reader = FileReader::open(&data, pipe).unwrap();
        let read = reader.read_page(key).unwrap();
        let indirect = read.as_indirect().unwrap();
        assert_eq!(indirect.revision(), 7);
        assert_eq!(indirect.reference(3).key, 1234);
    }

    #[test]
    fn beacon_round_trip() {
        let dir = tempdir().unwrap();
        let (data, offsets) = paths(&dir);
        let pipe = ByteHandlerPipeline::identity();

        let mut writer = FileWriter::open(&data, &offsets, pipe.clone()).unwrap();
        let key = writer
            .write_page(&Page::Uber(UberPage::bootstrap()))
            .unwrap();
        writer.write_uber_beacon(key).unwrap();
        writer.sync_data().unwrap();

        let mut reader = FileReader::open(&data, pipe).unwrap();
        let (beacon_key, uber) = reader.read_uber_page().unwrap();
        assert_eq!(beacon_key, key);
        assert!(uber.is_bootstrap());
    }

    #[test]
    fn fresh_resource_has_no_valid_beacon() {
        let dir = tempdir().unwrap();
        let (data, offsets) = paths(&dir);
        let pipe = ByteHandlerPipeline::identity();
        drop(FileWriter::open(&data, &offsets, pipe.clone()).unwrap());

        let mut reader = FileReader::open(&data, pipe).unwrap();
        let err = reader.read_uber_page().unwrap_err();
        assert!(matches!(
            StorageError::of(&err),
            Some(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn offsets_file_is_dense() {
        let dir = tempdir().unwrap();
        let (data, offsets) = paths(&dir);
        let mut writer =
            FileWriter::open(&data, &offsets, ByteHandlerPipeline::identity()).unwrap();
        writer.append_revision_offset(0, 12).unwrap();
        writer.append_revision_offset(1, 40).unwrap();
        let err = writer.append_revision_offset(3, 80).unwrap_err();
        assert!(matches!(
            StorageError::of(&err),
            Some(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn truncated_page_is_corruption() {
        let dir = tempdir().unwrap();
        let (data, offsets) = paths(&dir);
        let pipe = ByteHandlerPipeline::identity();
        let mut writer = FileWriter::open(&data, &offsets, pipe.clone()).unwrap();
        let key = writer
            .write_page(&Page::Indirect(IndirectPage::new(0)))
            .unwrap();

        // Clip the file in the middle of the page body.
        let len = std::fs::metadata(&data).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&data)
            .unwrap()
            .set_len(len - 10)
            .unwrap();

        let mut reader = FileReader::open(&data, pipe).unwrap();
        assert!(reader.read_page(key).is_err());
    }
}
