//! # Transaction Intent Log
//!
//! Every write transaction stages its pages in a durable log before commit:
//! five append-only stores inside `log/<revision>/` — one per record
//! subtree (`node`, `path`, `textValue`, `attributeValue`) holding
//! record-page containers keyed by page key, plus `page` holding trie pages
//! keyed by an assigned log key.
//!
//! ## Frame Format
//!
//! Each store is a sequence of frames:
//!
//! ```text
//! +---------------------+------------------+
//! | Frame Header (24 B) | Payload          |
//! +---------------------+------------------+
//! ```
//!
//! The header carries the entry key, the payload length, and a CRC64 over
//! key, length, and payload. A key may be appended many times; the
//! in-memory index tracks the newest frame per key, and a rescan after a
//! crash applies frames in order so the last valid frame wins. A frame with
//! a bad checksum ends the scan — everything before it is intact.
//!
//! ## Lifecycle
//!
//! The log directory is created with an `unfinished` sentinel file. A
//! successful commit deletes the whole directory; a crash leaves it behind
//! with the sentinel still present, and the next open of the resource
//! either replays it ([`TrxLog::reopen`]) or garbage-collects it
//! ([`TrxLog::discard_unfinished`]). Either choice is safe: the data file
//! is untouched until the commit's beacon update, which happens strictly
//! after the log stops being needed.
//!
//! ## Reads
//!
//! `get` serves straight from the store file through a lazily installed
//! memory mapping, validating the checksum on every read. Only the index
//! lives on the heap, so the log stays bounded regardless of transaction
//! size.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::Mmap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::UNFINISHED_SENTINEL;
use crate::error::StorageError;
use crate::page::{codec, Page, PageKind, RecordPageContainer, RECORD_SUBTREES};

pub const LOG_FRAME_HEADER_SIZE: usize = 24;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Name of the store holding trie pages (everything that is not a record
/// page container).
const PAGE_STORE_NAME: &str = "page";

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct LogFrameHeader {
    key: u64,
    payload_len: u32,
    _reserved: u32,
    checksum: u64,
}

fn compute_checksum(key: u64, payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&key.to_le_bytes());
    digest.update(&(payload.len() as u32).to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

/// One append-only keyed store backing part of a transaction log.
struct LogStore {
    path: PathBuf,
    file: File,
    /// key → (payload offset, payload length) of the newest frame.
    index: HashMap<u64, (u64, u32)>,
    read_mmap: Option<Mmap>,
    end: u64,
}

impl LogStore {
    fn create(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create log store at {:?}", path))?;
        Ok(Self {
            path,
            file,
            index: HashMap::new(),
            read_mmap: None,
            end: 0,
        })
    }

    /// Opens an existing store and rebuilds the index by scanning frames.
    /// A torn tail frame ends the scan.
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open log store at {:?}", path))?;
        let len = file.metadata().wrap_err("failed to stat log store")?.len();

        let mut index = HashMap::new();
        let mut end = 0u64;
        if len >= LOG_FRAME_HEADER_SIZE as u64 {
            // SAFETY: the store is only appended to, never rewritten; this
            // mapping is read once during open before any write happens
            // through this handle.
            let mmap = unsafe {
                Mmap::map(&file).wrap_err_with(|| format!("failed to mmap {:?}", path))?
            };
            let mut offset = 0usize;
            while offset + LOG_FRAME_HEADER_SIZE <= mmap.len() {
                let header = match LogFrameHeader::read_from_bytes(
                    &mmap[offset..offset + LOG_FRAME_HEADER_SIZE],
                ) {
                    Ok(header) => header,
                    Err(_) => break,
                };
                let payload_start = offset + LOG_FRAME_HEADER_SIZE;
                let payload_end = payload_start + header.payload_len as usize;
                if payload_end > mmap.len() {
                    break;
                }
                let payload = &mmap[payload_start..payload_end];
                if compute_checksum(header.key, payload) != header.checksum {
                    break;
                }
                index.insert(header.key, (payload_start as u64, header.payload_len));
                offset = payload_end;
                end = payload_end as u64;
            }
        }

        Ok(Self {
            path,
            file,
            index,
            read_mmap: None,
            end,
        })
    }

    fn put(&mut self, key: u64, payload: &[u8]) -> Result<()> {
        let header = LogFrameHeader {
            key,
            payload_len: payload.len() as u32,
            _reserved: 0,
            checksum: compute_checksum(key, payload),
        };
        // Appends go at the logical end, which after a reopen may sit below
        // a torn tail frame; writing there reclaims it.
        self.file
            .seek(SeekFrom::Start(self.end))
            .wrap_err("failed to seek to end of log store")?;
        self.file
            .write_all(header.as_bytes())
            .wrap_err("failed to write log frame header")?;
        self.file
            .write_all(payload)
            .wrap_err("failed to write log frame payload")?;
        self.file
            .sync_all()
            .wrap_err("failed to sync log frame to disk")?;

        let payload_offset = self.end + LOG_FRAME_HEADER_SIZE as u64;
        self.index.insert(key, (payload_offset, header.payload_len));
        self.end = payload_offset + payload.len() as u64;
        self.read_mmap = None;
        Ok(())
    }

    fn get(&mut self, key: u64) -> Result<Option<Vec<u8>>> {
        let (offset, len) = match self.index.get(&key) {
            Some(&entry) => entry,
            None => return Ok(None),
        };

        if self.read_mmap.is_none() {
            // SAFETY: frames below self.end are never rewritten; the mapping
            // is dropped before the next append through this handle.
            let mmap = unsafe {
                Mmap::map(&self.file)
                    .wrap_err_with(|| format!("failed to mmap {:?}", self.path))?
            };
            self.read_mmap = Some(mmap);
        }
        let mmap = self.read_mmap.as_ref().expect("mapping installed above");

        let start = offset as usize;
        let end = start + len as usize;
        ensure!(
            end <= mmap.len(),
            StorageError::Corruption(format!(
                "log frame for key {key} extends beyond store {:?}",
                self.path
            ))
        );
        let payload = &mmap[start..end];
        let header_start = start - LOG_FRAME_HEADER_SIZE;
        let header = LogFrameHeader::read_from_bytes(&mmap[header_start..start])
            .map_err(|e| StorageError::Corruption(format!("bad log frame header: {e:?}")))?;
        ensure!(
            compute_checksum(key, payload) == header.checksum,
            StorageError::Corruption(format!(
                "checksum mismatch for key {key} in {:?}",
                self.path
            ))
        );
        Ok(Some(payload.to_vec()))
    }

    fn keys_sorted(&self) -> Vec<u64> {
        let mut keys: Vec<u64> = self.index.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

/// The durable log of one uncommitted write transaction.
pub struct TrxLog {
    dir: PathBuf,
    subtrees: [LogStore; RECORD_SUBTREES.len()],
    pages: LogStore,
    next_log_key: u64,
}

impl TrxLog {
    /// Creates `log/<revision>/` with empty stores and the unfinished
    /// sentinel.
    pub fn create(log_root: &Path, revision: u32) -> Result<Self> {
        let dir = log_root.join(revision.to_string());
        create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create transaction log at {:?}", dir))?;
        File::create(dir.join(UNFINISHED_SENTINEL))
            .wrap_err("failed to create unfinished sentinel")?;

        let subtrees = Self::store_paths(&dir).map(|path| LogStore::create(path));
        let subtrees = Self::unwrap_stores(subtrees)?;
        let pages = LogStore::create(dir.join(PAGE_STORE_NAME))?;
        Ok(Self {
            dir,
            subtrees,
            pages,
            next_log_key: 0,
        })
    }

    /// Reopens a surviving log directory, rebuilding every index by frame
    /// scan. Used to replay an unfinished transaction after a restart.
    pub fn reopen(log_root: &Path, revision: u32) -> Result<Self> {
        let dir = log_root.join(revision.to_string());
        ensure!(
            dir.join(UNFINISHED_SENTINEL).exists(),
            StorageError::InvalidState(format!(
                "transaction log {:?} is not marked unfinished",
                dir
            ))
        );
        let subtrees = Self::store_paths(&dir).map(LogStore::open);
        let subtrees = Self::unwrap_stores(subtrees)?;
        let pages = LogStore::open(dir.join(PAGE_STORE_NAME))?;
        let next_log_key = pages.keys_sorted().last().map(|&k| k + 1).unwrap_or(0);
        Ok(Self {
            dir,
            subtrees,
            pages,
            next_log_key,
        })
    }

    fn store_paths(dir: &Path) -> [PathBuf; RECORD_SUBTREES.len()] {
        RECORD_SUBTREES.map(|kind| {
            dir.join(
                kind.log_store_name()
                    .expect("record subtrees have store names"),
            )
        })
    }

    fn unwrap_stores(
        stores: [Result<LogStore>; RECORD_SUBTREES.len()],
    ) -> Result<[LogStore; RECORD_SUBTREES.len()]> {
        let mut out = Vec::with_capacity(stores.len());
        for store in stores {
            out.push(store?);
        }
        Ok(out
            .try_into()
            .unwrap_or_else(|_| unreachable!("store count is fixed")))
    }

    fn subtree_store(&mut self, kind: PageKind) -> Result<&mut LogStore> {
        let index = kind.subtree_index().ok_or_else(|| {
            eyre::Report::from(StorageError::InvalidArgument(format!(
                "{kind:?} is not a record subtree"
            )))
        })?;
        Ok(&mut self.subtrees[index])
    }

    /// Stages a record-page container under its page key.
    pub fn put_container(
        &mut self,
        kind: PageKind,
        page_key: u64,
        container: &RecordPageContainer,
    ) -> Result<()> {
        let payload = serialize_container(container)?;
        self.subtree_store(kind)?.put(page_key, &payload)
    }

    pub fn get_container(
        &mut self,
        kind: PageKind,
        page_key: u64,
    ) -> Result<Option<RecordPageContainer>> {
        match self.subtree_store(kind)?.get(page_key)? {
            Some(payload) => Ok(Some(deserialize_container(&payload)?)),
            None => Ok(None),
        }
    }

    /// Page keys staged in a subtree, ascending.
    pub fn container_keys(&self, kind: PageKind) -> Vec<u64> {
        match kind.subtree_index() {
            Some(index) => self.subtrees[index].keys_sorted(),
            None => Vec::new(),
        }
    }

    /// Stages a trie page, returning its assigned log key.
    pub fn put_page(&mut self, page: &Page) -> Result<u64> {
        let log_key = self.next_log_key;
        self.next_log_key += 1;
        let payload = codec::serialize_page(page)?;
        self.pages.put(log_key, &payload)?;
        Ok(log_key)
    }

    pub fn get_page(&mut self, log_key: u64) -> Result<Option<Page>> {
        match self.pages.get(log_key)? {
            Some(payload) => Ok(Some(codec::deserialize_page(&payload)?)),
            None => Ok(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tears the log down after a successful commit.
    pub fn finish(self) -> Result<()> {
        let dir = self.dir.clone();
        drop(self);
        std::fs::remove_dir_all(&dir)
            .wrap_err_with(|| format!("failed to remove committed transaction log {:?}", dir))
    }

    /// Discards the log of a cancelled transaction.
    pub fn discard(self) -> Result<()> {
        self.finish()
    }

    /// Removes every leftover unfinished transaction log under `log_root`.
    /// Returns the revisions that were collected.
    pub fn discard_unfinished(log_root: &Path) -> Result<Vec<u32>> {
        let mut collected = Vec::new();
        if !log_root.exists() {
            return Ok(collected);
        }
        for entry in std::fs::read_dir(log_root).wrap_err("failed to scan log directory")? {
            let entry = entry.wrap_err("failed to read log directory entry")?;
            let path = entry.path();
            if path.is_dir() && path.join(UNFINISHED_SENTINEL).exists() {
                if let Some(revision) = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.parse::<u32>().ok())
                {
                    collected.push(revision);
                }
                std::fs::remove_dir_all(&path)
                    .wrap_err_with(|| format!("failed to remove stale log {:?}", path))?;
            }
        }
        collected.sort_unstable();
        Ok(collected)
    }
}

fn serialize_container(container: &RecordPageContainer) -> Result<Vec<u8>> {
    let complete = codec::serialize_page(&Page::Record(container.complete().clone()))?;
    let modified = codec::serialize_page(&Page::Record(container.modified().clone()))?;
    let mut out = Vec::with_capacity(8 + complete.len() + modified.len());
    let mut len_bytes = [0u8; 4];
    BigEndian::write_u32(&mut len_bytes, complete.len() as u32);
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(&complete);
    BigEndian::write_u32(&mut len_bytes, modified.len() as u32);
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(&modified);
    Ok(out)
}

fn deserialize_container(payload: &[u8]) -> Result<RecordPageContainer> {
    ensure!(
        payload.len() >= 8,
        StorageError::Corruption("container payload too short".into())
    );
    let complete_len = BigEndian::read_u32(&payload[0..4]) as usize;
    let complete_end = 4 + complete_len;
    ensure!(
        complete_end + 4 <= payload.len(),
        StorageError::Corruption("container payload truncated".into())
    );
    let modified_len = BigEndian::read_u32(&payload[complete_end..complete_end + 4]) as usize;
    let modified_end = complete_end + 4 + modified_len;
    ensure!(
        modified_end == payload.len(),
        StorageError::Corruption("container payload has trailing bytes".into())
    );

    let complete = codec::deserialize_page(&payload[4..complete_end])?;
    let modified = codec::deserialize_page(&payload[complete_end + 4..modified_end])?;
    match (complete, modified) {
        (Page::Record(complete), Page::Record(modified)) => {
            Ok(RecordPageContainer::new(complete, modified))
        }
        _ => bail!(StorageError::Corruption(
            "container payload does not hold record pages".into()
        )),
    }
}
