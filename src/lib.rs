//! # Strata — Versioned Copy-on-Write Page Store
//!
//! Strata is an append-only, paged storage engine for tree-structured data.
//! Every commit produces a new immutable revision reachable from a single
//! anchor at the head of the data file; older revisions stay intact and
//! navigable forever.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Resource Session (cache, locks)        │
//! ├─────────────────────────────────────────┤
//! │ Read Transactions │  Write Transaction   │
//! ├───────────────────┴─────────────────────┤
//! │ Indirect Tries │ Containers │ Intent Log │
//! ├─────────────────────────────────────────┤
//! │  Revisioning Policies (page versioning)  │
//! ├─────────────────────────────────────────┤
//! │       Page Codec + Byte Pipe             │
//! ├─────────────────────────────────────────┤
//! │  File I/O (buffered writer, mmap reads)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! A record lives in one of four subtrees (node, path summary, text value,
//! attribute value), each a fixed-fanout trie of indirect pages whose
//! leaves are record pages of 1024 records. Writing copies the touched
//! path, stages record pages as deltas or full dumps per the configured
//! [`Versioning`] policy, and commits by appending the new pages and
//! flipping the anchor — readers at older revisions never synchronize with
//! writers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use strata::{PageKind, Resource, ResourceConfig};
//!
//! let resource = Resource::create(ResourceConfig::new("/data/books"))?;
//!
//! let mut trx = resource.begin_write()?;
//! let record = trx.create_entry(b"chapter one".to_vec(), PageKind::Node)?;
//! trx.commit()?;
//! drop(trx);
//!
//! let mut read = resource.begin_read(None)?;
//! assert!(read.get_record(record.node_key(), PageKind::Node)?.is_some());
//! ```
//!
//! ## Module Overview
//!
//! - [`resource`]: session handles, creation, bootstrap
//! - [`txn`]: read/write transactions and the durable intent log
//! - [`versioning`]: FULL / DIFFERENTIAL / INCREMENTAL / SLIDING_SNAPSHOT
//! - [`page`]: page variants, references, codec
//! - [`io`]: readers, writer, byte pipe
//! - [`cache`]: shared page cache
//! - [`config`]: constants and per-resource configuration

pub mod cache;
pub mod config;
pub mod error;
pub mod io;
pub mod page;
pub mod record;
pub mod resource;
pub mod trie;
pub mod txn;
pub mod versioning;

pub use config::{ReaderKind, ResourceConfig};
pub use error::StorageError;
pub use page::{NameKind, PageKind};
pub use record::Record;
pub use resource::Resource;
pub use txn::{PageReadTrx, PageWriteTrx};
pub use versioning::Versioning;
