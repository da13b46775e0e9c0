//! Failure-path behavior: cancelled transactions, torn commits, and
//! leftover intent logs.

use std::io::Write;

use strata::txn::TrxLog;
use strata::{PageKind, Resource, ResourceConfig, StorageError};
use tempfile::tempdir;

#[test]
fn cancelled_transaction_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resource");
    let resource = Resource::create(ResourceConfig::new(&path)).unwrap();

    {
        let mut trx = resource.begin_write().unwrap();
        trx.create_entry(b"never committed".to_vec(), PageKind::Node)
            .unwrap();
        // dropped without commit
    }

    let mut read = resource.begin_read(None).unwrap();
    assert_eq!(read.revision_number(), 0);
    assert_eq!(read.get_record(0, PageKind::Node).unwrap(), None);
    // the intent log directory is gone
    assert!(std::fs::read_dir(path.join("log")).unwrap().next().is_none());

    // and the writer slot is free again
    let mut trx = resource.begin_write().unwrap();
    trx.create_entry(b"committed".to_vec(), PageKind::Node)
        .unwrap();
    trx.commit().unwrap();
}

#[test]
fn torn_commit_is_invisible_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resource");
    let resource = Resource::create(ResourceConfig::new(&path)).unwrap();

    let mut trx = resource.begin_write().unwrap();
    trx.create_entry(b"stable".to_vec(), PageKind::Node).unwrap();
    trx.commit().unwrap();
    drop(trx);
    drop(resource);

    // Simulate a crash mid-commit of revision 2: pages appended past the
    // beacon but the beacon never flipped, and the intent log survived with
    // its unfinished sentinel.
    {
        let log = TrxLog::create(&path.join("log"), 2).unwrap();
        let mut data = std::fs::OpenOptions::new()
            .append(true)
            .open(path.join("data.strata"))
            .unwrap();
        data.write_all(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22])
            .unwrap();
        // the log is never finished, as in a crash
        std::mem::forget(log);
    }

    let reopened = Resource::open(ResourceConfig::new(&path)).unwrap();
    // the stale log was collected
    assert!(!path.join("log").join("2").exists());

    let mut read = reopened.begin_read(None).unwrap();
    assert_eq!(read.revision_number(), 1);
    assert_eq!(
        read.get_record(0, PageKind::Node).unwrap().unwrap().data(),
        Some(&b"stable"[..])
    );

    // the resource keeps working: the next commit appends past the garbage
    let mut trx = reopened.begin_write().unwrap();
    trx.create_entry(b"after crash".to_vec(), PageKind::Node)
        .unwrap();
    trx.commit().unwrap();
    drop(trx);

    let mut read = reopened.begin_read(Some(2)).unwrap();
    assert_eq!(
        read.get_record(1, PageKind::Node).unwrap().unwrap().data(),
        Some(&b"after crash"[..])
    );
}

#[test]
fn surviving_intent_log_can_be_replayed_before_collection() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resource");
    let resource = Resource::create(ResourceConfig::new(&path)).unwrap();

    let mut trx = resource.begin_write().unwrap();
    trx.create_entry(b"staged then lost".to_vec(), PageKind::Node)
        .unwrap();
    // crash: no commit, no close
    std::mem::forget(trx);
    drop(resource);

    // Before the resource is reopened, the staged container is still
    // readable from the surviving log.
    let mut log = TrxLog::reopen(&path.join("log"), 1).unwrap();
    let container = log.get_container(PageKind::Node, 0).unwrap().unwrap();
    assert_eq!(
        container.modified().get(0).unwrap().data(),
        Some(&b"staged then lost"[..])
    );
    drop(log);

    // Reopening the resource discards it without touching committed state.
    let reopened = Resource::open(ResourceConfig::new(&path)).unwrap();
    let mut read = reopened.begin_read(None).unwrap();
    assert_eq!(read.revision_number(), 0);
    assert_eq!(read.get_record(0, PageKind::Node).unwrap(), None);
}

#[test]
fn opening_a_missing_resource_fails() {
    let dir = tempdir().unwrap();
    let err = Resource::open(ResourceConfig::new(dir.path().join("nope"))).unwrap_err();
    assert!(matches!(
        StorageError::of(&err),
        Some(StorageError::InvalidArgument(_))
    ));
}

#[test]
fn creating_over_an_existing_resource_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resource");
    let _resource = Resource::create(ResourceConfig::new(&path)).unwrap();
    let err = Resource::create(ResourceConfig::new(&path)).unwrap_err();
    assert!(matches!(
        StorageError::of(&err),
        Some(StorageError::InvalidArgument(_))
    ));
}

#[test]
fn corrupt_beacon_is_detected_at_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resource");
    let resource = Resource::create(ResourceConfig::new(&path)).unwrap();
    drop(resource);

    // point the beacon into the void
    let mut data = std::fs::OpenOptions::new()
        .write(true)
        .open(path.join("data.strata"))
        .unwrap();
    data.write_all(&i64::MAX.to_be_bytes()).unwrap();
    drop(data);

    let err = Resource::open(ResourceConfig::new(&path)).unwrap_err();
    assert!(matches!(
        StorageError::of(&err),
        Some(StorageError::Corruption(_))
    ));
}
