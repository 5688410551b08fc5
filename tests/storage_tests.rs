use std::sync::{Arc, Barrier};
use std::thread;

use bedrock::error::BedrockError;
use bedrock::storage::{Database, StorageConfig};
use bedrock::types::TxnId;
use tempfile::tempdir;

fn padded(text: &str, size: usize) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(size, 0);
    bytes
}

fn open(path: &std::path::Path) -> Database {
    let db = Database::open(path, StorageConfig::small()).unwrap();
    if !db.table_exists("flights") {
        db.create_table("flights").unwrap();
    }
    db
}

#[test]
fn test_insert_visible_to_owner_then_everyone() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());
    let t = TxnId::generate();
    let t2 = TxnId::generate();

    db.insert_record(t, "flights", "K", b"seat-map").unwrap();
    assert_eq!(db.read_record(t, "flights", "K").unwrap(), padded("seat-map", 64));
    assert!(matches!(
        db.read_record(t2, "flights", "K"),
        Err(BedrockError::RecordNotFound(_))
    ));

    db.prepare(t).unwrap();
    assert!(db.read_record(t2, "flights", "K").is_err());
    db.commit(t).unwrap();

    assert_eq!(db.read_record(t2, "flights", "K").unwrap(), padded("seat-map", 64));
}

#[test]
fn test_aborted_insert_is_gone() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());
    let t = TxnId::generate();
    db.insert_record(t, "flights", "K", b"v").unwrap();
    db.abort(t).unwrap();
    db.abort(t).unwrap();

    for reader in [t, TxnId::generate()] {
        assert!(matches!(
            db.read_record(reader, "flights", "K"),
            Err(BedrockError::RecordNotFound(_))
        ));
    }

    // Prepared, then aborted
    let t = TxnId::generate();
    db.insert_record(t, "flights", "K", b"v").unwrap();
    db.prepare(t).unwrap();
    db.abort(t).unwrap();
    assert!(db.read_record(TxnId::generate(), "flights", "K").is_err());

    // The key is free again
    let t = TxnId::generate();
    db.insert_record(t, "flights", "K", b"again").unwrap();
    db.commit(t).unwrap();
}

#[test]
fn test_concurrent_duplicate_insert() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open(dir.path()));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let txn = TxnId::generate();
                barrier.wait();
                (txn, db.insert_record(txn, "flights", "K", b"mine"))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<TxnId> = results
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(txn, _)| *txn)
        .collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .any(|(_, r)| matches!(r, Err(BedrockError::DuplicateKey(_)))));

    for (txn, _) in &results {
        db.commit(*txn).unwrap();
    }
    let all = db.read_all_records(TxnId::generate(), "flights").unwrap();
    assert_eq!(all.len(), 1);
}

#[test]
fn test_read_all_merges_own_log() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());
    let setup = TxnId::generate();
    for key in ["a", "b", "c"] {
        db.insert_record(setup, "flights", key, key.as_bytes()).unwrap();
    }
    db.commit(setup).unwrap();

    let t = TxnId::generate();
    db.delete_record(t, "flights", "a").unwrap();
    db.update_record(t, "flights", "b", b"B").unwrap();
    db.insert_record(t, "flights", "d", b"d").unwrap();
    db.prepare(t).unwrap();

    let mine: Vec<(String, Vec<u8>)> = db.read_all_records(t, "flights").unwrap();
    assert_eq!(
        mine,
        vec![
            ("b".to_string(), padded("B", 64)),
            ("c".to_string(), padded("c", 64)),
            ("d".to_string(), padded("d", 64)),
        ]
    );

    let theirs: Vec<String> = db
        .read_all_records(TxnId::generate(), "flights")
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(theirs, vec!["a", "b", "c"]);
}

#[test]
fn test_restart_then_abort_restores_committed_state() {
    let dir = tempdir().unwrap();
    let t = TxnId::generate();
    {
        let db = open(dir.path());
        let setup = TxnId::generate();
        db.insert_record(setup, "flights", "keep", b"1").unwrap();
        db.insert_record(setup, "flights", "drop", b"2").unwrap();
        db.commit(setup).unwrap();

        db.delete_record(t, "flights", "drop").unwrap();
        db.update_record(t, "flights", "keep", b"changed").unwrap();
        db.insert_record(t, "flights", "new", b"3").unwrap();
        db.prepare(t).unwrap();
    }

    let db = open(dir.path());
    assert_eq!(db.transactions(), vec![t]);
    assert_eq!(db.pending(t), 3);
    db.abort(t).unwrap();

    let reader = TxnId::generate();
    assert_eq!(db.read_record(reader, "flights", "keep").unwrap(), padded("1", 64));
    assert_eq!(db.read_record(reader, "flights", "drop").unwrap(), padded("2", 64));
    assert!(db.read_record(reader, "flights", "new").is_err());
    drop(db);

    // The abort itself was durable
    let db = open(dir.path());
    assert!(db.transactions().is_empty());
}

#[test]
fn test_unprepared_work_is_lost_on_restart() {
    let dir = tempdir().unwrap();
    {
        let db = open(dir.path());
        db.insert_record(TxnId::generate(), "flights", "K", b"v").unwrap();
    }
    let db = open(dir.path());
    assert!(db.transactions().is_empty());
    assert!(db.read_record(TxnId::generate(), "flights", "K").is_err());
}

#[test]
fn test_out_of_space() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path(), StorageConfig::small()).unwrap();
    let tiny = StorageConfig {
        page_count: 1,
        rows_per_page: 2,
        ..StorageConfig::small()
    };
    db.create_table_with("tiny", &tiny).unwrap();

    let t = TxnId::generate();
    db.insert_record(t, "tiny", "a", b"1").unwrap();
    db.insert_record(t, "tiny", "b", b"2").unwrap();
    assert!(matches!(
        db.insert_record(t, "tiny", "c", b"3"),
        Err(BedrockError::OutOfSpace(_))
    ));
    db.commit(t).unwrap();

    // Deleting frees the slot for a later insert
    let t = TxnId::generate();
    db.delete_record(t, "tiny", "a").unwrap();
    db.commit(t).unwrap();
    let t = TxnId::generate();
    db.insert_record(t, "tiny", "c", b"3").unwrap();
    db.commit(t).unwrap();
}

#[test]
fn test_concurrent_inserts_share_one_page() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path(), StorageConfig::small()).unwrap();
    let one_page = StorageConfig {
        page_count: 1,
        rows_per_page: 8,
        ..StorageConfig::small()
    };
    db.create_table_with("tiny", &one_page).unwrap();
    let db = Arc::new(db);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let txn = TxnId::generate();
                let key = format!("seat-{}", n);
                barrier.wait();
                db.insert_record(txn, "tiny", &key, key.as_bytes()).unwrap();
                db.commit(txn).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Eight rows, eight slots: nobody overwrote anybody
    let all = db.read_all_records(TxnId::generate(), "tiny").unwrap();
    assert_eq!(all.len(), 8);
    for (key, image) in &all {
        assert_eq!(image, &padded(key, 64));
    }
    assert!(matches!(
        db.insert_record(TxnId::generate(), "tiny", "seat-8", b"x"),
        Err(BedrockError::OutOfSpace(_))
    ));
}

#[test]
fn test_manifest_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = open(dir.path());
        db.create_table("cars").unwrap();
    }
    let db = open(dir.path());
    assert_eq!(db.tables(), vec!["cars".to_string(), "flights".to_string()]);
    assert_eq!(db.table_geometry("cars").unwrap().row_size, 64);
}
