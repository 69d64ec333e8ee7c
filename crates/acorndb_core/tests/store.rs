//! End-to-end tests for the KV surface, durability, and locking.

use acorndb_core::{Config, CoreError, Database, FileId, IndexMode, PERSISTENT};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn put(db: &Database, bucket: &str, key: &[u8], value: &[u8]) {
    db.update(|tx| tx.put(bucket, key, value, PERSISTENT))
        .unwrap();
}

fn get(db: &Database, bucket: &str, key: &[u8]) -> Result<Vec<u8>, CoreError> {
    let mut out = Err(CoreError::KeyNotFound);
    let result = db.view(|tx| {
        out = tx.get(bucket, key);
        Ok(())
    });
    result.unwrap();
    out
}

#[test]
fn basic_put_get_update_delete() {
    let temp = tempdir().unwrap();
    let db = Database::open(temp.path().join("db"), Config::default()).unwrap();

    put(&db, "bucket", b"k0", b"v0");
    assert_eq!(get(&db, "bucket", b"k0").unwrap(), b"v0");

    put(&db, "bucket", b"k0", b"v1");
    assert_eq!(get(&db, "bucket", b"k0").unwrap(), b"v1");

    db.update(|tx| tx.delete("bucket", b"k0")).unwrap();
    assert!(matches!(
        get(&db, "bucket", b"k0"),
        Err(CoreError::KeyNotFound)
    ));
}

#[test]
fn delete_error_cases() {
    let temp = tempdir().unwrap();
    let db = Database::open(temp.path().join("db"), Config::default()).unwrap();

    // Fresh store: the bucket itself is missing.
    let result = db.update(|tx| tx.delete("tb", b"k"));
    assert!(matches!(result, Err(CoreError::BucketNotFound { .. })));

    put(&db, "tb", b"k1", b"v");
    let result = db.update(|tx| tx.delete("tb", b"k0"));
    assert!(matches!(result, Err(CoreError::KeyNotFound)));
}

#[test]
fn last_write_wins_within_one_transaction() {
    let temp = tempdir().unwrap();
    let db = Database::open(temp.path().join("db"), Config::default()).unwrap();

    db.update(|tx| {
        tx.put("b", b"k", b"first", PERSISTENT)?;
        tx.put("b", b"k", b"second", PERSISTENT)?;
        // The transaction reads its own latest write.
        assert_eq!(tx.get("b", b"k")?, b"second");
        Ok(())
    })
    .unwrap();

    assert_eq!(get(&db, "b", b"k").unwrap(), b"second");
}

#[test]
fn update_sees_overlay_delete() {
    let temp = tempdir().unwrap();
    let db = Database::open(temp.path().join("db"), Config::default()).unwrap();
    put(&db, "b", b"k", b"v");

    db.update(|tx| {
        tx.delete("b", b"k")?;
        assert!(matches!(tx.get("b", b"k"), Err(CoreError::KeyNotFound)));
        tx.put("b", b"k", b"back", PERSISTENT)?;
        assert_eq!(tx.get("b", b"k")?, b"back");
        Ok(())
    })
    .unwrap();

    assert_eq!(get(&db, "b", b"k").unwrap(), b"back");
}

#[test]
fn durability_across_reopen() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");

    {
        let db = Database::open(&path, Config::default()).unwrap();
        db.update(|tx| {
            tx.put("users", b"alice", b"1", PERSISTENT)?;
            tx.put("users", b"bob", b"2", PERSISTENT)?;
            tx.delete("users", b"alice")
        })
        .unwrap();
        db.close().unwrap();
    }

    let db = Database::open(&path, Config::default()).unwrap();
    assert!(matches!(
        get(&db, "users", b"alice"),
        Err(CoreError::KeyNotFound)
    ));
    assert_eq!(get(&db, "users", b"bob").unwrap(), b"2");
}

#[test]
fn aborted_transaction_leaves_no_trace_after_restart() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");

    {
        let db = Database::open(&path, Config::default()).unwrap();
        put(&db, "b", b"committed", b"v");
        let result = db.update(|tx| {
            tx.put("b", b"uncommitted", b"v", PERSISTENT)?;
            Err(CoreError::invalid_argument("abort"))
        });
        assert!(result.is_err());
        db.close().unwrap();
    }

    let db = Database::open(&path, Config::default()).unwrap();
    assert_eq!(get(&db, "b", b"committed").unwrap(), b"v");
    assert!(matches!(
        get(&db, "b", b"uncommitted"),
        Err(CoreError::KeyNotFound)
    ));
}

#[test]
fn segment_rollover_places_records_predictably() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");
    let config = Config::default().segment_size(120);
    let db = Database::open(&path, config).unwrap();

    // Each record is 40 (header) + 6 + 5 + 5 = 56 bytes; two fit per
    // 120-byte segment, so ten puts span five segments.
    for _ in 0..10 {
        put(&db, "bucket", b"hello", b"world");
    }

    db.view(|tx| {
        let ptr = tx.get_record_ptr("bucket", b"hello")?;
        assert_eq!(ptr.file_id, FileId::new(4));
        assert_eq!(ptr.data_pos, 56);
        assert_eq!(ptr.size, 56);
        Ok(())
    })
    .unwrap();

    let segments = std::fs::read_dir(&path)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".dat"))
        .count();
    assert_eq!(segments, 5);

    // Recovery rebuilds the same picture.
    db.close().unwrap();
    drop(db);
    let db = Database::open(&path, Config::default().segment_size(120)).unwrap();
    assert_eq!(get(&db, "bucket", b"hello").unwrap(), b"world");
    db.view(|tx| {
        let ptr = tx.get_record_ptr("bucket", b"hello")?;
        assert_eq!(ptr.file_id, FileId::new(4));
        assert_eq!(ptr.data_pos, 56);
        Ok(())
    })
    .unwrap();
}

#[test]
fn expiry_is_observed_in_memory_and_after_restart() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");
    let db = Database::open(&path, Config::default()).unwrap();

    db.update(|tx| tx.put("b", b"fleeting", b"v", 2)).unwrap();
    put(&db, "b", b"lasting", b"v");
    assert_eq!(get(&db, "b", b"fleeting").unwrap(), b"v");

    thread::sleep(Duration::from_millis(2600));
    assert!(matches!(
        get(&db, "b", b"fleeting"),
        Err(CoreError::KeyNotFound)
    ));

    db.close().unwrap();
    drop(db);
    let db = Database::open(&path, Config::default()).unwrap();
    assert!(matches!(
        get(&db, "b", b"fleeting"),
        Err(CoreError::KeyNotFound)
    ));
    assert_eq!(get(&db, "b", b"lasting").unwrap(), b"v");
}

#[test]
fn directory_lock_is_exclusive() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");

    let db = Database::open(&path, Config::default()).unwrap();
    let second = Database::open(&path, Config::default());
    assert!(matches!(second, Err(CoreError::DirLocked)));

    db.close().unwrap();
    drop(db);
    let reopened = Database::open(&path, Config::default()).unwrap();
    reopened.close().unwrap();
}

#[test]
fn reader_error_releases_seat_for_writers() {
    let temp = tempdir().unwrap();
    let db = Arc::new(Database::open(temp.path().join("db"), Config::default()).unwrap());

    let failed = db.view(|_| Err(CoreError::invalid_argument("reader bailed")));
    assert!(failed.is_err());

    let (done_tx, done_rx) = mpsc::channel();
    let writer_db = Arc::clone(&db);
    thread::spawn(move || {
        writer_db
            .update(|tx| tx.put("b", b"k", b"v", PERSISTENT))
            .unwrap();
        done_tx.send(()).unwrap();
    });

    done_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("writer should proceed after a failed view");
    assert_eq!(get(&db, "b", b"k").unwrap(), b"v");
}

#[test]
fn writers_serialize_on_the_writer_seat() {
    let temp = tempdir().unwrap();
    let db = Arc::new(Database::open(temp.path().join("db"), Config::default()).unwrap());
    put(&db, "counters", b"n", &0u64.to_le_bytes());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for _ in 0..25 {
                db.update(|tx| {
                    let current = tx.get("counters", b"n")?;
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&current);
                    let next = u64::from_le_bytes(bytes) + 1;
                    tx.put("counters", b"n", &next.to_le_bytes(), PERSISTENT)
                })
                .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&get(&db, "counters", b"n").unwrap());
    assert_eq!(u64::from_le_bytes(bytes), 100);
}

#[test]
fn delete_bucket_lifecycle() {
    let temp = tempdir().unwrap();
    let db = Database::open(temp.path().join("db"), Config::default()).unwrap();

    use acorndb_core::Kind;

    let result = db.update(|tx| tx.delete_bucket(Kind::Kv, "ghost"));
    assert!(matches!(result, Err(CoreError::BucketNotFound { .. })));

    put(&db, "ghost", b"k", b"v");
    db.update(|tx| tx.delete_bucket(Kind::Kv, "ghost")).unwrap();
    assert!(matches!(
        get(&db, "ghost", b"k"),
        Err(CoreError::BucketNotFound { .. })
    ));

    let again = db.update(|tx| tx.delete_bucket(Kind::Kv, "ghost"));
    assert!(matches!(again, Err(CoreError::BucketNotFound { .. })));
}

#[test]
fn value_caching_mode_roundtrip() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");
    let config = Config::default().entry_idx_mode(IndexMode::HintKeyValAndRam);

    {
        let db = Database::open(&path, config.clone()).unwrap();
        for i in 0..20u32 {
            put(&db, "b", &i.to_le_bytes(), format!("value-{i}").as_bytes());
        }
        assert_eq!(get(&db, "b", &7u32.to_le_bytes()).unwrap(), b"value-7");
        db.close().unwrap();
    }

    let db = Database::open(&path, config).unwrap();
    assert_eq!(get(&db, "b", &19u32.to_le_bytes()).unwrap(), b"value-19");
}

#[test]
fn sparse_mode_finds_unindexed_keys_by_scan() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");
    let config = Config::default()
        .entry_idx_mode(IndexMode::HintBptSparse)
        .segment_size(4 * 1024);

    let db = Database::open(&path, config.clone()).unwrap();
    for i in 0..32u32 {
        put(&db, "b", format!("key-{i:02}").as_bytes(), format!("val-{i}").as_bytes());
    }

    // Every key resolves, whether it sits in the sparse tree or not.
    for i in 0..32u32 {
        assert_eq!(
            get(&db, "b", format!("key-{i:02}").as_bytes()).unwrap(),
            format!("val-{i}").into_bytes()
        );
    }

    db.update(|tx| tx.delete("b", b"key-05")).unwrap();
    assert!(matches!(
        get(&db, "b", b"key-05"),
        Err(CoreError::KeyNotFound)
    ));

    db.close().unwrap();
    drop(db);
    let db = Database::open(&path, config).unwrap();
    assert_eq!(get(&db, "b", b"key-31").unwrap(), b"val-31");
    assert!(matches!(
        get(&db, "b", b"key-05"),
        Err(CoreError::KeyNotFound)
    ));
}

#[test]
fn iterator_walks_live_keys_in_order() {
    let temp = tempdir().unwrap();
    let db = Database::open(temp.path().join("db"), Config::default()).unwrap();

    for i in 0..10u32 {
        put(&db, "b", format!("k{i}").as_bytes(), format!("v{i}").as_bytes());
    }
    db.update(|tx| tx.delete("b", b"k5")).unwrap();

    db.view(|tx| {
        let mut iter = tx.iter("b");
        let mut seen = Vec::new();
        while iter.set_next()? {
            let (key, value) = iter.entry().expect("positioned cursor has an entry");
            seen.push((key.to_vec(), value.to_vec()));
        }
        let keys: Vec<_> = seen.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                b"k0".to_vec(),
                b"k1".to_vec(),
                b"k2".to_vec(),
                b"k3".to_vec(),
                b"k4".to_vec(),
                b"k6".to_vec(),
                b"k7".to_vec(),
                b"k8".to_vec(),
                b"k9".to_vec(),
            ]
        );
        assert_eq!(seen[0].1, b"v0");

        // Seek repositions mid-iteration.
        iter.seek(b"k7");
        assert!(iter.set_next()?);
        assert_eq!(iter.entry().map(|(k, _)| k.to_vec()), Some(b"k7".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn view_error_reaches_error_handler() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let temp = tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let config = Config::default().error_handler(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let db = Database::open(temp.path().join("db"), config).unwrap();

    let _ = db.view(|tx| {
        tx.get("missing", b"k")?;
        Ok(())
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
