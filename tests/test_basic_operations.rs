use emberdb::{DbFlags, EnvFlags, EnvOptions, Environment, Error, WriteFlags};
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(
        temp_dir.path(),
        EnvOptions::default(),
        EnvFlags::empty(),
        0o644,
    )
    .unwrap();
    (temp_dir, env)
}

#[test]
fn test_database_open_close() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();

    let db = env.open_database(&txn, None, DbFlags::empty()).unwrap();
    assert_eq!(db.flags(), DbFlags::empty());
    assert_eq!(db.name(), None);

    let db = env
        .open_database(&txn, Some("testdb"), DbFlags::CREATE)
        .unwrap();
    assert_eq!(db.name(), Some("testdb"));
    db.close();
    assert!(matches!(txn.get(&db, b"k"), Err(Error::DbClosed)));
}

#[test]
fn test_open_missing_database_fails() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    assert!(matches!(
        env.open_database(&txn, Some("absent"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env.open_database(&txn, None, DbFlags::empty()).unwrap();

    txn.put(&db, b"test_key", b"test_value", WriteFlags::empty())
        .unwrap();
    let result = txn.get(&db, b"test_key").unwrap();
    assert_eq!(result.unwrap(), b"test_value");

    assert!(txn.exists(&db, b"test_key").unwrap());
    assert!(!txn.exists(&db, b"other_key").unwrap());
}

#[test]
fn test_put_nooverwrite() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env.open_database(&txn, None, DbFlags::empty()).unwrap();

    txn.put(&db, b"key", b"first", WriteFlags::NOOVERWRITE)
        .unwrap();
    assert!(matches!(
        txn.put(&db, b"key", b"second", WriteFlags::NOOVERWRITE),
        Err(Error::KeyExist)
    ));
    assert_eq!(txn.get(&db, b"key").unwrap().unwrap(), b"first");

    // plain put replaces
    txn.put(&db, b"key", b"second", WriteFlags::empty()).unwrap();
    assert_eq!(txn.get(&db, b"key").unwrap().unwrap(), b"second");
}

#[test]
fn test_delete() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env.open_database(&txn, None, DbFlags::empty()).unwrap();

    txn.put(&db, b"key", b"value", WriteFlags::empty()).unwrap();
    txn.del(&db, b"key", None).unwrap();
    assert_eq!(txn.get(&db, b"key").unwrap(), None);

    // absent key, tree unchanged
    assert!(matches!(txn.del(&db, b"key", None), Err(Error::NotFound)));
}

#[test]
fn test_conditional_delete() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env.open_database(&txn, None, DbFlags::empty()).unwrap();

    txn.put(&db, b"key", b"value", WriteFlags::empty()).unwrap();
    assert!(matches!(
        txn.del(&db, b"key", Some(b"other")),
        Err(Error::NotFound)
    ));
    assert!(txn.exists(&db, b"key").unwrap());
    txn.del(&db, b"key", Some(b"value")).unwrap();
    assert!(!txn.exists(&db, b"key").unwrap());
}

#[test]
fn test_key_size_limits() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env.open_database(&txn, None, DbFlags::empty()).unwrap();

    assert!(matches!(
        txn.put(&db, b"", b"v", WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
    let long_key = vec![b'k'; emberdb::MAX_KEY_SIZE + 1];
    assert!(matches!(
        txn.put(&db, &long_key, b"v", WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
    let max_key = vec![b'k'; emberdb::MAX_KEY_SIZE];
    txn.put(&db, &max_key, b"v", WriteFlags::empty()).unwrap();

    let huge_value = vec![0u8; emberdb::PAGE_SIZE];
    assert!(matches!(
        txn.put(&db, b"key", &huge_value, WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
}

#[test]
fn test_dupsort_database() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env
        .open_database(&txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT)
        .unwrap();

    txn.put(&db, b"color", b"red", WriteFlags::empty()).unwrap();
    txn.put(&db, b"color", b"blue", WriteFlags::empty()).unwrap();
    txn.put(&db, b"color", b"green", WriteFlags::empty()).unwrap();

    // get returns the lowest duplicate
    assert_eq!(txn.get(&db, b"color").unwrap().unwrap(), b"blue");
    assert_eq!(
        txn.get_all(&db, b"color").unwrap(),
        vec![b"blue".to_vec(), b"green".to_vec(), b"red".to_vec()]
    );

    // NODUPDATA refuses an exact duplicate
    assert!(matches!(
        txn.put(&db, b"color", b"red", WriteFlags::NODUPDATA),
        Err(Error::KeyExist)
    ));

    // deleting one duplicate keeps the rest
    txn.del(&db, b"color", Some(b"green")).unwrap();
    assert_eq!(
        txn.get_all(&db, b"color").unwrap(),
        vec![b"blue".to_vec(), b"red".to_vec()]
    );

    // draining all duplicates removes the key
    txn.del(&db, b"color", Some(b"blue")).unwrap();
    txn.del(&db, b"color", Some(b"red")).unwrap();
    assert!(!txn.exists(&db, b"color").unwrap());
}

#[test]
fn test_dupsort_flag_mismatch() {
    let (_dir, env) = setup_test_env();
    {
        let txn = env.begin_rw_txn().unwrap();
        env.open_database(&txn, Some("plain"), DbFlags::CREATE)
            .unwrap();
        txn.commit().unwrap();
    }
    let txn = env.begin_rw_txn().unwrap();
    assert!(matches!(
        env.open_database(&txn, Some("plain"), DbFlags::DUPSORT),
        Err(Error::Incompatible)
    ));
}

#[test]
fn test_cursor_iterates_in_key_order() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env.open_database(&txn, None, DbFlags::empty()).unwrap();

    for key in ["delta", "alpha", "charlie", "bravo"] {
        txn.put(&db, key.as_bytes(), b"v", WriteFlags::empty())
            .unwrap();
    }

    let mut cursor = txn.cursor(&db).unwrap();
    let mut keys = Vec::new();
    while let Some((key, _)) = cursor.next().unwrap() {
        keys.push(String::from_utf8(key).unwrap());
    }
    assert_eq!(keys, ["alpha", "bravo", "charlie", "delta"]);

    cursor.rewind();
    assert_eq!(cursor.next().unwrap().unwrap().0, b"alpha");
}

#[test]
fn test_cursor_is_frozen_at_open() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env.open_database(&txn, None, DbFlags::empty()).unwrap();
    txn.put(&db, b"a", b"1", WriteFlags::empty()).unwrap();

    let mut cursor = txn.cursor(&db).unwrap();
    txn.put(&db, b"b", b"2", WriteFlags::empty()).unwrap();

    let mut seen = Vec::new();
    while let Some((key, _)) = cursor.next().unwrap() {
        seen.push(key);
    }
    assert_eq!(seen, vec![b"a".to_vec()]);
}

#[test]
fn test_cursor_expands_duplicates() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env
        .open_database(&txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT)
        .unwrap();
    txn.put(&db, b"k", b"2", WriteFlags::empty()).unwrap();
    txn.put(&db, b"k", b"1", WriteFlags::empty()).unwrap();
    txn.put(&db, b"z", b"9", WriteFlags::empty()).unwrap();

    let mut cursor = txn.cursor(&db).unwrap();
    let mut pairs = Vec::new();
    while let Some((key, value)) = cursor.next().unwrap() {
        pairs.push((key, value));
    }
    assert_eq!(
        pairs,
        vec![
            (b"k".to_vec(), b"1".to_vec()),
            (b"k".to_vec(), b"2".to_vec()),
            (b"z".to_vec(), b"9".to_vec()),
        ]
    );
}

#[test]
fn test_cursor_buffered_duplicates_die_with_txn() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env
        .open_database(&txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT)
        .unwrap();
    txn.put(&db, b"k", b"1", WriteFlags::empty()).unwrap();
    txn.put(&db, b"k", b"2", WriteFlags::empty()).unwrap();

    // the first next() buffers the second duplicate
    let mut cursor = txn.cursor(&db).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().1, b"1");
    txn.abort();
    assert!(matches!(cursor.next(), Err(Error::TxnFinished)));
}

#[test]
fn test_stat_counts_entries() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = env.open_database(&txn, None, DbFlags::empty()).unwrap();

    for i in 0..100u32 {
        txn.put(
            &db,
            format!("key-{i:04}").as_bytes(),
            &vec![b'v'; 100],
            WriteFlags::empty(),
        )
        .unwrap();
    }
    let stat = db.stat(&txn).unwrap();
    assert_eq!(stat.entries, 100);
    assert_eq!(stat.psize as usize, emberdb::PAGE_SIZE);
    assert!(stat.depth >= 1);
    assert!(stat.leaf_pages >= 1);
    assert_eq!(stat.overflow_pages, 0);
}

#[test]
fn test_max_dbs_limit() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(
        temp_dir.path(),
        EnvOptions {
            max_dbs: 2,
            ..EnvOptions::default()
        },
        EnvFlags::empty(),
        0o644,
    )
    .unwrap();

    let txn = env.begin_rw_txn().unwrap();
    env.open_database(&txn, Some("one"), DbFlags::CREATE).unwrap();
    env.open_database(&txn, Some("two"), DbFlags::CREATE).unwrap();
    assert!(matches!(
        env.open_database(&txn, Some("three"), DbFlags::CREATE),
        Err(Error::DbsFull)
    ));
}

#[test]
fn test_env_close_with_open_txn_fails() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_ro_txn().unwrap();
    assert!(matches!(env.close(), Err(Error::TxnsStillOpen)));
    txn.abort();
    env.close().unwrap();
    assert!(matches!(env.begin_ro_txn(), Err(Error::EnvClosed)));
}

#[test]
fn test_env_info_and_sync() {
    let (_dir, env) = setup_test_env();
    {
        let txn = env.begin_rw_txn().unwrap();
        let db = env.open_database(&txn, None, DbFlags::empty()).unwrap();
        txn.put(&db, b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    env.sync(true).unwrap();
    let info = env.info().unwrap();
    assert!(info.last_txnid >= 1);
    assert!(info.last_pgno > 2);
    assert_eq!(info.num_readers, 0);
}
