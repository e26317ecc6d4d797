//! End-to-end scenarios exercising the public `Db` facade only (§8).

use frozendb::{Db, ErrorKind, FinderStrategy, Mode};
use uuid::Uuid;

fn uuid_from_ts(ts_ms: u64) -> Uuid {
    let ts = uuid::Timestamp::from_unix(uuid::NoContext, ts_ms / 1000, ((ts_ms % 1000) * 1_000_000) as u32);
    Uuid::new_v7(ts)
}

/// Scenario 1: a single committed row is findable and sets `max_timestamp`.
#[test]
fn single_committed_row_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    Db::create(&path, 1024, 5000).unwrap();

    let db = Db::open(&path, Mode::ReadWrite, FinderStrategy::InMemory).unwrap();
    let key = uuid_from_ts(1);
    let mut tx = db.begin_tx().unwrap();
    tx.add_row(key, b"{}").unwrap();
    tx.commit().unwrap();

    assert_eq!(db.get(&key).unwrap(), serde_json::json!({}));
    assert_eq!(db.max_timestamp(), 1);
}

/// Scenario 3: out-of-order (but skew-legal) insertion still resolves
/// every key correctly, regardless of which `Finder` strategy is used.
#[test]
fn out_of_order_insertion_resolves_correctly_for_every_strategy() {
    for strategy in [FinderStrategy::Simple, FinderStrategy::InMemory, FinderStrategy::Binary] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        Db::create(&path, 1024, 5000).unwrap();
        let db = Db::open(&path, Mode::ReadWrite, strategy).unwrap();

        let k6 = uuid_from_ts(6000);
        let k2 = uuid_from_ts(2000);
        let k5 = uuid_from_ts(5000);

        for (key, value) in [(k6, b"6" as &[u8]), (k2, b"2"), (k5, b"5")] {
            let mut tx = db.begin_tx().unwrap();
            tx.add_row(key, value).unwrap();
            tx.commit().unwrap();
        }

        assert_eq!(db.get(&k6).unwrap(), serde_json::json!(6));
        assert_eq!(db.get(&k2).unwrap(), serde_json::json!(2));
        assert_eq!(db.get(&k5).unwrap(), serde_json::json!(5));
    }
}

/// A savepoint rollback hides everything added after it, but keeps what
/// came before within the same transaction.
#[test]
fn savepoint_rollback_hides_only_rows_after_the_savepoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    Db::create(&path, 1024, 5000).unwrap();
    let db = Db::open(&path, Mode::ReadWrite, FinderStrategy::InMemory).unwrap();

    let first = uuid_from_ts(1000);
    let second = uuid_from_ts(2000);
    let third = uuid_from_ts(3000);

    let mut tx = db.begin_tx().unwrap();
    tx.add_row(first, b"1").unwrap();
    tx.add_row(second, b"2").unwrap();
    tx.savepoint().unwrap();
    tx.add_row(third, b"3").unwrap();
    tx.rollback(1).unwrap();

    assert_eq!(db.get(&first).unwrap(), serde_json::json!(1));
    assert_eq!(db.get(&second).unwrap(), serde_json::json!(2));
    assert_eq!(db.get(&third).unwrap_err().kind, ErrorKind::KeyNotFound);
}

/// A full rollback of a multi-row transaction hides every row it staged.
#[test]
fn full_rollback_hides_every_row_in_the_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    Db::create(&path, 1024, 5000).unwrap();
    let db = Db::open(&path, Mode::ReadWrite, FinderStrategy::Simple).unwrap();

    let key = uuid_from_ts(1000);
    let mut tx = db.begin_tx().unwrap();
    tx.add_row(key, b"1").unwrap();
    tx.rollback(0).unwrap();

    assert_eq!(db.get(&key).unwrap_err().kind, ErrorKind::KeyNotFound);

    // The slot is free again for a fresh transaction after the rollback.
    let mut tx2 = db.begin_tx().unwrap();
    tx2.add_row(key, b"2").unwrap();
    tx2.commit().unwrap();
    assert_eq!(db.get(&key).unwrap(), serde_json::json!(2));
}

/// A second `begin_tx` while one is outstanding is rejected; once the first
/// is closed, the slot is free again.
#[test]
fn only_one_transaction_may_be_open_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    Db::create(&path, 1024, 5000).unwrap();
    let db = Db::open(&path, Mode::ReadWrite, FinderStrategy::Simple).unwrap();

    let tx = db.begin_tx().unwrap();
    assert_eq!(db.begin_tx().unwrap_err().kind, ErrorKind::TransactionActive);
    tx.commit().unwrap();
    assert!(db.begin_tx().is_ok());
}

/// Reopening after a clean close recovers no active transaction and
/// preserves every previously committed value.
#[test]
fn reopen_after_clean_close_preserves_committed_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    Db::create(&path, 1024, 5000).unwrap();

    let key = uuid_from_ts(1000);
    {
        let db = Db::open(&path, Mode::ReadWrite, FinderStrategy::InMemory).unwrap();
        let mut tx = db.begin_tx().unwrap();
        tx.add_row(key, br#"{"reopened":true}"#).unwrap();
        tx.commit().unwrap();
        db.close();
    }

    let db = Db::open(&path, Mode::ReadWrite, FinderStrategy::Binary).unwrap();
    assert!(db.get_active_tx().is_none());
    assert_eq!(db.get(&key).unwrap(), serde_json::json!({"reopened": true}));
}

/// A transaction left open by a crash (no terminal row written) is resumed
/// on the next open rather than silently discarded.
#[test]
fn crash_mid_transaction_is_resumed_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    Db::create(&path, 1024, 5000).unwrap();

    let committed_key = uuid_from_ts(500);
    let dangling_key = uuid_from_ts(1500);
    {
        let db = Db::open(&path, Mode::ReadWrite, FinderStrategy::Simple).unwrap();
        let mut tx = db.begin_tx().unwrap();
        tx.add_row(committed_key, b"\"ok\"").unwrap();
        tx.commit().unwrap();

        // Simulate a crash: begin a second transaction and stage a row, but
        // never commit or rollback it. Dropping `db` here leaves the file's
        // tail showing an open, unterminated transaction.
        let mut crashed = db.begin_tx().unwrap();
        crashed.add_row(dangling_key, b"\"lost\"").unwrap();
        std::mem::forget(crashed);
    }

    let db = Db::open(&path, Mode::ReadWrite, FinderStrategy::InMemory).unwrap();
    assert_eq!(db.get(&committed_key).unwrap(), serde_json::json!("ok"));

    let resumed = db.get_active_tx().expect("recovery should have found the open transaction");
    assert_eq!(db.get(&dangling_key).unwrap_err().kind, ErrorKind::KeyNotFound);
    resumed.rollback(0).unwrap();
    assert_eq!(db.get(&dangling_key).unwrap_err().kind, ErrorKind::KeyNotFound);

    // The slot is free again once the resumed transaction is closed out.
    let mut tx = db.begin_tx().unwrap();
    tx.add_row(dangling_key, b"\"recovered\"").unwrap();
    tx.commit().unwrap();
    assert_eq!(db.get(&dangling_key).unwrap(), serde_json::json!("recovered"));
}

/// A read-only database cannot begin a transaction, but can read rows
/// another process already committed.
#[test]
fn read_only_open_can_read_but_not_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    Db::create(&path, 1024, 5000).unwrap();

    let key = uuid_from_ts(1000);
    {
        let writer = Db::open(&path, Mode::ReadWrite, FinderStrategy::Simple).unwrap();
        let mut tx = writer.begin_tx().unwrap();
        tx.add_row(key, b"1").unwrap();
        tx.commit().unwrap();
        writer.close();
    }

    let reader = Db::open(&path, Mode::ReadOnly, FinderStrategy::Binary).unwrap();
    assert_eq!(reader.get(&key).unwrap(), serde_json::json!(1));
    assert_eq!(reader.begin_tx().unwrap_err().kind, ErrorKind::InvalidAction);
}

/// `Db::create` refuses to overwrite an existing file.
#[test]
fn create_refuses_to_overwrite_an_existing_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    Db::create(&path, 1024, 5000).unwrap();
    assert!(Db::create(&path, 1024, 5000).is_err());
}
