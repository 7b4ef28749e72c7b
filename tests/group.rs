//! Group lifecycle: open, commit, reopen, isolation, crash windows.

use std::time::Duration;

use tabula::{ColumnType, Cond, Durability, Group, Options, Result, TabulaError};
use tempfile::TempDir;

fn scratch() -> Options {
    Options {
        durability: Durability::MemOnly,
        ..Options::default()
    }
}

#[test]
fn empty_group_to_first_commit_and_reopen() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.tabula");

    {
        let group = Group::open(&path, scratch())?;
        let mut txn = group.begin_write()?;
        {
            let mut t = txn.add_table("t")?;
            t.add_column(ColumnType::Int, "c")?;
        }
        txn.commit()?;
    }

    let group = Group::open(&path, scratch())?;
    let snap = group.begin_read()?;
    assert!(snap.has_table("t")?);
    let t = snap.table("t")?;
    assert_eq!(t.column_names()?, vec!["c".to_owned()]);
    assert_eq!(t.row_count()?, 0);
    Ok(())
}

#[test]
fn snapshot_isolation_around_commit() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), scratch())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
    }
    txn.commit()?;

    let reader_a = group.begin_read()?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.table("t")?;
        let row = t.add_row()?;
        t.set_int(0, row, 42)?;
    }
    txn.commit()?;

    let reader_b = group.begin_read()?;

    // Reader A began before the commit and must not see it.
    let t_a = reader_a.table("t")?;
    assert_eq!(t_a.row_count()?, 0);
    assert_eq!(t_a.query(0)?.count(Cond::Equal, 42)?, 0);

    let t_b = reader_b.table("t")?;
    assert_eq!(t_b.row_count()?, 1);
    assert_eq!(t_b.query(0)?.count(Cond::Equal, 42)?, 1);
    Ok(())
}

#[test]
fn writes_are_invisible_until_commit() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), scratch())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
        let row = t.add_row()?;
        t.set_int(0, row, 7)?;
        // The transaction's own view sees its writes.
        assert_eq!(t.get_int(0, row)?, 7);
    }
    let snap = group.begin_read()?;
    assert!(!snap.has_table("t")?);
    txn.commit()?;

    assert!(!snap.has_table("t")?, "snapshot view must stay fixed");
    assert!(group.begin_read()?.has_table("t")?);
    Ok(())
}

#[test]
fn rollback_leaves_no_trace() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.tabula");
    let group = Group::open(&path, scratch())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("gone")?;
        t.add_column(ColumnType::Int, "c")?;
    }
    txn.rollback();

    assert!(!group.begin_read()?.has_table("gone")?);

    // An implicitly dropped transaction also rolls back.
    {
        let mut txn = group.begin_write()?;
        txn.add_table("also_gone")?;
    }
    assert!(!group.begin_read()?.has_table("also_gone")?);

    // And the group still accepts new writers afterwards.
    let mut txn = group.begin_write()?;
    txn.add_table("kept")?;
    txn.commit()?;
    assert!(group.begin_read()?.has_table("kept")?);
    Ok(())
}

#[test]
fn crash_between_top_write_and_flip_recovers_old_version() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.tabula");

    {
        let group = Group::open(&path, Options::default())?;
        let mut txn = group.begin_write()?;
        {
            let mut t = txn.add_table("t")?;
            t.add_column(ColumnType::Int, "c")?;
            let row = t.add_row()?;
            t.set_int(0, row, 1)?;
        }
        txn.commit()?;

        // The doomed commit: everything is written and synced, but the
        // active-slot byte never flips.
        let mut txn = group.begin_write()?;
        {
            let mut t = txn.table("t")?;
            let row = t.add_row()?;
            t.set_int(0, row, 42)?;
        }
        txn.commit_without_flip()?;
    }

    // "Reboot": the previous version must be intact, the orphan invisible.
    let group = Group::open(&path, Options::default())?;
    let snap = group.begin_read()?;
    let t = snap.table("t")?;
    assert_eq!(t.row_count()?, 1);
    assert_eq!(t.get_int(0, 0)?, 1);
    assert_eq!(t.query(0)?.count(Cond::Equal, 42)?, 0);
    drop(snap);

    // A new writer over the recovered state succeeds.
    let mut txn = group.begin_write()?;
    {
        let mut t = txn.table("t")?;
        let row = t.add_row()?;
        t.set_int(0, row, 99)?;
    }
    txn.commit()?;

    let t = group.begin_read()?;
    let t = t.table("t")?;
    assert_eq!(t.row_count()?, 2);
    assert_eq!(t.get_int(0, 1)?, 99);
    Ok(())
}

#[test]
fn file_size_stabilizes_over_insert_erase_cycles() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.tabula");
    let group = Group::open(&path, scratch())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
    }
    txn.commit()?;

    let mut sizes = Vec::new();
    for cycle in 0..30 {
        let mut txn = group.begin_write()?;
        {
            let mut t = txn.table("t")?;
            for i in 0..100 {
                let row = t.add_row()?;
                t.set_int(0, row, cycle * 1000 + i)?;
            }
        }
        txn.commit()?;

        let mut txn = group.begin_write()?;
        {
            let mut t = txn.table("t")?;
            for _ in 0..100 {
                t.remove_row(0)?;
            }
        }
        txn.commit()?;

        sizes.push(std::fs::metadata(&path)?.len());
    }

    // Copy-on-write garbage must be recycled through the free list rather
    // than growing the file without bound.
    let tail = &sizes[sizes.len() - 10..];
    assert!(
        tail.iter().all(|&s| s == tail[0]),
        "file size should stabilize, got {sizes:?}"
    );
    Ok(())
}

#[test]
fn read_only_group_refuses_writes() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.tabula");
    {
        let group = Group::open(&path, scratch())?;
        let mut txn = group.begin_write()?;
        txn.add_table("t")?;
        txn.commit()?;
    }

    let group = Group::open(&path, Options::read_only())?;
    assert!(group.begin_read()?.has_table("t")?);
    match group.begin_write() {
        Err(TabulaError::ReadOnly) => {}
        other => panic!("expected ReadOnly, got {other:?}"),
    }
    Ok(())
}

#[test]
fn begin_write_times_out_while_writer_active() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = std::sync::Arc::new(Group::open(dir.path().join("db.tabula"), scratch())?);

    let holder = std::sync::Arc::clone(&group);
    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let handle = std::thread::spawn(move || {
        let txn = holder.begin_write().unwrap();
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        txn.rollback();
    });

    started_rx.recv().unwrap();
    match group.begin_write_timeout(Duration::from_millis(20)) {
        Err(TabulaError::LockTimeout { .. }) => {}
        other => panic!("expected LockTimeout, got {other:?}"),
    }

    release_tx.send(()).unwrap();
    handle.join().unwrap();

    // The lock is free again.
    group.begin_write()?.commit()?;
    Ok(())
}

#[test]
fn encryption_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let options = Options {
        encryption_key: Some(vec![0u8; 64]),
        ..Options::default()
    };
    match Group::open(dir.path().join("db.tabula"), options) {
        Err(TabulaError::Unsupported(_)) => {}
        other => panic!("expected Unsupported, got {other:?}"),
    }
}

#[test]
fn garbage_header_is_invalid_format() -> Result<()> {
    use std::io::Write;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.tabula");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(&[0xAB; 64])?;
    drop(file);

    match Group::open(&path, Options::default()) {
        Err(TabulaError::InvalidFormat { .. }) => {}
        other => panic!("expected InvalidFormat, got {other:?}"),
    }
    Ok(())
}

#[test]
fn verify_reports_clean_after_commits() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), scratch())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "a")?;
        t.add_column(ColumnType::Bool, "b")?;
        t.add_column(ColumnType::IntNull, "n")?;
        for i in 0..500 {
            let row = t.add_row()?;
            t.set_int(0, row, i)?;
            t.set_bool(1, row, i % 2 == 0)?;
            if i % 3 == 0 {
                t.set_nullable_int(2, row, Some(i))?;
            }
        }
    }
    txn.commit()?;

    let report = group.verify()?;
    assert!(report.is_clean(), "unexpected errors: {:?}", report.errors);
    assert!(report.nodes_visited > 10);
    Ok(())
}

#[test]
fn metrics_record_queries_and_transactions() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let options = Options {
        enable_metrics: true,
        durability: Durability::MemOnly,
        ..Options::default()
    };
    let group = Group::open(dir.path().join("db.tabula"), options)?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
        let row = t.add_row()?;
        t.set_int(0, row, 5)?;
    }
    txn.commit()?;

    {
        let snap = group.begin_read()?;
        let t = snap.table("t")?;
        t.query(0)?.count(Cond::Equal, 5)?;
        t.query(0)?.sum()?;
    }

    let metrics = group.metrics().expect("metrics enabled");
    assert_eq!(metrics.total_commits, 1);
    assert!(metrics.total_queries >= 2);
    assert!(metrics.total_read_transactions >= 1);
    let json = metrics.to_json().unwrap();
    assert!(json.contains("count(Equal, 5)"));
    Ok(())
}

#[test]
fn many_tables_and_reopen() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.tabula");

    {
        let group = Group::open(&path, Options::default())?;
        let mut txn = group.begin_write()?;
        for k in 0..10 {
            let name = format!("table_{k}");
            let mut t = txn.add_table(&name)?;
            t.add_column(ColumnType::Int, "v")?;
            for i in 0..50 {
                let row = t.add_row()?;
                t.set_int(0, row, k * 100 + i)?;
            }
        }
        txn.commit()?;
    }

    let group = Group::open(&path, Options::default())?;
    let snap = group.begin_read()?;
    assert_eq!(snap.table_names()?.len(), 10);
    for k in 0..10 {
        let t = snap.table(&format!("table_{k}"))?;
        assert_eq!(t.row_count()?, 50);
        assert_eq!(t.get_int(0, 49)?, k * 100 + 49);
    }
    Ok(())
}

#[test]
fn version_counter_advances_per_commit() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), scratch())?;
    let v0 = group.committed_version();
    group.begin_write()?.commit()?;
    group.begin_write()?.commit()?;
    assert_eq!(group.committed_version(), v0 + 2);
    Ok(())
}
