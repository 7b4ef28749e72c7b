//! Column behavior through the public table surface: adaptive widening,
//! leaf splits, aggregates, null handling.

use tabula::{ColumnType, Cond, Durability, Group, Options, Result};
use tempfile::TempDir;

fn scratch() -> Options {
    Options {
        durability: Durability::MemOnly,
        ..Options::default()
    }
}

fn tiny_leaves() -> Options {
    Options {
        max_leaf_size: 4,
        durability: Durability::MemOnly,
        ..Options::default()
    }
}

#[test]
fn widening_cascade_preserves_insertion_order() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), scratch())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
        let mut expect = Vec::new();
        for _ in 0..1000 {
            let row = t.add_row()?;
            t.set_int(0, row, 0)?;
            expect.push(0);
        }
        for v in [1i64, 2, 128, 70_000] {
            let row = t.add_row()?;
            t.set_int(0, row, v)?;
            expect.push(v);
        }
        for (i, &v) in expect.iter().enumerate() {
            assert_eq!(t.get_int(0, i)?, v, "row {i}");
        }
    }
    txn.commit()?;

    // Same values after the commit and from a fresh snapshot.
    let snap = group.begin_read()?;
    let t = snap.table("t")?;
    assert_eq!(t.get_int(0, 999)?, 0);
    assert_eq!(t.get_int(0, 1000)?, 1);
    assert_eq!(t.get_int(0, 1001)?, 2);
    assert_eq!(t.get_int(0, 1002)?, 128);
    assert_eq!(t.get_int(0, 1003)?, 70_000);
    Ok(())
}

#[test]
fn negative_and_extreme_values_roundtrip() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), scratch())?;

    let values = [
        0i64,
        -1,
        1,
        i8::MIN as i64,
        i8::MAX as i64,
        i16::MIN as i64,
        i32::MAX as i64,
        i64::MAX,
        i64::MIN + 1,
    ];
    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
        for &v in &values {
            let row = t.add_row()?;
            t.set_int(0, row, v)?;
        }
    }
    txn.commit()?;

    let snap = group.begin_read()?;
    let t = snap.table("t")?;
    for (i, &v) in values.iter().enumerate() {
        assert_eq!(t.get_int(0, i)?, v);
    }
    Ok(())
}

#[test]
fn leaf_split_keeps_sequence() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), tiny_leaves())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
        for v in [10, 20, 30, 40] {
            let row = t.add_row()?;
            t.set_int(0, row, v)?;
        }
    }
    txn.commit()?;

    // The leaf is full at four elements; inserting in the middle forces a
    // split. Observable contract: the concatenation of the leaves equals
    // the pre-insert sequence with the new element at its position.
    let mut txn = group.begin_write()?;
    {
        let mut t = txn.table("t")?;
        t.insert_row(2)?;
        t.set_int(0, 2, 25)?;
    }
    txn.commit()?;

    let snap = group.begin_read()?;
    let t = snap.table("t")?;
    let got: Vec<i64> = (0..5).map(|i| t.get_int(0, i).unwrap()).collect();
    assert_eq!(got, vec![10, 20, 25, 30, 40]);

    let report = group.verify()?;
    assert!(report.is_clean(), "{:?}", report.errors);
    Ok(())
}

#[test]
fn thousands_of_rows_across_tiny_leaves() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), tiny_leaves())?;

    let n = 2000i64;
    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
        for i in 0..n {
            let row = t.add_row()?;
            t.set_int(0, row, i * 7)?;
        }
    }
    txn.commit()?;

    let snap = group.begin_read()?;
    let t = snap.table("t")?;
    assert_eq!(t.row_count()?, n as usize);
    for i in [0, 1, 999, 1000, 1999] {
        assert_eq!(t.get_int(0, i as usize)?, i * 7);
    }
    assert_eq!(
        t.query(0)?.find_first(Cond::Equal, 1999 * 7)?,
        Some(1999)
    );
    assert!(group.verify()?.is_clean());
    Ok(())
}

#[test]
fn aggregate_correctness_on_known_data() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), scratch())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
        for v in [3i64, -5, 7, -5, 11] {
            let row = t.add_row()?;
            t.set_int(0, row, v)?;
        }
    }
    txn.commit()?;

    let snap = group.begin_read()?;
    let q = snap.table("t")?.query(0)?;
    assert_eq!(q.min()?, Some((-5, 1)));
    assert_eq!(q.max()?, Some((11, 4)));
    assert_eq!(q.sum()?, 11);
    assert_eq!(q.count(Cond::Equal, -5)?, 2);
    assert_eq!(q.find_first(Cond::Greater, 6)?, Some(2));
    assert_eq!(q.average()?, Some(11.0 / 5.0));
    Ok(())
}

#[test]
fn set_get_roundtrip_is_stable() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), scratch())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
        for v in [5i64, -9, 100] {
            let row = t.add_row()?;
            t.set_int(0, row, v)?;
        }
        // set(i, get(i)) must not change observable values.
        for i in 0..3 {
            let v = t.get_int(0, i)?;
            t.set_int(0, i, v)?;
        }
        assert_eq!(t.get_int(0, 0)?, 5);
        assert_eq!(t.get_int(0, 1)?, -9);
        assert_eq!(t.get_int(0, 2)?, 100);
    }
    txn.commit()?;
    Ok(())
}

#[test]
fn bool_columns_store_flags() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), scratch())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Bool, "flag")?;
        for i in 0..100 {
            let row = t.add_row()?;
            t.set_bool(0, row, i % 3 == 0)?;
        }
        assert!(t.set_int(0, 0, 5).is_err(), "set_int on a Bool column");
    }
    txn.commit()?;

    let snap = group.begin_read()?;
    let t = snap.table("t")?;
    for i in 0..100 {
        assert_eq!(t.get_bool(0, i)?, i % 3 == 0);
    }
    assert_eq!(t.query(0)?.count(Cond::Equal, 1)?, 34);
    Ok(())
}

#[test]
fn nullable_columns_roundtrip_and_query() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.tabula");
    {
        let group = Group::open(&path, Options::default())?;
        let mut txn = group.begin_write()?;
        {
            let mut t = txn.add_table("t")?;
            t.add_column(ColumnType::IntNull, "n")?;
            for i in 0..50 {
                let row = t.add_row()?;
                if i % 2 == 0 {
                    t.set_nullable_int(0, row, Some(i))?;
                }
            }
        }
        txn.commit()?;
    }

    let group = Group::open(&path, Options::default())?;
    let snap = group.begin_read()?;
    let t = snap.table("t")?;
    // add_row defaults a nullable column to null.
    assert_eq!(t.get_nullable_int(0, 1)?, None);
    assert_eq!(t.get_nullable_int(0, 2)?, Some(2));

    let q = t.query(0)?;
    assert_eq!(q.find_nulls()?.len(), 25);
    assert_eq!(q.count(Cond::GreaterEqual, 0)?, 25);
    assert_eq!(q.sum()?, (0..50i64).filter(|i| i % 2 == 0).sum::<i64>());
    assert_eq!(q.min()?, Some((0, 0)));
    Ok(())
}

#[test]
fn backfilled_column_defaults() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), scratch())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "a")?;
        for i in 0..10 {
            let row = t.add_row()?;
            t.set_int(0, row, i)?;
        }
        // Columns added late are backfilled for existing rows.
        let b = t.add_column(ColumnType::IntNull, "b")?;
        assert_eq!(t.get_nullable_int(b, 3)?, None);
        t.set_nullable_int(b, 3, Some(33))?;
        assert_eq!(t.get_nullable_int(b, 3)?, Some(33));
        assert_eq!(t.row_count()?, 10);
    }
    txn.commit()?;
    Ok(())
}

#[test]
fn remove_row_shifts_later_rows() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let group = Group::open(dir.path().join("db.tabula"), tiny_leaves())?;

    let mut txn = group.begin_write()?;
    {
        let mut t = txn.add_table("t")?;
        t.add_column(ColumnType::Int, "c")?;
        for i in 0..20 {
            let row = t.add_row()?;
            t.set_int(0, row, i)?;
        }
        t.remove_row(0)?;
        t.remove_row(3)?; // was value 4
        assert_eq!(t.row_count()?, 18);
        assert_eq!(t.get_int(0, 0)?, 1);
        assert_eq!(t.get_int(0, 3)?, 5);
    }
    txn.commit()?;
    assert!(group.verify()?.is_clean());
    Ok(())
}
