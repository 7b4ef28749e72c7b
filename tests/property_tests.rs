//! Model-based random operation sequences: the table must agree with a
//! plain vector model after any series of edits, and survive a
//! commit/reopen cycle unchanged.

use proptest::prelude::*;
use tabula::{ColumnType, Cond, Durability, Group, Options};

#[derive(Debug, Clone)]
enum Op {
    Push(i64),
    InsertAt { pos: usize, value: i64 },
    Set { pos: usize, value: i64 },
    Remove { pos: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    let value = prop_oneof![
        any::<i64>(),
        -130i64..130,
        Just(0i64),
        Just(i64::MAX),
        Just(i64::MIN + 1),
    ];
    prop_oneof![
        value.clone().prop_map(Op::Push),
        (any::<usize>(), value.clone()).prop_map(|(pos, value)| Op::InsertAt { pos, value }),
        (any::<usize>(), value).prop_map(|(pos, value)| Op::Set { pos, value }),
        any::<usize>().prop_map(|pos| Op::Remove { pos }),
    ]
}

fn scratch_small_leaves() -> Options {
    Options {
        max_leaf_size: 8,
        durability: Durability::MemOnly,
        ..Options::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn table_matches_vec_model(ops in prop::collection::vec(arb_op(), 1..120)) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("db.tabula");
        let group = Group::open(&path, scratch_small_leaves()).unwrap();

        let mut model: Vec<i64> = Vec::new();
        let mut txn = group.begin_write().unwrap();
        {
            let mut t = txn.add_table("t").unwrap();
            t.add_column(ColumnType::Int, "c").unwrap();
            for op in &ops {
                match *op {
                    Op::Push(value) => {
                        let row = t.add_row().unwrap();
                        t.set_int(0, row, value).unwrap();
                        model.push(value);
                    }
                    Op::InsertAt { pos, value } => {
                        let pos = pos % (model.len() + 1);
                        t.insert_row(pos).unwrap();
                        t.set_int(0, pos, value).unwrap();
                        model.insert(pos, value);
                    }
                    Op::Set { pos, value } => {
                        if !model.is_empty() {
                            let pos = pos % model.len();
                            t.set_int(0, pos, value).unwrap();
                            model[pos] = value;
                        }
                    }
                    Op::Remove { pos } => {
                        if !model.is_empty() {
                            let pos = pos % model.len();
                            t.remove_row(pos).unwrap();
                            model.remove(pos);
                        }
                    }
                }
            }

            prop_assert_eq!(t.row_count().unwrap(), model.len());
            for (i, &v) in model.iter().enumerate() {
                prop_assert_eq!(t.get_int(0, i).unwrap(), v);
            }
        }
        txn.commit().unwrap();

        // The committed image and a reopened file agree with the model.
        drop(group);
        let group = Group::open(&path, scratch_small_leaves()).unwrap();
        let snap = group.begin_read().unwrap();
        let t = snap.table("t").unwrap();
        prop_assert_eq!(t.row_count().unwrap(), model.len());
        for (i, &v) in model.iter().enumerate() {
            prop_assert_eq!(t.get_int(0, i).unwrap(), v);
        }
        prop_assert!(group.verify().unwrap().is_clean());
    }

    #[test]
    fn count_agrees_with_model(values in prop::collection::vec(-20i64..20, 0..200), target in -20i64..20) {
        let tmp = tempfile::TempDir::new().unwrap();
        let group = Group::open(tmp.path().join("db.tabula"), scratch_small_leaves()).unwrap();

        let mut txn = group.begin_write().unwrap();
        {
            let mut t = txn.add_table("t").unwrap();
            t.add_column(ColumnType::Int, "c").unwrap();
            for &v in &values {
                let row = t.add_row().unwrap();
                t.set_int(0, row, v).unwrap();
            }
        }
        txn.commit().unwrap();

        let snap = group.begin_read().unwrap();
        let q = snap.table("t").unwrap().query(0).unwrap();
        let expect = values.iter().filter(|&&v| v == target).count() as u64;
        prop_assert_eq!(q.count(Cond::Equal, target).unwrap(), expect);
        let expect_less = values.iter().filter(|&&v| v < target).count() as u64;
        prop_assert_eq!(q.count(Cond::Less, target).unwrap(), expect_less);
    }
}
