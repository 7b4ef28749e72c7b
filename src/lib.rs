//! tabula: an embeddable object-database core.
//!
//! Typed tables live in a single memory-mapped file. Storage is built from
//! one primitive — the adaptive bit-packed integer array — composed into
//! copy-on-write B+-tree columns and bound into durable versions by a
//! two-slot commit header. Any number of read snapshots run in parallel
//! with at most one writer; a snapshot's view never changes after
//! `begin_read`.
//!
//! ```no_run
//! use tabula::{ColumnType, Cond, Group, Options};
//!
//! # fn main() -> tabula::Result<()> {
//! let group = Group::open("people.tabula", Options::default())?;
//!
//! let mut txn = group.begin_write()?;
//! let mut people = txn.add_table("people")?;
//! let age = people.add_column(ColumnType::Int, "age")?;
//! let row = people.add_row()?;
//! people.set_int(age, row, 42)?;
//! drop(people);
//! txn.commit()?;
//!
//! let snapshot = group.begin_read()?;
//! let people = snapshot.table("people")?;
//! assert_eq!(people.query(age)?.count(Cond::Equal, 42)?, 1);
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod column;
pub mod error;
pub mod group;
pub mod mem;
pub mod metrics;
pub mod query;
pub mod table;
pub mod types;

pub use crate::array::find::{Acc, Cond, QueryState};
pub use crate::column::{Column, DEFAULT_MAX_LEAF};
pub use crate::error::{Result, TabulaError};
pub use crate::group::{Durability, Group, Options, Snapshot, VerifyReport, WriteTxn};
pub use crate::metrics::{Metrics, QueryInfo, TransactionInfo, TransactionKind};
pub use crate::query::ColumnQuery;
pub use crate::table::{ColumnType, TableMut, TableRead};
pub use crate::types::Ref;
