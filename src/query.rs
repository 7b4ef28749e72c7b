//! Query facade: the one place where runtime condition/action dispatch
//! happens before the monomorphised kernel loops take over.
//!
//! Everything here is read-only and works identically on snapshots and on
//! the writer's live view. `average` is deliberately computed out here as
//! sum over count; the kernel has no averaging action.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::array::find::{Acc, QueryState};
use crate::column::Column;
use crate::error::{Result, TabulaError};
use crate::mem::Mem;
use crate::metrics::Metrics;

pub use crate::array::find::Cond;

/// Per-column query entry point.
pub struct ColumnQuery<'m, M: Mem> {
    mem: &'m M,
    column: Column,
    table: String,
    column_name: String,
    metrics: Option<Arc<Mutex<Metrics>>>,
}

impl<'m, M: Mem> ColumnQuery<'m, M> {
    pub(crate) fn new(
        mem: &'m M,
        column: Column,
        table: String,
        column_name: String,
        metrics: Option<Arc<Mutex<Metrics>>>,
    ) -> Self {
        Self {
            mem,
            column,
            table,
            column_name,
            metrics,
        }
    }

    fn record(&self, start: Instant, description: impl FnOnce() -> String) {
        if let Some(metrics) = &self.metrics {
            metrics
                .lock()
                .record_query(description(), self.table.clone(), start.elapsed());
        }
    }

    /// Smallest row index matching `cond value`.
    pub fn find_first(&self, cond: Cond, value: i64) -> Result<Option<usize>> {
        let start = Instant::now();
        let out = self.column.find_first(self.mem, cond, Some(value));
        self.record(start, || {
            format!("find_first({cond:?}, {value}) on {}", self.column_name)
        });
        out
    }

    /// All matching row indices, ascending.
    pub fn find_all(&self, cond: Cond, value: i64) -> Result<Vec<usize>> {
        self.find_all_limited(cond, value, usize::MAX)
    }

    /// Matching row indices, stopping once `limit` matches are collected.
    pub fn find_all_limited(&self, cond: Cond, value: i64, limit: usize) -> Result<Vec<usize>> {
        let start = Instant::now();
        let out = self.column.find_all(self.mem, cond, Some(value), limit);
        self.record(start, || {
            format!("find_all({cond:?}, {value}) on {}", self.column_name)
        });
        out
    }

    pub fn count(&self, cond: Cond, value: i64) -> Result<u64> {
        let start = Instant::now();
        let out = self.column.count(self.mem, cond, Some(value));
        self.record(start, || {
            format!("count({cond:?}, {value}) on {}", self.column_name)
        });
        out
    }

    /// Sum of elements matching `cond value`.
    pub fn sum_where(&self, cond: Cond, value: i64) -> Result<i64> {
        let start = Instant::now();
        let out = self.column.sum_where(self.mem, cond, Some(value));
        self.record(start, || {
            format!("sum({cond:?}, {value}) on {}", self.column_name)
        });
        out
    }

    /// Sum over the whole column; nulls contribute nothing.
    pub fn sum(&self) -> Result<i64> {
        let start = Instant::now();
        let out = self.column.sum(self.mem);
        self.record(start, || format!("sum on {}", self.column_name));
        out
    }

    /// Minimum value with the smallest row index achieving it.
    pub fn min(&self) -> Result<Option<(i64, usize)>> {
        let start = Instant::now();
        let out = self.column.minimum(self.mem);
        self.record(start, || format!("min on {}", self.column_name));
        out
    }

    /// Maximum value with the smallest row index achieving it.
    pub fn max(&self) -> Result<Option<(i64, usize)>> {
        let start = Instant::now();
        let out = self.column.maximum(self.mem);
        self.record(start, || format!("max on {}", self.column_name));
        out
    }

    /// Mean over non-null elements; `None` when there are none.
    pub fn average(&self) -> Result<Option<f64>> {
        let start = Instant::now();
        let (cond, target) = if self.column.is_nullable() {
            (Cond::NotEqual, None)
        } else {
            (Cond::GreaterEqual, Some(i64::MIN))
        };
        let count = self.column.count(self.mem, cond, target)?;
        let out = if count == 0 {
            None
        } else {
            let sum = self.column.sum(self.mem)?;
            Some(sum as f64 / count as f64)
        };
        self.record(start, || format!("average on {}", self.column_name));
        Ok(out)
    }

    /// Row indices holding null (nullable columns only).
    pub fn find_nulls(&self) -> Result<Vec<usize>> {
        if !self.column.is_nullable() {
            return Err(TabulaError::logic("find_nulls on a non-nullable column"));
        }
        let start = Instant::now();
        let out = self.column.find_all(self.mem, Cond::Equal, None, usize::MAX);
        self.record(start, || format!("find_nulls on {}", self.column_name));
        out
    }

    /// Count of rows where `self[i] cond other[i]`.
    pub fn compare_count(&self, other: &ColumnQuery<'m, M>, cond: Cond) -> Result<u64> {
        let start = Instant::now();
        let mut state = QueryState::count(usize::MAX);
        compare_columns(self.mem, &self.column, &other.column, cond, &mut state)?;
        let out = match state.acc {
            Acc::Count(n) => n,
            _ => unreachable!(),
        };
        self.record(start, || {
            format!(
                "compare({cond:?}, {} vs {})",
                self.column_name, other.column_name
            )
        });
        Ok(out)
    }

    /// Row indices where `self[i] cond other[i]`.
    pub fn compare_find_all(&self, other: &ColumnQuery<'m, M>, cond: Cond) -> Result<Vec<usize>> {
        let start = Instant::now();
        let mut state = QueryState::find_all(usize::MAX);
        compare_columns(self.mem, &self.column, &other.column, cond, &mut state)?;
        let out = match state.acc {
            Acc::FindAll(v) => v,
            _ => unreachable!(),
        };
        self.record(start, || {
            format!(
                "compare_all({cond:?}, {} vs {})",
                self.column_name, other.column_name
            )
        });
        Ok(out)
    }
}

/// Row-aligned column-to-column comparison, feeding the shared aggregate
/// state. Null semantics: two nulls are equal (so `Equal`, `LessEqual` and
/// `GreaterEqual` match), `NotEqual` matches when exactly one side is null
/// or both values differ, strict orderings never match a null.
pub fn compare_columns(
    mem: &impl Mem,
    lhs: &Column,
    rhs: &Column,
    cond: Cond,
    state: &mut QueryState<'_>,
) -> Result<()> {
    let n = lhs.size(mem)?;
    if n != rhs.size(mem)? {
        return Err(TabulaError::QueryMismatch {
            detail: format!(
                "column sizes differ: {n} vs {}",
                rhs.size(mem)?
            ),
        });
    }
    for i in 0..n {
        if !state.keep_going() {
            return Ok(());
        }
        let a = lhs.get_nullable(mem, i)?;
        let b = rhs.get_nullable(mem, i)?;
        let hit = match (a, b) {
            (Some(x), Some(y)) => cond.matches(x, y),
            (None, None) => matches!(cond, Cond::Equal | Cond::LessEqual | Cond::GreaterEqual),
            _ => matches!(cond, Cond::NotEqual),
        };
        if hit && !state.match_at(i, a) {
            return Ok(());
        }
    }
    Ok(())
}
