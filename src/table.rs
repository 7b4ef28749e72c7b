//! Tables: named tuples of columns plus their metadata arrays.
//!
//! On disk a table node is `[spec-ref, columns-ref]`; the spec node is
//! `[types-ref, names-ref]`. Rows exist only as aligned positions across
//! the column B+-trees; the row count is the size of the first column.
//!
//! All read paths are generic over [`Mem`], so the same code serves
//! snapshots and the writer's live view. Write paths run inside a
//! [`WriteTxn`] and propagate copy-on-write ref changes up the spine:
//! column root, columns array, table node, tables array, top node.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::array::strings::StringArray;
use crate::array::Array;
use crate::column::Column;
use crate::error::{Result, TabulaError};
use crate::group::{WriteTxn, TOP_NAMES, TOP_TABLES};
use crate::mem::{Allocator, Mem};
use crate::metrics::Metrics;
use crate::query::ColumnQuery;
use crate::types::Ref;

pub(crate) const TABLE_SPEC: usize = 0;
pub(crate) const TABLE_COLUMNS: usize = 1;
pub(crate) const SPEC_TYPES: usize = 0;
pub(crate) const SPEC_NAMES: usize = 1;

/// Storable column types. `IntNull` is an integer column with a null
/// representation (leaf sentinel slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Bool,
    IntNull,
}

impl ColumnType {
    pub(crate) fn code(self) -> i64 {
        match self {
            Self::Int => 0,
            Self::Bool => 1,
            Self::IntNull => 2,
        }
    }

    pub(crate) fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Int),
            1 => Ok(Self::Bool),
            2 => Ok(Self::IntNull),
            _ => Err(TabulaError::corrupt(format!(
                "unknown column type code {code}"
            ))),
        }
    }

    pub fn is_nullable(self) -> bool {
        matches!(self, Self::IntNull)
    }
}

/// Read-only resolver for the group's table catalog.
pub(crate) struct GroupRead<'m, M: Mem> {
    mem: &'m M,
    top: Ref,
    max_leaf: usize,
    metrics: Option<Arc<Mutex<Metrics>>>,
}

impl<'m, M: Mem> GroupRead<'m, M> {
    pub(crate) fn new(
        mem: &'m M,
        top: Ref,
        max_leaf: usize,
        metrics: Option<Arc<Mutex<Metrics>>>,
    ) -> Self {
        Self {
            mem,
            top,
            max_leaf,
            metrics,
        }
    }

    fn top_array(&self) -> Result<Array> {
        Array::attach(self.mem, self.top)
    }

    pub(crate) fn table_names(&self) -> Result<Vec<String>> {
        let top = self.top_array()?;
        let names = StringArray::attach(self.mem, top.get_child_ref(self.mem, TOP_NAMES)?)?;
        (0..names.size()).map(|i| names.get(self.mem, i)).collect()
    }

    pub(crate) fn find_table(&self, name: &str) -> Result<Option<usize>> {
        let top = self.top_array()?;
        let names = StringArray::attach(self.mem, top.get_child_ref(self.mem, TOP_NAMES)?)?;
        names.find_first(self.mem, name)
    }

    pub(crate) fn table(&self, idx: usize) -> Result<TableRead<'m, M>> {
        let top = self.top_array()?;
        let names = StringArray::attach(self.mem, top.get_child_ref(self.mem, TOP_NAMES)?)?;
        let name = names.get(self.mem, idx)?;
        let tables = Array::attach(self.mem, top.get_child_ref(self.mem, TOP_TABLES)?)?;
        if idx >= tables.size() {
            return Err(TabulaError::corrupt(
                "table name and table arrays disagree",
            ));
        }
        Ok(TableRead {
            mem: self.mem,
            table_ref: tables.get_child_ref(self.mem, idx)?,
            name,
            max_leaf: self.max_leaf,
            metrics: self.metrics.clone(),
        })
    }
}

fn table_parts<M: Mem>(mem: &M, table_ref: Ref) -> Result<(Array, Array)> {
    let table = Array::attach(mem, table_ref)?;
    if table.size() != 2 {
        return Err(TabulaError::corrupt(format!(
            "table node at ref {table_ref} has {} slots, expected 2",
            table.size()
        )));
    }
    let spec = Array::attach(mem, table.get_child_ref(mem, TABLE_SPEC)?)?;
    let columns = Array::attach(mem, table.get_child_ref(mem, TABLE_COLUMNS)?)?;
    Ok((spec, columns))
}

fn spec_parts<M: Mem>(mem: &M, spec: &Array) -> Result<(Array, StringArray)> {
    let types = Array::attach(mem, spec.get_child_ref(mem, SPEC_TYPES)?)?;
    let names = StringArray::attach(mem, spec.get_child_ref(mem, SPEC_NAMES)?)?;
    if types.size() != names.size() {
        return Err(TabulaError::corrupt(
            "column type and name arrays disagree",
        ));
    }
    Ok((types, names))
}

/// Read-only table view.
pub struct TableRead<'m, M: Mem> {
    mem: &'m M,
    table_ref: Ref,
    name: String,
    max_leaf: usize,
    metrics: Option<Arc<Mutex<Metrics>>>,
}

impl<'m, M: Mem> TableRead<'m, M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_count(&self) -> Result<usize> {
        let (spec, _) = table_parts(self.mem, self.table_ref)?;
        let (types, _) = spec_parts(self.mem, &spec)?;
        Ok(types.size())
    }

    pub fn column_names(&self) -> Result<Vec<String>> {
        let (spec, _) = table_parts(self.mem, self.table_ref)?;
        let (_, names) = spec_parts(self.mem, &spec)?;
        (0..names.size()).map(|i| names.get(self.mem, i)).collect()
    }

    pub fn find_column(&self, name: &str) -> Result<Option<usize>> {
        let (spec, _) = table_parts(self.mem, self.table_ref)?;
        let (_, names) = spec_parts(self.mem, &spec)?;
        names.find_first(self.mem, name)
    }

    pub fn column_type(&self, col: usize) -> Result<ColumnType> {
        let (spec, _) = table_parts(self.mem, self.table_ref)?;
        let (types, _) = spec_parts(self.mem, &spec)?;
        if col >= types.size() {
            return Err(TabulaError::logic(format!(
                "column index {col} out of range"
            )));
        }
        ColumnType::from_code(types.get(self.mem, col))
    }

    /// Rows are positions shared across columns; the first column's length
    /// is the row count (0 when there are no columns).
    pub fn row_count(&self) -> Result<usize> {
        let (_, columns) = table_parts(self.mem, self.table_ref)?;
        if columns.is_empty() {
            return Ok(0);
        }
        self.column(0)?.size(self.mem)
    }

    /// Column accessor at `col`.
    pub(crate) fn column(&self, col: usize) -> Result<Column> {
        let (_, columns) = table_parts(self.mem, self.table_ref)?;
        if col >= columns.size() {
            return Err(TabulaError::logic(format!(
                "column index {col} out of range"
            )));
        }
        let root = columns.get_child_ref(self.mem, col)?;
        let ty = self.column_type(col)?;
        Ok(Column::new(root, ty.is_nullable(), self.max_leaf))
    }

    fn check_row(&self, row: usize) -> Result<()> {
        let rows = self.row_count()?;
        if row >= rows {
            return Err(TabulaError::logic(format!(
                "row {row} out of range (rows {rows})"
            )));
        }
        Ok(())
    }

    pub fn get_int(&self, col: usize, row: usize) -> Result<i64> {
        self.check_row(row)?;
        match self.column_type(col)? {
            ColumnType::Int => self.column(col)?.get(self.mem, row),
            other => Err(TabulaError::logic(format!(
                "get_int on {other:?} column"
            ))),
        }
    }

    pub fn get_bool(&self, col: usize, row: usize) -> Result<bool> {
        self.check_row(row)?;
        match self.column_type(col)? {
            ColumnType::Bool => Ok(self.column(col)?.get(self.mem, row)? != 0),
            other => Err(TabulaError::logic(format!(
                "get_bool on {other:?} column"
            ))),
        }
    }

    pub fn get_nullable_int(&self, col: usize, row: usize) -> Result<Option<i64>> {
        self.check_row(row)?;
        match self.column_type(col)? {
            ColumnType::IntNull => self.column(col)?.get_nullable(self.mem, row),
            other => Err(TabulaError::logic(format!(
                "get_nullable_int on {other:?} column"
            ))),
        }
    }

    /// Query facade over one column.
    pub fn query(&self, col: usize) -> Result<ColumnQuery<'m, M>> {
        let column = self.column(col)?;
        let col_name = self
            .column_names()?
            .get(col)
            .cloned()
            .unwrap_or_default();
        Ok(ColumnQuery::new(
            self.mem,
            column,
            self.name.clone(),
            col_name,
            self.metrics.clone(),
        ))
    }
}

/// Writable table handle inside a write transaction.
pub struct TableMut<'t, 'g> {
    txn: &'t mut WriteTxn<'g>,
    idx: usize,
}

impl<'t, 'g> TableMut<'t, 'g> {
    pub(crate) fn new(txn: &'t mut WriteTxn<'g>, idx: usize) -> Self {
        Self { txn, idx }
    }

    fn reader(&self) -> Result<TableRead<'_, Allocator>> {
        let max_leaf = self.txn.group.options.max_leaf_size;
        let metrics = self.txn.group.metrics.clone();
        let mem = &self.txn.state.alloc;
        GroupRead::new(mem, self.txn.top, max_leaf, metrics).table(self.idx)
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.reader()?.name().to_owned())
    }

    pub fn row_count(&self) -> Result<usize> {
        self.reader()?.row_count()
    }

    pub fn column_count(&self) -> Result<usize> {
        self.reader()?.column_count()
    }

    pub fn column_names(&self) -> Result<Vec<String>> {
        self.reader()?.column_names()
    }

    pub fn find_column(&self, name: &str) -> Result<Option<usize>> {
        self.reader()?.find_column(name)
    }

    pub fn column_type(&self, col: usize) -> Result<ColumnType> {
        self.reader()?.column_type(col)
    }

    pub fn get_int(&self, col: usize, row: usize) -> Result<i64> {
        self.reader()?.get_int(col, row)
    }

    pub fn get_bool(&self, col: usize, row: usize) -> Result<bool> {
        self.reader()?.get_bool(col, row)
    }

    pub fn get_nullable_int(&self, col: usize, row: usize) -> Result<Option<i64>> {
        self.reader()?.get_nullable_int(col, row)
    }

    pub fn query(&self, col: usize) -> Result<ColumnQuery<'_, Allocator>> {
        self.reader()?.query(col)
    }

    /// Append a column. Existing rows are backfilled with the default
    /// value (0, false, or null).
    pub fn add_column(&mut self, ty: ColumnType, name: &str) -> Result<usize> {
        if self.find_column(name)?.is_some() {
            return Err(TabulaError::logic(format!(
                "column '{name}' already exists"
            )));
        }
        let rows = self.row_count()?;
        let max_leaf = self.txn.group.options.max_leaf_size;

        let alloc = &mut self.txn.state.alloc;
        let root = Column::create(alloc, ty.is_nullable())?;
        let mut column = Column::new(root, ty.is_nullable(), max_leaf);
        for _ in 0..rows {
            match ty {
                ColumnType::IntNull => column.push_null(alloc)?,
                _ => column.push(alloc, 0)?,
            }
        }
        let root = column.root();

        self.with_spec(|alloc, types, names| {
            types.push(alloc, ty.code())?;
            names.push(alloc, name)
        })?;
        let idx = self.with_columns(|alloc, columns| {
            let idx = columns.size();
            columns.push_ref(alloc, root)?;
            Ok(idx)
        })?;
        debug!(table = self.idx, column = name, ?ty, "column added");
        Ok(idx)
    }

    /// Append a row of defaults to every column, returning its index.
    pub fn add_row(&mut self) -> Result<usize> {
        let row = self.row_count()?;
        self.insert_row(row)?;
        Ok(row)
    }

    /// Insert a row of defaults at `row`, shifting later rows down.
    pub fn insert_row(&mut self, row: usize) -> Result<()> {
        let types = self.column_types()?;
        let rows = self.row_count()?;
        if row > rows {
            return Err(TabulaError::logic(format!(
                "insert at row {row} out of range (rows {rows})"
            )));
        }
        let max_leaf = self.txn.group.options.max_leaf_size;
        self.with_columns(|alloc, columns| {
            for (i, ty) in types.iter().enumerate() {
                let root = columns.get_child_ref(alloc, i)?;
                let mut column = Column::new(root, ty.is_nullable(), max_leaf);
                match ty {
                    ColumnType::IntNull => column.insert_null(alloc, row)?,
                    _ => column.insert(alloc, row, 0)?,
                }
                if column.root() != root {
                    columns.set_ref(alloc, i, column.root())?;
                }
            }
            Ok(())
        })
    }

    /// Remove one row from every column.
    pub fn remove_row(&mut self, row: usize) -> Result<()> {
        let types = self.column_types()?;
        let rows = self.row_count()?;
        if row >= rows {
            return Err(TabulaError::logic(format!(
                "row {row} out of range (rows {rows})"
            )));
        }
        let max_leaf = self.txn.group.options.max_leaf_size;
        self.with_columns(|alloc, columns| {
            for (i, ty) in types.iter().enumerate() {
                let root = columns.get_child_ref(alloc, i)?;
                let mut column = Column::new(root, ty.is_nullable(), max_leaf);
                column.erase(alloc, row)?;
                if column.root() != root {
                    columns.set_ref(alloc, i, column.root())?;
                }
            }
            Ok(())
        })
    }

    pub fn set_int(&mut self, col: usize, row: usize, value: i64) -> Result<()> {
        let ty = self.column_type(col)?;
        if ty == ColumnType::Bool {
            return Err(TabulaError::logic("set_int on Bool column"));
        }
        self.with_column(col, ty, |alloc, column| column.set(alloc, row, value))
    }

    pub fn set_bool(&mut self, col: usize, row: usize, value: bool) -> Result<()> {
        let ty = self.column_type(col)?;
        if ty != ColumnType::Bool {
            return Err(TabulaError::logic(format!("set_bool on {ty:?} column")));
        }
        self.with_column(col, ty, |alloc, column| {
            column.set(alloc, row, i64::from(value))
        })
    }

    pub fn set_nullable_int(&mut self, col: usize, row: usize, value: Option<i64>) -> Result<()> {
        let ty = self.column_type(col)?;
        if ty != ColumnType::IntNull {
            return Err(TabulaError::logic(format!(
                "set_nullable_int on {ty:?} column"
            )));
        }
        self.with_column(col, ty, |alloc, column| match value {
            Some(v) => column.set(alloc, row, v),
            None => column.set_null(alloc, row),
        })
    }

    fn column_types(&self) -> Result<Vec<ColumnType>> {
        let reader = self.reader()?;
        (0..reader.column_count()?)
            .map(|i| reader.column_type(i))
            .collect()
    }

    /// Run `f` against the column at `col`, propagating a moved root.
    fn with_column<R>(
        &mut self,
        col: usize,
        ty: ColumnType,
        f: impl FnOnce(&mut Allocator, &mut Column) -> Result<R>,
    ) -> Result<R> {
        let max_leaf = self.txn.group.options.max_leaf_size;
        self.with_columns(|alloc, columns| {
            if col >= columns.size() {
                return Err(TabulaError::logic(format!(
                    "column index {col} out of range"
                )));
            }
            let root = columns.get_child_ref(alloc, col)?;
            let mut column = Column::new(root, ty.is_nullable(), max_leaf);
            let out = f(alloc, &mut column)?;
            if column.root() != root {
                columns.set_ref(alloc, col, column.root())?;
            }
            Ok(out)
        })
    }

    /// Run `f` against this table's columns array, then write any
    /// copy-on-write ref changes up through the spine.
    fn with_columns<R>(
        &mut self,
        f: impl FnOnce(&mut Allocator, &mut Array) -> Result<R>,
    ) -> Result<R> {
        let tables_ref = self.txn.top_slot(TOP_TABLES)?;
        let alloc = &mut self.txn.state.alloc;
        let mut tables = Array::attach(alloc, tables_ref)?;
        let table_ref = tables.get_child_ref(alloc, self.idx)?;
        let mut table = Array::attach(alloc, table_ref)?;
        let columns_ref = table.get_child_ref(alloc, TABLE_COLUMNS)?;
        let mut columns = Array::attach(alloc, columns_ref)?;

        let out = f(alloc, &mut columns)?;

        if columns.pos() != columns_ref {
            table.set_ref(alloc, TABLE_COLUMNS, columns.pos())?;
        }
        if table.pos() != table_ref {
            tables.set_ref(alloc, self.idx, table.pos())?;
        }
        let new_tables = tables.pos();
        if new_tables != tables_ref {
            self.txn.set_top_slot(TOP_TABLES, new_tables)?;
        }
        Ok(out)
    }

    /// Same spine walk for the spec node's type and name arrays.
    fn with_spec<R>(
        &mut self,
        f: impl FnOnce(&mut Allocator, &mut Array, &mut StringArray) -> Result<R>,
    ) -> Result<R> {
        let tables_ref = self.txn.top_slot(TOP_TABLES)?;
        let alloc = &mut self.txn.state.alloc;
        let mut tables = Array::attach(alloc, tables_ref)?;
        let table_ref = tables.get_child_ref(alloc, self.idx)?;
        let mut table = Array::attach(alloc, table_ref)?;
        let spec_ref = table.get_child_ref(alloc, TABLE_SPEC)?;
        let mut spec = Array::attach(alloc, spec_ref)?;
        let types_ref = spec.get_child_ref(alloc, SPEC_TYPES)?;
        let mut types = Array::attach(alloc, types_ref)?;
        let names_ref = spec.get_child_ref(alloc, SPEC_NAMES)?;
        let mut names = StringArray::attach(alloc, names_ref)?;

        let out = f(alloc, &mut types, &mut names)?;

        if types.pos() != types_ref {
            spec.set_ref(alloc, SPEC_TYPES, types.pos())?;
        }
        if names.pos() != names_ref {
            spec.set_ref(alloc, SPEC_NAMES, names.pos())?;
        }
        if spec.pos() != spec_ref {
            table.set_ref(alloc, TABLE_SPEC, spec.pos())?;
        }
        if table.pos() != table_ref {
            tables.set_ref(alloc, self.idx, table.pos())?;
        }
        let new_tables = tables.pos();
        if new_tables != tables_ref {
            self.txn.set_top_slot(TOP_TABLES, new_tables)?;
        }
        Ok(out)
    }
}
