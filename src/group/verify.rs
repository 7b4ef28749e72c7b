//! Structural integrity walk over a committed version.
//!
//! Follows every ref reachable from the top node, checking alignment,
//! mapped bounds, header sanity, B+-tree offset consistency, and catalog
//! shape. Problems are collected rather than thrown so one pass reports
//! everything it can reach.

use tracing::error;

use crate::array::header::NodeHeader;
use crate::array::strings::StringArray;
use crate::array::Array;
use crate::error::Result;
use crate::group::transaction::Snapshot;
use crate::group::{
    TOP_FREE_POSITIONS, TOP_FREE_SIZES, TOP_FREE_VERSIONS, TOP_NAMES, TOP_SLOT_COUNT, TOP_TABLES,
};
use crate::mem::Mem;
use crate::table::{SPEC_NAMES, SPEC_TYPES, TABLE_COLUMNS, TABLE_SPEC};
use crate::types::{Ref, NODE_HEADER_SIZE, REF_ALIGN};

#[derive(Debug)]
pub struct VerifyReport {
    pub nodes_visited: usize,
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Walker<'s> {
    snap: &'s Snapshot,
    report: VerifyReport,
}

pub(crate) fn verify_snapshot(snap: &Snapshot) -> Result<VerifyReport> {
    let mut walker = Walker {
        snap,
        report: VerifyReport {
            nodes_visited: 0,
            errors: Vec::new(),
        },
    };
    walker.run();
    if !walker.report.is_clean() {
        error!(
            errors = walker.report.errors.len(),
            "integrity verification found problems"
        );
    }
    Ok(walker.report)
}

impl Walker<'_> {
    fn fail(&mut self, msg: String) {
        self.report.errors.push(msg);
    }

    /// Basic node checks; returns the header when the node is usable.
    fn check_node(&mut self, r: Ref, what: &str) -> Option<NodeHeader> {
        if r == 0 || r % REF_ALIGN != 0 {
            self.fail(format!("{what}: ref {r} is null or unaligned"));
            return None;
        }
        let bytes = match self.snap.bytes(r, NODE_HEADER_SIZE) {
            Ok(b) => b,
            Err(err) => {
                self.fail(format!("{what}: header at ref {r} unreadable: {err}"));
                return None;
            }
        };
        let header = match NodeHeader::decode(bytes) {
            Ok(h) => h,
            Err(err) => {
                self.fail(format!("{what}: bad header at ref {r}: {err}"));
                return None;
            }
        };
        if r + header.capacity as u64 > self.snap.region_len() {
            self.fail(format!(
                "{what}: node at ref {r} overruns the mapped region"
            ));
            return None;
        }
        if header.byte_size() > header.capacity {
            self.fail(format!(
                "{what}: node at ref {r} uses {} bytes of a {}-byte capacity",
                header.byte_size(),
                header.capacity
            ));
            return None;
        }
        self.report.nodes_visited += 1;
        Some(header)
    }

    fn run(&mut self) {
        let top_ref = self.snap.top_ref();
        if self.check_node(top_ref, "top").is_none() {
            return;
        }
        let top = match Array::attach(self.snap, top_ref) {
            Ok(t) => t,
            Err(err) => return self.fail(format!("top: {err}")),
        };
        if top.size() != TOP_SLOT_COUNT || !top.has_refs() {
            return self.fail(format!(
                "top: expected {TOP_SLOT_COUNT} ref slots, found {}",
                top.size()
            ));
        }

        self.check_free_arrays(&top);

        let names_ref = match top.get_child_ref(self.snap, TOP_NAMES) {
            Ok(r) => r,
            Err(err) => return self.fail(format!("top names slot: {err}")),
        };
        let table_count = match self.check_names(names_ref) {
            Some(n) => n,
            None => return,
        };

        let tables_ref = match top.get_child_ref(self.snap, TOP_TABLES) {
            Ok(r) => r,
            Err(err) => return self.fail(format!("top tables slot: {err}")),
        };
        if self.check_node(tables_ref, "tables").is_none() {
            return;
        }
        let tables = match Array::attach(self.snap, tables_ref) {
            Ok(t) => t,
            Err(err) => return self.fail(format!("tables: {err}")),
        };
        if tables.size() != table_count {
            self.fail(format!(
                "tables: {} entries but {} names",
                tables.size(),
                table_count
            ));
        }
        for i in 0..tables.size() {
            match tables.get_child_ref(self.snap, i) {
                Ok(t) => self.check_table(t, i),
                Err(err) => self.fail(format!("table {i}: {err}")),
            }
        }
    }

    fn check_names(&mut self, names_ref: Ref) -> Option<usize> {
        self.check_node(names_ref, "table names")?;
        let names = match StringArray::attach(self.snap, names_ref) {
            Ok(n) => n,
            Err(err) => {
                self.fail(format!("table names: {err}"));
                return None;
            }
        };
        for i in 0..names.size() {
            if let Err(err) = names.get(self.snap, i) {
                self.fail(format!("table name {i}: {err}"));
            }
        }
        Some(names.size())
    }

    fn check_free_arrays(&mut self, top: &Array) {
        let mut sizes = [0usize; 3];
        for (k, slot) in [TOP_FREE_POSITIONS, TOP_FREE_SIZES, TOP_FREE_VERSIONS]
            .into_iter()
            .enumerate()
        {
            let r = match top.get_child_ref(self.snap, slot) {
                Ok(r) => r,
                Err(err) => return self.fail(format!("free-list slot {slot}: {err}")),
            };
            if self.check_node(r, "free list").is_none() {
                return;
            }
            match Array::attach(self.snap, r) {
                Ok(arr) => sizes[k] = arr.size(),
                Err(err) => return self.fail(format!("free list: {err}")),
            }
        }
        if sizes[0] != sizes[1] || sizes[0] != sizes[2] {
            self.fail(format!(
                "free-list arrays disagree on length: {sizes:?}"
            ));
        }
    }

    fn check_table(&mut self, table_ref: Ref, idx: usize) {
        if self.check_node(table_ref, "table node").is_none() {
            return;
        }
        let table = match Array::attach(self.snap, table_ref) {
            Ok(t) => t,
            Err(err) => return self.fail(format!("table {idx}: {err}")),
        };
        if table.size() != 2 {
            return self.fail(format!(
                "table {idx}: {} slots, expected 2",
                table.size()
            ));
        }

        let spec_ref = match table.get_child_ref(self.snap, TABLE_SPEC) {
            Ok(r) => r,
            Err(err) => return self.fail(format!("table {idx} spec: {err}")),
        };
        let nullables = self.check_spec(spec_ref, idx);

        let columns_ref = match table.get_child_ref(self.snap, TABLE_COLUMNS) {
            Ok(r) => r,
            Err(err) => return self.fail(format!("table {idx} columns: {err}")),
        };
        if self.check_node(columns_ref, "columns").is_none() {
            return;
        }
        let columns = match Array::attach(self.snap, columns_ref) {
            Ok(c) => c,
            Err(err) => return self.fail(format!("table {idx} columns: {err}")),
        };
        if let Some(nullables) = &nullables {
            if columns.size() != nullables.len() {
                self.fail(format!(
                    "table {idx}: {} column roots but {} specs",
                    columns.size(),
                    nullables.len()
                ));
            }
        }

        let mut row_count: Option<usize> = None;
        for c in 0..columns.size() {
            let nullable = nullables
                .as_ref()
                .and_then(|n| n.get(c).copied())
                .unwrap_or(false);
            let root = match columns.get_child_ref(self.snap, c) {
                Ok(r) => r,
                Err(err) => {
                    self.fail(format!("table {idx} column {c}: {err}"));
                    continue;
                }
            };
            if let Some(count) = self.check_tree(root, nullable, idx, c) {
                match row_count {
                    None => row_count = Some(count),
                    Some(expected) if expected != count => self.fail(format!(
                        "table {idx} column {c}: {count} rows, others have {expected}"
                    )),
                    _ => {}
                }
            }
        }
    }

    fn check_spec(&mut self, spec_ref: Ref, idx: usize) -> Option<Vec<bool>> {
        self.check_node(spec_ref, "spec node")?;
        let spec = match Array::attach(self.snap, spec_ref) {
            Ok(s) => s,
            Err(err) => {
                self.fail(format!("table {idx} spec: {err}"));
                return None;
            }
        };
        if spec.size() != 2 {
            self.fail(format!(
                "table {idx} spec: {} slots, expected 2",
                spec.size()
            ));
            return None;
        }
        let types_ref = spec.get_child_ref(self.snap, SPEC_TYPES).ok()?;
        let names_ref = spec.get_child_ref(self.snap, SPEC_NAMES).ok()?;
        self.check_node(types_ref, "column types")?;
        self.check_node(names_ref, "column names")?;
        let types = Array::attach(self.snap, types_ref).ok()?;
        let names = StringArray::attach(self.snap, names_ref).ok()?;
        if types.size() != names.size() {
            self.fail(format!(
                "table {idx}: {} column types but {} names",
                types.size(),
                names.size()
            ));
        }
        let mut nullables = Vec::with_capacity(types.size());
        for i in 0..types.size() {
            match crate::table::ColumnType::from_code(types.get(self.snap, i)) {
                Ok(ty) => nullables.push(ty.is_nullable()),
                Err(err) => {
                    self.fail(format!("table {idx} column {i}: {err}"));
                    nullables.push(false);
                }
            }
        }
        Some(nullables)
    }

    /// Validate one column subtree, returning its logical element count.
    fn check_tree(&mut self, node: Ref, nullable: bool, t: usize, c: usize) -> Option<usize> {
        let header = self.check_node(node, "column node")?;
        let arr = match Array::attach(self.snap, node) {
            Ok(a) => a,
            Err(err) => {
                self.fail(format!("table {t} column {c}: {err}"));
                return None;
            }
        };
        if !header.context_flag {
            let min = usize::from(nullable);
            if arr.size() < min {
                self.fail(format!(
                    "table {t} column {c}: nullable leaf at ref {node} missing its sentinel"
                ));
                return None;
            }
            return Some(arr.size() - min);
        }

        if arr.size() != 2 || !arr.has_refs() {
            self.fail(format!(
                "table {t} column {c}: malformed inner node at ref {node}"
            ));
            return None;
        }
        let children_ref = arr.get_child_ref(self.snap, 0).ok()?;
        let offsets_ref = arr.get_child_ref(self.snap, 1).ok()?;
        self.check_node(children_ref, "inner children")?;
        self.check_node(offsets_ref, "inner offsets")?;
        let children = Array::attach(self.snap, children_ref).ok()?;
        let offsets = Array::attach(self.snap, offsets_ref).ok()?;
        if children.size() != offsets.size() {
            self.fail(format!(
                "table {t} column {c}: inner node at ref {node} has {} children, {} offsets",
                children.size(),
                offsets.size()
            ));
            return None;
        }

        let mut cumulative = 0usize;
        for k in 0..children.size() {
            let child = match children.get_child_ref(self.snap, k) {
                Ok(r) => r,
                Err(err) => {
                    self.fail(format!("table {t} column {c} child {k}: {err}"));
                    return None;
                }
            };
            let count = self.check_tree(child, nullable, t, c)?;
            cumulative += count;
            let recorded = offsets.get(self.snap, k);
            if recorded != cumulative as i64 {
                self.fail(format!(
                    "table {t} column {c}: offset[{k}] = {recorded}, children hold {cumulative}"
                ));
                return None;
            }
        }
        Some(cumulative)
    }
}
