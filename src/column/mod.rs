//! B+-tree columns: a logically contiguous sequence of integers built from
//! array nodes.
//!
//! A column root is either a single leaf (plain integer node) or an inner
//! node: a has-refs array with the context flag set, holding exactly two
//! sub-refs — the child-ref array and the cumulative-offset array whose
//! last element is the subtree element count. The element at global index
//! `i` lives in the first child whose cumulative offset exceeds `i`.
//!
//! Inserts split full leaves at the insertion point (the left node keeps
//! `[0..i)` plus the new element); split records propagate upward and may
//! split ancestors up to a new root. Deletes shrink leaves in place and
//! leave empty leaves behind; only truncation collapses levels.
//!
//! Nullable columns reserve physical index 0 of every leaf for the null
//! sentinel; logical element `i` lives at physical `i + 1`.

use smallvec::SmallVec;
use tracing::trace;

use crate::array::find::{find_in_array, find_in_nullable, Acc, Cond, QueryState};
use crate::array::Array;
use crate::error::{Result, TabulaError};
use crate::mem::{Allocator, Mem};
use crate::types::Ref;

/// Default upper bound on leaf element count; configurable per group.
pub const DEFAULT_MAX_LEAF: usize = 1000;

/// Sentinel stored at physical index 0 of nullable leaves. The value itself
/// is reserved: storing it as a live element is rejected.
pub const NULL_SENTINEL: i64 = i64::MIN;

const SLOT_CHILDREN: usize = 0;
const SLOT_OFFSETS: usize = 1;

/// Outcome of an insert that overflowed a node.
struct Split {
    right: Ref,
    left_count: usize,
    right_count: usize,
}

/// Accessor for one column. Holds no memory; mutations may replace the root
/// ref, which the owner must write back into the parent slot.
pub struct Column {
    root: Ref,
    nullable: bool,
    max_leaf: usize,
}

impl Column {
    /// Allocate an empty column (a single empty leaf) and return its root.
    pub fn create(alloc: &mut Allocator, nullable: bool) -> Result<Ref> {
        let root = Array::create(alloc, false, false, 0, 0)?;
        if nullable {
            let mut leaf = Array::attach(alloc, root)?;
            leaf.push(alloc, NULL_SENTINEL)?;
            return Ok(leaf.pos());
        }
        Ok(root)
    }

    pub fn new(root: Ref, nullable: bool, max_leaf: usize) -> Self {
        Self {
            root,
            nullable,
            max_leaf,
        }
    }

    pub fn root(&self) -> Ref {
        self.root
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn size(&self, mem: &impl Mem) -> Result<usize> {
        self.node_count(mem, self.root)
    }

    fn node_count(&self, mem: &impl Mem, node: Ref) -> Result<usize> {
        let arr = Array::attach(mem, node)?;
        if arr.is_inner_node() {
            let (_, offsets) = self.inner_parts(mem, &arr)?;
            if offsets.is_empty() {
                return Ok(0);
            }
            Ok(offsets.get(mem, offsets.size() - 1) as usize)
        } else {
            Ok(arr.size() - usize::from(self.nullable))
        }
    }

    fn inner_parts(&self, mem: &impl Mem, inner: &Array) -> Result<(Array, Array)> {
        if inner.size() != 2 {
            return Err(TabulaError::corrupt(format!(
                "inner node at ref {} has {} slots, expected 2",
                inner.pos(),
                inner.size()
            )));
        }
        let children = Array::attach(mem, inner.get_child_ref(mem, SLOT_CHILDREN)?)?;
        let offsets = Array::attach(mem, inner.get_child_ref(mem, SLOT_OFFSETS)?)?;
        if children.size() != offsets.size() {
            return Err(TabulaError::corrupt(
                "inner node child and offset arrays disagree",
            ));
        }
        Ok((children, offsets))
    }

    /// Child index holding global `index`, with the element count preceding
    /// that child.
    fn locate(&self, mem: &impl Mem, offsets: &Array, index: usize) -> Result<(usize, usize)> {
        let c = offsets.upper_bound(mem, index as i64);
        if c >= offsets.size() {
            return Err(TabulaError::logic(format!(
                "index {index} beyond subtree of {} elements",
                if offsets.is_empty() {
                    0
                } else {
                    offsets.get(mem, offsets.size() - 1)
                }
            )));
        }
        let prefix = if c == 0 {
            0
        } else {
            offsets.get(mem, c - 1) as usize
        };
        Ok((c, prefix))
    }

    pub fn get(&self, mem: &impl Mem, index: usize) -> Result<i64> {
        let mut node = self.root;
        let mut idx = index;
        loop {
            let arr = Array::attach(mem, node)?;
            if !arr.is_inner_node() {
                let phys = idx + usize::from(self.nullable);
                if phys >= arr.size() {
                    return Err(TabulaError::logic(format!(
                        "column index {index} out of range"
                    )));
                }
                return Ok(arr.get(mem, phys));
            }
            let (children, offsets) = self.inner_parts(mem, &arr)?;
            let (c, prefix) = self.locate(mem, &offsets, idx)?;
            node = children.get_child_ref(mem, c)?;
            idx -= prefix;
        }
    }

    /// Element as an optional value; `None` is the stored null (nullable
    /// columns only).
    pub fn get_nullable(&self, mem: &impl Mem, index: usize) -> Result<Option<i64>> {
        let v = self.get(mem, index)?;
        if self.nullable && v == NULL_SENTINEL {
            return Ok(None);
        }
        Ok(Some(v))
    }

    pub fn set(&mut self, alloc: &mut Allocator, index: usize, value: i64) -> Result<()> {
        self.check_storable(value)?;
        self.root = self.set_in(alloc, self.root, index, value)?;
        Ok(())
    }

    pub fn set_null(&mut self, alloc: &mut Allocator, index: usize) -> Result<()> {
        if !self.nullable {
            return Err(TabulaError::logic("column is not nullable"));
        }
        self.root = self.set_in(alloc, self.root, index, NULL_SENTINEL)?;
        Ok(())
    }

    fn check_storable(&self, value: i64) -> Result<()> {
        if self.nullable && value == NULL_SENTINEL {
            return Err(TabulaError::logic(
                "value is reserved as the null sentinel of this column",
            ));
        }
        Ok(())
    }

    fn set_in(&self, alloc: &mut Allocator, node: Ref, index: usize, value: i64) -> Result<Ref> {
        let mut arr = Array::attach(alloc, node)?;
        if !arr.is_inner_node() {
            let phys = index + usize::from(self.nullable);
            if phys >= arr.size() {
                return Err(TabulaError::logic(format!(
                    "column index {index} out of range"
                )));
            }
            arr.set(alloc, phys, value)?;
            return Ok(arr.pos());
        }
        let (mut children, offsets) = self.inner_parts(alloc, &arr)?;
        let (c, prefix) = self.locate(alloc, &offsets, index)?;
        let child = children.get_child_ref(alloc, c)?;
        let new_child = self.set_in(alloc, child, index - prefix, value)?;
        if new_child != child {
            children.set_ref(alloc, c, new_child)?;
        }
        self.publish_parts(alloc, &mut arr, &children, &offsets)?;
        Ok(arr.pos())
    }

    /// Write possibly-moved sub-arrays back into the inner node's slots.
    fn publish_parts(
        &self,
        alloc: &mut Allocator,
        inner: &mut Array,
        children: &Array,
        offsets: &Array,
    ) -> Result<()> {
        if inner.get_child_ref(alloc, SLOT_CHILDREN)? != children.pos() {
            inner.set_ref(alloc, SLOT_CHILDREN, children.pos())?;
        }
        if inner.get_child_ref(alloc, SLOT_OFFSETS)? != offsets.pos() {
            inner.set_ref(alloc, SLOT_OFFSETS, offsets.pos())?;
        }
        Ok(())
    }

    pub fn insert(&mut self, alloc: &mut Allocator, index: usize, value: i64) -> Result<()> {
        self.check_storable(value)?;
        self.insert_impl(alloc, index, value)
    }

    pub fn insert_null(&mut self, alloc: &mut Allocator, index: usize) -> Result<()> {
        if !self.nullable {
            return Err(TabulaError::logic("column is not nullable"));
        }
        self.insert_impl(alloc, index, NULL_SENTINEL)
    }

    pub fn push(&mut self, alloc: &mut Allocator, value: i64) -> Result<()> {
        let size = self.size(alloc)?;
        self.insert(alloc, size, value)
    }

    pub fn push_null(&mut self, alloc: &mut Allocator) -> Result<()> {
        let size = self.size(alloc)?;
        self.insert_null(alloc, size)
    }

    fn insert_impl(&mut self, alloc: &mut Allocator, index: usize, value: i64) -> Result<()> {
        let size = self.size(alloc)?;
        if index > size {
            return Err(TabulaError::logic(format!(
                "insert index {index} out of range (size {size})"
            )));
        }
        let (new_root, split) = self.insert_in(alloc, self.root, index, value)?;
        self.root = new_root;
        if let Some(split) = split {
            // The root split: grow the tree one level.
            trace!(
                left = self.root,
                right = split.right,
                "column root split"
            );
            self.root = make_inner(
                alloc,
                &[self.root, split.right],
                &[split.left_count as i64, (split.left_count + split.right_count) as i64],
            )?;
        }
        Ok(())
    }

    fn insert_in(
        &self,
        alloc: &mut Allocator,
        node: Ref,
        index: usize,
        value: i64,
    ) -> Result<(Ref, Option<Split>)> {
        let mut arr = Array::attach(alloc, node)?;
        if !arr.is_inner_node() {
            return self.insert_in_leaf(alloc, arr, index, value);
        }

        let (mut children, mut offsets) = self.inner_parts(alloc, &arr)?;
        let total = if offsets.is_empty() {
            0
        } else {
            offsets.get(alloc, offsets.size() - 1) as usize
        };
        // Appends descend into the last child.
        let (c, prefix) = if index >= total {
            let c = children.size() - 1;
            let prefix = if c == 0 {
                0
            } else {
                offsets.get(alloc, c - 1) as usize
            };
            (c, prefix)
        } else {
            self.locate(alloc, &offsets, index)?
        };

        let child = children.get_child_ref(alloc, c)?;
        let (new_child, child_split) = self.insert_in(alloc, child, index - prefix, value)?;
        if new_child != child {
            children.set_ref(alloc, c, new_child)?;
        }

        match child_split {
            None => {
                offsets.adjust_range(alloc, c, offsets.size(), 1)?;
            }
            Some(split) => {
                let old_cum = offsets.get(alloc, c);
                offsets.set(alloc, c, (prefix + split.left_count) as i64)?;
                offsets.insert(alloc, c + 1, old_cum + 1)?;
                offsets.adjust_range(alloc, c + 2, offsets.size(), 1)?;
                children.insert(
                    alloc,
                    c + 1,
                    crate::types::RefOrTagged::make_ref(split.right).slot() as i64,
                )?;
            }
        }

        if children.size() > self.max_leaf {
            let split = self.split_inner(alloc, &mut children, &mut offsets)?;
            self.publish_parts(alloc, &mut arr, &children, &offsets)?;
            return Ok((arr.pos(), Some(split)));
        }

        self.publish_parts(alloc, &mut arr, &children, &offsets)?;
        Ok((arr.pos(), None))
    }

    fn insert_in_leaf(
        &self,
        alloc: &mut Allocator,
        mut leaf: Array,
        index: usize,
        value: i64,
    ) -> Result<(Ref, Option<Split>)> {
        let header = usize::from(self.nullable);
        let logical = leaf.size() - header;
        debug_assert!(index <= logical);
        if logical < self.max_leaf {
            leaf.insert(alloc, index + header, value)?;
            return Ok((leaf.pos(), None));
        }

        // Split at the insertion point: the left leaf keeps [0..index) plus
        // the new element, the right leaf takes [index..size). A pure append
        // becomes a singleton right leaf.
        let right_ref = Array::create(alloc, false, false, 0, 0)?;
        let mut right = Array::attach(alloc, right_ref)?;
        if self.nullable {
            right.push(alloc, leaf.get(alloc, 0))?;
        }
        if index == logical {
            right.push(alloc, value)?;
            return Ok((
                leaf.pos(),
                Some(Split {
                    right: right.pos(),
                    left_count: logical,
                    right_count: 1,
                }),
            ));
        }

        for i in index..logical {
            right.push(alloc, leaf.get(alloc, i + header))?;
        }
        leaf.truncate(alloc, index + header)?;
        leaf.push(alloc, value)?;
        Ok((
            leaf.pos(),
            Some(Split {
                right: right.pos(),
                left_count: index + 1,
                right_count: logical - index,
            }),
        ))
    }

    /// Split an overfull inner node in half, leaving the left half in
    /// `children`/`offsets` and returning the new right sibling.
    fn split_inner(
        &self,
        alloc: &mut Allocator,
        children: &mut Array,
        offsets: &mut Array,
    ) -> Result<Split> {
        let k = children.size();
        let h = k / 2;
        let left_count = offsets.get(alloc, h - 1) as usize;
        let total = offsets.get(alloc, k - 1) as usize;

        let mut right_children = Vec::with_capacity(k - h);
        let mut right_offsets = Vec::with_capacity(k - h);
        for j in h..k {
            right_children.push(children.get_child_ref(alloc, j)?);
            right_offsets.push(offsets.get(alloc, j) - left_count as i64);
        }
        let right = make_inner(alloc, &right_children, &right_offsets)?;

        children.truncate(alloc, h)?;
        offsets.truncate(alloc, h)?;

        Ok(Split {
            right,
            left_count,
            right_count: total - left_count,
        })
    }

    pub fn erase(&mut self, alloc: &mut Allocator, index: usize) -> Result<()> {
        let size = self.size(alloc)?;
        if index >= size {
            return Err(TabulaError::logic(format!(
                "erase index {index} out of range (size {size})"
            )));
        }
        self.root = self.erase_in(alloc, self.root, index)?;
        Ok(())
    }

    fn erase_in(&self, alloc: &mut Allocator, node: Ref, index: usize) -> Result<Ref> {
        let mut arr = Array::attach(alloc, node)?;
        if !arr.is_inner_node() {
            arr.erase(alloc, index + usize::from(self.nullable))?;
            return Ok(arr.pos());
        }
        let (mut children, mut offsets) = self.inner_parts(alloc, &arr)?;
        let (c, prefix) = self.locate(alloc, &offsets, index)?;
        let child = children.get_child_ref(alloc, c)?;
        let new_child = self.erase_in(alloc, child, index - prefix)?;
        if new_child != child {
            children.set_ref(alloc, c, new_child)?;
        }
        offsets.adjust_range(alloc, c, offsets.size(), -1)?;
        self.publish_parts(alloc, &mut arr, &children, &offsets)?;
        Ok(arr.pos())
    }

    /// Erase `[n..size)`, then collapse single-child root levels. This is
    /// the only operation that merges tree levels.
    pub fn truncate(&mut self, alloc: &mut Allocator, n: usize) -> Result<()> {
        let mut size = self.size(alloc)?;
        if n > size {
            return Err(TabulaError::logic(format!(
                "truncate to {n} beyond size {size}"
            )));
        }
        if n == 0 {
            return self.clear(alloc);
        }
        while size > n {
            self.erase(alloc, size - 1)?;
            size -= 1;
        }
        loop {
            let arr = Array::attach(alloc, self.root)?;
            if !arr.is_inner_node() {
                break;
            }
            let (children, offsets) = self.inner_parts(alloc, &arr)?;
            if children.size() != 1 {
                break;
            }
            let only = children.get_child_ref(alloc, 0)?;
            alloc.free(children.pos(), children.capacity());
            alloc.free(offsets.pos(), offsets.capacity());
            alloc.free(arr.pos(), arr.capacity());
            self.root = only;
        }
        Ok(())
    }

    /// Drop every element, resetting to a single empty leaf.
    pub fn clear(&mut self, alloc: &mut Allocator) -> Result<()> {
        Array::destroy_deep(alloc, self.root)?;
        self.root = Column::create(alloc, self.nullable)?;
        Ok(())
    }

    /// Apply the scan kernel over `[start..end)`, leaf by leaf, with global
    /// base indices.
    pub fn find(
        &self,
        mem: &impl Mem,
        cond: Cond,
        value: Option<i64>,
        start: usize,
        end: usize,
        state: &mut QueryState<'_>,
    ) -> Result<()> {
        if value.is_none() && !self.nullable {
            return Err(TabulaError::logic(
                "null search on a non-nullable column",
            ));
        }
        let size = self.size(mem)?;
        let end = end.min(size);
        if start > end {
            return Err(TabulaError::logic("find range inverted"));
        }
        self.scan_node(mem, self.root, 0, start, end, cond, value, state)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_node(
        &self,
        mem: &impl Mem,
        node: Ref,
        base: usize,
        start: usize,
        end: usize,
        cond: Cond,
        value: Option<i64>,
        state: &mut QueryState<'_>,
    ) -> Result<bool> {
        let arr = Array::attach(mem, node)?;
        if !arr.is_inner_node() {
            let count = arr.size() - usize::from(self.nullable);
            let lo = start.saturating_sub(base);
            let hi = end.saturating_sub(base).min(count);
            if lo >= hi {
                return Ok(true);
            }
            return if self.nullable {
                find_in_nullable(&arr, mem, cond, value, lo, hi, base, state)
            } else {
                let target = value.expect("non-null target checked in find");
                find_in_array(&arr, mem, cond, target, lo, hi, base, state)
            };
        }

        let (children, offsets) = self.inner_parts(mem, &arr)?;
        let mut child_base = base;
        for c in 0..children.size() {
            let cum = offsets.get(mem, c) as usize;
            let child_end = base + cum;
            if child_end > start {
                if child_base >= end {
                    break;
                }
                let child = children.get_child_ref(mem, c)?;
                if !self.scan_node(mem, child, child_base, start, end, cond, value, state)? {
                    return Ok(false);
                }
            }
            child_base = base + cum;
        }
        Ok(true)
    }

    /// Smallest index matching `cond value`, if any.
    pub fn find_first(&self, mem: &impl Mem, cond: Cond, value: Option<i64>) -> Result<Option<usize>> {
        let mut state = QueryState::first();
        self.find(mem, cond, value, 0, usize::MAX, &mut state)?;
        match state.acc {
            Acc::ReturnFirst(slot) => Ok(slot),
            _ => unreachable!(),
        }
    }

    pub fn find_all(
        &self,
        mem: &impl Mem,
        cond: Cond,
        value: Option<i64>,
        limit: usize,
    ) -> Result<Vec<usize>> {
        let mut state = QueryState::find_all(limit);
        self.find(mem, cond, value, 0, usize::MAX, &mut state)?;
        match state.acc {
            Acc::FindAll(v) => Ok(v),
            _ => unreachable!(),
        }
    }

    pub fn count(&self, mem: &impl Mem, cond: Cond, value: Option<i64>) -> Result<u64> {
        let mut state = QueryState::count(usize::MAX);
        self.find(mem, cond, value, 0, usize::MAX, &mut state)?;
        match state.acc {
            Acc::Count(n) => Ok(n),
            _ => unreachable!(),
        }
    }

    /// Sum of matching elements (nulls contribute nothing).
    pub fn sum_where(&self, mem: &impl Mem, cond: Cond, value: Option<i64>) -> Result<i64> {
        let mut state = QueryState::sum();
        self.find(mem, cond, value, 0, usize::MAX, &mut state)?;
        match state.acc {
            Acc::Sum(s) => Ok(s),
            _ => unreachable!(),
        }
    }

    pub fn sum(&self, mem: &impl Mem) -> Result<i64> {
        let (cond, target) = self.all_match();
        self.sum_where(mem, cond, target)
    }

    /// Minimum element with the smallest index achieving it.
    pub fn minimum(&self, mem: &impl Mem) -> Result<Option<(i64, usize)>> {
        let (cond, target) = self.all_match();
        let mut state = QueryState::min();
        self.find(mem, cond, target, 0, usize::MAX, &mut state)?;
        match state.acc {
            Acc::Min(best) => Ok(best),
            _ => unreachable!(),
        }
    }

    /// Maximum element with the smallest index achieving it.
    pub fn maximum(&self, mem: &impl Mem) -> Result<Option<(i64, usize)>> {
        let (cond, target) = self.all_match();
        let mut state = QueryState::max();
        self.find(mem, cond, target, 0, usize::MAX, &mut state)?;
        match state.acc {
            Acc::Max(best) => Ok(best),
            _ => unreachable!(),
        }
    }

    /// A condition matching every live element: `NotEqual null` on nullable
    /// columns (nulls excluded), otherwise the saturated `>= i64::MIN`.
    fn all_match(&self) -> (Cond, Option<i64>) {
        if self.nullable {
            (Cond::NotEqual, None)
        } else {
            (Cond::GreaterEqual, Some(i64::MIN))
        }
    }

    /// Flatten to a vector of optional values (tests and verification).
    pub fn to_vec(&self, mem: &impl Mem) -> Result<Vec<Option<i64>>> {
        let size = self.size(mem)?;
        (0..size).map(|i| self.get_nullable(mem, i)).collect()
    }

    /// Depth and leaf statistics used by verification.
    pub(crate) fn leaf_refs(&self, mem: &impl Mem) -> Result<Vec<Ref>> {
        let mut out = Vec::new();
        let mut stack: SmallVec<[Ref; 8]> = SmallVec::new();
        stack.push(self.root);
        while let Some(node) = stack.pop() {
            let arr = Array::attach(mem, node)?;
            if !arr.is_inner_node() {
                out.push(node);
                continue;
            }
            let (children, _) = self.inner_parts(mem, &arr)?;
            for c in (0..children.size()).rev() {
                stack.push(children.get_child_ref(mem, c)?);
            }
        }
        Ok(out)
    }
}

/// Build an inner node over `children` with the given cumulative offsets.
fn make_inner(alloc: &mut Allocator, children: &[Ref], offsets: &[i64]) -> Result<Ref> {
    debug_assert_eq!(children.len(), offsets.len());
    let children_ref = Array::create(alloc, true, false, 0, 0)?;
    let mut carr = Array::attach(alloc, children_ref)?;
    for &c in children {
        carr.push_ref(alloc, c)?;
    }
    let offsets_ref = Array::create(alloc, false, false, 0, 0)?;
    let mut oarr = Array::attach(alloc, offsets_ref)?;
    for &o in offsets {
        oarr.push(alloc, o)?;
    }
    let inner_ref = Array::create(alloc, true, true, 0, 0)?;
    let mut inner = Array::attach(alloc, inner_ref)?;
    inner.push_ref(alloc, carr.pos())?;
    inner.push_ref(alloc, oarr.pos())?;
    Ok(inner.pos())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(alloc: &mut Allocator, max_leaf: usize, values: &[i64]) -> Column {
        let root = Column::create(alloc, false).unwrap();
        let mut col = Column::new(root, false, max_leaf);
        for &v in values {
            col.push(alloc, v).unwrap();
        }
        col
    }

    fn values(col: &Column, mem: &impl Mem) -> Vec<i64> {
        col.to_vec(mem)
            .unwrap()
            .into_iter()
            .map(|v| v.unwrap())
            .collect()
    }

    #[test]
    fn split_at_insertion_point() {
        let mut alloc = Allocator::heap();
        let root = Column::create(&mut alloc, false).unwrap();
        let mut col = Column::new(root, false, 4);
        for v in [10, 20, 30, 40] {
            col.push(&mut alloc, v).unwrap();
        }
        col.insert(&mut alloc, 2, 25).unwrap();

        assert_eq!(values(&col, &alloc), vec![10, 20, 25, 30, 40]);

        let arr = Array::attach(&alloc, col.root()).unwrap();
        assert!(arr.is_inner_node());
        let (children, offsets) = col.inner_parts(&alloc, &arr).unwrap();
        assert_eq!(children.size(), 2);
        assert_eq!(offsets.get(&alloc, 0), 3);
        assert_eq!(offsets.get(&alloc, 1), 5);

        let left = Array::attach(&alloc, children.get_child_ref(&alloc, 0).unwrap()).unwrap();
        let right = Array::attach(&alloc, children.get_child_ref(&alloc, 1).unwrap()).unwrap();
        let left_vals: Vec<i64> = (0..left.size()).map(|i| left.get(&alloc, i)).collect();
        let right_vals: Vec<i64> = (0..right.size()).map(|i| right.get(&alloc, i)).collect();
        assert_eq!(left_vals, vec![10, 20, 25]);
        assert_eq!(right_vals, vec![30, 40]);
    }

    #[test]
    fn grows_through_many_levels() {
        let mut alloc = Allocator::heap();
        let n = 300;
        let col = column(&mut alloc, 4, &(0..n).collect::<Vec<_>>());
        assert_eq!(col.size(&alloc).unwrap(), n as usize);
        for i in 0..n {
            assert_eq!(col.get(&alloc, i as usize).unwrap(), i);
        }
    }

    #[test]
    fn random_position_inserts_match_model() {
        let mut alloc = Allocator::heap();
        let root = Column::create(&mut alloc, false).unwrap();
        let mut col = Column::new(root, false, 4);
        let mut model: Vec<i64> = Vec::new();
        // Deterministic but scattered insert positions.
        for i in 0..200i64 {
            let pos = (i as usize * 7919) % (model.len() + 1);
            col.insert(&mut alloc, pos, i).unwrap();
            model.insert(pos, i);
        }
        assert_eq!(values(&col, &alloc), model);
    }

    #[test]
    fn erase_keeps_order_and_empty_leaves() {
        let mut alloc = Allocator::heap();
        let mut col = column(&mut alloc, 4, &(0..20).collect::<Vec<_>>());
        // Drain an entire leaf's worth from the front.
        for _ in 0..5 {
            col.erase(&mut alloc, 0).unwrap();
        }
        assert_eq!(col.size(&alloc).unwrap(), 15);
        assert_eq!(values(&col, &alloc), (5..20).collect::<Vec<_>>());
    }

    #[test]
    fn insert_then_erase_roundtrips() {
        let mut alloc = Allocator::heap();
        let before: Vec<i64> = (0..50).map(|i| i * 3).collect();
        let mut col = column(&mut alloc, 8, &before);
        col.insert(&mut alloc, 17, 999).unwrap();
        col.erase(&mut alloc, 17).unwrap();
        assert_eq!(values(&col, &alloc), before);
    }

    #[test]
    fn truncate_collapses_to_leaf() {
        let mut alloc = Allocator::heap();
        let mut col = column(&mut alloc, 4, &(0..100).collect::<Vec<_>>());
        col.truncate(&mut alloc, 3).unwrap();
        assert_eq!(values(&col, &alloc), vec![0, 1, 2]);
        let arr = Array::attach(&alloc, col.root()).unwrap();
        assert!(!arr.is_inner_node(), "truncation should collapse the tree");
    }

    #[test]
    fn clear_resets_to_empty_leaf() {
        let mut alloc = Allocator::heap();
        let mut col = column(&mut alloc, 4, &(0..100).collect::<Vec<_>>());
        col.clear(&mut alloc).unwrap();
        assert_eq!(col.size(&alloc).unwrap(), 0);
        assert!(!Array::attach(&alloc, col.root()).unwrap().is_inner_node());
    }

    #[test]
    fn find_works_across_leaves() {
        let mut alloc = Allocator::heap();
        let vals: Vec<i64> = (0..100).map(|i| i % 10).collect();
        let col = column(&mut alloc, 4, &vals);

        assert_eq!(col.find_first(&alloc, Cond::Equal, Some(7)).unwrap(), Some(7));
        assert_eq!(col.count(&alloc, Cond::Equal, Some(3)).unwrap(), 10);
        let all = col.find_all(&alloc, Cond::Equal, Some(9), usize::MAX).unwrap();
        assert_eq!(all, (0..10).map(|k| k * 10 + 9).collect::<Vec<_>>());
        let limited = col.find_all(&alloc, Cond::Equal, Some(9), 3).unwrap();
        assert_eq!(limited, vec![9, 19, 29]);
    }

    #[test]
    fn aggregates_across_leaves() {
        let mut alloc = Allocator::heap();
        let col = column(&mut alloc, 4, &[3, -5, 7, -5, 11]);
        assert_eq!(col.sum(&alloc).unwrap(), 11);
        assert_eq!(col.minimum(&alloc).unwrap(), Some((-5, 1)));
        assert_eq!(col.maximum(&alloc).unwrap(), Some((11, 4)));
        assert_eq!(col.count(&alloc, Cond::Equal, Some(-5)).unwrap(), 2);
        assert_eq!(col.find_first(&alloc, Cond::Greater, Some(6)).unwrap(), Some(2));
    }

    #[test]
    fn nullable_columns_roundtrip() {
        let mut alloc = Allocator::heap();
        let root = Column::create(&mut alloc, true).unwrap();
        let mut col = Column::new(root, true, 4);
        col.push(&mut alloc, 7).unwrap();
        col.push_null(&mut alloc).unwrap();
        col.push(&mut alloc, 5).unwrap();
        col.push_null(&mut alloc).unwrap();
        for v in [1, 2, 3, 4] {
            col.push(&mut alloc, v).unwrap();
        }

        assert_eq!(col.size(&alloc).unwrap(), 8);
        assert_eq!(col.get_nullable(&alloc, 0).unwrap(), Some(7));
        assert_eq!(col.get_nullable(&alloc, 1).unwrap(), None);
        assert_eq!(col.get_nullable(&alloc, 3).unwrap(), None);

        assert_eq!(col.count(&alloc, Cond::Equal, None).unwrap(), 2);
        assert_eq!(col.find_first(&alloc, Cond::Equal, None).unwrap(), Some(1));
        assert_eq!(col.sum(&alloc).unwrap(), 7 + 5 + 1 + 2 + 3 + 4);
        assert_eq!(col.minimum(&alloc).unwrap(), Some((1, 4)));

        assert!(col.push(&mut alloc, NULL_SENTINEL).is_err());
    }

    #[test]
    fn descent_finds_exactly_one_leaf_per_index() {
        let mut alloc = Allocator::heap();
        let col = column(&mut alloc, 4, &(0..64).collect::<Vec<_>>());
        let leaves = col.leaf_refs(&alloc).unwrap();
        let mut total = 0;
        for leaf in &leaves {
            total += Array::attach(&alloc, *leaf).unwrap().size();
        }
        assert_eq!(total, 64);
    }
}
