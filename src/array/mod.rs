//! The bit-packed integer array: the substrate every column and every
//! tree-internal structure is built from.
//!
//! A node stores fixed-width integers at one of eight widths
//! {0,1,2,4,8,16,32,64} and widens adaptively when a value outside the
//! current range arrives. Widening is monotonic; erasing never narrows.
//!
//! The accessor here assumes no ownership of the node memory. Mutating
//! operations go through the allocator and follow copy-on-write: a node
//! below the committed watermark is first copied, the copy mutated, and the
//! old region queued on the pending-free list. All reallocation is staged
//! (allocate, copy, publish, free) so a failed allocation leaves the array
//! untouched.

use crate::error::{Result, TabulaError};
use crate::mem::{Allocator, Mem};
use crate::types::{
    lbound_for_width, ubound_for_width, width_for_value, Ref, RefOrTagged, WidthType,
    MAX_NODE_SIZE, NODE_HEADER_SIZE,
};

pub mod bits;
pub mod find;
pub mod header;
pub mod strings;

#[cfg(target_arch = "x86_64")]
pub(crate) mod sse;

use bits::{getter_for, setter_for, Getter, Setter};
use header::{byte_size_for, NodeHeader};

/// Accessor for one bit-packed integer node.
///
/// Holds the node ref, a decoded copy of the header, and function pointers
/// for element access, selected once per attach (and re-selected on widen).
pub struct Array {
    pos: Ref,
    header: NodeHeader,
    lbound: i64,
    ubound: i64,
    get_fn: Getter,
    set_fn: Setter,
}

impl Array {
    /// Allocate a fresh integer node and return its ref. `size` elements are
    /// zero-initialized at width 0 unless a wider start is requested.
    pub fn create(
        alloc: &mut Allocator,
        has_refs: bool,
        context_flag: bool,
        width: usize,
        size: usize,
    ) -> Result<Ref> {
        if size > MAX_NODE_SIZE {
            return Err(TabulaError::logic(format!("node size {size} out of range")));
        }
        let capacity = byte_size_for(WidthType::Bits, size, width);
        let pos = alloc.alloc(capacity)?;
        let mut h = NodeHeader::new(WidthType::Bits, has_refs, context_flag, width);
        h.size = size;
        h.capacity = capacity;
        h.encode(alloc.bytes_mut(pos, NODE_HEADER_SIZE)?);
        Ok(pos)
    }

    /// Bind an accessor to the node at `pos`, validating the header.
    pub fn attach(mem: &impl Mem, pos: Ref) -> Result<Self> {
        let header = NodeHeader::decode(mem.bytes(pos, NODE_HEADER_SIZE)?)?;
        if header.wtype != WidthType::Bits {
            return Err(TabulaError::corrupt(format!(
                "expected integer node at ref {pos}, found width-type {:?}",
                header.wtype
            )));
        }
        if header.capacity < NODE_HEADER_SIZE || header.byte_size() > header.capacity {
            return Err(TabulaError::corrupt(format!(
                "node at ref {pos} overflows its {}-byte capacity",
                header.capacity
            )));
        }
        // The whole node must be addressable before any getter runs.
        mem.bytes(pos, header.capacity)?;
        Ok(Self {
            pos,
            header,
            lbound: lbound_for_width(header.width),
            ubound: ubound_for_width(header.width),
            get_fn: getter_for(header.width),
            set_fn: setter_for(header.width),
        })
    }

    pub fn pos(&self) -> Ref {
        self.pos
    }

    pub fn size(&self) -> usize {
        self.header.size
    }

    pub fn is_empty(&self) -> bool {
        self.header.size == 0
    }

    pub fn width(&self) -> usize {
        self.header.width
    }

    pub fn has_refs(&self) -> bool {
        self.header.has_refs
    }

    /// Context flag doubles as the inner-B+-tree-node marker.
    pub fn is_inner_node(&self) -> bool {
        self.header.context_flag
    }

    pub fn capacity(&self) -> usize {
        self.header.capacity
    }

    fn payload<'m>(&self, mem: &'m impl Mem) -> Result<&'m [u8]> {
        mem.bytes(
            self.pos + NODE_HEADER_SIZE as u64,
            self.header.capacity - NODE_HEADER_SIZE,
        )
    }

    /// Element `i`. Constant time; panics on out-of-range index like slice
    /// indexing does (an out-of-range index here is an internal bug).
    pub fn get(&self, mem: &impl Mem, i: usize) -> i64 {
        debug_assert!(i < self.header.size, "index {i} out of range");
        let payload = self.payload(mem).expect("attached node must be readable");
        (self.get_fn)(payload, i)
    }

    pub fn get_ref_or_tagged(&self, mem: &impl Mem, i: usize) -> RefOrTagged {
        RefOrTagged::from_slot(self.get(mem, i) as u64)
    }

    /// Child ref at slot `i` of a has-refs node; 0 means null.
    pub fn get_child_ref(&self, mem: &impl Mem, i: usize) -> Result<Ref> {
        debug_assert!(self.header.has_refs);
        self.get_ref_or_tagged(mem, i)
            .as_ref_value()
            .ok_or_else(|| {
                TabulaError::corrupt(format!(
                    "slot {i} of node at ref {} holds a tagged value, expected a ref",
                    self.pos
                ))
            })
    }

    /// Overwrite element `i`. In place when the value fits the current width
    /// and the node is writable; otherwise stages a widen/copy first.
    pub fn set(&mut self, alloc: &mut Allocator, i: usize, value: i64) -> Result<()> {
        if i >= self.header.size {
            return Err(TabulaError::logic(format!(
                "set index {i} out of range (size {})",
                self.header.size
            )));
        }
        self.ensure(alloc, self.header.size, width_for_value(value))?;
        let payload = self.payload_mut(alloc)?;
        (self.set_fn)(payload, i, value);
        Ok(())
    }

    pub fn set_ref(&mut self, alloc: &mut Allocator, i: usize, child: Ref) -> Result<()> {
        debug_assert!(self.header.has_refs);
        self.set(alloc, i, RefOrTagged::make_ref(child).slot() as i64)
    }

    pub fn set_tagged(&mut self, alloc: &mut Allocator, i: usize, value: u64) -> Result<()> {
        self.set(alloc, i, RefOrTagged::make_tagged(value).slot() as i64)
    }

    /// Insert `value` at `i`, shifting `[i..size)` one slot right.
    pub fn insert(&mut self, alloc: &mut Allocator, i: usize, value: i64) -> Result<()> {
        if i > self.header.size {
            return Err(TabulaError::logic(format!(
                "insert index {i} out of range (size {})",
                self.header.size
            )));
        }
        if self.header.size >= MAX_NODE_SIZE {
            return Err(TabulaError::logic("node is at maximum element count"));
        }
        self.ensure(alloc, self.header.size + 1, width_for_value(value))?;

        let size = self.header.size;
        let width = self.header.width;
        let payload = self.payload_mut(alloc)?;
        if width >= 8 {
            let b = width / 8;
            payload.copy_within(i * b..size * b, (i + 1) * b);
        } else {
            let mut j = size;
            while j > i {
                let v = (self.get_fn)(payload, j - 1);
                (self.set_fn)(payload, j, v);
                j -= 1;
            }
        }
        (self.set_fn)(payload, i, value);
        self.set_size(alloc, size + 1)
    }

    pub fn push(&mut self, alloc: &mut Allocator, value: i64) -> Result<()> {
        self.insert(alloc, self.header.size, value)
    }

    pub fn push_ref(&mut self, alloc: &mut Allocator, child: Ref) -> Result<()> {
        self.push(alloc, RefOrTagged::make_ref(child).slot() as i64)
    }

    pub fn push_tagged(&mut self, alloc: &mut Allocator, value: u64) -> Result<()> {
        self.push(alloc, RefOrTagged::make_tagged(value).slot() as i64)
    }

    /// Remove element `i`, shifting `[i+1..size)` left. Sub-refs are not
    /// freed; deep destruction is the caller's responsibility.
    pub fn erase(&mut self, alloc: &mut Allocator, i: usize) -> Result<()> {
        self.erase_range(alloc, i, i + 1)
    }

    /// Remove `[begin..end)`.
    pub fn erase_range(&mut self, alloc: &mut Allocator, begin: usize, end: usize) -> Result<()> {
        let size = self.header.size;
        if begin > end || end > size {
            return Err(TabulaError::logic(format!(
                "erase range [{begin}, {end}) invalid for size {size}"
            )));
        }
        if begin == end {
            return Ok(());
        }
        self.ensure(alloc, size, 0)?;
        let width = self.header.width;
        let gap = end - begin;
        let payload = self.payload_mut(alloc)?;
        if width >= 8 {
            let b = width / 8;
            payload.copy_within(end * b..size * b, begin * b);
        } else {
            for j in end..size {
                let v = (self.get_fn)(payload, j);
                (self.set_fn)(payload, j - gap, v);
            }
        }
        self.set_size(alloc, size - gap)
    }

    /// Erase `[n..size)`. Width is deliberately left unchanged.
    pub fn truncate(&mut self, alloc: &mut Allocator, n: usize) -> Result<()> {
        if n > self.header.size {
            return Err(TabulaError::logic(format!(
                "truncate to {n} beyond size {}",
                self.header.size
            )));
        }
        self.ensure(alloc, self.header.size, 0)?;
        self.set_size(alloc, n)
    }

    /// Block-copy `[begin..end)` to `dest`. `dest` must not lie inside
    /// `(begin, end)`.
    pub fn move_range(
        &mut self,
        alloc: &mut Allocator,
        begin: usize,
        end: usize,
        dest: usize,
    ) -> Result<()> {
        let size = self.header.size;
        let n = end.saturating_sub(begin);
        if begin > end || end > size || dest + n > size {
            return Err(TabulaError::logic("move range out of bounds"));
        }
        if dest > begin && dest < end {
            return Err(TabulaError::logic("move destination overlaps source start"));
        }
        if n == 0 || dest == begin {
            return Ok(());
        }
        self.ensure(alloc, size, 0)?;
        let payload = self.payload_mut(alloc)?;
        if dest < begin {
            for k in 0..n {
                let v = (self.get_fn)(payload, begin + k);
                (self.set_fn)(payload, dest + k, v);
            }
        } else {
            for k in (0..n).rev() {
                let v = (self.get_fn)(payload, begin + k);
                (self.set_fn)(payload, dest + k, v);
            }
        }
        Ok(())
    }

    /// Add `diff` to element `i`.
    pub fn adjust(&mut self, alloc: &mut Allocator, i: usize, diff: i64) -> Result<()> {
        let v = self.get(alloc, i);
        let new = v
            .checked_add(diff)
            .ok_or_else(|| TabulaError::logic("adjust overflows 64 bits"))?;
        self.set(alloc, i, new)
    }

    /// Add `diff` to every element in `[begin..end)`.
    pub fn adjust_range(
        &mut self,
        alloc: &mut Allocator,
        begin: usize,
        end: usize,
        diff: i64,
    ) -> Result<()> {
        if begin > end || end > self.header.size {
            return Err(TabulaError::logic("adjust range out of bounds"));
        }
        if diff == 0 || begin == end {
            return Ok(());
        }
        // Stage the widen up front so a mid-loop failure cannot leave the
        // range half-adjusted.
        let mut needed = self.header.width;
        for i in begin..end {
            let v = self.get(alloc, i);
            let new = v
                .checked_add(diff)
                .ok_or_else(|| TabulaError::logic("adjust overflows 64 bits"))?;
            needed = needed.max(width_for_value(new));
        }
        self.ensure(alloc, self.header.size, needed)?;
        let payload = self.payload_mut(alloc)?;
        for i in begin..end {
            let v = (self.get_fn)(payload, i);
            (self.set_fn)(payload, i, v + diff);
        }
        Ok(())
    }

    /// Add `diff` to every element greater than or equal to `limit`.
    pub fn adjust_ge(&mut self, alloc: &mut Allocator, limit: i64, diff: i64) -> Result<()> {
        if diff == 0 {
            return Ok(());
        }
        let mut needed = self.header.width;
        for i in 0..self.header.size {
            let v = self.get(alloc, i);
            if v >= limit {
                let new = v
                    .checked_add(diff)
                    .ok_or_else(|| TabulaError::logic("adjust overflows 64 bits"))?;
                needed = needed.max(width_for_value(new));
            }
        }
        self.ensure(alloc, self.header.size, needed)?;
        let payload = self.payload_mut(alloc)?;
        for i in 0..self.header.size {
            let v = (self.get_fn)(payload, i);
            if v >= limit {
                (self.set_fn)(payload, i, v + diff);
            }
        }
        Ok(())
    }

    /// First index whose element is not less than `value`, assuming the
    /// array is sorted ascending.
    pub fn lower_bound(&self, mem: &impl Mem, value: i64) -> usize {
        let mut lo = 0;
        let mut hi = self.header.size;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mem, mid) < value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// First index whose element is greater than `value`, assuming the array
    /// is sorted ascending.
    pub fn upper_bound(&self, mem: &impl Mem, value: i64) -> usize {
        let mut lo = 0;
        let mut hi = self.header.size;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mem, mid) <= value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Widen the node (if needed) so that `value` can be stored without a
    /// further reallocation. Used ahead of bulk writes.
    pub fn ensure_minimum_width(&mut self, alloc: &mut Allocator, value: i64) -> Result<()> {
        self.ensure(alloc, self.header.size, width_for_value(value))
    }

    /// Wrapping sum of `[start..end)`.
    pub fn sum(&self, mem: &impl Mem, start: usize, end: usize) -> i64 {
        let end = end.min(self.header.size);
        let mut acc = 0i64;
        for i in start..end {
            acc = acc.wrapping_add(self.get(mem, i));
        }
        acc
    }

    /// Minimum of `[start..end)` with the smallest index achieving it.
    pub fn minimum(&self, mem: &impl Mem, start: usize, end: usize) -> Option<(i64, usize)> {
        let end = end.min(self.header.size);
        let mut best: Option<(i64, usize)> = None;
        for i in start..end {
            let v = self.get(mem, i);
            if best.map_or(true, |(bv, _)| v < bv) {
                best = Some((v, i));
            }
        }
        best
    }

    /// Maximum of `[start..end)` with the smallest index achieving it.
    pub fn maximum(&self, mem: &impl Mem, start: usize, end: usize) -> Option<(i64, usize)> {
        let end = end.min(self.header.size);
        let mut best: Option<(i64, usize)> = None;
        for i in start..end {
            let v = self.get(mem, i);
            if best.map_or(true, |(bv, _)| v > bv) {
                best = Some((v, i));
            }
        }
        best
    }

    /// Recursively free the node at `pos` and, for has-refs nodes, every
    /// child reachable through untagged non-null slots.
    pub fn destroy_deep(alloc: &mut Allocator, pos: Ref) -> Result<()> {
        let arr = Array::attach(alloc, pos)?;
        let capacity = arr.header.capacity;
        if arr.header.has_refs {
            let mut children = Vec::new();
            for i in 0..arr.header.size {
                if let Some(child) = arr.get_ref_or_tagged(alloc, i).as_ref_value() {
                    if child != 0 {
                        children.push(child);
                    }
                }
            }
            for child in children {
                Self::destroy_deep(alloc, child)?;
            }
        }
        alloc.free(pos, capacity);
        Ok(())
    }

    /// Copy this node into writable memory if it currently lives below the
    /// committed watermark. Returns true when the ref changed, so the caller
    /// can propagate the new ref into the parent slot.
    pub fn cow(&mut self, alloc: &mut Allocator) -> Result<bool> {
        let before = self.pos;
        self.ensure(alloc, self.header.size, 0)?;
        Ok(self.pos != before)
    }

    fn payload_mut<'a>(&self, alloc: &'a mut Allocator) -> Result<&'a mut [u8]> {
        debug_assert!(!alloc.is_read_only(self.pos), "mutating committed memory");
        alloc.bytes_mut(
            self.pos + NODE_HEADER_SIZE as u64,
            self.header.capacity - NODE_HEADER_SIZE,
        )
    }

    fn set_size(&mut self, alloc: &mut Allocator, size: usize) -> Result<()> {
        self.header.size = size;
        self.write_header(alloc)
    }

    fn write_header(&mut self, alloc: &mut Allocator) -> Result<()> {
        self.header
            .encode(alloc.bytes_mut(self.pos, NODE_HEADER_SIZE)?);
        Ok(())
    }

    /// Make the node writable, wide enough for `min_width`, and large enough
    /// for `size_hint` elements, reallocating at most once. The staging
    /// order (allocate, copy, publish, free) gives the strong guarantee.
    fn ensure(&mut self, alloc: &mut Allocator, size_hint: usize, min_width: usize) -> Result<()> {
        let target_width = self.header.width.max(min_width);
        let needed = byte_size_for(WidthType::Bits, size_hint, target_width);
        let widen = target_width != self.header.width;
        let grow = needed > self.header.capacity;
        let cow = alloc.is_read_only(self.pos);
        if !widen && !grow && !cow {
            return Ok(());
        }

        let new_capacity = if grow {
            // Leave headroom so a run of inserts does not reallocate per
            // element.
            needed.max(self.header.capacity + self.header.capacity / 2)
        } else {
            byte_size_for(WidthType::Bits, self.header.size.max(size_hint), target_width)
        };
        let new_capacity = ((new_capacity + 7) & !7).min(MAX_NODE_SIZE);
        if new_capacity < needed {
            return Err(TabulaError::logic("node capacity limit exceeded"));
        }

        let new_pos = alloc.alloc(new_capacity)?;

        if widen {
            let old_payload = self.payload(alloc)?.to_vec();
            let old_get = self.get_fn;
            let new_set = setter_for(target_width);
            let new_payload = alloc.bytes_mut(
                new_pos + NODE_HEADER_SIZE as u64,
                new_capacity - NODE_HEADER_SIZE,
            )?;
            for i in 0..self.header.size {
                new_set(new_payload, i, old_get(&old_payload, i));
            }
        } else {
            let used = self.header.payload_bytes();
            let src = self.pos + NODE_HEADER_SIZE as u64;
            let dst = new_pos + NODE_HEADER_SIZE as u64;
            let bytes = alloc.bytes(src, used)?.to_vec();
            alloc.bytes_mut(dst, used)?.copy_from_slice(&bytes);
        }

        alloc.free(self.pos, self.header.capacity);
        self.pos = new_pos;
        self.header.width = target_width;
        self.header.capacity = new_capacity;
        self.lbound = lbound_for_width(target_width);
        self.ubound = ubound_for_width(target_width);
        self.get_fn = getter_for(target_width);
        self.set_fn = setter_for(target_width);
        self.write_header(alloc)
    }

    pub(crate) fn bounds(&self) -> (i64, i64) {
        (self.lbound, self.ubound)
    }
}
