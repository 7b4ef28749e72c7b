//! The parameterised find/aggregate kernel.
//!
//! One routine serves every search and aggregation over an integer node.
//! It is parameterised by comparison, by aggregate action (carried in
//! [`QueryState`]), and by bit width; the hot loops are monomorphised per
//! (comparison, width) pair and walk the payload in 64-bit words, using
//! bithack predicates to skip words with no candidate match:
//!
//! - equality: XOR with the replicated needle, then a zero-element cascade;
//! - greater/less on non-negative domains: the saturating-subtract magic
//!   trick;
//! - `can_match`/`will_match` pre-tests against the node's width bounds
//!   skip or bulk-process entire nodes.
//!
//! On x86_64 with SSE4.2 the aligned middle of the range is scanned in
//! 128-bit blocks (widths 8..64; 64-bit `Less` stays scalar). The SIMD and
//! scalar paths must produce identical match sets.

use crate::array::Array;
use crate::error::{Result, TabulaError};
use crate::mem::Mem;
use crate::types::NODE_HEADER_SIZE;

/// Comparison operators accepted by the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
}

impl Cond {
    pub fn matches(self, v: i64, target: i64) -> bool {
        match self {
            Self::Equal => v == target,
            Self::NotEqual => v != target,
            Self::Less => v < target,
            Self::Greater => v > target,
            Self::LessEqual => v <= target,
            Self::GreaterEqual => v >= target,
        }
    }
}

/// Kernel-internal comparison set. `LessEqual`/`GreaterEqual` are folded
/// into `Less`/`Greater` with an adjusted needle; the saturated cases
/// become `All`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CondK {
    Eq,
    Neq,
    Lt,
    Gt,
    All,
}

pub(crate) fn normalize(cond: Cond, value: i64) -> (CondK, i64) {
    match cond {
        Cond::Equal => (CondK::Eq, value),
        Cond::NotEqual => (CondK::Neq, value),
        Cond::Less => (CondK::Lt, value),
        Cond::Greater => (CondK::Gt, value),
        Cond::LessEqual => match value.checked_add(1) {
            Some(v) => (CondK::Lt, v),
            None => (CondK::All, value),
        },
        Cond::GreaterEqual => match value.checked_sub(1) {
            Some(v) => (CondK::Gt, v),
            None => (CondK::All, value),
        },
    }
}

impl CondK {
    fn test(self, v: i64, target: i64) -> bool {
        match self {
            Self::Eq => v == target,
            Self::Neq => v != target,
            Self::Lt => v < target,
            Self::Gt => v > target,
            Self::All => true,
        }
    }

    /// Could any value in `[lb, ub]` match?
    fn can_match(self, target: i64, lb: i64, ub: i64) -> bool {
        match self {
            Self::Eq => lb <= target && target <= ub,
            Self::Neq => !(lb == ub && lb == target),
            Self::Lt => lb < target,
            Self::Gt => ub > target,
            Self::All => true,
        }
    }

    /// Must every value in `[lb, ub]` match?
    fn will_match(self, target: i64, lb: i64, ub: i64) -> bool {
        match self {
            Self::Eq => lb == ub && lb == target,
            Self::Neq => target < lb || target > ub,
            Self::Lt => ub < target,
            Self::Gt => lb > target,
            Self::All => true,
        }
    }
}

/// Aggregate accumulator, one variant per action.
pub enum Acc<'a> {
    /// Stop at the first match, recording its index.
    ReturnFirst(Option<usize>),
    /// Collect every matching index.
    FindAll(Vec<usize>),
    Count(u64),
    Sum(i64),
    /// Minimum value with the smallest index achieving it.
    Min(Option<(i64, usize)>),
    /// Maximum value with the smallest index achieving it.
    Max(Option<(i64, usize)>),
    /// Invoke a callback per match; the callback may stop the scan.
    Callback(&'a mut dyn FnMut(usize) -> bool),
}

/// Scan state threaded through the kernel: the accumulator plus the match
/// counter and early-exit limit.
pub struct QueryState<'a> {
    pub acc: Acc<'a>,
    pub match_count: usize,
    pub limit: usize,
}

impl<'a> QueryState<'a> {
    pub fn new(acc: Acc<'a>, limit: usize) -> Self {
        Self {
            acc,
            match_count: 0,
            limit,
        }
    }

    pub fn first() -> Self {
        Self::new(Acc::ReturnFirst(None), 1)
    }

    pub fn find_all(limit: usize) -> Self {
        Self::new(Acc::FindAll(Vec::new()), limit)
    }

    pub fn count(limit: usize) -> Self {
        Self::new(Acc::Count(0), limit)
    }

    pub fn sum() -> Self {
        Self::new(Acc::Sum(0), usize::MAX)
    }

    pub fn min() -> Self {
        Self::new(Acc::Min(None), usize::MAX)
    }

    pub fn max() -> Self {
        Self::new(Acc::Max(None), usize::MAX)
    }

    pub fn callback(f: &'a mut dyn FnMut(usize) -> bool) -> Self {
        Self::new(Acc::Callback(f), usize::MAX)
    }

    pub fn keep_going(&self) -> bool {
        self.match_count < self.limit
    }

    /// Record a match at global `index`. `value` is `None` for a null
    /// element (nullable arrays only). Returns false to stop the scan.
    pub fn match_at(&mut self, index: usize, value: Option<i64>) -> bool {
        self.match_count += 1;
        match &mut self.acc {
            Acc::ReturnFirst(slot) => {
                *slot = Some(index);
                return false;
            }
            Acc::FindAll(v) => v.push(index),
            Acc::Count(n) => *n += 1,
            Acc::Sum(s) => {
                if let Some(v) = value {
                    *s = s.wrapping_add(v);
                }
            }
            Acc::Min(best) => {
                if let Some(v) = value {
                    if best.map_or(true, |(bv, _)| v < bv) {
                        *best = Some((v, index));
                    }
                }
            }
            Acc::Max(best) => {
                if let Some(v) = value {
                    if best.map_or(true, |(bv, _)| v > bv) {
                        *best = Some((v, index));
                    }
                }
            }
            Acc::Callback(f) => {
                if !f(index) {
                    return false;
                }
            }
        }
        self.match_count < self.limit
    }
}

/// Replicate the low `w` bits of `v` across a 64-bit word.
#[inline]
fn replicate(v: i64, w: usize) -> u64 {
    if w == 64 {
        return v as u64;
    }
    let mask = (1u64 << w) - 1;
    (v as u64 & mask).wrapping_mul(!0u64 / mask)
}

/// Bit pattern with the lowest bit of each `w`-bit element set.
#[inline]
fn lower_bits(w: usize) -> u64 {
    match w {
        1 => !0u64,
        2 => 0x5555_5555_5555_5555,
        4 => 0x1111_1111_1111_1111,
        8 => 0x0101_0101_0101_0101,
        16 => 0x0001_0001_0001_0001,
        32 => 0x0000_0001_0000_0001,
        _ => 0x0000_0000_0000_0001,
    }
}

/// True when some `w`-bit element of `word` is zero (the classic
/// subtract-and-mask zero-byte test, generalised per width).
#[inline]
fn has_zero_element(word: u64, w: usize) -> bool {
    if w == 64 {
        return word == 0;
    }
    let lower = lower_bits(w);
    let upper = lower << (w - 1);
    (word.wrapping_sub(lower)) & !word & upper != 0
}

/// Extract the `k`-th `w`-bit element from a word, sign-extending widths
/// of 8 and above.
#[inline]
fn elem_from_word(word: u64, k: usize, w: usize) -> i64 {
    if w == 64 {
        return word as i64;
    }
    let raw = (word >> (k * w)) & ((1u64 << w) - 1);
    if w >= 8 {
        let shift = 64 - w;
        ((raw << shift) as i64) >> shift
    } else {
        raw as i64
    }
}

/// Magic constant for the greater/less chunk predicate. Valid only when
/// every element in the chunk and the needle are non-negative.
#[inline]
fn gtlt_magic(gt: bool, v: i64, w: usize) -> u64 {
    let mask1 = if w == 64 { !0u64 } else { (1u64 << w) - 1 };
    let mask2 = mask1 >> 1;
    let unit = !0u64 / mask1;
    if gt {
        unit.wrapping_mul(mask2.wrapping_sub(v as u64) & mask1)
    } else {
        unit.wrapping_mul(v as u64 & mask1)
    }
}

/// Does `chunk` contain an element greater than (`gt`) or less than the
/// needle baked into `magic`? Elements must be non-negative.
#[inline]
fn gtlt_chunk_hit(gt: bool, chunk: u64, magic: u64, w: usize) -> bool {
    let mask1 = if w == 64 { !0u64 } else { (1u64 << w) - 1 };
    let mask2 = mask1 >> 1;
    let high = (!0u64 / mask1).wrapping_mul(mask2 + 1);
    let m = if gt {
        (chunk.wrapping_add(magic) | chunk) & high
    } else {
        chunk.wrapping_sub(magic) & !chunk & high
    };
    m != 0
}

/// Run the kernel over `[start..end)` of an integer node, reporting global
/// indices offset by `baseindex`. Returns `Ok(true)` to continue on
/// following leaves, `Ok(false)` when the scan stopped early.
pub fn find_in_array(
    arr: &Array,
    mem: &impl Mem,
    cond: Cond,
    value: i64,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> Result<bool> {
    let end = end.min(arr.size());
    if start > end {
        return Err(TabulaError::logic(format!(
            "find range [{start}, {end}) inverted"
        )));
    }
    if start == end || !state.keep_going() {
        return Ok(state.keep_going());
    }

    let (ck, needle) = normalize(cond, value);
    let (lb, ub) = arr.bounds();

    if !ck.can_match(needle, lb, ub) {
        return Ok(true);
    }
    if ck.will_match(needle, lb, ub) {
        return Ok(bulk_match(arr, mem, start, end, baseindex, state));
    }

    let width = arr.width();
    debug_assert!(width > 0, "width-0 nodes are fully decided by the bounds");
    let payload = mem.bytes(
        arr.pos() + NODE_HEADER_SIZE as u64,
        arr.capacity() - NODE_HEADER_SIZE,
    )?;

    if let Some(done) = simd_search(ck, needle, width, payload, start, end, baseindex, state) {
        return Ok(done);
    }
    Ok(scalar_search(
        ck, needle, width, payload, start, end, baseindex, state,
    ))
}

/// Try the 128-bit block path: scalar head, SSE4.2 aligned middle, scalar
/// tail. `None` means the range was not eligible and the caller should run
/// the plain scalar scan.
#[cfg(target_arch = "x86_64")]
#[allow(clippy::too_many_arguments)]
fn simd_search(
    ck: CondK,
    needle: i64,
    width: usize,
    payload: &[u8],
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> Option<bool> {
    use crate::array::sse;

    let eligible = width >= 8
        && !(ck == CondK::Lt && width == 64)
        && end - start >= 64 / (width / 8)
        && sse::available();
    if !eligible {
        return None;
    }
    let (mid_start, mid_end) = sse::aligned_range(payload, width, start, end);
    if mid_start >= mid_end {
        return None;
    }
    if !scalar_search(ck, needle, width, payload, start, mid_start, baseindex, state) {
        return Some(false);
    }
    if !sse::search(ck, needle, width, payload, mid_start, mid_end, baseindex, state) {
        return Some(false);
    }
    Some(scalar_search(
        ck, needle, width, payload, mid_end, end, baseindex, state,
    ))
}

#[cfg(not(target_arch = "x86_64"))]
#[allow(clippy::too_many_arguments)]
fn simd_search(
    _ck: CondK,
    _needle: i64,
    _width: usize,
    _payload: &[u8],
    _start: usize,
    _end: usize,
    _baseindex: usize,
    _state: &mut QueryState<'_>,
) -> Option<bool> {
    None
}

/// Every element in range matches: apply the action in bulk.
fn bulk_match(
    arr: &Array,
    mem: &impl Mem,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    let remaining = state.limit - state.match_count;
    let end = end.min(start.saturating_add(remaining));
    let n = end - start;
    if !matches!(
        state.acc,
        Acc::Count(_) | Acc::Sum(_) | Acc::Min(_) | Acc::Max(_)
    ) {
        for i in start..end {
            let v = arr.get(mem, i);
            if !state.match_at(i + baseindex, Some(v)) {
                return false;
            }
        }
        return state.keep_going();
    }
    match &mut state.acc {
        Acc::Count(c) => *c += n as u64,
        Acc::Sum(s) => *s = s.wrapping_add(arr.sum(mem, start, end)),
        Acc::Min(best) => {
            if let Some((v, i)) = arr.minimum(mem, start, end) {
                if best.map_or(true, |(bv, _)| v < bv) {
                    *best = Some((v, i + baseindex));
                }
            }
        }
        Acc::Max(best) => {
            if let Some((v, i)) = arr.maximum(mem, start, end) {
                if best.map_or(true, |(bv, _)| v > bv) {
                    *best = Some((v, i + baseindex));
                }
            }
        }
        _ => unreachable!(),
    }
    state.match_count += n;
    state.keep_going()
}

/// Word-at-a-time scalar scan. Returns false when the scan stopped early.
#[allow(clippy::too_many_arguments)]
pub(crate) fn scalar_search(
    ck: CondK,
    needle: i64,
    width: usize,
    payload: &[u8],
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    debug_assert!(width > 0);
    let per_word = 64 / width;
    let mut i = start;

    // Leading elements up to a word boundary.
    let head_end = end.min((start + per_word - 1) / per_word * per_word);
    while i < head_end {
        let v = get_elem(payload, i, width);
        if ck.test(v, needle) && !state.match_at(i + baseindex, Some(v)) {
            return false;
        }
        i += 1;
    }

    // The greater/less chunk predicate needs every element and the needle
    // to keep their per-element high bit clear, which only the unsigned
    // sub-byte widths can guarantee (for elements: conservatively, via the
    // needle bound below). Equality is sign-agnostic.
    let chunkable = match ck {
        CondK::Eq | CondK::Neq => true,
        CondK::Lt | CondK::Gt => {
            width < 8 && needle >= 0 && (needle as u64) <= ((1u64 << width) - 1) >> 1
        }
        CondK::All => false,
    };
    let eq_magic = replicate(needle, width);
    let gt = ck == CondK::Gt;
    let ineq_magic = if chunkable && !matches!(ck, CondK::Eq | CondK::Neq) {
        gtlt_magic(gt, needle, width)
    } else {
        0
    };

    while i + per_word <= end {
        let word = super::bits::word_at(payload, i / per_word);
        let hit = if !chunkable {
            true
        } else {
            match ck {
                CondK::Eq => has_zero_element(word ^ eq_magic, width),
                CondK::Neq => word ^ eq_magic != 0,
                CondK::Lt | CondK::Gt => gtlt_chunk_hit(gt, word, ineq_magic, width),
                CondK::All => true,
            }
        };
        if hit {
            for k in 0..per_word {
                let v = elem_from_word(word, k, width);
                if ck.test(v, needle) && !state.match_at(i + k + baseindex, Some(v)) {
                    return false;
                }
            }
        }
        i += per_word;
    }

    // Tail.
    while i < end {
        let v = get_elem(payload, i, width);
        if ck.test(v, needle) && !state.match_at(i + baseindex, Some(v)) {
            return false;
        }
        i += 1;
    }
    true
}

#[inline]
pub(crate) fn get_elem(payload: &[u8], i: usize, width: usize) -> i64 {
    (super::bits::getter_for(width))(payload, i)
}

/// Kernel entry for nullable nodes: physical index 0 holds the sentinel and
/// logical element `i` lives at physical `i+1`. A `None` value searches for
/// nulls (Equal) or non-nulls (NotEqual).
pub fn find_in_nullable(
    arr: &Array,
    mem: &impl Mem,
    cond: Cond,
    value: Option<i64>,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> Result<bool> {
    if arr.size() == 0 {
        return Err(TabulaError::corrupt("nullable node missing its sentinel"));
    }
    let logical_size = arr.size() - 1;
    let end = end.min(logical_size);
    if start > end {
        return Err(TabulaError::logic(format!(
            "find range [{start}, {end}) inverted"
        )));
    }
    let sentinel = arr.get(mem, 0);
    for i in start..end {
        if !state.keep_going() {
            return Ok(false);
        }
        let raw = arr.get(mem, i + 1);
        let is_null = raw == sentinel;
        let hit = match value {
            None => match cond {
                Cond::Equal => is_null,
                Cond::NotEqual => !is_null,
                _ => false,
            },
            Some(target) => match cond {
                Cond::NotEqual => is_null || raw != target,
                c => !is_null && c.matches(raw, target),
            },
        };
        if hit {
            let v = if is_null { None } else { Some(raw) };
            if !state.match_at(i + baseindex, v) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}
