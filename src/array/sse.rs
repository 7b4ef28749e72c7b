//! SSE4.2 block scan for the find kernel (x86_64 only).
//!
//! Processes 16-byte aligned blocks with packed comparisons for widths 8,
//! 16, 32 and 64. The caller splits the range: unaligned head and tail go
//! through the scalar word loop, the aligned middle lands here. 64-bit
//! `Less` is never routed here; it stays on the scalar path.
//!
//! Matches are reported to the same [`QueryState`] in ascending index
//! order, so the SIMD and scalar paths produce identical match sets.

use std::arch::x86_64::{
    __m128i, _mm_cmpeq_epi16, _mm_cmpeq_epi32, _mm_cmpeq_epi64, _mm_cmpeq_epi8, _mm_cmpgt_epi16,
    _mm_cmpgt_epi32, _mm_cmpgt_epi64, _mm_cmpgt_epi8, _mm_load_si128, _mm_movemask_epi8,
    _mm_set1_epi16, _mm_set1_epi32, _mm_set1_epi64x, _mm_set1_epi8,
};

use super::find::{get_elem, CondK, QueryState};

pub(crate) fn available() -> bool {
    std::arch::is_x86_feature_detected!("sse4.2")
}

/// Largest `[mid_start, mid_end)` element range inside `[start, end)` whose
/// payload bytes start 16-byte aligned and span whole 16-byte blocks.
pub(crate) fn aligned_range(
    payload: &[u8],
    width: usize,
    start: usize,
    end: usize,
) -> (usize, usize) {
    let bytes_per = width / 8;
    let base = payload.as_ptr() as usize;
    let start_byte = start * bytes_per;
    // Mapped payloads start 8-aligned, making the pad below a whole number
    // of elements; an arbitrarily-aligned buffer that breaks that falls
    // back to the scalar path.
    if (base + start_byte) % bytes_per != 0 {
        return (0, 0);
    }
    let pad = (16 - (base + start_byte) % 16) % 16;
    let mid_start_byte = start_byte + pad;
    let end_byte = end * bytes_per;
    if mid_start_byte + 16 > end_byte {
        return (0, 0);
    }
    let mid_end_byte = mid_start_byte + (end_byte - mid_start_byte) / 16 * 16;
    (mid_start_byte / bytes_per, mid_end_byte / bytes_per)
}

/// Scan `[start, end)` (16-byte aligned, whole blocks) reporting matches.
/// Returns false when the scan stopped early.
pub(crate) fn search(
    ck: CondK,
    needle: i64,
    width: usize,
    payload: &[u8],
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    debug_assert!(matches!(width, 8 | 16 | 32 | 64));
    debug_assert!(!(ck == CondK::Lt && width == 64));
    // Safety: `available()` was checked by the caller and the range was
    // produced by `aligned_range`, so loads are aligned and in bounds.
    unsafe { search_blocks(ck, needle, width, payload, start, end, baseindex, state) }
}

#[target_feature(enable = "sse4.2")]
#[allow(clippy::too_many_arguments)]
unsafe fn search_blocks(
    ck: CondK,
    needle: i64,
    width: usize,
    payload: &[u8],
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    let bytes_per = width / 8;
    let per_block = 16 / bytes_per;
    let mut i = start;
    while i < end {
        if !state.keep_going() {
            return false;
        }
        let block = _mm_load_si128(payload.as_ptr().add(i * bytes_per) as *const __m128i);
        let mask = compare_block(ck, needle, width, block);
        let mut bits = _mm_movemask_epi8(mask) as u32;
        if ck == CondK::Neq {
            bits = !bits & 0xffff;
        }
        if bits != 0 {
            for k in 0..per_block {
                if bits & (1 << (k * bytes_per)) != 0 {
                    let v = get_elem(payload, i + k, width);
                    if !state.match_at(i + k + baseindex, Some(v)) {
                        return false;
                    }
                }
            }
        }
        i += per_block;
    }
    true
}

#[target_feature(enable = "sse4.2")]
unsafe fn compare_block(ck: CondK, needle: i64, width: usize, block: __m128i) -> __m128i {
    // NotEqual compares for equality; the caller inverts the mask.
    match (ck, width) {
        (CondK::Eq | CondK::Neq, 8) => _mm_cmpeq_epi8(block, _mm_set1_epi8(needle as i8)),
        (CondK::Eq | CondK::Neq, 16) => _mm_cmpeq_epi16(block, _mm_set1_epi16(needle as i16)),
        (CondK::Eq | CondK::Neq, 32) => _mm_cmpeq_epi32(block, _mm_set1_epi32(needle as i32)),
        (CondK::Eq | CondK::Neq, 64) => _mm_cmpeq_epi64(block, _mm_set1_epi64x(needle)),
        (CondK::Gt, 8) => _mm_cmpgt_epi8(block, _mm_set1_epi8(needle as i8)),
        (CondK::Gt, 16) => _mm_cmpgt_epi16(block, _mm_set1_epi16(needle as i16)),
        (CondK::Gt, 32) => _mm_cmpgt_epi32(block, _mm_set1_epi32(needle as i32)),
        (CondK::Gt, 64) => _mm_cmpgt_epi64(block, _mm_set1_epi64x(needle)),
        (CondK::Lt, 8) => _mm_cmpgt_epi8(_mm_set1_epi8(needle as i8), block),
        (CondK::Lt, 16) => _mm_cmpgt_epi16(_mm_set1_epi16(needle as i16), block),
        (CondK::Lt, 32) => _mm_cmpgt_epi32(_mm_set1_epi32(needle as i32), block),
        _ => unreachable!("unsupported SSE comparison"),
    }
}
