//! Persistent free-space bookkeeping.
//!
//! The reusable free list is stored in the top node as three parallel
//! integer arrays: positions, sizes, and the write version that released
//! each region. The in-memory mirror lives on the allocator; it is loaded
//! at `begin_write` and re-serialized during commit, with the allocator in
//! bump-only mode so the arrays cannot consume the blocks they record.

use tracing::warn;

use crate::array::Array;
use crate::error::{Result, TabulaError};
use crate::mem::{Allocator, FreeBlock, Mem};
use crate::types::Ref;

/// Read the three free arrays into allocator form.
pub fn load(
    mem: &impl Mem,
    positions_ref: Ref,
    sizes_ref: Ref,
    versions_ref: Ref,
) -> Result<Vec<FreeBlock>> {
    let positions = Array::attach(mem, positions_ref)?;
    let sizes = Array::attach(mem, sizes_ref)?;
    let versions = Array::attach(mem, versions_ref)?;
    if positions.size() != sizes.size() || positions.size() != versions.size() {
        return Err(TabulaError::corrupt(
            "free-list arrays have mismatched lengths",
        ));
    }
    let mut blocks = Vec::with_capacity(positions.size());
    for i in 0..positions.size() {
        let pos = positions.get(mem, i);
        let size = sizes.get(mem, i);
        if pos < 0 || size <= 0 {
            return Err(TabulaError::corrupt(format!(
                "free-list entry {i} is degenerate (pos {pos}, size {size})"
            )));
        }
        blocks.push(FreeBlock {
            pos: pos as u64,
            size: size as usize,
            version: versions.get(mem, i) as u64,
        });
    }
    Ok(blocks)
}

/// Serialize `blocks` into three fresh arrays, freeing the old ones, and
/// return the new refs as `(positions, sizes, versions)`.
pub fn store(
    alloc: &mut Allocator,
    old_positions: Ref,
    old_sizes: Ref,
    old_versions: Ref,
    blocks: &[FreeBlock],
) -> Result<(Ref, Ref, Ref)> {
    debug_assert!(blocks.iter().all(|b| b.size > 0));
    let positions_ref = Array::create(alloc, false, false, 0, 0)?;
    let mut positions = Array::attach(alloc, positions_ref)?;
    let sizes_ref = Array::create(alloc, false, false, 0, 0)?;
    let mut sizes = Array::attach(alloc, sizes_ref)?;
    let versions_ref = Array::create(alloc, false, false, 0, 0)?;
    let mut versions = Array::attach(alloc, versions_ref)?;

    for block in blocks {
        if block.pos > i64::MAX as u64 {
            warn!(pos = block.pos, "free block beyond representable range");
            continue;
        }
        positions.push(alloc, block.pos as i64)?;
        sizes.push(alloc, block.size as i64)?;
        versions.push(alloc, block.version as i64)?;
    }

    for old in [old_positions, old_sizes, old_versions] {
        let arr = Array::attach(alloc, old)?;
        let capacity = arr.capacity();
        alloc.free(old, capacity);
    }

    Ok((positions.pos(), sizes.pos(), versions.pos()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_arrays() {
        let mut alloc = Allocator::heap();
        let p = Array::create(&mut alloc, false, false, 0, 0).unwrap();
        let s = Array::create(&mut alloc, false, false, 0, 0).unwrap();
        let v = Array::create(&mut alloc, false, false, 0, 0).unwrap();

        let blocks = vec![
            FreeBlock {
                pos: 1024,
                size: 64,
                version: 3,
            },
            FreeBlock {
                pos: 8192,
                size: 256,
                version: 7,
            },
        ];
        let (p2, s2, v2) = store(&mut alloc, p, s, v, &blocks).unwrap();
        let loaded = load(&alloc, p2, s2, v2).unwrap();
        assert_eq!(loaded, blocks);

        // The superseded arrays were queued for release.
        let freed: Vec<_> = alloc.pending().iter().map(|f| f.pos).collect();
        assert!(freed.contains(&p) && freed.contains(&s) && freed.contains(&v));
    }

    #[test]
    fn load_rejects_mismatched_arrays() {
        let mut alloc = Allocator::heap();
        let p = Array::create(&mut alloc, false, false, 0, 0).unwrap();
        let mut parr = Array::attach(&alloc, p).unwrap();
        parr.push(&mut alloc, 64).unwrap();
        let s = Array::create(&mut alloc, false, false, 0, 0).unwrap();
        let v = Array::create(&mut alloc, false, false, 0, 0).unwrap();
        assert!(load(&alloc, parr.pos(), s, v).is_err());
    }
}
