//! A shared mapping of the database file.
//!
//! Snapshots hold an `Arc<MapRegion>` captured at `begin_read`; the writer
//! replaces the allocator's region on growth, so a superseded region stays
//! alive exactly as long as some snapshot still translates refs through it.
//! All mappings of one file share the same underlying pages, so a snapshot
//! bound to an older (shorter) region still observes committed bytes.

use std::fs::File;

use memmap2::MmapMut;

use crate::error::{Result, TabulaError};

pub struct MapRegion {
    map: MmapMut,
    ptr: *mut u8,
    len: usize,
}

// The raw pointer is derived from the owned mapping and the mapping is never
// moved out; sharing follows the writer/reader disjointness protocol (readers
// only touch offsets below their version's watermark).
unsafe impl Send for MapRegion {}
unsafe impl Sync for MapRegion {}

impl MapRegion {
    pub fn map(file: &File) -> Result<Self> {
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Err(TabulaError::corrupt("cannot map an empty file"));
        }
        if file_len > usize::MAX as u64 {
            return Err(TabulaError::corrupt("file exceeds addressable memory"));
        }
        let mut map = unsafe { MmapMut::map_mut(file)? };
        let ptr = map.as_mut_ptr();
        let len = map.len();
        Ok(Self { map, ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self, pos: u64, len: usize) -> Result<&[u8]> {
        let end = pos
            .checked_add(len as u64)
            .ok_or_else(|| TabulaError::corrupt("region range overflow"))?;
        if end > self.len as u64 {
            return Err(TabulaError::corrupt(format!(
                "read of [{pos}, {end}) beyond mapped length {}",
                self.len
            )));
        }
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(pos as usize), len) })
    }

    /// Caller must guarantee the range is in bounds and not aliased by a
    /// concurrent reader (i.e. it lies at or above every live snapshot's
    /// watermark).
    pub(crate) unsafe fn slice_mut(&self, pos: usize, len: usize) -> &mut [u8] {
        debug_assert!(pos + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(pos), len)
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }
}
