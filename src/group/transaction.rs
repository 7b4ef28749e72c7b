//! Read snapshots and write transactions.
//!
//! A snapshot binds to the top ref observed at `begin_read` and stays on
//! that version for its whole life, whatever later commits do. A write
//! transaction holds the in-process writer mutex plus the inter-process
//! file lock and publishes its work with the two-slot commit protocol:
//!
//! 1. finish all copy-on-write mutations (dirty top fully written),
//! 2. sync the new regions,
//! 3. write the new top ref into the inactive header slot, sync,
//! 4. flip the active-slot byte — the linearisation point,
//! 5. merge the newly unreferenced pending frees and release the lock.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::array::strings::StringArray;
use crate::array::Array;
use crate::error::{Result, TabulaError};
use crate::group::config::Durability;
use crate::group::header::{FileHeader, ACTIVE_BYTE_OFFSET, FILE_HEADER_SIZE};
use crate::group::lock::WriteLockGuard;
use crate::group::{
    Group, ReaderRegistry, WriterState, TOP_FREE_POSITIONS, TOP_FREE_SIZES, TOP_FREE_VERSIONS,
    TOP_NAMES, TOP_SLOT_COUNT, TOP_TABLES, TOP_VERSION,
};
use crate::mem::{MapRegion, Mem};
use crate::metrics::Metrics;
use crate::table::{GroupRead, TableMut, TableRead};
use crate::types::Ref;

/// A read-only view of one committed version.
pub struct Snapshot {
    region: Arc<MapRegion>,
    top_ref: Ref,
    version: u64,
    readers: ReaderRegistry,
    max_leaf: usize,
    opened_at: Instant,
    metrics: Option<Arc<Mutex<Metrics>>>,
}

impl Snapshot {
    pub(crate) fn bind(
        region: Arc<MapRegion>,
        top_ref: Ref,
        version: u64,
        readers: ReaderRegistry,
        max_leaf: usize,
        metrics: Option<Arc<Mutex<Metrics>>>,
    ) -> Self {
        *readers.lock().entry(version).or_insert(0) += 1;
        trace!(version, top_ref, "read transaction bound");
        Self {
            region,
            top_ref,
            version,
            readers,
            max_leaf,
            opened_at: Instant::now(),
            metrics,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn top_ref(&self) -> Ref {
        self.top_ref
    }

    fn read(&self) -> GroupRead<'_, Self> {
        GroupRead::new(self, self.top_ref, self.max_leaf, self.metrics.clone())
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        self.read().table_names()
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        Ok(self.read().find_table(name)?.is_some())
    }

    pub fn table(&self, name: &str) -> Result<TableRead<'_, Self>> {
        let reader = self.read();
        let idx = reader.find_table(name)?.ok_or_else(|| {
            TabulaError::logic(format!("no table named '{name}' in this snapshot"))
        })?;
        reader.table(idx)
    }
}

impl Mem for Snapshot {
    fn bytes(&self, pos: u64, len: usize) -> Result<&[u8]> {
        self.region.bytes(pos, len)
    }

    fn region_len(&self) -> u64 {
        self.region.len() as u64
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&self.version) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&self.version);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.lock().record_read_transaction(self.opened_at.elapsed());
        }
        trace!(version = self.version, "read transaction released");
    }
}

/// An exclusive copy-on-write session. Commit or roll back to finish;
/// dropping an unfinished transaction rolls back.
pub struct WriteTxn<'g> {
    pub(crate) group: &'g Group,
    pub(crate) state: MutexGuard<'g, WriterState>,
    _file_lock: WriteLockGuard,
    /// Ref of the current (possibly still committed) top node. Mutations
    /// replace it on first copy-on-write.
    pub(crate) top: Ref,
    pub(crate) version: u64,
    start_end: u64,
    started_at: Instant,
    finished: bool,
}

impl<'g> std::fmt::Debug for WriteTxn<'g> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("top", &self.top)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl<'g> WriteTxn<'g> {
    pub(crate) fn start(
        group: &'g Group,
        mut state: MutexGuard<'g, WriterState>,
        file_lock: WriteLockGuard,
    ) -> Result<Self> {
        let top = state.committed_top;
        let version = state.committed_version + 1;
        state.alloc.set_version(version);

        // Mirror the persistent free arrays into the allocator; blocks
        // listed there were merged under the no-live-reader rule and are
        // safe to reuse.
        let top_arr = Array::attach(&state.alloc, top)?;
        expect_top_shape(&top_arr)?;
        let blocks = crate::group::freelist::load(
            &state.alloc,
            top_arr.get_child_ref(&state.alloc, TOP_FREE_POSITIONS)?,
            top_arr.get_child_ref(&state.alloc, TOP_FREE_SIZES)?,
            top_arr.get_child_ref(&state.alloc, TOP_FREE_VERSIONS)?,
        )?;
        state.alloc.load_free_blocks(blocks);
        let start_end = state.alloc.end();

        debug!(version, top, "write transaction started");
        Ok(Self {
            group,
            state,
            _file_lock: file_lock,
            top,
            version,
            start_end,
            started_at: Instant::now(),
            finished: false,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn read(&self) -> GroupRead<'_, crate::mem::Allocator> {
        GroupRead::new(
            &self.state.alloc,
            self.top,
            self.group.options.max_leaf_size,
            self.group.metrics.clone(),
        )
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        self.read().table_names()
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        Ok(self.read().find_table(name)?.is_some())
    }

    /// Create an empty table. Names are unique within a group.
    pub fn add_table(&mut self, name: &str) -> Result<TableMut<'_, 'g>> {
        if self.read().find_table(name)?.is_some() {
            return Err(TabulaError::logic(format!(
                "table '{name}' already exists"
            )));
        }
        let alloc = &mut self.state.alloc;

        let types_ref = Array::create(alloc, false, false, 0, 0)?;
        let col_names_ref = StringArray::create(alloc)?;
        let spec_ref = Array::create(alloc, true, false, 0, 0)?;
        let mut spec = Array::attach(alloc, spec_ref)?;
        spec.push_ref(alloc, types_ref)?;
        spec.push_ref(alloc, col_names_ref)?;

        let columns_ref = Array::create(alloc, true, false, 0, 0)?;

        let table_ref = Array::create(alloc, true, false, 0, 0)?;
        let mut table = Array::attach(alloc, table_ref)?;
        table.push_ref(alloc, spec.pos())?;
        table.push_ref(alloc, columns_ref)?;

        let top_arr = Array::attach(alloc, self.top)?;
        let mut names = StringArray::attach(alloc, top_arr.get_child_ref(alloc, TOP_NAMES)?)?;
        names.push(alloc, name)?;
        self.set_top_slot(TOP_NAMES, names.pos())?;

        let top_arr = Array::attach(&self.state.alloc, self.top)?;
        let tables_ref = top_arr.get_child_ref(&self.state.alloc, TOP_TABLES)?;
        let mut tables = Array::attach(&self.state.alloc, tables_ref)?;
        let idx = tables.size();
        tables.push_ref(&mut self.state.alloc, table.pos())?;
        self.set_top_slot(TOP_TABLES, tables.pos())?;

        debug!(table = name, index = idx, "table added");
        Ok(TableMut::new(self, idx))
    }

    /// Open an existing table for reading and writing.
    pub fn table(&mut self, name: &str) -> Result<TableMut<'_, 'g>> {
        let idx = self.read().find_table(name)?.ok_or_else(|| {
            TabulaError::logic(format!("no table named '{name}' in this group"))
        })?;
        Ok(TableMut::new(self, idx))
    }

    /// Read-only view of a table inside this transaction.
    pub fn table_read(&self, name: &str) -> Result<TableRead<'_, crate::mem::Allocator>> {
        let reader = self.read();
        let idx = reader
            .find_table(name)?
            .ok_or_else(|| TabulaError::logic(format!("no table named '{name}' in this group")))?;
        reader.table(idx)
    }

    /// Write `new_ref` into a slot of the top node, copy-on-writing the top
    /// itself when needed.
    pub(crate) fn set_top_slot(&mut self, slot: usize, new_ref: Ref) -> Result<()> {
        let alloc = &mut self.state.alloc;
        let mut top_arr = Array::attach(alloc, self.top)?;
        if top_arr.get_child_ref(alloc, slot)? != new_ref {
            top_arr.set_ref(alloc, slot, new_ref)?;
            self.top = top_arr.pos();
        }
        Ok(())
    }

    pub(crate) fn top_slot(&self, slot: usize) -> Result<Ref> {
        let top_arr = Array::attach(&self.state.alloc, self.top)?;
        top_arr.get_child_ref(&self.state.alloc, slot)
    }

    /// Publish this transaction's state as the new committed version.
    pub fn commit(mut self) -> Result<()> {
        self.commit_inner(true)
    }

    /// Run every commit step except the active-slot flip. The durable state
    /// still names the previous version; used to exercise the
    /// crash-before-flip window in tests.
    #[doc(hidden)]
    pub fn commit_without_flip(mut self) -> Result<()> {
        self.commit_inner(false)
    }

    fn commit_inner(&mut self, flip: bool) -> Result<()> {
        debug_assert!(!self.finished);
        let version = self.version;

        // Pending frees released by transactions up to `version - 1` can be
        // recycled once no live reader is bound below them; entries from
        // this very transaction wait one more commit so a crash before the
        // flip cannot have overwritten the fallback version.
        let oldest_live = {
            let readers = self.group.readers.lock();
            readers.keys().next().copied().unwrap_or(u64::MAX)
        };
        let reclaim_below = oldest_live.min(version - 1).saturating_add(1);

        let alloc = &mut self.state.alloc;
        alloc.set_bump_only(true);
        let moved = alloc.merge_pending(reclaim_below);
        trace!(moved, reclaim_below, "merged pending frees");

        let result = (|| -> Result<()> {
            // Serialize the free list and stamp the new version into the
            // top node; both may copy-on-write the top.
            let old_positions = self.top_slot(TOP_FREE_POSITIONS)?;
            let old_sizes = self.top_slot(TOP_FREE_SIZES)?;
            let old_versions = self.top_slot(TOP_FREE_VERSIONS)?;
            let blocks = self.state.alloc.free_blocks().to_vec();
            let (p, s, v) = crate::group::freelist::store(
                &mut self.state.alloc,
                old_positions,
                old_sizes,
                old_versions,
                &blocks,
            )?;
            self.set_top_slot(TOP_FREE_POSITIONS, p)?;
            self.set_top_slot(TOP_FREE_SIZES, s)?;
            self.set_top_slot(TOP_FREE_VERSIONS, v)?;

            let alloc = &mut self.state.alloc;
            let mut top_arr = Array::attach(alloc, self.top)?;
            top_arr.set_tagged(alloc, TOP_VERSION, version)?;
            self.top = top_arr.pos();

            // Step 2: everything the new version references is on disk.
            self.sync_step()?;

            // Step 3: new top ref into the inactive slot, then sync.
            let alloc = &mut self.state.alloc;
            let mut header =
                FileHeader::decode(alloc.bytes(0, FILE_HEADER_SIZE)?)?;
            let inactive = header.inactive_index();
            header.slots[inactive] = self.top;
            let buf = alloc.bytes_mut(0, FILE_HEADER_SIZE)?;
            let mut bytes = [0u8; FILE_HEADER_SIZE];
            header.encode(&mut bytes);
            // Preserve the still-active selector byte; only the inactive
            // slot may change before the flip.
            bytes[ACTIVE_BYTE_OFFSET as usize] = buf[ACTIVE_BYTE_OFFSET as usize];
            buf.copy_from_slice(&bytes);
            self.sync_step()?;

            if !flip {
                return Ok(());
            }

            // Step 4: the linearisation point, one aligned byte.
            let alloc = &mut self.state.alloc;
            alloc.bytes_mut(ACTIVE_BYTE_OFFSET, 1)?[0] = inactive as u8;
            self.sync_step()?;
            Ok(())
        })();

        self.state.alloc.set_bump_only(false);
        result?;

        if flip {
            let alloc = &mut self.state.alloc;
            let end = alloc.end();
            alloc.set_baseline(end);
            alloc.clear_reused();
            self.state.committed_top = self.top;
            self.state.committed_version = version;

            let mut shared = self.group.shared.lock();
            if let Some(region) = self.state.alloc.current_region() {
                shared.region = region;
            }
            shared.top_ref = self.top;
            shared.version = version;
        } else {
            // The durable image still names the previous version; treat the
            // session like a rollback so the next writer starts clean.
            self.state.alloc.discard_pending();
            self.state.alloc.clear_reused();
        }

        self.finished = true;
        if let Some(metrics) = &self.group.metrics {
            metrics
                .lock()
                .record_write_transaction(self.started_at.elapsed(), true);
        }
        debug!(version, top = self.top, flipped = flip, "commit finished");
        Ok(())
    }

    fn sync_step(&self) -> Result<()> {
        match self.group.options.durability {
            Durability::Full => self.state.alloc.sync(),
            Durability::Async => self.state.alloc.sync_async(),
            Durability::MemOnly => Ok(()),
        }
    }

    /// Abandon the transaction. No durable state has changed.
    pub fn rollback(mut self) {
        self.rollback_inner();
    }

    fn rollback_inner(&mut self) {
        if self.finished {
            return;
        }
        let alloc = &mut self.state.alloc;
        alloc.discard_pending();
        alloc.set_end(self.start_end);
        alloc.clear_reused();
        alloc.set_bump_only(false);
        self.finished = true;
        if let Some(metrics) = &self.group.metrics {
            metrics
                .lock()
                .record_write_transaction(self.started_at.elapsed(), false);
        }
        debug!(version = self.version, "write transaction rolled back");
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        self.rollback_inner();
    }
}

pub(crate) fn expect_top_shape(top: &Array) -> Result<()> {
    if !top.has_refs() || top.size() != TOP_SLOT_COUNT {
        return Err(TabulaError::corrupt(format!(
            "top node has {} slots, expected {TOP_SLOT_COUNT}",
            top.size()
        )));
    }
    Ok(())
}

pub(crate) fn read_top_version(mem: &impl Mem, top_ref: Ref) -> Result<u64> {
    let top = Array::attach(mem, top_ref)?;
    expect_top_shape(&top)?;
    top.get_ref_or_tagged(mem, TOP_VERSION)
        .as_tagged_value()
        .ok_or_else(|| TabulaError::corrupt("top node version slot is not tagged"))
}
