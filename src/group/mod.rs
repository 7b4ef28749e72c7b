//! The top-level container: named tables bound into durable versions over
//! one file.
//!
//! On disk a version is a single top node of six ref slots:
//! `[table-names, tables, free-positions, free-sizes, free-versions,
//! version-counter (tagged)]`. The 24-byte file header holds two top-ref
//! slots and the active-slot selector; committing writes a fresh top node
//! and flips the selector. Readers bind to whatever the selector named
//! when their snapshot began.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::array::strings::StringArray;
use crate::array::Array;
use crate::error::{Result, TabulaError};
use crate::mem::{Allocator, MapRegion, Mem};
use crate::metrics::Metrics;
use crate::table::TableRead;
use crate::types::{Ref, REF_ALIGN};

pub mod config;
pub(crate) mod freelist;
pub mod header;
pub(crate) mod lock;
mod transaction;
mod verify;

pub use config::{Durability, Options};
pub use transaction::{Snapshot, WriteTxn};
pub use verify::VerifyReport;

use header::{FileHeader, FILE_HEADER_SIZE};
use transaction::read_top_version;

pub(crate) const TOP_NAMES: usize = 0;
pub(crate) const TOP_TABLES: usize = 1;
pub(crate) const TOP_FREE_POSITIONS: usize = 2;
pub(crate) const TOP_FREE_SIZES: usize = 3;
pub(crate) const TOP_FREE_VERSIONS: usize = 4;
pub(crate) const TOP_VERSION: usize = 5;
pub(crate) const TOP_SLOT_COUNT: usize = 6;

/// Live in-process readers: bound version to snapshot count. Pending frees
/// from a version stay unreclaimed while any entry at or below it exists.
pub(crate) type ReaderRegistry = Arc<Mutex<BTreeMap<u64, usize>>>;

/// State every reader needs, updated inside the short commit critical
/// section.
pub(crate) struct SharedView {
    pub region: Arc<MapRegion>,
    pub top_ref: Ref,
    pub version: u64,
}

/// State owned by the writer, held across a whole write transaction.
pub(crate) struct WriterState {
    pub alloc: Allocator,
    pub committed_top: Ref,
    pub committed_version: u64,
}

/// A shared handle to one database file.
pub struct Group {
    path: PathBuf,
    pub(crate) options: Options,
    file: std::fs::File,
    pub(crate) shared: Mutex<SharedView>,
    writer: Mutex<WriterState>,
    pub(crate) readers: ReaderRegistry,
    pub(crate) metrics: Option<Arc<Mutex<Metrics>>>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("path", &self.path).finish_non_exhaustive()
    }
}

const INITIAL_FILE_SIZE: u64 = 64 * 1024;

impl Group {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if options.encryption_key.is_some() {
            return Err(TabulaError::Unsupported(
                "encryption-at-rest is not built into this crate",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let (alloc, top_ref, version) = if file_len == 0 {
            Self::init_new_file(&file)?
        } else {
            Self::open_existing(&file, file_len, &options)?
        };

        let region = alloc
            .current_region()
            .ok_or_else(|| TabulaError::logic("group allocator must be file-backed"))?;
        info!(path = %path.display(), version, "group opened");
        Ok(Self {
            path,
            metrics: options
                .enable_metrics
                .then(|| Arc::new(Mutex::new(Metrics::default()))),
            options,
            file,
            shared: Mutex::new(SharedView {
                region,
                top_ref,
                version,
            }),
            writer: Mutex::new(WriterState {
                alloc,
                committed_top: top_ref,
                committed_version: version,
            }),
            readers: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    /// Lay out a fresh file: header, empty top node, first committed
    /// version.
    fn init_new_file(file: &std::fs::File) -> Result<(Allocator, Ref, u64)> {
        file.set_len(INITIAL_FILE_SIZE)?;
        let mut alloc =
            Allocator::from_file(file.try_clone()?, FILE_HEADER_SIZE as u64, 0)?;
        debug_assert_eq!(FILE_HEADER_SIZE as u64 % REF_ALIGN, 0);

        let names_ref = StringArray::create(&mut alloc)?;
        let tables_ref = Array::create(&mut alloc, true, false, 0, 0)?;
        let free_positions = Array::create(&mut alloc, false, false, 0, 0)?;
        let free_sizes = Array::create(&mut alloc, false, false, 0, 0)?;
        let free_versions = Array::create(&mut alloc, false, false, 0, 0)?;

        let top_ref = Array::create(&mut alloc, true, false, 0, 0)?;
        let mut top = Array::attach(&alloc, top_ref)?;
        top.push_ref(&mut alloc, names_ref)?;
        top.push_ref(&mut alloc, tables_ref)?;
        top.push_ref(&mut alloc, free_positions)?;
        top.push_ref(&mut alloc, free_sizes)?;
        top.push_ref(&mut alloc, free_versions)?;
        top.push_tagged(&mut alloc, 1)?;

        let mut header = FileHeader::new_file();
        header.slots[0] = top.pos();
        header.active = 0;
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        header.encode(&mut bytes);
        alloc.bytes_mut(0, FILE_HEADER_SIZE)?.copy_from_slice(&bytes);
        alloc.sync()?;

        let end = alloc.end();
        alloc.set_baseline(end);
        debug!(top = top.pos(), "new database initialized");
        Ok((alloc, top.pos(), 1))
    }

    fn open_existing(
        file: &std::fs::File,
        file_len: u64,
        options: &Options,
    ) -> Result<(Allocator, Ref, u64)> {
        if file_len < FILE_HEADER_SIZE as u64 {
            return Err(TabulaError::corrupt(format!(
                "file of {file_len} bytes is shorter than the header"
            )));
        }
        let alloc = Allocator::from_file(file.try_clone()?, file_len, file_len)?;
        let header = FileHeader::decode(alloc.bytes(0, FILE_HEADER_SIZE)?)?;
        header.validate(file_len, options.allow_file_format_upgrade)?;
        let top_ref = header.active_top();
        let version = read_top_version(&alloc, top_ref)?;
        Ok((alloc, top_ref, version))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a read transaction bound to the currently active version.
    pub fn begin_read(&self) -> Result<Snapshot> {
        let shared = self.shared.lock();
        Ok(Snapshot::bind(
            Arc::clone(&shared.region),
            shared.top_ref,
            shared.version,
            Arc::clone(&self.readers),
            self.options.max_leaf_size,
            self.metrics.clone(),
        ))
    }

    /// Begin the (single) write transaction, waiting on the file lock with
    /// the configured default timeout.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        self.begin_write_impl(self.options.write_lock_timeout)
    }

    /// Begin a write transaction, waiting at most `timeout`.
    pub fn begin_write_timeout(&self, timeout: Duration) -> Result<WriteTxn<'_>> {
        self.begin_write_impl(Some(timeout))
    }

    fn begin_write_impl(&self, timeout: Option<Duration>) -> Result<WriteTxn<'_>> {
        if self.options.read_only {
            return Err(TabulaError::ReadOnly);
        }
        let state = match timeout {
            Some(limit) => self.writer.try_lock_for(limit).ok_or_else(|| {
                TabulaError::LockTimeout {
                    path: self.path.clone(),
                }
            })?,
            None => self.writer.lock(),
        };
        let file_lock = lock::acquire_write_lock(&self.file, &self.path, timeout)?;
        let mut state = state;
        self.refresh_writer(&mut state)?;
        WriteTxn::start(self, state, file_lock)
    }

    /// Re-sync writer state from the file after taking the inter-process
    /// lock; another process may have committed since we last looked.
    fn refresh_writer(&self, state: &mut WriterState) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        if file_len > state.alloc.region_len() {
            state.alloc.ensure_mapped(file_len)?;
        }
        let header = FileHeader::decode(state.alloc.bytes(0, FILE_HEADER_SIZE)?)?;
        let top_ref = header.active_top();
        let version = read_top_version(&state.alloc, top_ref)?;
        if version != state.committed_version || top_ref != state.committed_top {
            debug!(
                from = state.committed_version,
                to = version,
                "adopting external commit"
            );
            state.committed_top = top_ref;
            state.committed_version = version;
            state.alloc.set_end(file_len);
            state.alloc.set_baseline(file_len);

            let mut shared = self.shared.lock();
            if let Some(region) = state.alloc.current_region() {
                shared.region = region;
            }
            shared.top_ref = top_ref;
            shared.version = version;
        }
        Ok(())
    }

    /// Current committed version counter.
    pub fn committed_version(&self) -> u64 {
        self.shared.lock().version
    }

    /// Copy of the collected metrics, when enabled.
    pub fn metrics(&self) -> Option<Metrics> {
        self.metrics.as_ref().map(|m| m.lock().clone())
    }

    /// Walk the committed state checking structural invariants.
    pub fn verify(&self) -> Result<VerifyReport> {
        let snapshot = self.begin_read()?;
        verify::verify_snapshot(&snapshot)
    }
}

/// Table view bound to a snapshot's lifetime.
pub type SnapshotTable<'s> = TableRead<'s, Snapshot>;
