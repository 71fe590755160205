#![doc = include_str!("../README.md")]
//! The core engine: pages, the mapping table, and the write paths.
//!
//! lodestore keeps its working set in a lock-free, page-oriented index:
//! every logical page is a chain of immutable delta records published by
//! compare-and-swap, and pages are persisted, evicted, and faulted back
//! through an append-only log-structured store. MVCC snapshot numbers
//! stamp every version, so readers see consistent data without blocking
//! writers.
//!
//! # Internals
//!
//! -   **Pages:** key-range partitions represented as delta chains.
//!     Structural changes (compact, split, merge) are optimistic: build,
//!     publish with one CAS, retry on conflict.
//! -   **Mapping table:** page id -> chain head, with an ordered index
//!     from each page's low fence for key routing.
//! -   **Log-structured store:** rotating flush buffers over a segmented
//!     append-only log; reservations happen before the publish CAS so
//!     the log and the in-memory head move together.
//! -   **Daemons:** background threads monitor memory, evict pages by
//!     clock sweep, clean the log, and refresh derived statistics.
//!
//! # Example
//!
//! ```
//! # use lodestore::{Config, Store};
//! # use tempfile::tempdir;
//! # fn main() -> Result<(), lodestore::StoreError> {
//! # let dir = tempdir().unwrap();
//! let store = Store::open(Config {
//!     path: dir.path().join("db"),
//!     ..Config::default()
//! })?;
//!
//! let mut writer = store.new_writer();
//! writer.insert(b"name", b"lodestore")?;
//! assert_eq!(writer.lookup(b"name")?.as_deref(), Some(&b"lodestore"[..]));
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod metrics_keys;

mod cleaner;
mod flushbuf;
mod item;
mod logfile;
mod lss;
mod page;
mod pagetable;
mod recovery;
mod snapshot;
mod stats;
mod swapper;

pub use config::Config;
pub use error::{LogError, StoreError};
pub use item::Item;
pub use snapshot::{Reader, RecoveryPoint, Snapshot, SnapshotIter};
pub use stats::StatsSnapshot;

use std::cell::{RefCell, RefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_epoch::{self as epoch, Guard, Shared};
use dashmap::DashMap;
use log::{debug, error};
use metrics::counter;
use once_cell::sync::Lazy;

use item::{AcceptNewest, GcFilter};
use lss::{BlockType, LsStore, BLOCK_TYPE_SIZE};
use page::{defer_destroy_chain, PageView};
use pagetable::{PageId, PageTable, START_PID};
use snapshot::MvccState;
use stats::{DerivedStats, Stats};

/// Pause between swap attempts while a writer is throttled on memory.
const SWAPPER_WAIT_INTERVAL: Duration = Duration::from_millis(10);
/// Memory-pressure re-evaluation period.
const MEM_MONITOR_INTERVAL: Duration = Duration::from_millis(100);
/// Cleaner fragmentation check period.
const CLEANER_INTERVAL: Duration = Duration::from_secs(1);
/// Derived-statistics refresh period.
const RUNTIME_STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Scratch buffers owned by every write context.
const NUM_CTX_BUFFERS: usize = 7;

/// Scratch buffer roles, one slot each per write context.
#[derive(Clone, Copy)]
pub(crate) enum CtxBuf {
    EncPage = 0,
    EncMeta = 1,
    Reloc = 2,
    Cleaner = 3,
    Recovery = 4,
    Fetch = 5,
    Persist = 6,
}

/// Per-worker state: scratch buffers, statistics, and the safe-read
/// offset that pins the log trim.
pub(crate) struct WCtx {
    pub(crate) stats: Arc<Stats>,
    bufs: [RefCell<Vec<u8>>; NUM_CTX_BUFFERS],
    pub(crate) safe_offset: Arc<AtomicU64>,
}

impl WCtx {
    pub(crate) fn buffer(&self, which: CtxBuf) -> RefMut<'_, Vec<u8>> {
        self.bufs[which as usize].borrow_mut()
    }

    fn cache_meta_begin(&self) -> i64 {
        self.stats.num_lss_reads.load(Ordering::Relaxed)
    }

    fn cache_meta_end(&self, reads_before: i64) {
        if self.stats.num_lss_reads.load(Ordering::Relaxed) > reads_before {
            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }
}

static REGISTRY: Lazy<DashMap<u64, Weak<Store>>> = Lazy::new(DashMap::new);
static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Sums [`Store::memory_in_use`] over every open store in the process.
pub fn total_memory_in_use() -> i64 {
    REGISTRY
        .iter()
        .filter_map(|e| e.value().upgrade())
        .map(|s| s.memory_in_use())
        .sum()
}

/// The storage engine handle.
///
/// A `Store` is opened with [`Store::open`], shared through its `Arc`,
/// and written through per-thread [`Writer`]s. Dropping the last handle
/// signals the background daemons; call [`Store::close`] for a
/// deterministic shutdown that also commits the log.
pub struct Store {
    pub(crate) cfg: Config,
    pub(crate) table: PageTable,
    pub(crate) lss: Option<LsStore>,
    pub(crate) mvcc: MvccState,
    items_count: AtomicI64,
    stats_blocks: Mutex<Vec<Arc<Stats>>>,
    pub(crate) gstats: Arc<Stats>,
    pub(crate) derived: DerivedStats,
    safe_offsets: Arc<Mutex<Vec<Arc<AtomicU64>>>>,
    pub(crate) has_memory_pressure: AtomicBool,
    pub(crate) clock_hand: Mutex<Option<Arc<[u8]>>>,
    shutdown: Arc<AtomicBool>,
    daemons: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    registry_id: u64,
}

impl Store {
    /// Opens (and, if the log is non-empty, recovers) a store.
    pub fn open(cfg: Config) -> Result<Arc<Store>, StoreError> {
        cfg.validate()?;

        let lss = if cfg.should_persist() {
            let log = logfile::LogFile::open(&cfg.path, cfg.log_segment_size, cfg.use_mmap)?;
            Some(LsStore::new(
                log,
                cfg.flush_buffer_size,
                cfg.num_flush_buffers,
                cfg.sync_interval,
            ))
        } else {
            None
        };

        let table = PageTable::new(cfg.mapping_table_size);
        let gstats = Arc::new(Stats::default());
        let registry_id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);

        let store = Arc::new(Store {
            mvcc: MvccState::new(cfg.enable_snapshots),
            cfg,
            table,
            lss,
            items_count: AtomicI64::new(0),
            stats_blocks: Mutex::new(vec![gstats.clone()]),
            gstats,
            derived: DerivedStats::default(),
            safe_offsets: Arc::new(Mutex::new(Vec::new())),
            has_memory_pressure: AtomicBool::new(false),
            clock_hand: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            daemons: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            registry_id,
        });

        if let Some(lss) = &store.lss {
            let safe_offsets = store.safe_offsets.clone();
            lss.set_safe_trim_callback(Box::new(move || {
                safe_offsets
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|o| o.load(Ordering::Acquire))
                    .min()
                    .unwrap_or(u64::MAX)
            }));

            let ctx = store.new_wctx();
            store.do_recovery(&ctx)?;
        }

        store.do_init();
        REGISTRY.insert(registry_id, Arc::downgrade(&store));
        store.spawn_daemons();
        Ok(store)
    }

    /// Seeds the start page if recovery left the table empty and arms
    /// the snapshot machinery.
    fn do_init(&self) {
        let guard = &epoch::pin();
        if self.table.head(START_PID, guard).is_null() {
            let seed = page::seed_page(guard);
            self.table.create(START_PID, seed.head);
        }
        self.mvcc.init();
        if self.cfg.enable_snapshots {
            self.persist_max_sn();
        }
    }

    fn gstats_ctx(&self) -> WCtx {
        WCtx {
            stats: self.gstats.clone(),
            bufs: Default::default(),
            safe_offset: Arc::new(AtomicU64::new(u64::MAX)),
        }
    }

    pub(crate) fn new_wctx(&self) -> WCtx {
        let stats = Arc::new(Stats::default());
        self.stats_blocks.lock().unwrap().push(stats.clone());
        let safe_offset = Arc::new(AtomicU64::new(u64::MAX));
        self.safe_offsets.lock().unwrap().push(safe_offset.clone());
        WCtx {
            stats,
            bufs: Default::default(),
            safe_offset,
        }
    }

    /// Creates a writer bound to this store.
    pub fn new_writer(self: &Arc<Self>) -> Writer {
        Writer {
            store: self.clone(),
            ctx: self.new_wctx(),
        }
    }

    /// Creates a snapshot-filtered reader.
    pub fn new_reader(self: &Arc<Self>) -> snapshot::Reader {
        snapshot::Reader::new(self.clone(), self.new_wctx())
    }

    /// Forces the tail flush buffer to the log and waits for it; with
    /// `commit` the log is also committed, making every prior write
    /// crash-durable.
    pub fn sync(&self, commit: bool) {
        if let Some(lss) = &self.lss {
            lss.sync(commit);
        }
    }

    /// Runs one log-cleaner pass regardless of the fragmentation
    /// threshold. The background cleaner does this automatically when
    /// `auto_cleaner` is set; this entry point exists for tools and
    /// tests that need reclamation at a deterministic moment.
    pub fn clean_log(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.lss.is_none() {
            return Ok(());
        }
        let ctx = self.new_wctx();
        self.run_cleaner_pass(&ctx)
    }

    /// Shuts the daemons down, persists the snapshot metadata, and
    /// closes the log.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::Closed);
        }
        self.shutdown.store(true, Ordering::Release);
        for handle in self.daemons.lock().unwrap().drain(..) {
            if let Err(e) = handle.join() {
                error!("daemon thread panicked: {:?}", e);
            }
        }
        if let Some(lss) = &self.lss {
            if self.cfg.enable_snapshots {
                let ctx = self.gstats_ctx();
                self.persist_max_sn();
                self.persist_recovery_points(&ctx);
            }
            lss.close()?;
        }
        REGISTRY.remove(&self.registry_id);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Number of items inserted minus items deleted.
    pub fn items_count(&self) -> i64 {
        self.items_count.load(Ordering::Relaxed)
    }

    /// Estimated resident bytes across all page chains.
    pub fn memory_in_use(&self) -> i64 {
        let blocks = self.stats_blocks.lock().unwrap();
        blocks
            .iter()
            .map(|s| {
                s.alloc_size.load(Ordering::Relaxed) - s.free_size.load(Ordering::Relaxed)
            })
            .sum()
    }

    /// Log fragmentation percentage, live data bytes, and used bytes.
    pub fn lss_info(&self) -> (i64, i64, i64) {
        let lss = match &self.lss {
            Some(lss) => lss,
            None => return (0, 0, 0),
        };
        let used = lss.used_space() as i64;
        let blocks = self.stats_blocks.lock().unwrap();
        let data: i64 = blocks
            .iter()
            .map(|s| s.flush_data_size.load(Ordering::Relaxed))
            .sum();
        let frag = if used > 0 {
            ((used - data).max(0) * 100) / used
        } else {
            0
        };
        (frag, data, used)
    }

    /// Merges every writer's counters with the derived gauges.
    pub fn stats(&self) -> StatsSnapshot {
        let mut snap = StatsSnapshot::default();
        {
            let blocks = self.stats_blocks.lock().unwrap();
            for block in blocks.iter() {
                block.merge_into(&mut snap);
            }
        }
        snap.num_pages = self.table.num_pages() as i64;
        snap.mem_used = snap.alloc_size - snap.free_size;
        if let Some(lss) = &self.lss {
            snap.bytes_written = lss.bytes_written() as i64;
            let (frag, data, used) = self.lss_info();
            snap.lss_frag = frag;
            snap.lss_data_size = data;
            snap.lss_used_space = used;
            if snap.bytes_incoming > 0 {
                snap.write_amp_avg = snap.bytes_written as f64 / snap.bytes_incoming as f64;
            }
        }
        snap.write_amp = self.derived.write_amp();
        snap.cache_hit_ratio = self.derived.cache_hit_ratio();
        snap.derive_resident_ratio();
        snap
    }

    // --- page access paths -------------------------------------------

    /// Reads a page's chain, faulting it in from the log when evicted.
    pub(crate) fn read_page<'g>(
        &self,
        pid: PageId,
        ctx: &WCtx,
        guard: &'g Guard,
    ) -> Result<PageView<'g>, StoreError> {
        loop {
            let head = self.table.head(pid, guard);
            if head.is_null() {
                return Err(StoreError::PageNotFound);
            }
            let view = PageView::from_head(pid, head);
            if view.is_evicted() {
                if !self.swap_in(&view, ctx, guard)? {
                    ctx.stats.swapin_conflicts.fetch_add(1, Ordering::Relaxed);
                    counter!(metrics_keys::SMO_CONFLICTS_TOTAL, metrics_keys::LABEL_SMO_KIND => "swapin")
                        .increment(1);
                }
                continue;
            }
            return Ok(view);
        }
    }

    /// Locates and reads the page owning `key`, following right
    /// siblings past concurrent splits and helping removals along.
    pub(crate) fn fetch_page<'g>(
        &self,
        key: &[u8],
        ctx: &WCtx,
        guard: &'g Guard,
    ) -> Result<PageView<'g>, StoreError> {
        'restart: loop {
            let pid = self.table.lookup_owner(key);
            let mut view = match self.read_page(pid, ctx, guard) {
                Ok(view) => view,
                Err(StoreError::PageNotFound) => continue 'restart,
                Err(e) => return Err(e),
            };

            loop {
                if !view.in_range(key) {
                    // A concurrent split moved the range; chase the
                    // sibling link.
                    let next = match view.right {
                        Some(next) => next,
                        None => continue 'restart,
                    };
                    view = match self.read_page(next, ctx, guard) {
                        Ok(view) => view,
                        Err(StoreError::PageNotFound) => continue 'restart,
                        Err(e) => return Err(e),
                    };
                    continue;
                }
                if view.need_removal() {
                    self.try_page_removal(view.pid, ctx, guard)?;
                    continue 'restart;
                }
                self.table.mark_referenced(view.pid);
                return Ok(view);
            }
        }
    }

    /// Installs the first head of a freshly allocated page.
    pub(crate) fn create_mapping(&self, view: &mut PageView<'_>, ctx: &WCtx) {
        self.table.create(view.pid, view.head);
        ctx.stats
            .alloc_size
            .fetch_add(view.new_alloc_bytes as i64, Ordering::Relaxed);
        ctx.stats
            .num_record_allocs
            .fetch_add(view.new_alloc_records as i64, Ordering::Relaxed);
        view.prev_head = view.head;
        view.new_alloc_bytes = 0;
        view.new_alloc_records = 0;
    }

    /// Publishes the view's working head, persisting any records that
    /// exist only in memory: the log reservation happens before the
    /// compare-and-swap and is finalized after it, so the on-disk log
    /// and the in-memory head move together.
    ///
    /// On success the displaced chain (if any) is retired through the
    /// epoch reclaimer; on failure the locally built records are
    /// dropped, the reserved blocks are discarded, and the caller
    /// retries from a fresh read.
    pub(crate) fn update_mapping<'g>(
        &self,
        view: &mut PageView<'g>,
        ctx: &WCtx,
        guard: &'g Guard,
    ) -> Result<bool, StoreError> {
        if self.lss.is_some() && view.has_unflushed(guard) {
            return self.persist_and_update(view, ctx, false, guard);
        }
        Ok(self.update_mapping_raw(view, ctx, guard))
    }

    /// The publish compare-and-swap alone, for chains whose top is
    /// already pinned to the log (or stores without one).
    pub(crate) fn update_mapping_raw<'g>(
        &self,
        view: &mut PageView<'g>,
        ctx: &WCtx,
        guard: &'g Guard,
    ) -> bool {
        if !self.table.update(view.pid, view.prev_head, view.head, guard) {
            view.abandon_unpublished(guard);
            return false;
        }

        ctx.stats
            .alloc_size
            .fetch_add(view.new_alloc_bytes as i64, Ordering::Relaxed);
        ctx.stats
            .num_record_allocs
            .fetch_add(view.new_alloc_records as i64, Ordering::Relaxed);

        if view.displaced {
            // SAFETY: the chain hanging off `prev_head` was unlinked by
            // the successful CAS above; `guard` defers the frees.
            let (bytes, records) =
                unsafe { defer_destroy_chain(view.prev_head, Shared::null(), guard) };
            ctx.stats
                .free_size
                .fetch_add(bytes as i64, Ordering::Relaxed);
            ctx.stats
                .num_record_frees
                .fetch_add(records as i64, Ordering::Relaxed);
            if view.evicting {
                ctx.stats
                    .num_record_swapout
                    .fetch_add(records as i64, Ordering::Relaxed);
            }
        }

        view.prev_head = view.head;
        view.new_alloc_bytes = 0;
        view.new_alloc_records = 0;
        view.displaced = false;
        view.evicting = false;
        true
    }

    /// Indexes a page's low fence, helping along a half-removed
    /// occupant if one is found.
    pub(crate) fn index_page(
        &self,
        low: Arc<[u8]>,
        pid: PageId,
        ctx: &WCtx,
        guard: &Guard,
    ) -> Result<(), StoreError> {
        loop {
            match self.table.index_insert(low.clone(), pid) {
                Ok(()) => return Ok(()),
                Err(existing) => {
                    let view = match self.read_page(existing, ctx, guard) {
                        Ok(view) => view,
                        Err(StoreError::PageNotFound) => continue,
                        Err(e) => return Err(e),
                    };
                    if view.need_removal() {
                        self.try_page_removal(existing, ctx, guard)?;
                        continue;
                    }
                    panic!("duplicate index fence for pid {:?}", pid);
                }
            }
        }
    }

    /// The compaction filter: retains versions still visible to a
    /// recovery point, an open snapshot, or the future.
    pub(crate) fn compaction_filter(&self) -> GcFilter {
        GcFilter::new(self.mvcc.gc_boundaries())
    }

    // --- structural modification triage ------------------------------

    /// Runs the structural-modification triage after a write, mirroring
    /// the write path exactly once: compact, else split, else
    /// merge/remove, else plain publish.
    ///
    /// Returns whether the view's records were published; `false` means
    /// the caller lost a race and must retry from a fresh read.
    pub(crate) fn try_smos<'g>(
        &self,
        view: &mut PageView<'g>,
        ctx: &WCtx,
        do_update: bool,
        guard: &'g Guard,
    ) -> Result<bool, StoreError> {
        if view.need_compaction(self.cfg.max_delta_chain_len) {
            let mut filter = self.compaction_filter();
            let stale = view.compact(&mut filter, guard);
            let updated = self.update_mapping(view, ctx, guard)?;
            if updated {
                ctx.stats.compacts.fetch_add(1, Ordering::Relaxed);
                ctx.stats
                    .flush_data_size
                    .fetch_sub(stale as i64, Ordering::Relaxed);
                counter!(metrics_keys::SMO_TOTAL, metrics_keys::LABEL_SMO_KIND => "compact")
                    .increment(1);
            } else {
                ctx.stats.compact_conflicts.fetch_add(1, Ordering::Relaxed);
                counter!(metrics_keys::SMO_CONFLICTS_TOTAL, metrics_keys::LABEL_SMO_KIND => "compact")
                    .increment(1);
            }
            Ok(updated)
        } else if view.need_split(self.cfg.max_page_items) {
            self.try_split(view, ctx, guard)
        } else if view.pid != START_PID && view.need_merge(self.cfg.min_page_items) {
            view.close(guard);
            let updated = self.update_mapping(view, ctx, guard)?;
            if updated {
                self.try_page_removal(view.pid, ctx, guard)?;
                ctx.stats.merges.fetch_add(1, Ordering::Relaxed);
                counter!(metrics_keys::SMO_TOTAL, metrics_keys::LABEL_SMO_KIND => "merge")
                    .increment(1);
            } else {
                ctx.stats.merge_conflicts.fetch_add(1, Ordering::Relaxed);
                counter!(metrics_keys::SMO_CONFLICTS_TOTAL, metrics_keys::LABEL_SMO_KIND => "merge")
                    .increment(1);
            }
            Ok(updated)
        } else if do_update {
            self.update_mapping(view, ctx, guard)
        } else {
            Ok(true)
        }
    }

    fn try_split<'g>(
        &self,
        view: &mut PageView<'g>,
        ctx: &WCtx,
        guard: &'g Guard,
    ) -> Result<bool, StoreError> {
        let split_pid = self.table.alloc_pid();
        let mut filter = self.compaction_filter();

        let mut right = match view.split(split_pid, &mut filter, guard) {
            Some(right) => right,
            None => {
                // Splitting is unprofitable (one key-run); compact
                // instead so the chain stays bounded.
                self.table.free_pid(split_pid);
                let mut filter = self.compaction_filter();
                let stale = view.compact(&mut filter, guard);
                let updated = self.update_mapping(view, ctx, guard)?;
                if updated {
                    ctx.stats
                        .flush_data_size
                        .fetch_sub(stale as i64, Ordering::Relaxed);
                }
                return Ok(updated);
            }
        };

        let mut reservation = None;
        let mut fd_len = 0u32;
        let mut stale_len = 0u32;
        let mut split_fd_len = 0u32;
        if let Some(lss) = &self.lss {
            let mut pg_buf = ctx.buffer(CtxBuf::EncPage);
            let mut split_buf = ctx.buffer(CtxBuf::EncMeta);
            let mut filter = self.compaction_filter();
            let info = view.marshal(&mut pg_buf, self.cfg.max_page_segments, &mut filter, guard);
            let mut filter = self.compaction_filter();
            let split_info =
                right.marshal(&mut split_buf, self.cfg.max_page_segments, &mut filter, guard);

            let res = match lss.reserve_space_multi(&[
                BLOCK_TYPE_SIZE + pg_buf.len(),
                BLOCK_TYPE_SIZE + split_buf.len(),
            ]) {
                Ok(res) => res,
                Err(e) => {
                    self.table.free_pid(split_pid);
                    right.abandon_unpublished(guard);
                    view.abandon_unpublished(guard);
                    return Err(e);
                }
            };

            let typ = if info.full_image {
                BlockType::PageData
            } else {
                BlockType::PageUpdate
            };
            lss.write_block(&res, 0, typ, &pg_buf);
            view.add_flush_record(res.offset(0), info.data_len, info.num_segments, guard);

            lss.write_block(&res, 1, BlockType::PageData, &split_buf);
            right.add_flush_record(res.offset(1), split_info.data_len, 1, guard);

            fd_len = info.data_len;
            stale_len = info.stale_len;
            split_fd_len = split_info.data_len;
            reservation = Some(res);
        }

        let right_low = right
            .low
            .as_key()
            .expect("split produces a bounded right fence")
            .clone();
        self.create_mapping(&mut right, ctx);

        let updated = self.update_mapping(view, ctx, guard)?;
        if updated {
            self.index_page(right_low, split_pid, ctx, guard)?;
            ctx.stats.splits.fetch_add(1, Ordering::Relaxed);
            counter!(metrics_keys::SMO_TOTAL, metrics_keys::LABEL_SMO_KIND => "split")
                .increment(1);
            if let (Some(lss), Some(res)) = (&self.lss, reservation) {
                ctx.stats.flush_data_size.fetch_add(
                    fd_len as i64 + split_fd_len as i64 - stale_len as i64,
                    Ordering::Relaxed,
                );
                lss.finalize_write(res);
            }
        } else {
            ctx.stats.split_conflicts.fetch_add(1, Ordering::Relaxed);
            counter!(metrics_keys::SMO_CONFLICTS_TOTAL, metrics_keys::LABEL_SMO_KIND => "split")
                .increment(1);
            // Unwind the right page. Its slot was populated, so a stale
            // reader may have glimpsed the chain; retire it through the
            // epoch reclaimer rather than freeing in place.
            self.table.clear(split_pid);
            // SAFETY: the chain is unreachable once the slot is cleared.
            let (bytes, records) =
                unsafe { defer_destroy_chain(right.head, Shared::null(), guard) };
            ctx.stats
                .free_size
                .fetch_add(bytes as i64, Ordering::Relaxed);
            ctx.stats
                .num_record_frees
                .fetch_add(records as i64, Ordering::Relaxed);
            self.table.free_pid(split_pid);
            if let (Some(lss), Some(res)) = (&self.lss, reservation) {
                lss.discard_block(&res, 0);
                lss.discard_block(&res, 1);
                lss.finalize_write(res);
            }
        }
        Ok(updated)
    }

    /// Drives the removal of a page marked with a removal delta: the
    /// left sibling absorbs its chain, the removal is persisted, and the
    /// page leaves the index and the mapping table.
    pub(crate) fn try_page_removal(
        &self,
        pid: PageId,
        ctx: &WCtx,
        guard: &Guard,
    ) -> Result<(), StoreError> {
        loop {
            let child_probe = match self.read_page(pid, ctx, guard) {
                Ok(view) => view,
                // Someone else finished the removal.
                Err(StoreError::PageNotFound) => return Ok(()),
                Err(e) => return Err(e),
            };
            if !child_probe.need_removal() {
                return Ok(());
            }
            let low = match child_probe.low.as_key() {
                Some(low) => low.clone(),
                None => return Ok(()), // the start page is never removed
            };
            if self.table.index_get(&low) != Some(pid) {
                return Ok(());
            }

            let parent_pid = self.table.left_sibling(&low);
            let mut parent = match self.read_page(parent_pid, ctx, guard) {
                Ok(view) => view,
                Err(StoreError::PageNotFound) => continue,
                Err(e) => return Err(e),
            };
            if parent.need_removal() {
                // The left sibling is being removed itself; help it
                // first, then retry ours.
                self.try_page_removal(parent_pid, ctx, guard)?;
                continue;
            }
            // The parent may have split away from us in the meantime.
            if parent.right != Some(pid) {
                continue;
            }

            parent.merge(&child_probe, guard);

            let mut reservation = None;
            let mut fd_len = 0u32;
            let mut stale_len = 0u32;
            if let Some(lss) = &self.lss {
                let mut meta_buf = ctx.buffer(CtxBuf::EncMeta);
                page::marshal_page_remove(&mut meta_buf, &child_probe.low);
                let mut pg_buf = ctx.buffer(CtxBuf::EncPage);
                let mut filter = self.compaction_filter();
                // The merge delta forces a self-contained image.
                let info =
                    parent.marshal(&mut pg_buf, self.cfg.max_page_segments, &mut filter, guard);

                let res = match lss.reserve_space_multi(&[
                    BLOCK_TYPE_SIZE + meta_buf.len(),
                    BLOCK_TYPE_SIZE + pg_buf.len(),
                ]) {
                    Ok(res) => res,
                    Err(e) => {
                        parent.abandon_unpublished(guard);
                        return Err(e);
                    }
                };
                lss.write_block(&res, 0, BlockType::PageRemove, &meta_buf);
                lss.write_block(&res, 1, BlockType::PageData, &pg_buf);
                parent.add_flush_record(res.offset(1), info.data_len, info.num_segments, guard);
                fd_len = info.data_len;
                stale_len = info.stale_len;
                reservation = Some(res);
            }

            if self.update_mapping(&mut parent, ctx, guard)? {
                self.table.index_remove(&low);
                self.table.clear(pid);
                self.table.free_pid(pid);
                if let (Some(lss), Some(res)) = (&self.lss, reservation) {
                    ctx.stats
                        .flush_data_size
                        .fetch_add(fd_len as i64 - stale_len as i64, Ordering::Relaxed);
                    lss.finalize_write(res);
                }
                return Ok(());
            } else if let (Some(lss), Some(res)) = (&self.lss, reservation) {
                lss.discard_block(&res, 0);
                lss.discard_block(&res, 1);
                lss.finalize_write(res);
            }
        }
    }

    /// Marshals the view's unflushed chain top (or, with `reloc`, a
    /// full relocation image), reserves log space, publishes, and
    /// finalizes the reservation — discarding the blocks when the
    /// publish loses its compare-and-swap.
    pub(crate) fn persist_and_update<'g>(
        &self,
        view: &mut PageView<'g>,
        ctx: &WCtx,
        reloc: bool,
        guard: &'g Guard,
    ) -> Result<bool, StoreError> {
        let lss = match &self.lss {
            Some(lss) => lss,
            None => return Ok(self.update_mapping_raw(view, ctx, guard)),
        };
        let mut pg_buf = ctx.buffer(if reloc { CtxBuf::Reloc } else { CtxBuf::Persist });
        let mut filter = self.compaction_filter();
        let max_segments = if reloc { 0 } else { self.cfg.max_page_segments };
        let info = view.marshal(&mut pg_buf, max_segments, &mut filter, guard);

        let res = match lss.reserve_space(BLOCK_TYPE_SIZE + pg_buf.len()) {
            Ok(res) => res,
            Err(e) => {
                view.abandon_unpublished(guard);
                return Err(e);
            }
        };
        let typ = match (reloc, info.full_image) {
            (true, _) => BlockType::PageReloc,
            (false, true) => BlockType::PageData,
            (false, false) => BlockType::PageUpdate,
        };
        lss.write_block(&res, 0, typ, &pg_buf);
        view.add_flush_record(res.offset(0), info.data_len, info.num_segments, guard);

        if self.update_mapping_raw(view, ctx, guard) {
            ctx.stats.flush_data_size.fetch_add(
                info.data_len as i64 - info.stale_len as i64,
                Ordering::Relaxed,
            );
            lss.finalize_write(res);
            Ok(true)
        } else {
            lss.discard_block(&res, 0);
            lss.finalize_write(res);
            Ok(false)
        }
    }

    /// Sleeps the calling writer while the store is over its memory
    /// quota, making eviction progress on the writer's own time.
    fn try_throttle_for_memory(&self, ctx: &WCtx) {
        if self.has_memory_pressure.load(Ordering::Relaxed) {
            while self.trigger_swapper(ctx) && !self.shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(SWAPPER_WAIT_INTERVAL);
            }
        }
    }

    // --- daemons -----------------------------------------------------

    fn spawn_daemons(self: &Arc<Self>) {
        let mut daemons = self.daemons.lock().unwrap();

        daemons.push(spawn_daemon(
            self,
            "lodestore-mem-monitor",
            MEM_MONITOR_INTERVAL,
            |store, ctx| {
                let pressure = store.trigger_swapper(ctx);
                store
                    .has_memory_pressure
                    .store(pressure, Ordering::Relaxed);
            },
        ));

        if self.lss.is_some() && self.cfg.auto_swapper {
            daemons.push(spawn_daemon(
                self,
                "lodestore-swapper",
                SWAPPER_WAIT_INTERVAL,
                |store, ctx| {
                    if store.has_memory_pressure.load(Ordering::Relaxed) {
                        store.trigger_swapper(ctx);
                    } else {
                        std::thread::sleep(MEM_MONITOR_INTERVAL);
                    }
                },
            ));
        }

        if self.lss.is_some() && self.cfg.auto_cleaner {
            daemons.push(spawn_daemon(
                self,
                "lodestore-cleaner",
                CLEANER_INTERVAL,
                |store, ctx| {
                    if store.should_run_cleaner() {
                        if let Err(e) = store.run_cleaner_pass(ctx) {
                            error!("cleaner pass failed: {}", e);
                        }
                    }
                },
            ));
        }

        daemons.push(spawn_daemon(
            self,
            "lodestore-stats",
            RUNTIME_STATS_INTERVAL,
            runtime_stats_tick,
        ));
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // `close` already joined the daemons; otherwise just signal
        // them. They hold only weak references and exit on their next
        // tick.
        self.shutdown.store(true, Ordering::Release);
        REGISTRY.remove(&self.registry_id);
    }
}

/// Spawns a stop-flag-driven daemon thread holding a weak store
/// reference: tick, check the flag, sleep.
fn spawn_daemon<F>(
    store: &Arc<Store>,
    name: &'static str,
    interval: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(&Store, &WCtx) + Send + 'static,
{
    let weak = Arc::downgrade(store);
    let shutdown = store.shutdown.clone();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut ctx_slot = None;
            while !shutdown.load(Ordering::Relaxed) {
                let store = match weak.upgrade() {
                    Some(store) => store,
                    None => break,
                };
                let ctx = ctx_slot.get_or_insert_with(|| store.new_wctx());
                tick(&store, ctx);
                drop(store);
                sleep_with_shutdown(&shutdown, interval);
            }
            debug!("{} stopped", name);
        })
        .expect("failed to spawn daemon thread")
}

/// Sleeps in short slices so shutdown stays responsive even for daemons
/// with long tick intervals.
fn sleep_with_shutdown(shutdown: &AtomicBool, total: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO && !shutdown.load(Ordering::Relaxed) {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

fn runtime_stats_tick(store: &Store, _ctx: &WCtx) {
    use metrics::gauge;

    let snap = store.stats();

    // Previous-tick totals, for interval deltas.
    static LAST: Lazy<DashMap<u64, (i64, i64, i64, i64)>> = Lazy::new(DashMap::new);
    let prev = LAST
        .get(&store.registry_id)
        .map(|e| *e.value())
        .unwrap_or((0, 0, 0, 0));
    LAST.insert(
        store.registry_id,
        (
            snap.bytes_written,
            snap.bytes_incoming,
            snap.cache_hits,
            snap.cache_misses,
        ),
    );

    let (pw, pi, ph, pm) = prev;
    let dw = (snap.bytes_written - pw) as f64;
    let di = (snap.bytes_incoming - pi) as f64;
    if di > 0.0 {
        store.derived.set_write_amp(dw / di);
    }
    let hits = (snap.cache_hits - ph) as f64;
    let misses = (snap.cache_misses - pm) as f64;
    if hits + misses > 0.0 {
        store.derived.set_cache_hit_ratio(hits / (hits + misses));
    }

    gauge!(metrics_keys::MEMORY_USAGE_BYTES).set(snap.mem_used as f64);
    gauge!(metrics_keys::WRITE_AMPLIFICATION).set(store.derived.write_amp());
    let mut resident = snap;
    resident.derive_resident_ratio();
    gauge!(metrics_keys::RESIDENT_RATIO).set(resident.resident_ratio);
}

/// A handle for mutating the store. Writers are cheap to create, are
/// not thread-safe themselves, and may be used from any one thread at a
/// time; concurrency comes from creating one writer per thread.
pub struct Writer {
    store: Arc<Store>,
    ctx: WCtx,
}

impl Writer {
    /// Inserts (or overwrites) a key.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.store.ensure_open()?;
        self.store.try_throttle_for_memory(&self.ctx);
        let item = Item::new(key, value, self.store.mvcc.current_sn());

        loop {
            let guard = &epoch::pin();
            let reads = self.ctx.cache_meta_begin();
            let mut view = self.store.fetch_page(key, &self.ctx, guard)?;
            view.insert(item.clone(), guard);
            if self.store.try_smos(&mut view, &self.ctx, true, guard)? {
                self.ctx.cache_meta_end(reads);
                break;
            }
            self.ctx
                .stats
                .insert_conflicts
                .fetch_add(1, Ordering::Relaxed);
            counter!(metrics_keys::SMO_CONFLICTS_TOTAL, metrics_keys::LABEL_SMO_KIND => "insert")
                .increment(1);
        }

        self.ctx.stats.inserts.fetch_add(1, Ordering::Relaxed);
        self.ctx
            .stats
            .bytes_incoming
            .fetch_add((key.len() + value.len()) as i64, Ordering::Relaxed);
        self.store.items_count.fetch_add(1, Ordering::Relaxed);
        counter!(metrics_keys::OPERATIONS_TOTAL, metrics_keys::LABEL_OPERATION_TYPE => "insert")
            .increment(1);
        Ok(())
    }

    /// Deletes a key by publishing a tombstone version.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.store.ensure_open()?;
        self.store.try_throttle_for_memory(&self.ctx);
        let item = Item::tombstone(key, self.store.mvcc.current_sn());

        loop {
            let guard = &epoch::pin();
            let reads = self.ctx.cache_meta_begin();
            let mut view = self.store.fetch_page(key, &self.ctx, guard)?;
            view.delete(item.clone(), guard);
            if self.store.try_smos(&mut view, &self.ctx, true, guard)? {
                self.ctx.cache_meta_end(reads);
                break;
            }
            self.ctx
                .stats
                .delete_conflicts
                .fetch_add(1, Ordering::Relaxed);
            counter!(metrics_keys::SMO_CONFLICTS_TOTAL, metrics_keys::LABEL_SMO_KIND => "delete")
                .increment(1);
        }

        self.ctx.stats.deletes.fetch_add(1, Ordering::Relaxed);
        self.ctx
            .stats
            .bytes_incoming
            .fetch_add(key.len() as i64, Ordering::Relaxed);
        self.store.items_count.fetch_sub(1, Ordering::Relaxed);
        counter!(metrics_keys::OPERATIONS_TOTAL, metrics_keys::LABEL_OPERATION_TYPE => "delete")
            .increment(1);
        Ok(())
    }

    /// Finds the newest visible value for `key`.
    pub fn lookup(&mut self, key: &[u8]) -> Result<Option<Arc<[u8]>>, StoreError> {
        self.store.ensure_open()?;

        let guard = &epoch::pin();
        let reads = self.ctx.cache_meta_begin();
        let mut view = self.store.fetch_page(key, &self.ctx, guard)?;
        let mut filter = AcceptNewest::default();
        let found = view.lookup(key, &mut filter, guard);
        // Lookups still drive maintenance so read-heavy workloads keep
        // their chains short.
        self.store.try_smos(&mut view, &self.ctx, false, guard)?;
        self.ctx.cache_meta_end(reads);
        counter!(metrics_keys::OPERATIONS_TOTAL, metrics_keys::LABEL_OPERATION_TYPE => "lookup")
            .increment(1);
        Ok(found.map(|item| item.value().clone()))
    }

    /// Compacts every page, folding all delta chains into base pages.
    pub fn compact_all(&mut self) -> Result<(), StoreError> {
        self.store.ensure_open()?;
        let mut fences: Vec<Option<Arc<[u8]>>> = vec![None];
        {
            let mut cursor: Option<Arc<[u8]>> = None;
            while let Some((fence, _)) = self
                .store
                .table
                .next_indexed(cursor.as_deref().unwrap_or(&[]), cursor.is_none())
            {
                cursor = Some(fence.clone());
                fences.push(Some(fence));
            }
        }

        for fence in fences {
            loop {
                let guard = &epoch::pin();
                let pid = match &fence {
                    None => START_PID,
                    Some(low) => match self.store.table.index_get(low) {
                        Some(pid) => pid,
                        None => break, // removed since listing
                    },
                };
                let mut view = match self.store.read_page(pid, &self.ctx, guard) {
                    Ok(view) => view,
                    Err(StoreError::PageNotFound) => break,
                    Err(e) => return Err(e),
                };
                if view.need_removal() {
                    break;
                }
                let mut filter = self.store.compaction_filter();
                let stale = view.compact(&mut filter, guard);
                if self.store.update_mapping(&mut view, &self.ctx, guard)? {
                    self.ctx
                        .stats
                        .flush_data_size
                        .fetch_sub(stale as i64, Ordering::Relaxed);
                    break;
                }
            }
        }
        Ok(())
    }

    /// This writer's store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}
