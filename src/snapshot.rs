//! Snapshots, recovery points, and rollback.
//!
//! A snapshot is a refcounted read position: every item version carries
//! the snapshot number that created it, and a reader at snapshot `sn`
//! sees the newest version at or below `sn`. Open snapshots and recovery
//! points pin history: the compaction filter keeps the newest version per
//! interval between them and drops the rest.
//!
//! Recovery points are durable snapshots. The list is marshaled to the
//! log whenever it changes, and [`Store::rollback`] masks every version
//! published after a recovery point by prepending rollback deltas across
//! all pages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};
use crossbeam_epoch as epoch;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::item::{Item, SnFilter};
use crate::lss::{BlockType, BLOCK_TYPE_SIZE};
use crate::pagetable::START_PID;
use crate::{CtxBuf, Store, WCtx};

/// A durable, named point in snapshot history that the store can be
/// rolled back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    /// The snapshot number the point captures.
    pub sn: u64,
    /// Caller-supplied metadata, carried verbatim.
    pub meta: Vec<u8>,
}

/// Snapshot bookkeeping shared across the engine.
pub(crate) struct MvccState {
    pub(crate) enabled: bool,
    curr_sn: AtomicU64,
    open: Mutex<BTreeMap<u64, usize>>,
    rp_version: AtomicU32,
    recovery_points: Mutex<Vec<RecoveryPoint>>,
}

impl MvccState {
    pub(crate) fn new(enabled: bool) -> Self {
        MvccState {
            enabled,
            curr_sn: AtomicU64::new(0),
            open: Mutex::new(BTreeMap::new()),
            rp_version: AtomicU32::new(0),
            recovery_points: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn init(&self) {
        // Snapshot numbers start at one; zero marks "never stamped".
        let _ = self
            .curr_sn
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn current_sn(&self) -> u64 {
        self.curr_sn.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_sn(&self, sn: u64) {
        self.curr_sn.fetch_max(sn, Ordering::AcqRel);
    }

    fn advance_sn(&self) -> u64 {
        self.curr_sn.fetch_add(1, Ordering::AcqRel)
    }

    /// The oldest snapshot any reader may still be positioned at. With
    /// no snapshot open, nothing below the next snapshot number needs
    /// more than its newest version.
    fn gc_sn(&self) -> u64 {
        let open = self.open.lock().unwrap();
        open.keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.current_sn() + 1)
    }

    /// Interval boundaries for the compaction filter: every recovery
    /// point below the garbage-collection snapshot, then the
    /// garbage-collection snapshot itself.
    pub(crate) fn gc_boundaries(&self) -> Arc<Vec<u64>> {
        let gc = self.gc_sn();
        let rps = self.recovery_points.lock().unwrap();
        let mut boundaries: Vec<u64> = rps.iter().map(|rp| rp.sn).filter(|&sn| sn < gc).collect();
        boundaries.push(gc);
        Arc::new(boundaries)
    }

    pub(crate) fn rp_version(&self) -> u16 {
        self.rp_version.load(Ordering::Acquire) as u16
    }

    pub(crate) fn restore_recovery_points(&self, version: u16, rps: Vec<RecoveryPoint>) {
        self.rp_version.store(version as u32, Ordering::Release);
        *self.recovery_points.lock().unwrap() = rps;
    }
}

/// A refcounted MVCC read position. Dropping the snapshot releases the
/// history it pinned.
pub struct Snapshot {
    sn: u64,
    store: Arc<Store>,
}

impl Snapshot {
    pub fn sn(&self) -> u64 {
        self.sn
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let mut open = self.store.mvcc.open.lock().unwrap();
        if let Some(count) = open.get_mut(&self.sn) {
            *count -= 1;
            if *count == 0 {
                open.remove(&self.sn);
            }
        }
    }
}

impl Store {
    /// Opens a snapshot at the current position and advances the
    /// snapshot counter, so later writes are invisible to it.
    pub fn new_snapshot(self: &Arc<Self>) -> Snapshot {
        let sn = {
            let mut open = self.mvcc.open.lock().unwrap();
            let sn = self.mvcc.advance_sn();
            *open.entry(sn).or_insert(0) += 1;
            sn
        };
        if self.lss.is_some() && self.cfg.enable_snapshots {
            self.persist_max_sn();
        }
        Snapshot {
            sn,
            store: self.clone(),
        }
    }

    /// Captures a durable recovery point at the current snapshot.
    pub fn create_recovery_point(&self, meta: &[u8]) -> Result<RecoveryPoint, StoreError> {
        self.mvcc
            .enabled
            .then_some(())
            .ok_or_else(|| StoreError::Config("snapshots are disabled".to_string()))?;

        let rp = RecoveryPoint {
            sn: self.mvcc.advance_sn(),
            meta: meta.to_vec(),
        };
        {
            let mut rps = self.mvcc.recovery_points.lock().unwrap();
            rps.push(rp.clone());
        }
        self.mvcc.rp_version.fetch_add(1, Ordering::AcqRel);

        if self.lss.is_some() {
            let ctx = self.gstats_ctx();
            self.persist_recovery_points(&ctx);
            self.persist_max_sn();
            self.sync(true);
        }
        Ok(rp)
    }

    /// The current recovery-point list, oldest first.
    pub fn recovery_points(&self) -> Vec<RecoveryPoint> {
        self.mvcc.recovery_points.lock().unwrap().clone()
    }

    /// Rolls the store back to `rp`: every version published after the
    /// recovery point becomes invisible, on every page, at every
    /// snapshot.
    pub fn rollback(&self, rp: &RecoveryPoint) -> Result<(), StoreError> {
        self.mvcc
            .enabled
            .then_some(())
            .ok_or_else(|| StoreError::Config("snapshots are disabled".to_string()))?;
        {
            let rps = self.mvcc.recovery_points.lock().unwrap();
            if !rps.iter().any(|p| p.sn == rp.sn) {
                return Err(StoreError::Config(format!(
                    "unknown recovery point at sn {}",
                    rp.sn
                )));
            }
        }

        let end_sn = self.mvcc.current_sn();
        let ctx = self.new_wctx();

        // Start page first, then every indexed fence.
        let mut cursor: Option<Arc<[u8]>> = None;
        loop {
            loop {
                let guard = &epoch::pin();
                let pid = match &cursor {
                    None => START_PID,
                    Some(low) => match self.table.index_get(low) {
                        Some(pid) => pid,
                        None => break,
                    },
                };
                let mut view = match self.read_page(pid, &ctx, guard) {
                    Ok(view) => view,
                    Err(StoreError::PageNotFound) => break,
                    Err(e) => return Err(e),
                };
                if view.need_removal() {
                    self.try_page_removal(pid, &ctx, guard)?;
                    break;
                }
                view.rollback(rp.sn, end_sn, guard);
                if self.update_mapping(&mut view, &ctx, guard)? {
                    break;
                }
            }
            match self
                .table
                .next_indexed(cursor.as_deref().unwrap_or(&[]), false)
            {
                Some((fence, _)) => cursor = Some(fence),
                None => break,
            }
        }

        {
            let mut rps = self.mvcc.recovery_points.lock().unwrap();
            rps.retain(|p| p.sn <= rp.sn);
        }
        self.mvcc.rp_version.fetch_add(1, Ordering::AcqRel);
        // Snapshot numbers inside the rolled-back range are burned;
        // writes from here on must stamp past it.
        self.mvcc.set_current_sn(end_sn + 1);

        if self.lss.is_some() {
            self.persist_recovery_points(&ctx);
            self.persist_max_sn();
            self.sync(true);
        }
        Ok(())
    }

    /// Writes the snapshot watermark to the log.
    pub(crate) fn persist_max_sn(&self) {
        let lss = match &self.lss {
            Some(lss) => lss,
            None => return,
        };
        let sn = self.mvcc.current_sn();
        match lss.reserve_space(BLOCK_TYPE_SIZE + 8) {
            Ok(res) => {
                lss.write_block(&res, 0, BlockType::MaxSn, &sn.to_be_bytes());
                lss.finalize_write(res);
            }
            Err(e) => log::error!("failed to persist snapshot watermark: {}", e),
        }
    }

    /// Writes the marshaled recovery-point list to the log.
    pub(crate) fn persist_recovery_points(&self, ctx: &WCtx) {
        let lss = match &self.lss {
            Some(lss) => lss,
            None => return,
        };
        let mut buf = ctx.buffer(CtxBuf::EncMeta);
        buf.clear();
        buf.extend_from_slice(&self.mvcc.rp_version().to_be_bytes());
        let rps = self.mvcc.recovery_points.lock().unwrap().clone();
        if let Err(e) = ciborium::into_writer(&rps, &mut *buf) {
            log::error!("failed to marshal recovery points: {}", e);
            return;
        }
        match lss.reserve_space(BLOCK_TYPE_SIZE + buf.len()) {
            Ok(res) => {
                lss.write_block(&res, 0, BlockType::RecoveryPoints, &buf);
                lss.finalize_write(res);
            }
            Err(e) => log::error!("failed to persist recovery points: {}", e),
        }
    }
}

/// Decodes a `RecoveryPoints` block body.
pub(crate) fn parse_recovery_points(body: &[u8]) -> Result<(u16, Vec<RecoveryPoint>), StoreError> {
    if body.len() < 2 {
        return Err(StoreError::Corrupt(
            "truncated recovery-point block".to_string(),
        ));
    }
    let version = BigEndian::read_u16(&body[..2]);
    let rps: Vec<RecoveryPoint> = ciborium::from_reader(&body[2..])
        .map_err(|e| StoreError::Corrupt(format!("recovery-point list: {}", e)))?;
    Ok((version, rps))
}

/// Decodes a `MaxSn` block body.
pub(crate) fn parse_max_sn(body: &[u8]) -> Result<u64, StoreError> {
    if body.len() < 8 {
        return Err(StoreError::Corrupt("truncated MaxSn block".to_string()));
    }
    Ok(BigEndian::read_u64(&body[..8]))
}

/// A snapshot-filtered read handle.
pub struct Reader {
    store: Arc<Store>,
    ctx: WCtx,
}

impl Reader {
    pub(crate) fn new(store: Arc<Store>, ctx: WCtx) -> Self {
        Reader { store, ctx }
    }

    /// Finds the newest version of `key` visible at `snap`.
    pub fn lookup(
        &mut self,
        snap: &Snapshot,
        key: &[u8],
    ) -> Result<Option<Arc<[u8]>>, StoreError> {
        let guard = &epoch::pin();
        let view = self.store.fetch_page(key, &self.ctx, guard)?;
        let mut filter = SnFilter::new(snap.sn);
        Ok(view
            .lookup(key, &mut filter, guard)
            .map(|item| item.value().clone()))
    }

    /// Iterates every visible item at `snap` in key order.
    pub fn iter<'r>(&'r mut self, snap: &Snapshot) -> SnapshotIter<'r> {
        SnapshotIter {
            reader: self,
            sn: snap.sn,
            buffered: Vec::new(),
            pos: 0,
            cursor: Cursor::Start,
        }
    }
}

enum Cursor {
    Start,
    At(Arc<[u8]>),
    Done,
}

/// An ordered scan over one snapshot. Pages are folded one at a time;
/// structural changes concurrent with the scan are absorbed by
/// re-fetching through the ordered index at each fence.
pub struct SnapshotIter<'r> {
    reader: &'r mut Reader,
    sn: u64,
    buffered: Vec<Item>,
    pos: usize,
    cursor: Cursor,
}

impl SnapshotIter<'_> {
    fn refill(&mut self) -> Result<bool, StoreError> {
        loop {
            let from: &[u8] = match &self.cursor {
                Cursor::Start => &[],
                Cursor::At(key) => key,
                Cursor::Done => return Ok(false),
            };

            let guard = &epoch::pin();
            let view = self
                .reader
                .store
                .fetch_page(from, &self.reader.ctx, guard)?;
            let mut filter = SnFilter::new(self.sn);
            let items = view.fold(&mut filter, guard);

            let lower_bound: Option<&[u8]> = match &self.cursor {
                Cursor::At(key) => Some(key),
                _ => None,
            };
            self.buffered.clear();
            self.pos = 0;
            self.buffered.extend(
                items
                    .into_iter()
                    .filter(|item| !item.is_tombstone())
                    .filter(|item| lower_bound.map(|lb| item.key() >= lb).unwrap_or(true)),
            );

            self.cursor = match view.hi.as_key() {
                Some(hi) => Cursor::At(hi.clone()),
                None => Cursor::Done,
            };

            if !self.buffered.is_empty() {
                return Ok(true);
            }
        }
    }
}

impl Iterator for SnapshotIter<'_> {
    type Item = Result<Item, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buffered.len() {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
        let item = self.buffered[self.pos].clone();
        self.pos += 1;
        Some(Ok(item))
    }
}
