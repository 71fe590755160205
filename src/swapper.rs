//! Page eviction and swap-in.
//!
//! Eviction is a clock sweep over the ordered index: every page access
//! sets its reference bit, the sweep clears bits on the first pass and
//! evicts pages whose bit is still clear on the next. An evicted page
//! leaves behind a single swap-out delta naming the log offset of its
//! newest persisted segment; faulting the page back walks the segment
//! back-links and rebuilds the chain in memory.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Guard};
use metrics::counter;

use crate::error::StoreError;
use crate::lss::BlockType;
use crate::metrics_keys;
use crate::page::{self, Op, PageView, ParsedSegment};
use crate::pagetable::{PageId, START_PID};
use crate::{CtxBuf, Store, WCtx};

/// Pages probed per clock-sweep batch.
const CLOCK_BATCH: usize = 32;

impl Store {
    /// One eviction round: returns whether the store is still over its
    /// memory quota afterwards. Pages get a second chance through their
    /// reference bit before being swapped out.
    pub(crate) fn trigger_swapper(&self, ctx: &WCtx) -> bool {
        if self.lss.is_none() {
            return false;
        }
        let quota = self.cfg.memory_quota;
        if quota == u64::MAX || self.memory_in_use() <= quota as i64 {
            return false;
        }

        for _ in 0..CLOCK_BATCH {
            let pid = match self.clock_next() {
                Some(pid) => pid,
                // The fence under the hand was removed; the hand has
                // already advanced, so just take the next probe.
                None => continue,
            };
            if self.table.take_referenced(pid) {
                continue;
            }
            if let Err(e) = self.try_swap_out(pid, ctx) {
                log::error!("swap-out of {:?} failed: {}", pid, e);
            }
            if self.memory_in_use() <= quota as i64 {
                break;
            }
        }

        self.memory_in_use() > quota as i64
    }

    /// Advances the clock hand one page, cycling through the start page
    /// and every indexed fence.
    fn clock_next(&self) -> Option<PageId> {
        let mut hand = self.clock_hand.lock().unwrap();
        match hand.take() {
            None => {
                // The hand passes the start page once per revolution.
                match self.table.next_indexed(&[], true) {
                    Some((fence, _)) => *hand = Some(fence),
                    None => *hand = None,
                }
                Some(START_PID)
            }
            Some(key) => {
                let curr = self.table.index_get(&key);
                *hand = self
                    .table
                    .next_indexed(&key, false)
                    .map(|(fence, _)| fence);
                // The fence may have been removed since the last tick;
                // fall through to the hand's new position next call.
                curr
            }
        }
    }

    /// Evicts one page: persists any records that exist only in memory,
    /// publishes a swap-out delta, and retires the resident chain.
    pub(crate) fn try_swap_out(&self, pid: PageId, ctx: &WCtx) -> Result<bool, StoreError> {
        let lss = match &self.lss {
            Some(lss) => lss,
            None => return Ok(false),
        };

        let guard = &epoch::pin();
        let head = self.table.head(pid, guard);
        if head.is_null() {
            return Ok(false);
        }
        let mut view = PageView::from_head(pid, head);
        if view.is_evicted() || view.need_removal() {
            return Ok(false);
        }

        if view.has_unflushed(guard) {
            // Dirty tail: relocate the whole page image first so the
            // swap-out delta has a single segment to point at.
            let mut pg_buf = ctx.buffer(CtxBuf::Persist);
            let mut filter = self.compaction_filter();
            let info = view.marshal(&mut pg_buf, 0, &mut filter, guard);

            let res = lss.reserve_space(crate::lss::BLOCK_TYPE_SIZE + pg_buf.len())?;
            lss.write_block(&res, 0, BlockType::PageReloc, &pg_buf);
            let offset = res.offset(0);
            view.swap_out(offset, info.data_len, guard);

            if self.update_mapping(&mut view, ctx, guard)? {
                ctx.stats.flush_data_size.fetch_add(
                    info.data_len as i64 - info.stale_len as i64,
                    Ordering::Relaxed,
                );
                lss.finalize_write(res);
                counter!(metrics_keys::SWAP_TOTAL, metrics_keys::LABEL_SWAP_DIR => "out")
                    .increment(1);
                Ok(true)
            } else {
                lss.discard_block(&res, 0);
                lss.finalize_write(res);
                Ok(false)
            }
        } else {
            let (offset, _, _) = match view.flush_info(guard) {
                Some(info) => info,
                None => return Ok(false),
            };
            let data_len = view.flush_data_size(guard);
            view.swap_out(offset, data_len, guard);
            let swapped = self.update_mapping(&mut view, ctx, guard)?;
            if swapped {
                counter!(metrics_keys::SWAP_TOTAL, metrics_keys::LABEL_SWAP_DIR => "out")
                    .increment(1);
            }
            Ok(swapped)
        }
    }

    /// Faults an evicted page back from the log and swaps the rebuilt
    /// chain in place of the swap-out delta. Returns `false` when the
    /// publish lost a race.
    pub(crate) fn swap_in<'g>(
        &self,
        view: &PageView<'g>,
        ctx: &WCtx,
        guard: &'g Guard,
    ) -> Result<bool, StoreError> {
        // SAFETY: the view's head is protected by `guard`.
        let head = unsafe { view.head.deref() };
        let offset = match head.op {
            Op::SwapOut { offset, .. } => offset,
            _ => return Ok(true),
        };

        // Pin the trim so the cleaner cannot reclaim the segments while
        // we chase their back-links.
        ctx.safe_offset.store(offset, Ordering::Release);
        let result = self.swap_in_at(view, offset, ctx, guard);
        ctx.safe_offset.store(u64::MAX, Ordering::Release);
        result
    }

    fn swap_in_at<'g>(
        &self,
        view: &PageView<'g>,
        offset: u64,
        ctx: &WCtx,
        guard: &'g Guard,
    ) -> Result<bool, StoreError> {
        let segments = self.fetch_segments(offset, ctx)?;

        let right = segments
            .first()
            .and_then(|(_, _, seg)| seg.hi.as_key())
            .and_then(|hi| self.table.index_get(hi));

        let mut rebuilt = page::assemble_chain(view.pid, segments, right, guard)
            .ok_or_else(|| StoreError::Corrupt("page image resolved to no segments".to_string()))?;
        rebuilt.mark_swapped_in(offset, guard);

        let records = rebuilt.new_alloc_records as i64;
        rebuilt.prev_head = view.head;
        rebuilt.displaced = true;

        if self.update_mapping(&mut rebuilt, ctx, guard)? {
            ctx.stats
                .num_record_swapin
                .fetch_add(records, Ordering::Relaxed);
            counter!(metrics_keys::SWAP_TOTAL, metrics_keys::LABEL_SWAP_DIR => "in").increment(1);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reads a page image from the log: the segment at `offset`, then
    /// every prior segment its back-links name, newest first.
    pub(crate) fn fetch_segments(
        &self,
        offset: u64,
        ctx: &WCtx,
    ) -> Result<Vec<(u64, u32, ParsedSegment)>, StoreError> {
        let lss = self.lss.as_ref().expect("fetch requires persistence");
        let mut buf = ctx.buffer(CtxBuf::Fetch);
        let mut segments = Vec::new();
        let mut curr = offset;

        loop {
            let n = lss.read(curr, &mut buf)?;
            ctx.stats.num_lss_reads.fetch_add(1, Ordering::Relaxed);
            ctx.stats
                .lss_read_bytes
                .fetch_add(n as i64, Ordering::Relaxed);
            counter!(metrics_keys::LSS_READS_TOTAL).increment(1);

            let typ = BlockType::from_u8(buf[0]);
            let body = &buf[crate::lss::BLOCK_TYPE_SIZE..n];
            match typ {
                Some(BlockType::PageData) | Some(BlockType::PageReloc) => {
                    let seg = page::parse_segment(body, true)?;
                    segments.push((curr, body.len() as u32, seg));
                    break;
                }
                Some(BlockType::PageUpdate) => {
                    let seg = page::parse_segment(body, false)?;
                    let prev = seg.prev_offset.expect("updates carry a back-link");
                    segments.push((curr, body.len() as u32, seg));
                    curr = prev;
                }
                other => panic!(
                    "invalid page block type {:?} at log offset {}",
                    other, curr
                ),
            }
        }

        Ok(segments)
    }
}
