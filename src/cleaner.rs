//! The log cleaner: relocates live data so the log head can advance.
//!
//! The cleaner scans forward from the oldest live offset, deciding per
//! block whether the data is still referenced. A block that is the
//! oldest segment of some page's persisted image is live: the page is
//! rewritten at the tail as a relocation image and its mapping entry is
//! swung over by compare-and-swap. Everything else is dead and merely
//! skipped. The scan trims the log in batches as it goes.
//!
//! Only one cleaner pass runs at a time; readers and writers are never
//! blocked by it.

use crossbeam_epoch as epoch;
use log::warn;
use metrics::counter;

use crate::error::StoreError;
use crate::item::Fence;
use crate::lss::{BlockType, LSS_RECLAIM_BLOCK_SIZE};
use crate::metrics_keys;
use crate::page;
use crate::pagetable::START_PID;
use crate::{CtxBuf, Store, WCtx};

/// Relocation attempts per block before the pass yields.
const RELOCATE_RETRIES: usize = 10;

enum BlockFate {
    Dead,
    Relocated,
    Contended,
}

impl Store {
    /// Whether fragmentation warrants a cleaner pass.
    pub(crate) fn should_run_cleaner(&self) -> bool {
        let (frag, _, used) = self.lss_info();
        used > 0 && frag as f64 / 100.0 >= self.cfg.cleaner_min_fragmentation
    }

    /// Runs one bounded cleaner pass over the log.
    pub(crate) fn run_cleaner_pass(&self, ctx: &WCtx) -> Result<(), StoreError> {
        let lss = match &self.lss {
            Some(lss) => lss,
            None => return Ok(()),
        };

        let pass_start = lss.start_offset();
        let mut scan_buf = ctx.buffer(CtxBuf::Cleaner);
        lss.run_cleaner(
            |offset, end_offset, payload| {
                let typ = match BlockType::from_u8(payload[0]) {
                    Some(typ) => typ,
                    None => panic!("invalid block type {} at log offset {}", payload[0], offset),
                };
                let body = &payload[crate::lss::BLOCK_TYPE_SIZE..];

                let fate = match typ {
                    // Superseded by construction: discards were never
                    // published, removals already folded into a parent
                    // image, and metadata is re-persisted at the end of
                    // the pass.
                    BlockType::Discard
                    | BlockType::PageRemove
                    | BlockType::MaxSn
                    | BlockType::RecoveryPoints => BlockFate::Dead,
                    BlockType::PageData | BlockType::PageReloc | BlockType::PageUpdate => {
                        let full = typ != BlockType::PageUpdate;
                        let seg = page::parse_segment(body, full)?;
                        self.relocate_if_live(seg.low, offset, ctx)?
                    }
                };

                match fate {
                    BlockFate::Dead | BlockFate::Relocated => {
                        let cont = end_offset - pass_start < LSS_RECLAIM_BLOCK_SIZE;
                        Ok((cont, end_offset))
                    }
                    BlockFate::Contended => {
                        // Leave the scan positioned at this block; the
                        // next pass retries it.
                        warn!("cleaner yielding at contended offset {}", offset);
                        Ok((false, offset))
                    }
                }
            },
            &mut scan_buf,
        )?;
        drop(scan_buf);

        // Metadata blocks behind the scan point were dropped; re-emit
        // the current values so recovery always finds them ahead of the
        // head.
        if self.cfg.enable_snapshots {
            self.persist_max_sn();
            self.persist_recovery_points(ctx);
        }
        counter!(metrics_keys::CLEANER_PASSES_TOTAL).increment(1);
        Ok(())
    }

    /// Relocates the page owning `low` when `offset` is the oldest
    /// segment of its current image; otherwise the block is dead.
    fn relocate_if_live(
        &self,
        low: Fence,
        offset: u64,
        ctx: &WCtx,
    ) -> Result<BlockFate, StoreError> {
        for _ in 0..RELOCATE_RETRIES {
            let guard = &epoch::pin();

            let pid = match &low {
                Fence::Unbounded => START_PID,
                Fence::Key(key) => match self.table.index_get(key) {
                    Some(pid) => pid,
                    None => return Ok(BlockFate::Dead),
                },
            };
            let mut view = match self.read_page(pid, ctx, guard) {
                Ok(view) => view,
                Err(StoreError::PageNotFound) => return Ok(BlockFate::Dead),
                Err(e) => return Err(e),
            };
            if view.low != low {
                return Ok(BlockFate::Dead);
            }
            if view.need_removal() {
                self.try_page_removal(pid, ctx, guard)?;
                continue;
            }
            match view.oldest_flush_offset(guard) {
                Some(oldest) if oldest == offset => {}
                _ => return Ok(BlockFate::Dead),
            }

            if self.persist_and_update(&mut view, ctx, true, guard)? {
                counter!(metrics_keys::CLEANER_RELOCATIONS_TOTAL).increment(1);
                return Ok(BlockFate::Relocated);
            }
        }
        Ok(BlockFate::Contended)
    }
}
