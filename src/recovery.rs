//! Recovery: rebuilding the mapping table from the log.
//!
//! The log is scanned head to tail. Page images create or replace pages,
//! incremental updates append to the page they name, removal metadata
//! deletes pages, and the snapshot watermark and recovery-point list are
//! restored from their newest blocks. Because blocks were appended in
//! commit order, replaying them in offset order reproduces exactly the
//! state the last commit made durable, and replaying twice is a no-op:
//! later blocks always supersede earlier ones.
//!
//! After the scan every page's right-sibling pointer is wired from its
//! successor in the ordered index. A gap between one page's high fence
//! and the next page's low fence means the log lost a page image; that
//! is corruption, and recovery panics rather than serving a store with a
//! hole in its key space.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Shared};

use crate::error::StoreError;
use crate::item::Fence;
use crate::lss::BlockType;
use crate::page::{self, defer_destroy_chain, Op};
use crate::pagetable::{PageId, START_PID};
use crate::{CtxBuf, Store, WCtx};

impl Store {
    pub(crate) fn do_recovery(&self, ctx: &WCtx) -> Result<(), StoreError> {
        let lss = self.lss.as_ref().expect("recovery requires a log");

        let mut buf = ctx.buffer(CtxBuf::Recovery);
        lss.visit(
            |offset, payload| {
                let typ = match BlockType::from_u8(payload[0]) {
                    Some(typ) => typ,
                    None => panic!(
                        "invalid block type {} at log offset {} during recovery",
                        payload[0], offset
                    ),
                };
                let body = &payload[crate::lss::BLOCK_TYPE_SIZE..];

                match typ {
                    BlockType::Discard => {}
                    BlockType::MaxSn => {
                        self.mvcc.set_current_sn(crate::snapshot::parse_max_sn(body)?);
                    }
                    BlockType::RecoveryPoints => {
                        let (version, rps) = crate::snapshot::parse_recovery_points(body)?;
                        self.mvcc.restore_recovery_points(version, rps);
                    }
                    BlockType::PageRemove => {
                        let low = page::parse_page_remove(body)?;
                        self.replay_page_remove(low, ctx)?;
                    }
                    BlockType::PageData | BlockType::PageReloc | BlockType::PageUpdate => {
                        let full = typ != BlockType::PageUpdate;
                        let seg = page::parse_segment(body, full)?;
                        let data_len = body.len() as u32;
                        if full {
                            self.replay_page_image(offset, data_len, seg, ctx)?;
                        } else {
                            self.replay_page_update(offset, data_len, seg, ctx)?;
                        }
                    }
                }
                Ok(true)
            },
            &mut buf,
        )?;
        drop(buf);

        self.wire_right_siblings(ctx)?;
        Ok(())
    }

    fn recovered_pid(&self, low: &Fence, guard: &epoch::Guard) -> Option<PageId> {
        match low {
            Fence::Unbounded => {
                if self.table.head(START_PID, guard).is_null() {
                    None
                } else {
                    Some(START_PID)
                }
            }
            Fence::Key(key) => self.table.index_get(key),
        }
    }

    fn replay_page_remove(&self, low: Fence, ctx: &WCtx) -> Result<(), StoreError> {
        let guard = &epoch::pin();
        let key = match low.as_key() {
            Some(key) => key.clone(),
            None => return Ok(()), // the start page is never removed
        };
        let pid = match self.table.index_get(&key) {
            Some(pid) => pid,
            None => return Ok(()),
        };
        let view = self.read_page(pid, ctx, guard)?;
        ctx.stats
            .flush_data_size
            .fetch_sub(view.flush_data_size(guard) as i64, Ordering::Relaxed);

        self.table.index_remove(&key);
        self.table.clear(pid);
        // SAFETY: the chain became unreachable when the slot cleared;
        // recovery is single-threaded, so no reader holds it.
        let (bytes, records) = unsafe { defer_destroy_chain(view.head, Shared::null(), guard) };
        ctx.stats
            .free_size
            .fetch_add(bytes as i64, Ordering::Relaxed);
        ctx.stats
            .num_record_frees
            .fetch_add(records as i64, Ordering::Relaxed);
        self.table.free_pid(pid);
        Ok(())
    }

    /// A self-contained image creates the page or replaces whatever the
    /// earlier log had built for it.
    fn replay_page_image(
        &self,
        offset: u64,
        data_len: u32,
        seg: page::ParsedSegment,
        ctx: &WCtx,
    ) -> Result<(), StoreError> {
        let guard = &epoch::pin();
        let low = seg.low.clone();

        match self.recovered_pid(&low, guard) {
            None => {
                let pid = match &low {
                    Fence::Unbounded => START_PID,
                    Fence::Key(_) => self.table.alloc_pid(),
                };
                let mut view = page::assemble_chain(pid, vec![(offset, data_len, seg)], None, guard)
                    .expect("a full image always yields a chain");
                self.create_mapping(&mut view, ctx);
                if let Fence::Key(key) = low {
                    self.table
                        .index_insert(key, pid)
                        .expect("recovery builds each fence once");
                }
                ctx.stats
                    .flush_data_size
                    .fetch_add(data_len as i64, Ordering::Relaxed);
            }
            Some(pid) => {
                let curr = self.read_page(pid, ctx, guard)?;
                ctx.stats.flush_data_size.fetch_add(
                    data_len as i64 - curr.flush_data_size(guard) as i64,
                    Ordering::Relaxed,
                );
                let mut view = page::assemble_chain(pid, vec![(offset, data_len, seg)], None, guard)
                    .expect("a full image always yields a chain");
                view.prev_head = curr.head;
                view.displaced = true;
                let updated = self.update_mapping(&mut view, ctx, guard)?;
                debug_assert!(updated, "recovery replay is single-threaded");
            }
        }
        Ok(())
    }

    /// An incremental update must follow an existing page; an orphan
    /// update belongs to a page whose newer image superseded it.
    fn replay_page_update(
        &self,
        offset: u64,
        data_len: u32,
        seg: page::ParsedSegment,
        ctx: &WCtx,
    ) -> Result<(), StoreError> {
        let guard = &epoch::pin();
        let pid = match self.recovered_pid(&seg.low, guard) {
            Some(pid) => pid,
            None => return Ok(()),
        };

        let mut view = self.read_page(pid, ctx, guard)?;
        let num_segments = view
            .flush_info(guard)
            .map(|(_, _, n)| n)
            .unwrap_or(0);

        // Records were serialized newest-first.
        for op in seg.records.into_iter().rev() {
            match op {
                Op::Insert(item) => view.insert(item, guard),
                Op::Delete(item) => view.delete(item, guard),
                Op::Rollback { start_sn, end_sn } => view.rollback(start_sn, end_sn, guard),
                _ => unreachable!("updates carry only item and rollback records"),
            }
        }
        view.add_flush_record(offset, data_len, num_segments + 1, guard);

        let updated = self.update_mapping(&mut view, ctx, guard)?;
        debug_assert!(updated, "recovery replay is single-threaded");
        ctx.stats
            .flush_data_size
            .fetch_add(data_len as i64, Ordering::Relaxed);
        Ok(())
    }

    /// Wires every page's right sibling from its successor in key order
    /// and checks that the fences tile the key space without gaps.
    fn wire_right_siblings(&self, ctx: &WCtx) -> Result<(), StoreError> {
        let guard = &epoch::pin();

        if self.table.head(START_PID, guard).is_null() {
            let seed = page::seed_page(guard);
            self.table.create(START_PID, seed.head);
        }

        let mut fences: Vec<(Option<Arc<[u8]>>, PageId)> = vec![(None, START_PID)];
        let mut cursor: Option<Arc<[u8]>> = None;
        while let Some((fence, pid)) = self
            .table
            .next_indexed(cursor.as_deref().unwrap_or(&[]), cursor.is_none())
        {
            cursor = Some(fence.clone());
            fences.push((Some(fence), pid));
        }

        let mut prev: Option<(PageId, Fence)> = None;
        for (low, pid) in fences {
            let view = self.read_page(pid, ctx, guard)?;

            if let Some((prev_pid, prev_hi)) = prev {
                let adjacent = match (&prev_hi, &low) {
                    (Fence::Key(hi), Some(low)) => hi == low,
                    _ => false,
                };
                if !adjacent {
                    panic!(
                        "recovery found non-adjacent pages: a page image is missing from the log"
                    );
                }
                let mut prev_head = self.table.head(prev_pid, guard);
                // SAFETY: recovery runs single-threaded before any
                // writer or daemon exists, so the head is uniquely
                // referenced.
                unsafe { prev_head.deref_mut().right = Some(pid) };
            }

            prev = Some((pid, view.hi.clone()));
        }

        if let Some((_, last_hi)) = prev {
            if !last_hi.is_unbounded() {
                panic!("recovery found a bounded final page: the log is missing its tail page");
            }
        }
        Ok(())
    }
}
