//! The logical page: a chain of immutable delta records ending in a base
//! page.
//!
//! A page is never mutated in place. Every change allocates a new delta
//! that points at the current head, and the new head is published with a
//! compare-and-swap on the mapping table. Readers walk the chain
//! newest-first under an epoch guard; displaced chains are handed to the
//! epoch reclaimer once unlinked.
//!
//! The same chain is what gets persisted: [`PageView::marshal`] emits
//! either an incremental segment (the deltas above the newest flush
//! record, with a back-link to the previous segment) or a fresh
//! self-contained image when the segment chain has grown too long.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::error::StoreError;
use crate::item::{Fence, Item, ItemFilter};
use crate::pagetable::PageId;

/// One record in a page's delta chain.
pub(crate) struct Delta {
    pub(crate) op: Op,
    /// Number of deltas above the base, counting this one.
    pub(crate) chain_len: u32,
    /// Approximate number of item versions in the page.
    pub(crate) num_items: i32,
    pub(crate) low: Fence,
    pub(crate) hi: Fence,
    /// The next page in key order; `None` is the end sentinel.
    pub(crate) right: Option<PageId>,
    /// The next-older record in the chain.
    pub(crate) next: Atomic<Delta>,
}

pub(crate) enum Op {
    Insert(Item),
    Delete(Item),
    /// The terminal record: items sorted by key ascending, snapshot
    /// descending.
    Base(Box<[Item]>),
    /// This page was split at `at`; the new right sibling is recorded in
    /// the delta's `right` field.
    Split { at: Arc<[u8]> },
    /// The right sibling's chain, absorbed during page removal.
    Merge { child: Atomic<Delta> },
    /// The page is marked for removal; writers seeing this help the
    /// removal along instead of publishing.
    Remove,
    /// Pins the chain segment below to a log offset.
    Flush {
        offset: u64,
        data_len: u32,
        /// Incremental segments composing the persisted image, this one
        /// included.
        num_segments: u32,
    },
    /// The page's items live in the log; `offset` addresses the newest
    /// segment of its persisted image.
    SwapOut { offset: u64, data_len: u32 },
    /// Marks a chain rebuilt from the log.
    SwapIn { offset: u64 },
    /// Versions with `start_sn < sn <= end_sn` are invisible.
    Rollback { start_sn: u64, end_sn: u64 },
}

impl Delta {
    /// Heap footprint for quota accounting.
    pub(crate) fn mem_size(&self) -> usize {
        let payload = match &self.op {
            Op::Insert(item) | Op::Delete(item) => item.mem_size(),
            Op::Base(items) => items.iter().map(Item::mem_size).sum(),
            Op::Split { at } => at.len(),
            _ => 0,
        };
        std::mem::size_of::<Delta>() + payload
    }

    pub(crate) fn is_removed(&self) -> bool {
        matches!(self.op, Op::Remove)
    }

    pub(crate) fn is_evicted(&self) -> bool {
        matches!(self.op, Op::SwapOut { .. })
    }
}

/// A working handle on one page: the head observed at read time plus any
/// locally prepended, not-yet-published records.
pub(crate) struct PageView<'g> {
    pub(crate) pid: PageId,
    /// The head as read; the compare-and-swap expectation.
    pub(crate) prev_head: Shared<'g, Delta>,
    /// The working head, ahead of `prev_head` by the local records.
    pub(crate) head: Shared<'g, Delta>,
    pub(crate) low: Fence,
    pub(crate) hi: Fence,
    pub(crate) right: Option<PageId>,
    pub(crate) chain_len: u32,
    pub(crate) num_items: i32,
    /// Bytes and records allocated locally, reported to the write
    /// context once the publish succeeds.
    pub(crate) new_alloc_bytes: usize,
    pub(crate) new_alloc_records: usize,
    /// The working head no longer links to `prev_head`; a successful
    /// publish must retire the whole displaced chain.
    pub(crate) displaced: bool,
    /// The displaced records are leaving memory for the log, not dying.
    pub(crate) evicting: bool,
}

/// What `marshal` produced.
pub(crate) struct MarshalInfo {
    /// Encoded payload length (the flush-record `data_len`).
    pub(crate) data_len: u32,
    /// Flush bytes superseded by this segment.
    pub(crate) stale_len: u32,
    /// Segment count to record in the new flush record.
    pub(crate) num_segments: u32,
    /// Whether the payload is a self-contained image (`PageData` /
    /// `PageReloc`) rather than an incremental `PageUpdate`.
    pub(crate) full_image: bool,
}

/// A block payload decoded back into chain form.
pub(crate) struct ParsedSegment {
    pub(crate) low: Fence,
    pub(crate) hi: Fence,
    pub(crate) records: Vec<Op>,
    pub(crate) base: Option<Box<[Item]>>,
    /// Back-link to the prior segment; present only on `PageUpdate`.
    pub(crate) prev_offset: Option<u64>,
}

impl<'g> PageView<'g> {
    /// Builds a view over an existing head. `head` must be non-null.
    pub(crate) fn from_head(pid: PageId, head: Shared<'g, Delta>) -> PageView<'g> {
        // SAFETY: callers pass heads loaded from the mapping table under
        // the same guard; a published head is never null.
        let d = unsafe { head.deref() };
        PageView {
            pid,
            prev_head: head,
            head,
            low: d.low.clone(),
            hi: d.hi.clone(),
            right: d.right,
            chain_len: d.chain_len,
            num_items: d.num_items,
            new_alloc_bytes: 0,
            new_alloc_records: 0,
            displaced: false,
            evicting: false,
        }
    }

    pub(crate) fn in_range(&self, key: &[u8]) -> bool {
        self.low.contains_from_low(key) && self.hi.contains_below_hi(key)
    }

    pub(crate) fn need_compaction(&self, max_chain_len: usize) -> bool {
        self.chain_len as usize >= max_chain_len
    }

    pub(crate) fn need_split(&self, max_items: usize) -> bool {
        self.num_items >= max_items as i32
    }

    pub(crate) fn need_merge(&self, min_items: usize) -> bool {
        self.num_items <= min_items as i32
    }

    pub(crate) fn need_removal(&self) -> bool {
        // SAFETY: `head` is valid under the caller's guard.
        unsafe { self.head.deref() }.is_removed()
    }

    pub(crate) fn is_evicted(&self) -> bool {
        // SAFETY: `head` is valid under the caller's guard.
        unsafe { self.head.deref() }.is_evicted()
    }

    fn alloc(&mut self, delta: Delta, guard: &'g Guard) {
        let size = delta.mem_size();
        let shared = Owned::new(delta).into_shared(guard);
        self.head = shared;
        self.new_alloc_bytes += size;
        self.new_alloc_records += 1;
    }

    fn meta_delta(&self, op: Op) -> Delta {
        Delta {
            op,
            chain_len: self.chain_len + 1,
            num_items: self.num_items,
            low: self.low.clone(),
            hi: self.hi.clone(),
            right: self.right,
            next: Atomic::from(self.head),
        }
    }

    /// Prepends an insert record.
    pub(crate) fn insert(&mut self, item: Item, guard: &'g Guard) {
        let mut d = self.meta_delta(Op::Insert(item));
        d.num_items += 1;
        self.chain_len += 1;
        self.num_items += 1;
        self.alloc(d, guard);
    }

    /// Prepends a delete record (a tombstone version).
    pub(crate) fn delete(&mut self, item: Item, guard: &'g Guard) {
        let mut d = self.meta_delta(Op::Delete(item));
        d.num_items -= 1;
        self.chain_len += 1;
        self.num_items -= 1;
        self.alloc(d, guard);
    }

    /// Prepends a rollback record masking `start_sn < sn <= end_sn`.
    pub(crate) fn rollback(&mut self, start_sn: u64, end_sn: u64, guard: &'g Guard) {
        let d = self.meta_delta(Op::Rollback { start_sn, end_sn });
        self.chain_len += 1;
        self.alloc(d, guard);
    }

    /// Prepends the removal marker.
    pub(crate) fn close(&mut self, guard: &'g Guard) {
        let d = self.meta_delta(Op::Remove);
        self.chain_len += 1;
        self.alloc(d, guard);
    }

    /// Prepends a flush record pinning the chain to the log.
    pub(crate) fn add_flush_record(
        &mut self,
        offset: u64,
        data_len: u32,
        num_segments: u32,
        guard: &'g Guard,
    ) {
        let d = self.meta_delta(Op::Flush {
            offset,
            data_len,
            num_segments,
        });
        self.chain_len += 1;
        self.alloc(d, guard);
    }

    /// Replaces the working chain with a single swap-out marker. The
    /// caller publishes it and then retires the displaced chain.
    pub(crate) fn swap_out(&mut self, offset: u64, data_len: u32, guard: &'g Guard) {
        self.abandon_unpublished(guard);
        let d = Delta {
            op: Op::SwapOut { offset, data_len },
            chain_len: 0,
            num_items: self.num_items,
            low: self.low.clone(),
            hi: self.hi.clone(),
            right: self.right,
            next: Atomic::null(),
        };
        self.chain_len = 0;
        self.alloc(d, guard);
        self.displaced = true;
        self.evicting = true;
    }

    /// Walks the chain newest-first, following merge branches and
    /// pre-masking rolled-back insert/delete records, stopping when `f`
    /// returns `false`.
    ///
    /// `f` receives every insert, delete, and base record along with the
    /// rollback masks in effect at that point in the chain; bookkeeping
    /// records are consumed internally.
    fn walk<F>(&self, guard: &'g Guard, f: &mut F)
    where
        F: FnMut(&'g Op, &[(u64, u64)]) -> bool,
    {
        let mut rollbacks: Vec<(u64, u64)> = Vec::new();
        Self::walk_from(self.head, guard, &mut rollbacks, f);
    }

    pub(crate) fn masked(rollbacks: &[(u64, u64)], sn: u64) -> bool {
        rollbacks.iter().any(|&(start, end)| sn > start && sn <= end)
    }

    fn walk_from<F>(
        start: Shared<'g, Delta>,
        guard: &'g Guard,
        rollbacks: &mut Vec<(u64, u64)>,
        f: &mut F,
    ) -> bool
    where
        F: FnMut(&'g Op, &[(u64, u64)]) -> bool,
    {
        let mut curr = start;
        // SAFETY (all derefs below): chain nodes are reachable from a
        // head read under `guard` and are only reclaimed after every
        // guard that could observe them has been dropped.
        while let Some(d) = unsafe { curr.as_ref() } {
            match &d.op {
                Op::Insert(item) | Op::Delete(item) => {
                    if !Self::masked(rollbacks, item.sn()) && !f(&d.op, rollbacks) {
                        return false;
                    }
                }
                Op::Base(_) => {
                    if !f(&d.op, rollbacks) {
                        return false;
                    }
                }
                Op::Rollback { start_sn, end_sn } => {
                    rollbacks.push((*start_sn, *end_sn));
                }
                Op::Merge { child } => {
                    let child_head = child.load_consume(guard);
                    let depth = rollbacks.len();
                    if !Self::walk_from(child_head, guard, rollbacks, f) {
                        return false;
                    }
                    rollbacks.truncate(depth);
                }
                Op::Split { .. } | Op::Remove | Op::Flush { .. } | Op::SwapIn { .. } => {}
                Op::SwapOut { .. } => {
                    // An evicted chain holds no items; callers swap the
                    // page in before walking.
                    return true;
                }
            }
            curr = d.next.load_consume(guard);
        }
        true
    }

    /// Finds the first visible version of `key`, newest-first.
    ///
    /// The rollback masks in the chain are applied before `filter`, so a
    /// rolled-back version is invisible at every snapshot.
    pub(crate) fn lookup<F: ItemFilter>(
        &self,
        key: &[u8],
        filter: &mut F,
        guard: &'g Guard,
    ) -> Option<Item> {
        filter.reset();
        let mut found: Option<Item> = None;

        self.walk(guard, &mut |op, rollbacks| match op {
            Op::Insert(item) | Op::Delete(item) => {
                if item.key() != key {
                    return true;
                }
                if filter.keep(item) {
                    found = Some(item.clone());
                    false
                } else {
                    true
                }
            }
            Op::Base(items) => {
                let start = items.partition_point(|it| it.key() < key);
                for item in items[start..].iter() {
                    if item.key() != key {
                        break;
                    }
                    if Self::masked(rollbacks, item.sn()) {
                        continue;
                    }
                    if filter.keep(item) {
                        found = Some(item.clone());
                        return false;
                    }
                }
                true
            }
            _ => true,
        });

        found.filter(|item| !item.is_tombstone())
    }

    /// Folds the chain into the page's logical content: every version in
    /// `[low, hi)` retained by `filter`, sorted by key ascending and
    /// snapshot descending, with redundant trailing tombstones elided.
    pub(crate) fn fold<F: ItemFilter>(&self, filter: &mut F, guard: &'g Guard) -> Vec<Item> {
        let mut deltas: Vec<Item> = Vec::new();
        let mut base: Vec<Item> = Vec::new();

        self.walk(guard, &mut |op, rollbacks| {
            match op {
                Op::Insert(item) | Op::Delete(item) => {
                    if self.in_range(item.key()) {
                        deltas.push(item.clone());
                    }
                }
                Op::Base(items) => {
                    base.extend(
                        items
                            .iter()
                            .filter(|it| {
                                self.in_range(it.key()) && !Self::masked(rollbacks, it.sn())
                            })
                            .cloned(),
                    );
                }
                _ => {}
            }
            true
        });

        // Walk order is newest-first per key; a stable sort by key keeps
        // it that way within each run.
        deltas.sort_by(|a, b| a.key().cmp(b.key()));
        base.sort_by(|a, b| a.cmp_key_sn(b));

        merge_runs(deltas, base, filter)
    }

    /// Folds every delta into a fresh base page. Returns the flush bytes
    /// of the absorbed chain (now stale for log accounting).
    pub(crate) fn compact<F: ItemFilter>(&mut self, filter: &mut F, guard: &'g Guard) -> u32 {
        let items = self.fold(filter, guard);
        let stale = self.flush_data_size(guard);

        // Locally prepended records are folded into the new base; drop
        // them before the chain is cut over so they cannot leak.
        self.abandon_unpublished(guard);

        let num_items = items.len() as i32;
        let d = Delta {
            op: Op::Base(items.into_boxed_slice()),
            chain_len: 0,
            num_items,
            low: self.low.clone(),
            hi: self.hi.clone(),
            right: self.right,
            next: Atomic::null(),
        };
        self.chain_len = 0;
        self.num_items = num_items;
        self.alloc(d, guard);
        self.displaced = true;
        stale
    }

    /// Splits at the median key-run boundary. Prepends a split delta to
    /// this page and returns the new right sibling's chain, or `None`
    /// when no boundary exists (all versions share one key).
    pub(crate) fn split<F: ItemFilter>(
        &mut self,
        new_pid: PageId,
        filter: &mut F,
        guard: &'g Guard,
    ) -> Option<PageView<'g>> {
        let items = self.fold(filter, guard);
        if items.len() < 2 {
            return None;
        }

        let mut mid = items.len() / 2;
        while mid < items.len() && items[mid].key() == items[mid - 1].key() {
            mid += 1;
        }
        if mid == items.len() {
            mid = items.len() / 2;
            while mid > 0 && items[mid].key() == items[mid - 1].key() {
                mid -= 1;
            }
            if mid == 0 {
                return None;
            }
        }

        let at: Arc<[u8]> = items[mid].shared_key();
        let right_items: Vec<Item> = items[mid..].to_vec();
        let right_count = right_items.len() as i32;

        let mut right = PageView {
            pid: new_pid,
            prev_head: Shared::null(),
            head: Shared::null(),
            low: Fence::Key(at.clone()),
            hi: self.hi.clone(),
            right: self.right,
            chain_len: 0,
            num_items: right_count,
            new_alloc_bytes: 0,
            new_alloc_records: 0,
            displaced: false,
            evicting: false,
        };
        let right_base = Delta {
            op: Op::Base(right_items.into_boxed_slice()),
            chain_len: 0,
            num_items: right_count,
            low: right.low.clone(),
            hi: right.hi.clone(),
            right: right.right,
            next: Atomic::null(),
        };
        right.alloc(right_base, guard);

        // The left half keeps its chain; versions at or above `at` are
        // excluded by the new high fence from now on.
        let mut d = self.meta_delta(Op::Split { at: at.clone() });
        d.hi = Fence::Key(at);
        d.right = Some(new_pid);
        d.num_items = mid as i32;
        self.hi = d.hi.clone();
        self.right = d.right;
        self.num_items = d.num_items;
        self.chain_len += 1;
        self.alloc(d, guard);

        Some(right)
    }

    /// Absorbs the (already removed) right sibling's chain into this
    /// page, extending the high fence over its range.
    pub(crate) fn merge(&mut self, child: &PageView<'g>, guard: &'g Guard) {
        let mut d = self.meta_delta(Op::Merge {
            child: Atomic::from(child.head),
        });
        d.hi = child.hi.clone();
        d.right = child.right;
        d.num_items = self.num_items + child.num_items;
        d.chain_len = self.chain_len + child.chain_len + 1;
        self.hi = d.hi.clone();
        self.right = d.right;
        self.num_items = d.num_items;
        self.chain_len = d.chain_len;
        self.alloc(d, guard);
    }

    /// Total flush bytes referenced by this chain, merge branches
    /// included.
    pub(crate) fn flush_data_size(&self, guard: &'g Guard) -> u32 {
        fn visit(start: Shared<'_, Delta>, guard: &Guard, total: &mut u64) {
            let mut curr = start;
            // SAFETY: see `walk_from`.
            while let Some(d) = unsafe { curr.as_ref() } {
                match &d.op {
                    Op::Flush { data_len, .. } | Op::SwapOut { data_len, .. } => {
                        *total += *data_len as u64;
                    }
                    Op::Merge { child } => visit(child.load_consume(guard), guard, total),
                    _ => {}
                }
                curr = d.next.load_consume(guard);
            }
        }
        let mut total = 0u64;
        visit(self.head, guard, &mut total);
        total as u32
    }

    /// The newest flush record: `(offset, data_len, num_segments)`.
    pub(crate) fn flush_info(&self, guard: &'g Guard) -> Option<(u64, u32, u32)> {
        let mut curr = self.head;
        // SAFETY: see `walk_from`.
        while let Some(d) = unsafe { curr.as_ref() } {
            match &d.op {
                Op::Flush {
                    offset,
                    data_len,
                    num_segments,
                } => return Some((*offset, *data_len, *num_segments)),
                Op::SwapOut { offset, data_len } => return Some((*offset, *data_len, 1)),
                _ => {}
            }
            curr = d.next.load_consume(guard);
        }
        None
    }

    /// The oldest flush offset of the page's persisted image, the
    /// cleaner's liveness anchor.
    pub(crate) fn oldest_flush_offset(&self, guard: &'g Guard) -> Option<u64> {
        let mut oldest = None;
        let mut curr = self.head;
        // SAFETY: see `walk_from`.
        while let Some(d) = unsafe { curr.as_ref() } {
            match &d.op {
                Op::Flush { offset, .. } | Op::SwapOut { offset, .. } => {
                    oldest = Some(*offset);
                }
                _ => {}
            }
            curr = d.next.load_consume(guard);
        }
        oldest
    }

    /// Serializes the page for the log.
    ///
    /// When the chain carries at most `max_segments` persisted segments,
    /// only the records above the newest flush record are emitted as an
    /// incremental `PageUpdate` back-linked to it; a strictly greater
    /// count (or the absence of any flush record) emits a full image
    /// folded through `filter`.
    pub(crate) fn marshal<F: ItemFilter>(
        &self,
        out: &mut Vec<u8>,
        max_segments: u32,
        filter: &mut F,
        guard: &'g Guard,
    ) -> MarshalInfo {
        out.clear();

        // Collect the unflushed tail of the chain.
        let mut records: Vec<&'g Op> = Vec::new();
        let mut prev_flush: Option<(u64, u32)> = None;
        let mut structural = false;
        let mut curr = self.head;
        // SAFETY: see `walk_from`.
        while let Some(d) = unsafe { curr.as_ref() } {
            match &d.op {
                Op::Insert(_) | Op::Delete(_) | Op::Rollback { .. } => records.push(&d.op),
                Op::Flush {
                    offset,
                    num_segments,
                    ..
                } => {
                    prev_flush = Some((*offset, *num_segments));
                    break;
                }
                Op::SwapOut { offset, .. } => {
                    prev_flush = Some((*offset, 1));
                    break;
                }
                Op::Base(_) | Op::Split { .. } | Op::Merge { .. } => {
                    structural = true;
                    break;
                }
                Op::Remove | Op::SwapIn { .. } => {}
            }
            curr = d.next.load_consume(guard);
        }

        if let Some((prev_offset, num_segments)) = prev_flush {
            if !structural && num_segments + 1 <= max_segments {
                put_fence(out, &self.low);
                put_fence(out, &self.hi);
                put_u32(out, records.len() as u32);
                // Newest-first, the order the chain replays in.
                for &op in &records {
                    put_record(out, op);
                }
                put_u64(out, prev_offset);
                return MarshalInfo {
                    data_len: out.len() as u32,
                    stale_len: 0,
                    num_segments: num_segments + 1,
                    full_image: false,
                };
            }
        }

        // Full image: fold and emit a self-contained page.
        let stale = self.flush_data_size(guard);
        let items = self.fold(filter, guard);
        put_fence(out, &self.low);
        put_fence(out, &self.hi);
        put_u32(out, items.len() as u32);
        for item in &items {
            put_item(out, item);
        }
        MarshalInfo {
            data_len: out.len() as u32,
            stale_len: stale,
            num_segments: 1,
            full_image: true,
        }
    }

    /// Drops records prepended locally but never published.
    ///
    /// Merge branches are left alone: an unpublished merge delta points
    /// at a chain that is still live under its own page.
    pub(crate) fn abandon_unpublished(&mut self, guard: &'g Guard) {
        let mut curr = self.head;
        while curr != self.prev_head && !curr.is_null() {
            // SAFETY: every node between `head` and `prev_head` was
            // allocated by this view and never published, so no other
            // thread can hold a reference to it.
            let next = unsafe { curr.deref() }.next.load_consume(guard);
            drop(unsafe { curr.into_owned() });
            curr = next;
        }
        self.head = self.prev_head;
        self.new_alloc_bytes = 0;
        self.new_alloc_records = 0;
        self.displaced = false;
        self.evicting = false;
    }

    /// Prepends the marker recording that this chain was rebuilt from
    /// the log at `offset`.
    pub(crate) fn mark_swapped_in(&mut self, offset: u64, guard: &'g Guard) {
        let d = self.meta_delta(Op::SwapIn { offset });
        self.chain_len += 1;
        self.alloc(d, guard);
    }

    /// Whether the chain holds records above its newest flush record,
    /// in other words data that exists only in memory.
    pub(crate) fn has_unflushed(&self, guard: &'g Guard) -> bool {
        let mut curr = self.head;
        // SAFETY: see `walk_from`.
        while let Some(d) = unsafe { curr.as_ref() } {
            match &d.op {
                Op::Flush { .. } | Op::SwapOut { .. } => return false,
                Op::Insert(_)
                | Op::Delete(_)
                | Op::Base(_)
                | Op::Split { .. }
                | Op::Merge { .. }
                | Op::Rollback { .. } => return true,
                Op::Remove | Op::SwapIn { .. } => {}
            }
            curr = d.next.load_consume(guard);
        }
        // Nothing persisted and nothing to persist.
        false
    }
}

/// The empty start page installed into a fresh store.
pub(crate) fn seed_page(guard: &Guard) -> PageView<'_> {
    let mut view = PageView {
        pid: crate::pagetable::START_PID,
        prev_head: Shared::null(),
        head: Shared::null(),
        low: Fence::Unbounded,
        hi: Fence::Unbounded,
        right: None,
        chain_len: 0,
        num_items: 0,
        new_alloc_bytes: 0,
        new_alloc_records: 0,
        displaced: false,
        evicting: false,
    };
    let base = Delta {
        op: Op::Base(Vec::new().into_boxed_slice()),
        chain_len: 0,
        num_items: 0,
        low: Fence::Unbounded,
        hi: Fence::Unbounded,
        right: None,
        next: Atomic::null(),
    };
    view.alloc(base, guard);
    view
}

/// Retires a published chain from `from` down to (exclusive) `until`,
/// following merge branches. Returns `(bytes, records)` retired.
///
/// SAFETY: the chain must have been unlinked by a successful
/// compare-and-swap; `guard` defers the frees past every reader that
/// could still observe it.
pub(crate) unsafe fn defer_destroy_chain(
    from: Shared<'_, Delta>,
    until: Shared<'_, Delta>,
    guard: &Guard,
) -> (usize, usize) {
    let mut bytes = 0usize;
    let mut records = 0usize;
    let mut curr = from;
    while !curr.is_null() && curr != until {
        let d = curr.deref();
        if let Op::Merge { child } = &d.op {
            let (b, r) = defer_destroy_chain(child.load_consume(guard), Shared::null(), guard);
            bytes += b;
            records += r;
        }
        bytes += d.mem_size();
        records += 1;
        let next = d.next.load_consume(guard);
        guard.defer_destroy(curr);
        curr = next;
    }
    (bytes, records)
}

/// Merges the sorted delta run with the sorted base run into key-runs of
/// descending snapshot, applying `filter` per key-run and eliding
/// tombstones that mask nothing.
///
/// Cross-run order goes by snapshot number: a merge can bring a page
/// whose absorbed versions are newer than stale copies left behind by an
/// earlier split of this chain.
fn merge_runs<F: ItemFilter>(deltas: Vec<Item>, base: Vec<Item>, filter: &mut F) -> Vec<Item> {
    let mut out: Vec<Item> = Vec::with_capacity(base.len() + deltas.len());
    let mut run_start = 0usize;
    let mut run_key: Option<Arc<[u8]>> = None;

    let mut push = |out: &mut Vec<Item>,
                    run_start: &mut usize,
                    run_key: &mut Option<Arc<[u8]>>,
                    filter: &mut F,
                    item: &Item| {
        if run_key.as_deref().map(|k| k != item.key()).unwrap_or(true) {
            finish_run(out, *run_start);
            *run_start = out.len();
            *run_key = Some(item.shared_key());
            filter.reset();
        }
        if filter.keep(item) {
            out.push(item.clone());
        }
    };

    let mut di = 0usize;
    let mut bi = 0usize;
    while di < deltas.len() || bi < base.len() {
        let take_delta = match (deltas.get(di), base.get(bi)) {
            (Some(d), Some(b)) => d.cmp_key_sn(b) != std::cmp::Ordering::Greater,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if take_delta {
            push(&mut out, &mut run_start, &mut run_key, filter, &deltas[di]);
            di += 1;
        } else {
            push(&mut out, &mut run_start, &mut run_key, filter, &base[bi]);
            bi += 1;
        }
    }
    finish_run(&mut out, run_start);
    out
}

/// Pops tombstones from the old end of the just-finished key-run; a
/// tombstone with no older retained version masks nothing.
fn finish_run(out: &mut Vec<Item>, run_start: usize) {
    while out.len() > run_start && out.last().map(Item::is_tombstone).unwrap_or(false) {
        out.pop();
    }
}

// --- on-disk encoding -------------------------------------------------

const RECORD_INSERT: u8 = 0;
const RECORD_DELETE: u8 = 1;
const RECORD_ROLLBACK: u8 = 2;

const FENCE_UNBOUNDED: u8 = 0;
const FENCE_KEY: u8 = 1;

const ITEM_FLAG_TOMBSTONE: u8 = 0x1;

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_fence(out: &mut Vec<u8>, fence: &Fence) {
    match fence {
        Fence::Unbounded => out.push(FENCE_UNBOUNDED),
        Fence::Key(k) => {
            out.push(FENCE_KEY);
            put_u16(out, k.len() as u16);
            out.extend_from_slice(k);
        }
    }
}

fn put_item(out: &mut Vec<u8>, item: &Item) {
    put_u64(out, item.sn());
    out.push(if item.is_tombstone() {
        ITEM_FLAG_TOMBSTONE
    } else {
        0
    });
    put_u16(out, item.key().len() as u16);
    out.extend_from_slice(item.key());
    put_u32(out, item.value().len() as u32);
    out.extend_from_slice(item.value());
}

fn put_record(out: &mut Vec<u8>, op: &Op) {
    match op {
        Op::Insert(item) => {
            out.push(RECORD_INSERT);
            put_item(out, item);
        }
        Op::Delete(item) => {
            out.push(RECORD_DELETE);
            put_item(out, item);
        }
        Op::Rollback { start_sn, end_sn } => {
            out.push(RECORD_ROLLBACK);
            put_u64(out, *start_sn);
            put_u64(out, *end_sn);
        }
        _ => unreachable!("only item and rollback records are serialized"),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), StoreError> {
        if self.pos + n > self.buf.len() {
            Err(StoreError::Corrupt("truncated page segment".to_string()))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, StoreError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, StoreError> {
        self.need(2)?;
        let v = BigEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, StoreError> {
        self.need(4)?;
        let v = BigEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, StoreError> {
        self.need(8)?;
        let v = BigEndian::read_u64(&self.buf[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    fn fence(&mut self) -> Result<Fence, StoreError> {
        match self.u8()? {
            FENCE_UNBOUNDED => Ok(Fence::Unbounded),
            FENCE_KEY => {
                let len = self.u16()? as usize;
                Ok(Fence::Key(Arc::from(self.bytes(len)?)))
            }
            other => Err(StoreError::Corrupt(format!(
                "invalid fence tag {} in page segment",
                other
            ))),
        }
    }

    fn item(&mut self) -> Result<Item, StoreError> {
        let sn = self.u64()?;
        let flags = self.u8()?;
        let klen = self.u16()? as usize;
        let key: Arc<[u8]> = Arc::from(self.bytes(klen)?);
        let vlen = self.u32()? as usize;
        let value: Arc<[u8]> = Arc::from(self.bytes(vlen)?);
        Ok(Item::from_parts(
            key,
            value,
            sn,
            flags & ITEM_FLAG_TOMBSTONE != 0,
        ))
    }
}

/// Decodes a `PageData`/`PageReloc` body (`full_image`) or a
/// `PageUpdate` body back into chain parts.
pub(crate) fn parse_segment(body: &[u8], full_image: bool) -> Result<ParsedSegment, StoreError> {
    let mut r = Reader::new(body);
    let low = r.fence()?;
    let hi = r.fence()?;

    if full_image {
        let count = r.u32()? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(r.item()?);
        }
        Ok(ParsedSegment {
            low,
            hi,
            records: Vec::new(),
            base: Some(items.into_boxed_slice()),
            prev_offset: None,
        })
    } else {
        let count = r.u32()? as usize;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let rec = match r.u8()? {
                RECORD_INSERT => Op::Insert(r.item()?),
                RECORD_DELETE => Op::Delete(r.item()?),
                RECORD_ROLLBACK => Op::Rollback {
                    start_sn: r.u64()?,
                    end_sn: r.u64()?,
                },
                other => {
                    return Err(StoreError::Corrupt(format!(
                        "invalid record tag {} in page update",
                        other
                    )))
                }
            };
            records.push(rec);
        }
        let prev_offset = r.u64()?;
        Ok(ParsedSegment {
            low,
            hi,
            records,
            base: None,
            prev_offset: Some(prev_offset),
        })
    }
}

/// Encodes the low fence for a `PageRemove` metadata block.
pub(crate) fn marshal_page_remove(out: &mut Vec<u8>, low: &Fence) {
    out.clear();
    put_fence(out, low);
}

/// Decodes a `PageRemove` metadata block.
pub(crate) fn parse_page_remove(body: &[u8]) -> Result<Fence, StoreError> {
    Reader::new(body).fence()
}

/// Assembles the chain for a page fetched from the log.
///
/// `segments` is ordered newest-first, exactly as the back-links were
/// followed. Each segment contributes its flush record and its records;
/// the top flush record carries the total segment count.
pub(crate) fn assemble_chain<'g>(
    pid: PageId,
    segments: Vec<(u64, u32, ParsedSegment)>,
    right: Option<PageId>,
    guard: &'g Guard,
) -> Option<PageView<'g>> {
    let (low, hi) = {
        let first = &segments.first()?.2;
        (first.low.clone(), first.hi.clone())
    };
    let total_segments = segments.len() as u32;

    let mut view = PageView {
        pid,
        prev_head: Shared::null(),
        head: Shared::null(),
        low,
        hi,
        right,
        chain_len: 0,
        num_items: 0,
        new_alloc_bytes: 0,
        new_alloc_records: 0,
        displaced: false,
        evicting: false,
    };

    // Build oldest-first so every prepend links to the chain below it.
    for (i, (offset, data_len, seg)) in segments.into_iter().enumerate().rev() {
        if let Some(items) = seg.base {
            let count = items.len() as i32;
            let d = Delta {
                op: Op::Base(items),
                chain_len: 0,
                num_items: count,
                low: view.low.clone(),
                hi: view.hi.clone(),
                right,
                next: Atomic::null(),
            };
            view.chain_len = 0;
            view.num_items = count;
            view.alloc(d, guard);
        }
        // Records were serialized newest-first; prepend oldest-first to
        // restore chain order.
        for op in seg.records.into_iter().rev() {
            match op {
                Op::Insert(item) => view.insert(item, guard),
                Op::Delete(item) => view.delete(item, guard),
                Op::Rollback { start_sn, end_sn } => view.rollback(start_sn, end_sn, guard),
                _ => {}
            }
        }
        let num_segments = if i == 0 { total_segments } else { 1 };
        view.add_flush_record(offset, data_len, num_segments, guard);
    }

    Some(view)
}
