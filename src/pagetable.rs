//! The mapping table and the ordered page index.
//!
//! A page id is an index into a table of atomic head pointers; publishing
//! a new head is one compare-and-swap on the page's slot. The ordered
//! index maps each page's low fence to its id, so locating the owner of a
//! key is a bounded search, and the left neighbor needed by the removal
//! protocol is one more.
//!
//! The start page (id 0) owns the range below every indexed fence and is
//! never indexed, split away, or removed.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Guard, Shared};
use crossbeam_queue::SegQueue;
use crossbeam_skiplist::SkipMap;

use crate::page::Delta;

/// An opaque handle on a page: an index into the mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PageId(pub(crate) u32);

/// The sentinel start page, covering keys below every indexed fence.
pub(crate) const START_PID: PageId = PageId(0);

pub(crate) struct PageTable {
    heads: Box<[Atomic<Delta>]>,
    /// Clock eviction reference bits, one per slot.
    ref_bits: Box<[AtomicBool]>,
    next_pid: AtomicU32,
    free_pids: SegQueue<u32>,
    /// Low fence -> page id, for every page except the start page.
    index: SkipMap<Arc<[u8]>, PageId>,
}

impl PageTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let heads: Box<[Atomic<Delta>]> = (0..capacity).map(|_| Atomic::null()).collect();
        let ref_bits: Box<[AtomicBool]> = (0..capacity).map(|_| AtomicBool::new(false)).collect();
        PageTable {
            heads,
            ref_bits,
            // Slot 0 is the start page.
            next_pid: AtomicU32::new(1),
            free_pids: SegQueue::new(),
            index: SkipMap::new(),
        }
    }

    /// Claims a fresh page id, recycling removed ones first.
    pub(crate) fn alloc_pid(&self) -> PageId {
        if let Some(pid) = self.free_pids.pop() {
            return PageId(pid);
        }
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        assert!(
            (pid as usize) < self.heads.len(),
            "mapping table full: raise mapping_table_size"
        );
        PageId(pid)
    }

    /// Returns a page id to the free list. The slot's head must already
    /// be cleared.
    pub(crate) fn free_pid(&self, pid: PageId) {
        self.ref_bits[pid.0 as usize].store(false, Ordering::Relaxed);
        self.free_pids.push(pid.0);
    }

    pub(crate) fn head<'g>(&self, pid: PageId, guard: &'g Guard) -> Shared<'g, Delta> {
        self.heads[pid.0 as usize].load_consume(guard)
    }

    /// Installs the first head of a new page. The slot must be empty;
    /// the page becomes reachable once its fence is indexed.
    pub(crate) fn create(&self, pid: PageId, head: Shared<'_, Delta>) {
        self.heads[pid.0 as usize].store(head, Ordering::Release);
    }

    /// Publishes `new` if the slot still holds `old`.
    pub(crate) fn update<'g>(
        &self,
        pid: PageId,
        old: Shared<'g, Delta>,
        new: Shared<'g, Delta>,
        guard: &'g Guard,
    ) -> bool {
        self.heads[pid.0 as usize]
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
    }

    /// Empties a removed page's slot.
    pub(crate) fn clear(&self, pid: PageId) {
        self.heads[pid.0 as usize].store(Shared::null(), Ordering::Release);
    }

    /// Finds the page owning `key`: the greatest indexed fence at or
    /// below it, or the start page.
    pub(crate) fn lookup_owner(&self, key: &[u8]) -> PageId {
        self.index
            .upper_bound(Bound::Included(key))
            .map(|e| *e.value())
            .unwrap_or(START_PID)
    }

    /// Finds the page immediately left of the fence `low`.
    pub(crate) fn left_sibling(&self, low: &[u8]) -> PageId {
        self.index
            .upper_bound(Bound::Excluded(low))
            .map(|e| *e.value())
            .unwrap_or(START_PID)
    }

    /// The first indexed page at or after `key`, used for ordered scans.
    pub(crate) fn next_indexed(&self, key: &[u8], inclusive: bool) -> Option<(Arc<[u8]>, PageId)> {
        let bound = if inclusive {
            Bound::Included(key)
        } else {
            Bound::Excluded(key)
        };
        self.index
            .lower_bound(bound)
            .map(|e| (e.key().clone(), *e.value()))
    }

    /// Indexes a page's low fence. Returns the resident id when another
    /// page already owns the fence.
    pub(crate) fn index_insert(&self, low: Arc<[u8]>, pid: PageId) -> Result<(), PageId> {
        let entry = self.index.get_or_insert(low, pid);
        let existing = *entry.value();
        if existing == pid {
            Ok(())
        } else {
            Err(existing)
        }
    }

    pub(crate) fn index_remove(&self, low: &[u8]) -> bool {
        self.index.remove(low).is_some()
    }

    pub(crate) fn index_get(&self, low: &[u8]) -> Option<PageId> {
        self.index.get(low).map(|e| *e.value())
    }

    /// Number of pages, the start page included.
    pub(crate) fn num_pages(&self) -> usize {
        self.index.len() + 1
    }

    /// Visits every page in key order: the start page, then every
    /// indexed fence.
    pub(crate) fn for_each_page<F>(&self, mut f: F)
    where
        F: FnMut(PageId) -> bool,
    {
        if !f(START_PID) {
            return;
        }
        for entry in self.index.iter() {
            if !f(*entry.value()) {
                return;
            }
        }
    }

    pub(crate) fn mark_referenced(&self, pid: PageId) {
        self.ref_bits[pid.0 as usize].store(true, Ordering::Relaxed);
    }

    /// Clears and returns the reference bit, the clock sweep primitive.
    pub(crate) fn take_referenced(&self, pid: PageId) -> bool {
        self.ref_bits[pid.0 as usize].swap(false, Ordering::Relaxed)
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        // SAFETY: dropping the table means no thread can reach any
        // chain through it anymore; records already handed to the epoch
        // reclaimer were unlinked earlier and are not reachable from any
        // head, so nothing is freed twice.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        for head in self.heads.iter() {
            let chain = head.load(Ordering::Relaxed, guard);
            unsafe { drop_chain(chain) };
        }
    }
}

/// Frees a whole chain in place, following merge branches.
///
/// SAFETY: the chain must be unreachable by every other thread.
unsafe fn drop_chain(head: Shared<'_, Delta>) {
    let guard = crossbeam_epoch::unprotected();
    let mut curr = head;
    while !curr.is_null() {
        let owned = curr.into_owned();
        if let crate::page::Op::Merge { child } = &owned.op {
            drop_chain(child.load(Ordering::Relaxed, guard));
        }
        curr = owned.next.load(Ordering::Relaxed, guard);
        drop(owned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Fence;
    use crate::page::{Delta, Op};
    use crossbeam_epoch::{self as epoch, Owned};

    fn empty_head<'g>(guard: &'g epoch::Guard) -> Shared<'g, Delta> {
        Owned::new(Delta {
            op: Op::Base(Vec::new().into_boxed_slice()),
            chain_len: 0,
            num_items: 0,
            low: Fence::Unbounded,
            hi: Fence::Unbounded,
            right: None,
            next: Atomic::null(),
        })
        .into_shared(guard)
    }

    fn key(s: &str) -> Arc<[u8]> {
        Arc::from(s.as_bytes())
    }

    #[test]
    fn owner_lookup_falls_back_to_start_page() {
        let table = PageTable::new(16);
        assert_eq!(table.lookup_owner(b"anything"), START_PID);

        let pid = table.alloc_pid();
        table.index_insert(key("m"), pid).unwrap();

        assert_eq!(table.lookup_owner(b"a"), START_PID);
        assert_eq!(table.lookup_owner(b"m"), pid);
        assert_eq!(table.lookup_owner(b"z"), pid);
    }

    #[test]
    fn left_sibling_is_strictly_below() {
        let table = PageTable::new(16);
        let p1 = table.alloc_pid();
        let p2 = table.alloc_pid();
        table.index_insert(key("g"), p1).unwrap();
        table.index_insert(key("p"), p2).unwrap();

        assert_eq!(table.left_sibling(b"p"), p1);
        assert_eq!(table.left_sibling(b"g"), START_PID);
        assert_eq!(table.left_sibling(b"z"), p2);
    }

    #[test]
    fn duplicate_fence_reports_resident() {
        let table = PageTable::new(16);
        let p1 = table.alloc_pid();
        let p2 = table.alloc_pid();
        table.index_insert(key("k"), p1).unwrap();
        assert_eq!(table.index_insert(key("k"), p2), Err(p1));
    }

    #[test]
    fn update_fails_after_concurrent_publish() {
        let table = PageTable::new(16);
        let guard = &epoch::pin();
        let pid = table.alloc_pid();

        let head_a = empty_head(guard);
        table.create(pid, head_a);

        let head_b = empty_head(guard);
        assert!(table.update(pid, head_a, head_b, guard));
        // The expectation is now stale.
        let head_c = empty_head(guard);
        assert!(!table.update(pid, head_a, head_c, guard));
        assert_eq!(table.head(pid, guard), head_b);

        // `head_b` stays owned by the table and is freed with it.
        // SAFETY: `head_a` was unlinked by the first update and `head_c`
        // was never published; this test is single-threaded.
        unsafe {
            drop(head_a.into_owned());
            drop(head_c.into_owned());
        }
    }

    #[test]
    fn freed_pids_are_recycled() {
        let table = PageTable::new(4);
        let p1 = table.alloc_pid();
        let p2 = table.alloc_pid();
        assert_ne!(p1, p2);
        table.free_pid(p1);
        assert_eq!(table.alloc_pid(), p1);
    }

    #[test]
    fn page_visit_walks_key_order() {
        let table = PageTable::new(16);
        let p1 = table.alloc_pid();
        let p2 = table.alloc_pid();
        table.index_insert(key("q"), p2).unwrap();
        table.index_insert(key("b"), p1).unwrap();

        let mut seen = Vec::new();
        table.for_each_page(|pid| {
            seen.push(pid);
            true
        });
        assert_eq!(seen, vec![START_PID, p1, p2]);
    }
}
