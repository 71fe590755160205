//! Item versions and visibility filters.
//!
//! Every mutation is stamped with the snapshot number that created it, so
//! a page chain holds multiple versions of the same key. The filters in
//! this module decide which versions a reader may observe and which
//! versions a compaction may drop.

use std::cmp::Ordering;
use std::sync::Arc;

/// One version of a key.
///
/// `value` is shared so that compaction and page splits copy version
/// handles, not payload bytes. A tombstone records a deletion; its value
/// is empty.
#[derive(Debug, Clone)]
pub struct Item {
    key: Arc<[u8]>,
    value: Arc<[u8]>,
    sn: u64,
    tombstone: bool,
}

impl Item {
    pub(crate) fn new(key: &[u8], value: &[u8], sn: u64) -> Self {
        Item {
            key: Arc::from(key),
            value: Arc::from(value),
            sn,
            tombstone: false,
        }
    }

    pub(crate) fn tombstone(key: &[u8], sn: u64) -> Self {
        Item {
            key: Arc::from(key),
            value: Arc::from(&[][..]),
            sn,
            tombstone: true,
        }
    }

    pub(crate) fn from_parts(key: Arc<[u8]>, value: Arc<[u8]>, sn: u64, tombstone: bool) -> Self {
        Item {
            key,
            value,
            sn,
            tombstone,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &Arc<[u8]> {
        &self.value
    }

    pub fn sn(&self) -> u64 {
        self.sn
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    pub(crate) fn shared_key(&self) -> Arc<[u8]> {
        self.key.clone()
    }

    /// Heap footprint of this version, used for quota accounting.
    pub(crate) fn mem_size(&self) -> usize {
        std::mem::size_of::<Item>() + self.key.len() + self.value.len()
    }

    /// Orders by key ascending, then snapshot descending, so equal keys
    /// appear newest-first in a sorted run.
    pub(crate) fn cmp_key_sn(&self, other: &Item) -> Ordering {
        self.key
            .as_ref()
            .cmp(other.key.as_ref())
            .then(other.sn.cmp(&self.sn))
    }
}

/// A page fence key. `Unbounded` stands for negative infinity on a low
/// fence and positive infinity on a high fence.
#[derive(Debug, Clone)]
pub(crate) enum Fence {
    Unbounded,
    Key(Arc<[u8]>),
}

impl Fence {
    /// Whether `key` lies at or above this low fence.
    pub(crate) fn contains_from_low(&self, key: &[u8]) -> bool {
        match self {
            Fence::Unbounded => true,
            Fence::Key(k) => key >= k.as_ref(),
        }
    }

    /// Whether `key` lies strictly below this high fence.
    pub(crate) fn contains_below_hi(&self, key: &[u8]) -> bool {
        match self {
            Fence::Unbounded => true,
            Fence::Key(k) => key < k.as_ref(),
        }
    }

    pub(crate) fn as_key(&self) -> Option<&Arc<[u8]>> {
        match self {
            Fence::Unbounded => None,
            Fence::Key(k) => Some(k),
        }
    }

    pub(crate) fn is_unbounded(&self) -> bool {
        matches!(self, Fence::Unbounded)
    }
}

impl PartialEq for Fence {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Fence::Unbounded, Fence::Unbounded) => true,
            (Fence::Key(a), Fence::Key(b)) => a == b,
            _ => false,
        }
    }
}

/// Decides which versions of a key survive a chain fold.
///
/// The fold presents each key's versions newest-first and calls `reset`
/// at every key boundary. Returning `false` drops the version.
pub(crate) trait ItemFilter {
    fn reset(&mut self);
    fn keep(&mut self, item: &Item) -> bool;
}

/// Keeps only the newest version of each key. Used when snapshots are
/// disabled: history has no readers, so it is dropped eagerly.
#[derive(Default)]
pub(crate) struct AcceptNewest {
    taken: bool,
}

impl ItemFilter for AcceptNewest {
    fn reset(&mut self) {
        self.taken = false;
    }

    fn keep(&mut self, _item: &Item) -> bool {
        if self.taken {
            false
        } else {
            self.taken = true;
            true
        }
    }
}

/// Reader visibility at a fixed snapshot: the newest version with
/// `sn <= at` wins; everything else is invisible.
pub(crate) struct SnFilter {
    at: u64,
    taken: bool,
}

impl SnFilter {
    pub(crate) fn new(at: u64) -> Self {
        SnFilter { at, taken: false }
    }
}

impl ItemFilter for SnFilter {
    fn reset(&mut self) {
        self.taken = false;
    }

    fn keep(&mut self, item: &Item) -> bool {
        if self.taken || item.sn() > self.at {
            return false;
        }
        self.taken = true;
        true
    }
}

/// Compaction filter built from the garbage-collection snapshot and the
/// recovery-point snapshot numbers.
///
/// `boundaries` is ascending and ends with the gc snapshot. A version is
/// retained when it is the newest one inside its interval; versions newer
/// than the gc snapshot are always retained because active readers may
/// still need them.
pub(crate) struct GcFilter {
    boundaries: Arc<Vec<u64>>,
    filled: Vec<bool>,
}

impl GcFilter {
    pub(crate) fn new(boundaries: Arc<Vec<u64>>) -> Self {
        let filled = vec![false; boundaries.len()];
        GcFilter { boundaries, filled }
    }
}

impl ItemFilter for GcFilter {
    fn reset(&mut self) {
        for f in self.filled.iter_mut() {
            *f = false;
        }
    }

    fn keep(&mut self, item: &Item) -> bool {
        let gc_sn = *self.boundaries.last().unwrap_or(&0);
        if item.sn() >= gc_sn {
            return true;
        }
        // A version at snapshot `sn` is the candidate for every boundary
        // at or above `sn`, so it buckets with the lowest such boundary.
        let idx = self.boundaries.partition_point(|&b| b < item.sn());
        if self.filled[idx] {
            false
        } else {
            self.filled[idx] = true;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(sn: u64) -> Item {
        Item::new(b"k", b"v", sn)
    }

    #[test]
    fn accept_newest_keeps_one_per_key() {
        let mut f = AcceptNewest::default();
        f.reset();
        assert!(f.keep(&item(9)));
        assert!(!f.keep(&item(5)));
        f.reset();
        assert!(f.keep(&item(3)));
    }

    #[test]
    fn sn_filter_picks_newest_visible() {
        let mut f = SnFilter::new(6);
        f.reset();
        assert!(!f.keep(&item(9)));
        assert!(f.keep(&item(6)));
        assert!(!f.keep(&item(2)));
    }

    #[test]
    fn gc_filter_keeps_newest_per_interval() {
        // Recovery point at sn 5, gc snapshot at sn 10.
        let mut f = GcFilter::new(Arc::new(vec![5, 10]));
        f.reset();
        assert!(f.keep(&item(12)), "newer than gc_sn is always kept");
        assert!(f.keep(&item(9)), "newest in [5, 10)");
        assert!(!f.keep(&item(7)), "shadowed within [5, 10)");
        assert!(f.keep(&item(4)), "newest in [0, 5)");
        assert!(!f.keep(&item(1)), "shadowed within [0, 5)");
    }

    #[test]
    fn fence_bounds() {
        let f = Fence::Key(Arc::from(&b"m"[..]));
        assert!(f.contains_from_low(b"m"));
        assert!(!f.contains_from_low(b"a"));
        assert!(f.contains_below_hi(b"a"));
        assert!(!f.contains_below_hi(b"m"));
        assert!(Fence::Unbounded.contains_from_low(b""));
        assert!(Fence::Unbounded.contains_below_hi(b"\xff\xff"));
    }
}
