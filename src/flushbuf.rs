//! The flush buffer: a fixed byte slab with lock-free multi-reservation.
//!
//! Many writers co-reserve disjoint chunks of one buffer; the whole buffer
//! is later appended to the log as a single unit. All coordination runs
//! through one 64-bit state word updated by compare-and-swap:
//!
//! ```text
//! [ 32-bit offset | 14 bits unused | 16-bit writer count | reset | full ]
//! ```
//!
//! The flush of a buffer fires exactly once: when the writer count drops
//! to zero while the full bit is set. Buffers flush in rotation order
//! because every buffer is initialized holding one writer count on behalf
//! of its predecessor, released only when the predecessor's flush
//! completes.

use std::cell::UnsafeCell;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use byteorder::{BigEndian, ByteOrder};
use crossbeam_utils::{Backoff, CachePadded};

/// Every payload is preceded in the buffer by a 4-byte big-endian length
/// so the log can be read positionally.
pub(crate) const LEN_PREFIX_SIZE: usize = 4;

/// Outcome of a reservation attempt.
pub(crate) enum AllocOutcome {
    /// Space reserved: per-chunk log offsets and payload ranges within
    /// the buffer. The writer count has been incremented once for the
    /// whole reservation.
    Reserved {
        offsets: Vec<u64>,
        ranges: Vec<Range<usize>>,
    },
    /// This call transitioned the buffer to full; the caller must rotate
    /// to the next buffer and release the closer's writer count.
    RotateFull,
    /// The buffer is full or resetting; retry on the current tail.
    Busy,
}

pub(crate) struct FlushBuffer {
    state: CachePadded<AtomicU64>,
    seqno: AtomicU64,
    base_offset: AtomicU64,
    do_commit: AtomicBool,
    /// Pending trim request, forwarded to the log by the flush. Zero
    /// means none.
    trim_offset: AtomicU64,
    buf: UnsafeCell<Box<[u8]>>,
}

// SAFETY: the byte slab is shared between threads, but every mutable
// range is owned by exactly one reservation (ranges handed out by `alloc`
// are disjoint), and `bytes()` is only called by the flusher after the
// writer count has dropped to zero with the full bit set, which orders
// all chunk writes before the read.
unsafe impl Sync for FlushBuffer {}

impl FlushBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        FlushBuffer {
            state: CachePadded::new(AtomicU64::new(encode_state(false, 1, 0))),
            seqno: AtomicU64::new(0),
            base_offset: AtomicU64::new(0),
            do_commit: AtomicBool::new(false),
            trim_offset: AtomicU64::new(0),
            buf: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        // SAFETY: the slab's length never changes after construction.
        unsafe { (&*self.buf.get()).len() }
    }

    pub(crate) fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::Relaxed)
    }

    pub(crate) fn base_offset(&self) -> u64 {
        self.base_offset.load(Ordering::Acquire)
    }

    /// Seeds the base offset of the initial ring buffer from the log
    /// tail. Later buffers inherit theirs through `init_for`.
    pub(crate) fn set_base_offset(&self, off: u64) {
        self.base_offset.store(off, Ordering::Release);
    }

    /// The log offset one past the last reserved byte.
    pub(crate) fn end_offset(&self) -> u64 {
        let (_, _, _, offset) = decode_state(self.state.load(Ordering::Acquire));
        self.base_offset() + offset as u64
    }

    /// Attempts to reserve `sizes` payloads plus their length prefixes.
    pub(crate) fn alloc(&self, sizes: &[usize]) -> AllocOutcome {
        let backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (is_full, reset, nw, offset) = decode_state(state);

            if is_full || reset {
                return AllocOutcome::Busy;
            }

            let total: usize = sizes.iter().map(|sz| sz + LEN_PREFIX_SIZE).sum();
            let new_offset = offset + total;
            if new_offset > self.capacity() {
                let new_state = encode_state(true, nw, offset);
                if self
                    .state
                    .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    backoff.spin();
                    continue;
                }
                return AllocOutcome::RotateFull;
            }

            let new_state = encode_state(false, nw + 1, new_offset);
            if self
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                backoff.spin();
                continue;
            }

            let base = self.base_offset();
            let mut offsets = Vec::with_capacity(sizes.len());
            let mut ranges = Vec::with_capacity(sizes.len());
            let mut within = offset;
            for &sz in sizes {
                // SAFETY: [within, within + 4 + sz) was exclusively
                // reserved by the CAS above.
                let prefix = unsafe { self.slice_mut(within..within + LEN_PREFIX_SIZE) };
                BigEndian::write_u32(prefix, sz as u32);

                offsets.push(base + within as u64);
                ranges.push(within + LEN_PREFIX_SIZE..within + LEN_PREFIX_SIZE + sz);
                within += sz + LEN_PREFIX_SIZE;
            }

            return AllocOutcome::Reserved { offsets, ranges };
        }
    }

    /// Marks the buffer full if at least `threshold` bytes are reserved.
    /// Returns the end offset on success.
    pub(crate) fn try_close(&self, threshold: usize) -> Option<u64> {
        let state = self.state.load(Ordering::Acquire);
        let (is_full, reset, nw, offset) = decode_state(state);
        if offset < threshold || is_full || reset {
            return None;
        }
        let new_state = encode_state(true, nw, offset);
        if self
            .state
            .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(self.end_offset())
        } else {
            None
        }
    }

    /// Takes a short-lived writer count for side access (reads, trim
    /// metadata). Fails when the buffer is inactive.
    fn begin_access(&self) -> bool {
        let backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (is_full, reset, nw, offset) = decode_state(state);
            if nw == 0 || reset {
                return false;
            }
            let new_state = encode_state(is_full, nw + 1, offset);
            if self
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            backoff.spin();
        }
    }

    /// Releases one writer count. Returns `true` when this release
    /// dropped the count to zero with the full bit set — the caller must
    /// then run the flush, exactly once.
    #[must_use]
    pub(crate) fn done(&self) -> bool {
        let backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (is_full, reset, nw, offset) = decode_state(state);
            debug_assert!(nw > 0, "writer count underflow");
            let new_state_raw = encode_state(is_full, nw - 1, offset);
            let new_state = if reset { new_state_raw | RESET_BIT } else { new_state_raw };
            if self
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return nw == 1 && is_full;
            }
            backoff.spin();
        }
    }

    /// Copies the payload stored at log offset `off` into `dst`, serving
    /// reads that land in a not-yet-flushed buffer. Returns the payload
    /// length (`None` when the offset is not resident here) and whether
    /// this access must trigger the flush — the fire flag is meaningful
    /// even when the read itself missed, because the access briefly held
    /// a writer count.
    pub(crate) fn read_payload(&self, off: u64, dst: &mut [u8]) -> (Option<usize>, bool) {
        if !self.begin_access() {
            return (None, false);
        }

        let (_, _, _, offset) = decode_state(self.state.load(Ordering::Acquire));
        let start = self.base_offset();
        let end = start + offset as u64;

        let served = if off >= start && off < end {
            let within = (off - start) as usize;
            // SAFETY: [within, within + 4) was fully written before the
            // reserving writer released its count; the writer count we
            // hold keeps the buffer from resetting underneath us.
            let prefix = unsafe { self.slice(within..within + LEN_PREFIX_SIZE) };
            let len = BigEndian::read_u32(prefix) as usize;
            let data_start = within + LEN_PREFIX_SIZE;
            // SAFETY: same reservation as the prefix.
            let payload = unsafe { self.slice(data_start..data_start + len) };
            dst[..len].copy_from_slice(payload);
            Some(len)
        } else {
            None
        };

        let fire = self.done();
        (served, fire)
    }

    /// Records a trim request to be applied by this buffer's flush.
    /// Returns the fire flag on success, `None` when the buffer is
    /// inactive.
    pub(crate) fn set_trim_offset(&self, off: u64) -> Option<bool> {
        if !self.begin_access() {
            return None;
        }
        self.trim_offset.store(off, Ordering::Release);
        Some(self.done())
    }

    pub(crate) fn take_trim_offset(&self) -> Option<u64> {
        let off = self.trim_offset.load(Ordering::Acquire);
        if off > 0 {
            Some(off)
        } else {
            None
        }
    }

    pub(crate) fn set_do_commit(&self, commit: bool) {
        self.do_commit.store(commit, Ordering::Release);
    }

    pub(crate) fn do_commit(&self) -> bool {
        self.do_commit.load(Ordering::Acquire)
    }

    /// The reserved prefix of the slab, read by the flusher.
    ///
    /// SAFETY: only call after the flush has been triggered (writer count
    /// zero, full bit set); no reservation can still be writing.
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        let (_, _, _, offset) = decode_state(self.state.load(Ordering::Acquire));
        self.slice(0..offset)
    }

    pub(crate) fn is_reset(&self) -> bool {
        decode_state(self.state.load(Ordering::Acquire)).1
    }

    /// Marks the buffer reusable. The next `init_for` observes the reset
    /// bit and rearms the state word.
    pub(crate) fn reset(&self) {
        self.base_offset.store(0, Ordering::Release);
        self.do_commit.store(false, Ordering::Release);
        self.trim_offset.store(0, Ordering::Release);
        self.state.fetch_or(RESET_BIT, Ordering::AcqRel);
    }

    /// Rearms a reset buffer behind `prev`: the base offset continues
    /// where `prev` ends and the state starts with two writer counts, one
    /// for the predecessor's flush ordering and one for whoever closes
    /// this buffer.
    pub(crate) fn init_for(&self, prev_end: u64, prev_seqno: u64) {
        self.base_offset.store(prev_end, Ordering::Release);
        self.seqno.store(prev_seqno + 1, Ordering::Release);
        self.state
            .store(encode_state(false, 2, 0), Ordering::Release);
    }

    unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        &(&*self.buf.get())[range]
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [u8] {
        &mut (&mut *self.buf.get())[range]
    }

    /// Grants mutable access to a reserved payload range.
    ///
    /// SAFETY: `range` must come from this buffer's `alloc` and must not
    /// be written through more than one path at a time.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self, range: Range<usize>) -> &mut [u8] {
        self.slice_mut(range)
    }
}

const FULL_BIT: u64 = 0x1;
const RESET_BIT: u64 = 0x2;

fn decode_state(state: u64) -> (bool, bool, usize, usize) {
    let is_full = state & FULL_BIT == FULL_BIT;
    let reset = state & RESET_BIT == RESET_BIT;
    let nwriters = (state >> 2 & 0xffff) as usize;
    let offset = (state >> 32) as usize;
    (is_full, reset, nwriters, offset)
}

fn encode_state(is_full: bool, nwriters: usize, offset: usize) -> u64 {
    let full_bits = if is_full { FULL_BIT } else { 0 };
    let writer_bits = (nwriters as u64) << 2;
    let offset_bits = (offset as u64) << 32;
    full_bits | writer_bits | offset_bits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed(capacity: usize) -> FlushBuffer {
        let fb = FlushBuffer::new(capacity);
        fb.reset();
        fb.init_for(0, 0);
        fb
    }

    #[test]
    fn state_word_round_trips() {
        for &(full, nw, off) in &[(false, 0, 0), (true, 1, 42), (false, 65535, 1 << 31)] {
            let (f, r, n, o) = decode_state(encode_state(full, nw, off));
            assert_eq!((f, r, n, o), (full, false, nw, off));
        }
    }

    #[test]
    fn alloc_assigns_monotonic_offsets() {
        let fb = armed(1024);
        let (off_a, ranges_a) = match fb.alloc(&[10, 20]) {
            AllocOutcome::Reserved { offsets, ranges } => (offsets, ranges),
            _ => panic!("expected reservation"),
        };
        assert_eq!(off_a, vec![0, 14]);
        assert_eq!(ranges_a[0], 4..14);
        assert_eq!(ranges_a[1], 18..38);

        let (off_b, _) = match fb.alloc(&[5]) {
            AllocOutcome::Reserved { offsets, ranges } => (offsets, ranges),
            _ => panic!("expected reservation"),
        };
        assert_eq!(off_b, vec![38]);
    }

    #[test]
    fn overflow_marks_full_once() {
        let fb = armed(32);
        match fb.alloc(&[16]) {
            AllocOutcome::Reserved { .. } => {}
            _ => panic!("first alloc must fit"),
        }
        match fb.alloc(&[16]) {
            AllocOutcome::RotateFull => {}
            _ => panic!("overflow must mark the buffer full"),
        }
        match fb.alloc(&[1]) {
            AllocOutcome::Busy => {}
            _ => panic!("full buffer must reject further allocs"),
        }
    }

    #[test]
    fn flush_fires_exactly_once_after_last_done() {
        let fb = armed(64);
        let n_reservations = 3;
        for _ in 0..n_reservations {
            match fb.alloc(&[4]) {
                AllocOutcome::Reserved { .. } => {}
                _ => panic!("expected reservation"),
            }
        }
        assert!(fb.try_close(0).is_some());

        // Two init counts plus three reservations; only the final done
        // fires.
        let mut fired = 0;
        for _ in 0..n_reservations + 2 {
            if fb.done() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn read_back_from_unflushed_buffer() {
        let fb = armed(128);
        let range = match fb.alloc(&[5]) {
            AllocOutcome::Reserved { mut ranges, .. } => ranges.remove(0),
            _ => panic!("expected reservation"),
        };
        // SAFETY: the range was just reserved and is not aliased.
        unsafe { fb.payload_mut(range) }.copy_from_slice(b"delta");

        let mut dst = [0u8; 16];
        let (len, fire) = fb.read_payload(0, &mut dst);
        assert_eq!(&dst[..len.unwrap()], b"delta");
        assert!(!fire);

        let (len, _) = fb.read_payload(999, &mut dst);
        assert!(len.is_none());
    }

    #[test]
    fn reset_buffer_rejects_access() {
        let fb = armed(64);
        fb.reset();
        assert!(fb.is_reset());
        let mut dst = [0u8; 8];
        let (len, fire) = fb.read_payload(0, &mut dst);
        assert!(len.is_none() && !fire);
        assert!(fb.set_trim_offset(10).is_none());
        assert!(matches!(fb.alloc(&[1]), AllocOutcome::Busy));
    }

    #[test]
    fn close_below_threshold_fails() {
        let fb = armed(64);
        match fb.alloc(&[4]) {
            AllocOutcome::Reserved { .. } => {}
            _ => panic!("expected reservation"),
        }
        assert!(fb.try_close(1024).is_none());
        assert!(fb.try_close(8).is_some());
    }
}
