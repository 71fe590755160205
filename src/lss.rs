//! The log-structured store: a ring of flush buffers over the append-only
//! log.
//!
//! Writers reserve space on the tail buffer; when a buffer fills, the
//! reserving thread that observed the overflow rotates the ring and the
//! last reservation to complete flushes the buffer to the log. Reads at
//! offsets past the durable tail are served straight out of the
//! unflushed buffers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use crossbeam_utils::{Backoff, CachePadded};
use log::error;
use metrics::counter;

use crate::error::{LogError, StoreError};
use crate::flushbuf::{AllocOutcome, FlushBuffer, LEN_PREFIX_SIZE};
use crate::logfile::LogFile;
use crate::metrics_keys;

/// A non-full buffer holding at least this much is proactively closed by
/// the predecessor's flush.
pub(crate) const FORCE_FLUSH_THRESHOLD: usize = 512 * 1024;

/// Cleaner relocation budget per pass.
pub(crate) const LSS_RECLAIM_BLOCK_SIZE: u64 = 8 * 1024 * 1024;

/// One byte tagging every block payload.
pub(crate) const BLOCK_TYPE_SIZE: usize = 1;

/// Block tags as they appear on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockType {
    /// A self-contained page image.
    PageData = 1,
    /// A self-contained page image written by the cleaner.
    PageReloc = 2,
    /// An incremental page delta with a back-link to the prior segment.
    PageUpdate = 3,
    /// Metadata naming a removed page's low fence.
    PageRemove = 4,
    /// The marshaled recovery-point list.
    RecoveryPoints = 5,
    /// The snapshot watermark.
    MaxSn = 6,
    /// A reservation abandoned after a lost compare-and-swap; skipped by
    /// every scan.
    Discard = 7,
}

impl BlockType {
    pub(crate) fn from_u8(b: u8) -> Option<BlockType> {
        match b {
            1 => Some(BlockType::PageData),
            2 => Some(BlockType::PageReloc),
            3 => Some(BlockType::PageUpdate),
            4 => Some(BlockType::PageRemove),
            5 => Some(BlockType::RecoveryPoints),
            6 => Some(BlockType::MaxSn),
            7 => Some(BlockType::Discard),
            _ => None,
        }
    }
}

/// Computes the lowest log offset still needed by an in-flight reader;
/// trims never pass it.
pub(crate) type SafeTrimFn = Box<dyn Fn() -> u64 + Send + Sync>;

/// A pinned multi-chunk reservation on a flush buffer.
///
/// The reservation holds one writer count on its buffer; the payload
/// becomes eligible for flushing only when [`LsStore::finalize_write`]
/// releases it. Dropping a reservation without finalizing would wedge the
/// buffer, so the engine always pairs reserve with finalize.
pub(crate) struct Reservation {
    buf_idx: usize,
    offsets: Vec<u64>,
    ranges: Vec<std::ops::Range<usize>>,
}

impl Reservation {
    pub(crate) fn offset(&self, i: usize) -> u64 {
        self.offsets[i]
    }
}

pub(crate) struct LsStore {
    bufs: Box<[FlushBuffer]>,
    head_idx: CachePadded<AtomicUsize>,
    tail_idx: CachePadded<AtomicUsize>,
    log: LogFile,
    buf_size: usize,
    commit_duration: Duration,
    last_commit: Mutex<Instant>,
    /// Highest trim offset requested through a flush buffer.
    pending_trim: AtomicU64,
    /// Cleaner bookkeeping: offset of the last issued trim and the scan
    /// resume point.
    cleaner_trim: AtomicU64,
    start_offset: AtomicU64,
    trim_batch: u64,
    bytes_written: AtomicU64,
    cleaner_lock: Mutex<()>,
    safe_trim: RwLock<Option<SafeTrimFn>>,
}

impl LsStore {
    pub(crate) fn new(
        log: LogFile,
        buf_size: usize,
        nbufs: usize,
        commit_duration: Duration,
    ) -> Self {
        assert!(nbufs >= 2, "the ring needs at least two buffers");

        let bufs: Box<[FlushBuffer]> = (0..nbufs).map(|_| FlushBuffer::new(buf_size)).collect();
        // The first buffer accepts writes immediately; the rest wait in
        // the reset state for their turn.
        bufs[0].set_base_offset(log.tail());
        for fb in bufs.iter().skip(1) {
            fb.reset();
        }

        let start_offset = log.head();
        LsStore {
            bufs,
            head_idx: CachePadded::new(AtomicUsize::new(0)),
            tail_idx: CachePadded::new(AtomicUsize::new(0)),
            log,
            buf_size,
            commit_duration,
            last_commit: Mutex::new(Instant::now()),
            pending_trim: AtomicU64::new(0),
            cleaner_trim: AtomicU64::new(0),
            start_offset: AtomicU64::new(start_offset),
            trim_batch: buf_size as u64,
            bytes_written: AtomicU64::new(0),
            cleaner_lock: Mutex::new(()),
            safe_trim: RwLock::new(None),
        }
    }

    pub(crate) fn set_safe_trim_callback(&self, f: SafeTrimFn) {
        *self.safe_trim.write().unwrap() = Some(f);
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn used_space(&self) -> u64 {
        self.log.size()
    }

    pub(crate) fn log_tail(&self) -> u64 {
        self.log.tail()
    }

    pub(crate) fn start_offset(&self) -> u64 {
        self.start_offset.load(Ordering::Acquire)
    }

    fn next_of(&self, idx: usize) -> usize {
        (idx + 1) % self.bufs.len()
    }

    /// Reserves one chunk; see [`LsStore::reserve_space_multi`].
    pub(crate) fn reserve_space(&self, size: usize) -> Result<Reservation, StoreError> {
        self.reserve_space_multi(&[size])
    }

    /// Reserves log space for `sizes` payloads in one buffer, rotating
    /// the ring when the tail fills. Offsets across calls are strictly
    /// monotonic.
    pub(crate) fn reserve_space_multi(&self, sizes: &[usize]) -> Result<Reservation, StoreError> {
        let total: usize = sizes.iter().map(|sz| sz + LEN_PREFIX_SIZE).sum();
        if total > self.buf_size {
            return Err(LogError::ReservationTooLarge(total).into());
        }

        let backoff = Backoff::new();
        loop {
            let idx = self.tail_idx.load(Ordering::Acquire);
            let fb = &self.bufs[idx];
            match fb.alloc(sizes) {
                AllocOutcome::Reserved { offsets, ranges } => {
                    return Ok(Reservation {
                        buf_idx: idx,
                        offsets,
                        ranges,
                    });
                }
                AllocOutcome::RotateFull => {
                    self.init_next_buffer(idx);
                    if fb.done() {
                        self.flush_from(idx);
                    }
                }
                AllocOutcome::Busy => {
                    backoff.snooze();
                }
            }
        }
    }

    /// Writes `bytes` into reservation chunk `i` as `[type][payload]`.
    pub(crate) fn write_block(&self, res: &Reservation, i: usize, typ: BlockType, bytes: &[u8]) {
        let range = res.ranges[i].clone();
        debug_assert_eq!(range.len(), BLOCK_TYPE_SIZE + bytes.len());
        // SAFETY: the range belongs to this reservation and the engine
        // writes each chunk from exactly one thread.
        let dst = unsafe { self.bufs[res.buf_idx].payload_mut(range) };
        dst[0] = typ as u8;
        dst[1..].copy_from_slice(bytes);
    }

    /// Overwrites the block tag of chunk `i` with `Discard` so scans skip
    /// a reservation whose publish lost its compare-and-swap.
    pub(crate) fn discard_block(&self, res: &Reservation, i: usize) {
        let range = res.ranges[i].clone();
        // SAFETY: as in `write_block`.
        let dst = unsafe { self.bufs[res.buf_idx].payload_mut(range) };
        dst[0] = BlockType::Discard as u8;
    }

    /// Releases the reservation; its payload is final and may be flushed.
    pub(crate) fn finalize_write(&self, res: Reservation) {
        let idx = res.buf_idx;
        if self.bufs[idx].done() {
            self.flush_from(idx);
        }
    }

    /// Reads the block payload at `offset` into `buf`, serving unflushed
    /// data from the ring. Returns the payload length.
    pub(crate) fn read(&self, offset: u64, buf: &mut Vec<u8>) -> Result<usize, StoreError> {
        let backoff = Backoff::new();
        loop {
            let tail = self.log.tail();
            if offset >= tail {
                // Still in the flush buffers.
                if buf.len() < self.buf_size {
                    buf.resize(self.buf_size, 0);
                }
                let head = self.head_idx.load(Ordering::Acquire);
                let mut served = None;
                for k in 0..self.bufs.len() {
                    let idx = (head + k) % self.bufs.len();
                    let (len, fire) = self.bufs[idx].read_payload(offset, buf);
                    if fire {
                        self.flush_from(idx);
                    }
                    if let Some(len) = len {
                        served = Some(len);
                        break;
                    }
                }
                if let Some(len) = served {
                    return Ok(len);
                }
                // The buffer raced to reset between the tail check and
                // the read; try again.
                backoff.snooze();
                continue;
            }

            let mut hdr = [0u8; LEN_PREFIX_SIZE];
            self.log.read(&mut hdr, offset)?;
            let len = BigEndian::read_u32(&hdr) as usize;
            if buf.len() < len {
                buf.resize(len, 0);
            }
            self.log.read(&mut buf[..len], offset + LEN_PREFIX_SIZE as u64)?;
            return Ok(len);
        }
    }

    /// Records a trim request on the current tail buffer; the trim is
    /// issued by that buffer's flush at the next commit.
    pub(crate) fn trim_log(&self, offset: u64) {
        let backoff = Backoff::new();
        loop {
            let idx = self.tail_idx.load(Ordering::Acquire);
            match self.bufs[idx].set_trim_offset(offset) {
                Some(fire) => {
                    if fire {
                        self.flush_from(idx);
                    }
                    return;
                }
                None => backoff.snooze(),
            }
        }
    }

    /// Forces the current tail buffer out, even partially filled, and
    /// waits until the log tail passes its end. With `commit` the flush
    /// also commits the log.
    pub(crate) fn sync(&self, commit: bool) {
        let backoff = Backoff::new();
        loop {
            let idx = self.tail_idx.load(Ordering::Acquire);
            let fb = &self.bufs[idx];
            if let Some(end) = fb.try_close(0) {
                self.init_next_buffer(idx);
                fb.set_do_commit(commit);
                if fb.done() {
                    self.flush_from(idx);
                }
                while self.log_tail() < end {
                    thread::yield_now();
                }
                return;
            }
            backoff.snooze();
        }
    }

    /// Spins until the buffer after `curr_idx` is reset, rearms it as the
    /// continuation of `curr_idx`, and publishes it as the new tail.
    fn init_next_buffer(&self, curr_idx: usize) {
        let next_idx = self.next_of(curr_idx);
        let next = &self.bufs[next_idx];

        let backoff = Backoff::new();
        while !next.is_reset() {
            backoff.snooze();
        }

        let curr = &self.bufs[curr_idx];
        next.init_for(curr.end_offset(), curr.seqno());

        if self
            .tail_idx
            .compare_exchange(curr_idx, next_idx, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!(
                "flush buffer rotation raced: tail moved past seqno {}",
                curr.seqno()
            );
        }
    }

    /// The flush path: appends closed buffers to the log in seqno order.
    ///
    /// Runs on whichever thread released the final writer count. The
    /// loop continues into the next buffer when this flush's releases
    /// completed it as well.
    fn flush_from(&self, idx: usize) {
        let mut idx = idx;
        loop {
            let fb = &self.bufs[idx];

            // SAFETY: the flush fires only after the writer count hit
            // zero with the full bit set; every reservation is final.
            let bytes = unsafe { fb.bytes() };
            loop {
                match self.log.append(bytes) {
                    Ok(()) => {
                        self.bytes_written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        counter!(metrics_keys::LSS_BYTES_WRITTEN_TOTAL)
                            .increment(bytes.len() as u64);
                        break;
                    }
                    Err(e) => {
                        error!("log append failed, retrying: {}", e);
                        thread::sleep(Duration::from_secs(1));
                    }
                }
            }

            if let Some(trim) = fb.take_trim_offset() {
                self.pending_trim.fetch_max(trim, Ordering::AcqRel);
            }

            let do_commit = fb.do_commit() || {
                let last = self.last_commit.lock().unwrap();
                last.elapsed() >= self.commit_duration
            };
            if do_commit {
                self.apply_trim();
                if let Err(e) = self.log.commit() {
                    error!("log commit failed: {}", e);
                }
                *self.last_commit.lock().unwrap() = Instant::now();
            }

            fb.reset();
            let next_idx = self.next_of(idx);
            self.head_idx.store(next_idx, Ordering::Release);

            let next = &self.bufs[next_idx];
            let mut fire = false;
            // A successor already past the force-flush threshold is
            // closed right away rather than waiting to fill.
            if next.try_close(FORCE_FLUSH_THRESHOLD).is_some() {
                self.init_next_buffer(next_idx);
                fire |= next.done();
            }
            // Release the parent-ordering count the successor holds for
            // us.
            fire |= next.done();

            if fire {
                idx = next_idx;
                continue;
            }
            return;
        }
    }

    fn apply_trim(&self) {
        let requested = self.pending_trim.load(Ordering::Acquire);
        if requested == 0 {
            return;
        }
        let safe = self
            .safe_trim
            .read()
            .unwrap()
            .as_ref()
            .map(|f| f())
            .unwrap_or(u64::MAX);
        let effective = requested.min(safe);
        if effective > self.log.head() {
            self.log.trim(effective);
        }
    }

    /// Scans `[start, end)` invoking `callb` per block with the payload
    /// (tag byte included).
    fn scan<F>(&self, start: u64, end: u64, mut callb: F, buf: &mut Vec<u8>) -> Result<(), StoreError>
    where
        F: FnMut(u64, &[u8]) -> Result<bool, StoreError>,
    {
        let mut curr = start;
        while curr < end {
            let n = self.read(curr, buf)?;
            if !callb(curr, &buf[..n])? {
                break;
            }
            curr += (n + LEN_PREFIX_SIZE) as u64;
        }
        Ok(())
    }

    /// Visits every block from the log head to the tail (recovery scan).
    pub(crate) fn visit<F>(&self, callb: F, buf: &mut Vec<u8>) -> Result<(), StoreError>
    where
        F: FnMut(u64, &[u8]) -> Result<bool, StoreError>,
    {
        self.scan(self.log.head(), self.log.tail(), callb, buf)
    }

    /// Runs one cleaner pass. `callb(offset, end_offset, payload)` decides
    /// per block and returns `(continue, clean_offset)`; the scan resume
    /// point follows `clean_offset`, and a trim is issued every
    /// `trim_batch` bytes reclaimed.
    pub(crate) fn run_cleaner<F>(&self, mut callb: F, buf: &mut Vec<u8>) -> Result<(), StoreError>
    where
        F: FnMut(u64, u64, &[u8]) -> Result<(bool, u64), StoreError>,
    {
        let _guard = self.cleaner_lock.lock().unwrap();

        let end = self.log.tail();
        let start = self.start_offset.load(Ordering::Acquire);

        self.scan(
            start,
            end,
            |offset, bs| {
                let end_offset = offset + (bs.len() + LEN_PREFIX_SIZE) as u64;
                let (cont, clean_off) = callb(offset, end_offset, bs)?;

                if clean_off - self.cleaner_trim.load(Ordering::Acquire) >= self.trim_batch {
                    self.trim_log(clean_off);
                    self.cleaner_trim.store(clean_off, Ordering::Release);
                }
                self.start_offset.store(clean_off, Ordering::Release);
                Ok(cont)
            },
            buf,
        )
    }

    pub(crate) fn close(&self) -> Result<(), StoreError> {
        self.sync(true);
        self.log.close()?;
        Ok(())
    }
}
