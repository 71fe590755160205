//! The low-level append-only log.
//!
//! The log is a directory of fixed-size segment files addressed by a
//! single monotonically growing byte offset, plus a twin-slot superblock
//! recording the committed head and tail. Appends go to the tail, trims
//! advance the head and delete whole segments behind it, and a commit
//! fsyncs the dirty segments before publishing the new tail in the
//! superblock.
//!
//! Crash behavior follows from the superblock: bytes appended after the
//! last commit are not referenced by either superblock slot, so a reopened
//! log resumes appending over them and recovery never observes a partial
//! flush.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};
use log::warn;
use memmap2::{Mmap, MmapOptions};
use rustix::fs::{fallocate, FallocateFlags};

use crate::error::LogError;

pub(crate) const SUPER_BLOCK_SIZE: usize = 4096;
const SUPER_BLOCK_MAGIC: u32 = 0x4C4F_4453; // "LODS"
const SUPER_BLOCK_VERSION: u32 = 0;
const SUPER_BLOCK_FILE: &str = "superblock";

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

// Superblock slot layout, all big-endian:
// magic u32 | version u32 | gen u64 | head u64 | tail u64 | crc u32
const SB_PAYLOAD_LEN: usize = 4 + 4 + 8 + 8 + 8;

#[derive(Debug)]
struct Segment {
    index: u64,
    file: File,
    map: Option<Mmap>,
}

impl Segment {
    fn read_at(&self, dst: &mut [u8], pos: u64) -> Result<(), LogError> {
        if let Some(map) = &self.map {
            let start = pos as usize;
            let end = start + dst.len();
            dst.copy_from_slice(&map[start..end]);
            Ok(())
        } else {
            self.file.read_exact_at(dst, pos)?;
            Ok(())
        }
    }
}

#[derive(Debug)]
struct Appender {
    synced_upto: u64,
    commit_gen: u64,
    sb_file: File,
}

/// A segmented append-only log with positional reads.
#[derive(Debug)]
pub(crate) struct LogFile {
    dir: PathBuf,
    segment_size: u64,
    use_mmap: bool,
    head: AtomicU64,
    tail: AtomicU64,
    segments: RwLock<Vec<Arc<Segment>>>,
    appender: Mutex<Appender>,
}

impl LogFile {
    pub(crate) fn open(dir: &Path, segment_size: u64, use_mmap: bool) -> Result<Self, LogError> {
        fs::create_dir_all(dir)?;

        let sb_path = dir.join(SUPER_BLOCK_FILE);
        let fresh = !sb_path.exists();
        let sb_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&sb_path)?;
        if fresh {
            sb_file.set_len((SUPER_BLOCK_SIZE * 2) as u64)?;
            sb_file.sync_all()?;
        }

        let (gen, head, tail) = read_super_block(&sb_file)?;

        let log = LogFile {
            dir: dir.to_path_buf(),
            segment_size,
            use_mmap,
            head: AtomicU64::new(head),
            tail: AtomicU64::new(tail),
            segments: RwLock::new(Vec::new()),
            appender: Mutex::new(Appender {
                synced_upto: tail,
                commit_gen: gen,
                sb_file,
            }),
        };

        if tail > head {
            let first = head / segment_size;
            let last = (tail - 1) / segment_size;
            let mut opened = Vec::new();
            for index in first..=last {
                if log.segment_path(index).exists() {
                    opened.push(Arc::new(log.open_segment(index, false)?));
                } else if opened.is_empty() {
                    // A trim deleted this segment before its new head
                    // reached the superblock; the data is gone, move the
                    // head past it.
                    log.head
                        .store((index + 1) * segment_size, Ordering::Release);
                } else {
                    return Err(LogError::Io(format!(
                        "log segment {} missing mid-stream",
                        index
                    )));
                }
            }
            *log.segments.write().unwrap() = opened;
        }

        Ok(log)
    }

    fn segment_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("segment.{:06}", index))
    }

    fn open_segment(&self, index: u64, create: bool) -> Result<Segment, LogError> {
        let path = self.segment_path(index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;

        // Segments are preallocated to their full size so mmap covers the
        // whole addressable range up front.
        fallocate(&file, FallocateFlags::empty(), 0, self.segment_size)
            .map_err(|e| LogError::Io(e.to_string()))?;

        let map = if self.use_mmap {
            // SAFETY: the mapping is read-only and the file is only ever
            // written by this process through `write_all_at`; readers are
            // bounded by the tail offset, which is published only after
            // the covered bytes have been written.
            let map = unsafe {
                MmapOptions::new()
                    .len(self.segment_size as usize)
                    .map(&file)?
            };
            Some(map)
        } else {
            None
        };

        Ok(Segment { index, file, map })
    }

    fn find_segment(&self, index: u64) -> Result<Arc<Segment>, LogError> {
        let segments = self.segments.read().unwrap();
        match segments.binary_search_by_key(&index, |s| s.index) {
            Ok(pos) => Ok(segments[pos].clone()),
            Err(_) => Err(LogError::TrimmedOffset(index * self.segment_size)),
        }
    }

    /// Appends `bytes` at the tail. The tail offset is published only
    /// after every byte has been handed to the OS.
    pub(crate) fn append(&self, bytes: &[u8]) -> Result<(), LogError> {
        // One appender at a time; readers go through the segment list.
        let _appender = self.appender.lock().unwrap();
        let start = self.tail.load(Ordering::Acquire);

        let mut pos = start;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let index = pos / self.segment_size;
            let within = pos % self.segment_size;
            let room = (self.segment_size - within) as usize;
            let n = remaining.len().min(room);

            let segment = self.ensure_segment(index)?;
            segment.file.write_all_at(&remaining[..n], within)?;

            pos += n as u64;
            remaining = &remaining[n..];
        }

        self.tail.store(start + bytes.len() as u64, Ordering::Release);
        Ok(())
    }

    fn ensure_segment(&self, index: u64) -> Result<Arc<Segment>, LogError> {
        if let Ok(segment) = self.find_segment(index) {
            return Ok(segment);
        }
        let segment = Arc::new(self.open_segment(index, true)?);
        let mut segments = self.segments.write().unwrap();
        if let Err(pos) = segments.binary_search_by_key(&index, |s| s.index) {
            segments.insert(pos, segment.clone());
        }
        Ok(segment)
    }

    /// Reads exactly `dst.len()` bytes starting at `offset`.
    pub(crate) fn read(&self, dst: &mut [u8], offset: u64) -> Result<(), LogError> {
        if offset < self.head.load(Ordering::Acquire) {
            return Err(LogError::TrimmedOffset(offset));
        }
        if offset + dst.len() as u64 > self.tail.load(Ordering::Acquire) {
            return Err(LogError::ShortRead);
        }

        let mut pos = offset;
        let mut filled = 0usize;
        while filled < dst.len() {
            let index = pos / self.segment_size;
            let within = pos % self.segment_size;
            let room = (self.segment_size - within) as usize;
            let n = (dst.len() - filled).min(room);

            let segment = self.find_segment(index)?;
            segment.read_at(&mut dst[filled..filled + n], within)?;

            pos += n as u64;
            filled += n;
        }
        Ok(())
    }

    /// The trim point: offsets below it are unreadable.
    pub(crate) fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// The end of appended data.
    pub(crate) fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Bytes currently addressable in the log.
    pub(crate) fn size(&self) -> u64 {
        self.tail() - self.head()
    }

    /// Advances the head to `offset` and deletes segment files that lie
    /// entirely behind it. The new head becomes durable at the next
    /// commit.
    pub(crate) fn trim(&self, offset: u64) {
        let offset = offset.min(self.tail());
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if offset <= head {
                return;
            }
            match self.head.compare_exchange(
                head,
                offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }

        let mut removed = Vec::new();
        {
            let mut segments = self.segments.write().unwrap();
            segments.retain(|s| {
                let end = (s.index + 1) * self.segment_size;
                if end <= offset {
                    removed.push(s.index);
                    false
                } else {
                    true
                }
            });
        }
        for index in removed {
            if let Err(e) = fs::remove_file(self.segment_path(index)) {
                warn!("failed to remove trimmed segment {}: {}", index, e);
            }
        }
    }

    /// Makes every appended byte durable and publishes the head and tail
    /// in the superblock.
    pub(crate) fn commit(&self) -> Result<(), LogError> {
        let mut appender = self.appender.lock().unwrap();
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        if tail > appender.synced_upto {
            let first = appender.synced_upto / self.segment_size;
            let last = (tail - 1) / self.segment_size;
            for index in first..=last {
                if let Ok(segment) = self.find_segment(index) {
                    segment.file.sync_all()?;
                }
            }
        }

        let gen = appender.commit_gen + 1;
        let mut slot = [0u8; SUPER_BLOCK_SIZE];
        BigEndian::write_u32(&mut slot[0..4], SUPER_BLOCK_MAGIC);
        BigEndian::write_u32(&mut slot[4..8], SUPER_BLOCK_VERSION);
        BigEndian::write_u64(&mut slot[8..16], gen);
        BigEndian::write_u64(&mut slot[16..24], head);
        BigEndian::write_u64(&mut slot[24..32], tail);
        let crc = CASTAGNOLI.checksum(&slot[..SB_PAYLOAD_LEN]);
        BigEndian::write_u32(&mut slot[SB_PAYLOAD_LEN..SB_PAYLOAD_LEN + 4], crc);

        let slot_pos = (gen % 2) as u64 * SUPER_BLOCK_SIZE as u64;
        appender.sb_file.write_all_at(&slot, slot_pos)?;
        appender.sb_file.sync_all()?;

        appender.commit_gen = gen;
        appender.synced_upto = tail;
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<(), LogError> {
        self.commit()
    }
}

fn parse_super_slot(slot: &[u8]) -> Option<(u64, u64, u64)> {
    if BigEndian::read_u32(&slot[0..4]) != SUPER_BLOCK_MAGIC {
        return None;
    }
    if BigEndian::read_u32(&slot[4..8]) != SUPER_BLOCK_VERSION {
        return None;
    }
    let crc = BigEndian::read_u32(&slot[SB_PAYLOAD_LEN..SB_PAYLOAD_LEN + 4]);
    if CASTAGNOLI.checksum(&slot[..SB_PAYLOAD_LEN]) != crc {
        return None;
    }
    let gen = BigEndian::read_u64(&slot[8..16]);
    let head = BigEndian::read_u64(&slot[16..24]);
    let tail = BigEndian::read_u64(&slot[24..32]);
    Some((gen, head, tail))
}

fn read_super_block(sb_file: &File) -> Result<(u64, u64, u64), LogError> {
    let mut buf = [0u8; SUPER_BLOCK_SIZE * 2];
    sb_file.read_exact_at(&mut buf, 0)?;

    let a = parse_super_slot(&buf[..SUPER_BLOCK_SIZE]);
    let b = parse_super_slot(&buf[SUPER_BLOCK_SIZE..]);

    match (a, b) {
        (Some(a), Some(b)) => Ok(if a.0 >= b.0 { a } else { b }),
        (Some(a), None) => Ok(a),
        (None, Some(b)) => Ok(b),
        (None, None) => {
            // A freshly created superblock file is all zeros; anything
            // else means both copies are damaged.
            if buf.iter().all(|&b| b == 0) {
                Ok((0, 0, 0))
            } else {
                Err(LogError::CorruptSuperBlock)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_read_round_trip() {
        let dir = tempdir().unwrap();
        let log = LogFile::open(dir.path(), 4096, false).unwrap();

        log.append(b"hello").unwrap();
        log.append(b"world").unwrap();
        assert_eq!(log.tail(), 10);

        let mut buf = [0u8; 5];
        log.read(&mut buf, 5).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn appends_span_segment_boundaries() {
        let dir = tempdir().unwrap();
        let log = LogFile::open(dir.path(), 8, false).unwrap();

        log.append(b"0123456789abcdef0123").unwrap();
        let mut buf = [0u8; 20];
        log.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"0123456789abcdef0123");
    }

    #[test]
    fn tail_survives_commit_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let log = LogFile::open(dir.path(), 4096, false).unwrap();
            log.append(b"durable").unwrap();
            log.commit().unwrap();
            log.append(b"volatile").unwrap();
            // No commit for the second append.
        }
        let log = LogFile::open(dir.path(), 4096, false).unwrap();
        assert_eq!(log.tail(), 7);
        let mut buf = [0u8; 7];
        log.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"durable");
    }

    #[test]
    fn trim_deletes_whole_segments() {
        let dir = tempdir().unwrap();
        let log = LogFile::open(dir.path(), 8, false).unwrap();
        log.append(&[7u8; 32]).unwrap();

        log.trim(17);
        assert_eq!(log.head(), 17);
        assert!(!dir.path().join("segment.000000").exists());
        assert!(!dir.path().join("segment.000001").exists());
        assert!(dir.path().join("segment.000002").exists());

        let mut buf = [0u8; 4];
        assert_eq!(log.read(&mut buf, 8), Err(LogError::TrimmedOffset(8)));
        log.read(&mut buf, 24).unwrap();
    }

    #[test]
    fn mmap_reads_match_pread() {
        let dir = tempdir().unwrap();
        let log = LogFile::open(dir.path(), 64, true).unwrap();
        log.append(b"mapped bytes").unwrap();
        let mut buf = [0u8; 12];
        log.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"mapped bytes");
    }

    #[test]
    fn corrupt_superblock_is_rejected() {
        let dir = tempdir().unwrap();
        {
            let log = LogFile::open(dir.path(), 4096, false).unwrap();
            log.append(b"x").unwrap();
            log.commit().unwrap();
        }
        // Damage both slots.
        let sb = dir.path().join(SUPER_BLOCK_FILE);
        let data = vec![0xAAu8; SUPER_BLOCK_SIZE * 2];
        fs::write(&sb, data).unwrap();

        match LogFile::open(dir.path(), 4096, false) {
            Err(LogError::CorruptSuperBlock) => {}
            other => panic!("expected corrupt superblock, got {:?}", other),
        }
    }
}
