use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::mmap::MmapFile;
use crate::{Error, Result};

pub const LOG_MAGIC: u32 = 0x434E_4454; // 'CNDT'
pub const LOG_VERSION: u32 = 1;

/// Number of term partitions per log buffer. Terms rotate through the
/// partitions in sequence; a partition is reused three terms later, after
/// housekeeping has zeroed it.
pub const PARTITION_COUNT: u32 = 3;

/// Size of the metadata page at the start of every log buffer file.
pub const LOG_META_SIZE: usize = 4096;

pub const MIN_TERM_LENGTH: usize = 64 * 1024;
pub const MAX_TERM_LENGTH: usize = 1 << 30;

/// Fixed number of subscriber position slots in the metadata page.
pub const MAX_SUBSCRIBER_SLOTS: usize = 8;

/// A subscriber's advertised consumption position. `owner_id` of zero marks a
/// free slot. Each slot has its own cache line so independent consumers do not
/// contend.
#[repr(C, align(128))]
pub struct SubscriberSlot {
    pub owner_id: AtomicU64,
    pub position: AtomicU64,
    pub _pad: [u8; 112],
}

/// Metadata page shared by every process mapping the log.
///
/// Field groups are separated into cache lines: identity fields are written
/// once at creation, raw tails are producer-hot, flow-control words are
/// driver-written and producer-read.
#[repr(C, align(128))]
pub struct LogMeta {
    // Identity, written before init_state is released.
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    pub is_closed: AtomicU32,
    pub term_length: AtomicU64,
    pub initial_term_id: AtomicU32,
    pub session_id: AtomicU32,
    pub stream_id: AtomicU32,
    pub mtu: AtomicU32,
    pub _pad0: [u8; 88],

    // Producer-hot.
    pub raw_tails: [AtomicU64; PARTITION_COUNT as usize],
    pub active_term_count: AtomicU32,
    pub _pad1: [u8; 100],

    // Flow control, driver-written.
    pub pub_limit: AtomicU64,
    pub sender_position: AtomicU64,
    pub receiver_hwm: AtomicU64,
    pub end_of_stream_position: AtomicU64,
    pub _pad2: [u8; 96],

    // Housekeeping.
    pub clean_count: AtomicU64,
    pub _pad3: [u8; 120],

    pub sub_slots: [SubscriberSlot; MAX_SUBSCRIBER_SLOTS],
}

/// Packs a term id and a tail offset into a raw tail word.
#[inline]
pub fn pack_tail(term_id: u32, tail_offset: u32) -> u64 {
    ((term_id as u64) << 32) | tail_offset as u64
}

#[inline]
pub fn tail_term_id(raw_tail: u64) -> u32 {
    (raw_tail >> 32) as u32
}

/// Tail offset, capped at the term length (concurrent overflowing claims can
/// push the raw offset past the end).
#[inline]
pub fn tail_offset(raw_tail: u64, term_length: usize) -> u32 {
    let raw = raw_tail & 0xFFFF_FFFF;
    raw.min(term_length as u64) as u32
}

#[inline]
pub fn index_by_term_count(term_count: u32) -> usize {
    (term_count % PARTITION_COUNT) as usize
}

pub fn validate_term_length(term_length: usize) -> Result<usize> {
    if !(MIN_TERM_LENGTH..=MAX_TERM_LENGTH).contains(&term_length) {
        return Err(Error::Unsupported("term length out of range"));
    }
    if !term_length.is_power_of_two() {
        return Err(Error::Unsupported("term length must be a power of two"));
    }
    Ok(term_length)
}

pub fn log_file_length(term_length: usize) -> usize {
    LOG_META_SIZE + term_length * PARTITION_COUNT as usize
}

/// Creation parameters for a log buffer.
#[derive(Debug, Clone, Copy)]
pub struct LogParams {
    pub term_length: usize,
    pub initial_term_id: u32,
    pub session_id: u32,
    pub stream_id: u32,
    pub mtu: u32,
}

/// A mapped log buffer: metadata page plus three term partitions.
///
/// Cloneable via `Arc`; all mutation goes through atomics in the metadata page
/// or release-committed frame words in the partitions.
pub struct LogBuffer {
    mmap: MmapFile,
    meta: *mut LogMeta,
    term_length: usize,
    position_bits: u32,
}

// SAFETY: all shared state inside the mapping is accessed through atomics or
// release/acquire-committed frames; the wrapper itself is immutable after open.
unsafe impl Send for LogBuffer {}
unsafe impl Sync for LogBuffer {}

impl LogBuffer {
    pub fn create(path: &Path, params: LogParams) -> Result<Arc<Self>> {
        let term_length = validate_term_length(params.term_length)?;
        let tmp_path = path.with_extension("tmp");
        let mut mmap = MmapFile::create(&tmp_path, log_file_length(term_length))?;
        mmap.as_mut_slice().fill(0);
        let ptr = mmap.as_ptr() as *mut LogMeta;
        let meta = unsafe { &*ptr };
        meta.init_state.store(1, Ordering::Relaxed);
        meta.version.store(LOG_VERSION, Ordering::Relaxed);
        meta.term_length.store(term_length as u64, Ordering::Relaxed);
        meta.initial_term_id
            .store(params.initial_term_id, Ordering::Relaxed);
        meta.session_id.store(params.session_id, Ordering::Relaxed);
        meta.stream_id.store(params.stream_id, Ordering::Relaxed);
        meta.mtu.store(params.mtu, Ordering::Relaxed);
        // Partition 0 starts at the initial term id; partitions 1 and 2 hold
        // the tails rotation expects to find (three terms behind their first
        // use), so the first two rotations take the same path as every later
        // one.
        for i in 0..PARTITION_COUNT {
            let term_id = params
                .initial_term_id
                .wrapping_add(i)
                .wrapping_sub(if i == 0 { 0 } else { PARTITION_COUNT });
            meta.raw_tails[i as usize].store(pack_tail(term_id, 0), Ordering::Relaxed);
        }
        meta.active_term_count.store(0, Ordering::Relaxed);
        meta.pub_limit.store(0, Ordering::Relaxed);
        meta.end_of_stream_position
            .store(u64::MAX, Ordering::Relaxed);
        // All three partitions start zeroed.
        meta.clean_count
            .store(PARTITION_COUNT as u64, Ordering::Relaxed);
        meta.magic.store(LOG_MAGIC, Ordering::Relaxed);
        meta.init_state.store(2, Ordering::Release);
        std::fs::rename(&tmp_path, path)?;
        Ok(Arc::new(Self {
            mmap,
            meta: ptr,
            term_length,
            position_bits: term_length.trailing_zeros(),
        }))
    }

    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let mmap = MmapFile::open(path)?;
        if mmap.len() < LOG_META_SIZE {
            return Err(Error::CorruptMetadata("log file too small"));
        }
        let ptr = mmap.as_ptr() as *mut LogMeta;
        let meta = unsafe { &*ptr };
        if meta.init_state.load(Ordering::Acquire) != 2 {
            return Err(Error::CorruptMetadata("log buffer not initialized"));
        }
        if meta.magic.load(Ordering::Acquire) != LOG_MAGIC {
            return Err(Error::CorruptMetadata("log buffer magic mismatch"));
        }
        let version = meta.version.load(Ordering::Acquire);
        if version != LOG_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let term_length = validate_term_length(meta.term_length.load(Ordering::Acquire) as usize)?;
        if mmap.len() != log_file_length(term_length) {
            return Err(Error::CorruptMetadata("log file length mismatch"));
        }
        Ok(Arc::new(Self {
            mmap,
            meta: ptr,
            term_length,
            position_bits: term_length.trailing_zeros(),
        }))
    }

    pub fn meta(&self) -> &LogMeta {
        unsafe { &*self.meta }
    }

    pub fn term_length(&self) -> usize {
        self.term_length
    }

    pub fn position_bits(&self) -> u32 {
        self.position_bits
    }

    pub fn initial_term_id(&self) -> u32 {
        self.meta().initial_term_id.load(Ordering::Relaxed)
    }

    pub fn session_id(&self) -> u32 {
        self.meta().session_id.load(Ordering::Relaxed)
    }

    pub fn stream_id(&self) -> u32 {
        self.meta().stream_id.load(Ordering::Relaxed)
    }

    pub fn mtu(&self) -> u32 {
        self.meta().mtu.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.meta().is_closed.load(Ordering::Acquire) != 0
    }

    pub fn close(&self) {
        self.meta().is_closed.store(1, Ordering::Release);
    }

    /// Base pointer of a term partition.
    pub fn term_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < PARTITION_COUNT as usize);
        unsafe {
            self.mmap
                .as_ptr()
                .add(LOG_META_SIZE + index * self.term_length)
        }
    }

    /// Zero a term partition. Housekeeping only; callers must ensure no
    /// consumer still needs the partition's frames.
    pub fn clean_term(&self, index: usize) {
        let ptr = self.term_ptr(index);
        unsafe { std::ptr::write_bytes(ptr, 0, self.term_length) };
    }

    /// Number of terms the stream has advanced past `initial_term_id`.
    #[inline]
    pub fn term_count_of(&self, term_id: u32) -> u32 {
        term_id.wrapping_sub(self.initial_term_id())
    }

    /// Stream position of a (term id, term offset) pair.
    #[inline]
    pub fn compute_position(&self, term_id: u32, term_offset: u32) -> u64 {
        ((self.term_count_of(term_id) as u64) << self.position_bits) + term_offset as u64
    }

    #[inline]
    pub fn term_count_of_position(&self, position: u64) -> u32 {
        (position >> self.position_bits) as u32
    }

    #[inline]
    pub fn term_offset_of_position(&self, position: u64) -> u32 {
        (position & (self.term_length as u64 - 1)) as u32
    }

    /// Position of the producer tail: active term, committed tail offset.
    pub fn producer_position(&self) -> u64 {
        let meta = self.meta();
        let term_count = meta.active_term_count.load(Ordering::Acquire);
        let raw = meta.raw_tails[index_by_term_count(term_count)].load(Ordering::Acquire);
        self.compute_position(tail_term_id(raw), tail_offset(raw, self.term_length))
    }

    /// Register a subscriber position slot. Returns the slot index.
    pub fn register_subscriber(&self, owner_id: u64, position: u64) -> Result<usize> {
        if owner_id == 0 {
            return Err(Error::Unsupported("subscriber owner id must be non-zero"));
        }
        let meta = self.meta();
        for (index, slot) in meta.sub_slots.iter().enumerate() {
            if slot
                .owner_id
                .compare_exchange(0, owner_id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.position.store(position, Ordering::Release);
                return Ok(index);
            }
        }
        Err(Error::Unsupported("no free subscriber slot"))
    }

    pub fn release_subscriber(&self, index: usize) {
        let slot = &self.meta().sub_slots[index];
        slot.owner_id.store(0, Ordering::Release);
    }

    /// Advance a subscriber slot's position. Positions only move forward;
    /// a stale update (reordered status message) is a no-op.
    pub fn update_subscriber(&self, index: usize, position: u64) {
        let slot = &self.meta().sub_slots[index];
        slot.position.fetch_max(position, Ordering::AcqRel);
    }

    /// Minimum advertised position across active subscriber slots, or `None`
    /// when no subscriber is registered.
    pub fn min_subscriber_position(&self) -> Option<u64> {
        let meta = self.meta();
        let mut min = None;
        for slot in &meta.sub_slots {
            if slot.owner_id.load(Ordering::Acquire) == 0 {
                continue;
            }
            let position = slot.position.load(Ordering::Acquire);
            min = Some(match min {
                Some(current) if current <= position => current,
                _ => position,
            });
        }
        min
    }

    pub fn has_subscribers(&self) -> bool {
        self.meta()
            .sub_slots
            .iter()
            .any(|slot| slot.owner_id.load(Ordering::Acquire) != 0)
    }

    /// Release subscriber slots owned by the given client. Returns how many
    /// were freed.
    pub fn release_slots_of(&self, owner_id: u64) -> usize {
        let mut freed = 0;
        for slot in &self.meta().sub_slots {
            if slot
                .owner_id
                .compare_exchange(owner_id, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                freed += 1;
            }
        }
        freed
    }
}
