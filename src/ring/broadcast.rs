use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::ring::{
    record_align_up, LENGTH_OFFSET, PADDING_MSG_TYPE, RECORD_HEADER_SIZE, RING_TRAILER_SIZE,
    TYPE_OFFSET,
};
use crate::{Error, Result};

#[repr(C, align(128))]
struct Trailer {
    /// High-water mark of bytes the writer has started to (re)write.
    tail_intent: AtomicU64,
    _pad0: [u8; 120],
    /// Bytes fully transmitted.
    tail: AtomicU64,
    _pad1: [u8; 120],
}

/// One-writer, many-readers broadcast ring.
///
/// The writer never blocks on readers: it overwrites the oldest records as it
/// wraps. Each reader keeps its own cursor and copies records out, then
/// validates against `tail_intent` that the copied bytes were not rewritten
/// mid-copy. A reader that falls more than one capacity behind has lost
/// records and resynchronizes to the live tail.
pub struct BroadcastRing {
    base: *mut u8,
    capacity: u64,
    mask: u64,
    trailer: *const Trailer,
}

// SAFETY: coordination happens through the trailer atomics; readers treat the
// data region as volatile and validate after copying.
unsafe impl Send for BroadcastRing {}
unsafe impl Sync for BroadcastRing {}

impl BroadcastRing {
    /// Attach to a ring region of `total_len` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a region of at least `total_len` bytes, 128-byte
    /// aligned and valid for the lifetime of the ring. Only one attached view
    /// may transmit.
    pub unsafe fn attach(base: *mut u8, total_len: usize) -> Result<Self> {
        if total_len <= RING_TRAILER_SIZE {
            return Err(Error::Unsupported("ring region too small"));
        }
        let capacity = total_len - RING_TRAILER_SIZE;
        if !capacity.is_power_of_two() {
            return Err(Error::Unsupported("ring capacity must be a power of two"));
        }
        let trailer = base.add(capacity) as *const Trailer;
        Ok(Self {
            base,
            capacity: capacity as u64,
            mask: capacity as u64 - 1,
            trailer,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn max_message_length(&self) -> usize {
        self.capacity as usize / 8
    }

    fn trailer(&self) -> &Trailer {
        unsafe { &*self.trailer }
    }

    #[inline]
    fn store_u32(&self, index: u64, offset: usize, value: u32, ordering: Ordering) {
        // SAFETY: index is masked into the data region; records are 8-byte
        // aligned so both header words are 4-byte aligned.
        let atomic =
            unsafe { &*(self.base.add((index as usize) + offset) as *const AtomicU32) };
        atomic.store(value, ordering);
    }

    #[inline]
    fn load_u32(&self, index: u64, offset: usize) -> u32 {
        // SAFETY: as in store_u32.
        let atomic =
            unsafe { &*(self.base.add((index as usize) + offset) as *const AtomicU32) };
        atomic.load(Ordering::Acquire)
    }

    /// Transmit a record. Single writer only.
    pub fn transmit(&self, msg_type: u32, payload: &[u8]) -> Result<()> {
        if msg_type == PADDING_MSG_TYPE {
            return Err(Error::Unsupported("message type 0 is reserved"));
        }
        if payload.len() > self.max_message_length() {
            return Err(Error::PayloadTooLarge);
        }
        let record_len = RECORD_HEADER_SIZE + payload.len();
        let aligned = record_align_up(record_len) as u64;
        let trailer = self.trailer();

        let mut tail = trailer.tail.load(Ordering::Relaxed);
        let tail_index = tail & self.mask;
        let to_end = self.capacity - tail_index;
        let padding = if aligned > to_end { to_end } else { 0 };

        // Declare the region about to be rewritten before touching it, so
        // readers copying from it can detect the overlap.
        trailer
            .tail_intent
            .store(tail + padding + aligned, Ordering::Release);

        if padding > 0 {
            self.store_u32(tail_index, TYPE_OFFSET, PADDING_MSG_TYPE, Ordering::Relaxed);
            self.store_u32(tail_index, LENGTH_OFFSET, to_end as u32, Ordering::Release);
            tail += padding;
        }

        let index = tail & self.mask;
        self.store_u32(index, TYPE_OFFSET, msg_type, Ordering::Relaxed);
        // SAFETY: the writer owns the whole data region; readers validate
        // against tail_intent after copying.
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.base.add((index as usize) + RECORD_HEADER_SIZE),
                payload.len(),
            );
        }
        self.store_u32(index, LENGTH_OFFSET, record_len as u32, Ordering::Release);

        trailer.tail.store(tail + aligned, Ordering::Release);
        Ok(())
    }

    pub fn tail(&self) -> u64 {
        self.trailer().tail.load(Ordering::Acquire)
    }

    /// Create a reader positioned at the live tail (new records only).
    pub fn receiver(&self) -> BroadcastReceiver<'_> {
        self.receiver_from(self.tail())
    }

    /// Create a reader resuming from a previously snapshotted tail, so no
    /// record transmitted after the snapshot is missed. A snapshot that has
    /// already fallen off the retained window resynchronizes as an overrun.
    pub fn receiver_from(&self, cursor: u64) -> BroadcastReceiver<'_> {
        BroadcastReceiver {
            ring: self,
            cursor,
            lapped: 0,
            scratch: Vec::with_capacity(1024),
        }
    }
}

/// A reader cursor over a `BroadcastRing`.
pub struct BroadcastReceiver<'a> {
    ring: &'a BroadcastRing,
    cursor: u64,
    lapped: u64,
    scratch: Vec<u8>,
}

impl BroadcastReceiver<'_> {
    /// Number of times this reader lost records by falling behind.
    pub fn lapped_count(&self) -> u64 {
        self.lapped
    }

    /// Drain up to `limit` records into the handler. Returns the number of
    /// records delivered.
    pub fn receive(&mut self, limit: usize, handler: &mut dyn FnMut(u32, &[u8])) -> usize {
        let trailer = self.ring.trailer();
        let mut received = 0;
        while received < limit {
            let tail = trailer.tail.load(Ordering::Acquire);
            if self.cursor == tail {
                break;
            }
            if tail - self.cursor > self.ring.capacity {
                // Fell off the retained window before we started reading.
                self.cursor = tail;
                self.lapped += 1;
                continue;
            }
            let index = self.cursor & self.ring.mask;
            let length = self.ring.load_u32(index, LENGTH_OFFSET) as u64;
            let msg_type = self.ring.load_u32(index, TYPE_OFFSET);
            if length < RECORD_HEADER_SIZE as u64 || length > self.ring.capacity {
                // Header was rewritten under us.
                self.cursor = trailer.tail.load(Ordering::Acquire);
                self.lapped += 1;
                continue;
            }
            let payload_len = length as usize - RECORD_HEADER_SIZE;
            self.scratch.clear();
            self.scratch.resize(payload_len, 0);
            // SAFETY: bounds were validated above; the copy is revalidated
            // against tail_intent before use.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.ring.base.add((index as usize) + RECORD_HEADER_SIZE),
                    self.scratch.as_mut_ptr(),
                    payload_len,
                );
            }
            // The record was stable only if the writer has not started
            // rewriting the span we just copied.
            if trailer.tail_intent.load(Ordering::Acquire) - self.cursor > self.ring.capacity {
                self.cursor = trailer.tail.load(Ordering::Acquire);
                self.lapped += 1;
                continue;
            }
            self.cursor += record_align_up(length as usize) as u64;
            if msg_type != PADDING_MSG_TYPE {
                handler(msg_type, &self.scratch);
                received += 1;
            }
        }
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::MmapFile;
    use tempfile::TempDir;

    fn ring_file(dir: &TempDir, capacity: usize) -> (MmapFile, BroadcastRing) {
        let path = dir.path().join("bcast.dat");
        let mmap = MmapFile::create(&path, capacity + RING_TRAILER_SIZE).unwrap();
        let ring = unsafe { BroadcastRing::attach(mmap.as_ptr(), mmap.len()) }.unwrap();
        (mmap, ring)
    }

    #[test]
    fn fan_out_to_two_receivers() {
        let dir = TempDir::new().unwrap();
        let (_mmap, ring) = ring_file(&dir, 1024);
        let mut rx1 = ring.receiver();
        let mut rx2 = ring.receiver();

        ring.transmit(3, b"to everyone").unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let mut seen = Vec::new();
            rx.receive(10, &mut |msg_type, body| seen.push((msg_type, body.to_vec())));
            assert_eq!(seen, vec![(3, b"to everyone".to_vec())]);
        }
    }

    #[test]
    fn late_receiver_only_sees_new_records() {
        let dir = TempDir::new().unwrap();
        let (_mmap, ring) = ring_file(&dir, 1024);
        ring.transmit(1, b"early").unwrap();
        let mut rx = ring.receiver();
        ring.transmit(2, b"late").unwrap();
        let mut seen = Vec::new();
        rx.receive(10, &mut |msg_type, body| seen.push((msg_type, body.to_vec())));
        assert_eq!(seen, vec![(2, b"late".to_vec())]);
    }

    #[test]
    fn wrap_preserves_record_contents() {
        let dir = TempDir::new().unwrap();
        let (_mmap, ring) = ring_file(&dir, 256);
        let mut rx = ring.receiver();
        for i in 0..100u32 {
            ring.transmit(i + 1, &i.to_le_bytes()).unwrap();
            let mut seen = Vec::new();
            rx.receive(10, &mut |msg_type, body| seen.push((msg_type, body.to_vec())));
            assert_eq!(seen, vec![(i + 1, i.to_le_bytes().to_vec())]);
        }
        assert_eq!(rx.lapped_count(), 0);
    }

    #[test]
    fn lapped_receiver_resyncs() {
        let dir = TempDir::new().unwrap();
        let (_mmap, ring) = ring_file(&dir, 256);
        let mut rx = ring.receiver();
        // Push far more than one capacity without draining.
        for i in 0..64u32 {
            ring.transmit(1, &[i as u8; 24]).unwrap();
        }
        let mut count = 0;
        rx.receive(1000, &mut |_, _| count += 1);
        assert!(rx.lapped_count() >= 1);
        // Whatever survived is the newest window, not the full history.
        assert!(count < 64);
    }
}
