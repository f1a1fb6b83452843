use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::ring::{
    record_align_up, LENGTH_OFFSET, PADDING_MSG_TYPE, RECORD_HEADER_SIZE, RING_TRAILER_SIZE,
    TYPE_OFFSET,
};
use crate::{Error, Result};

#[repr(C, align(128))]
struct Trailer {
    tail: AtomicU64,
    _pad0: [u8; 120],
    head: AtomicU64,
    _pad1: [u8; 120],
}

/// Many-producers, one-consumer ring over a shared memory region.
///
/// Producers claim a record with a CAS on the tail, write type and payload,
/// then commit by storing the record length with release semantics. The single
/// consumer zeroes records as it consumes them, so the length word of any
/// claimable region is always zero before commit.
///
/// Layout: `[data: capacity][trailer: RING_TRAILER_SIZE]`, capacity a power
/// of two.
pub struct MpscRing {
    base: *mut u8,
    capacity: u64,
    mask: u64,
    trailer: *const Trailer,
}

// SAFETY: coordination happens through the trailer atomics and record commit
// words; the struct itself is immutable after attach.
unsafe impl Send for MpscRing {}
unsafe impl Sync for MpscRing {}

impl MpscRing {
    /// Attach to a ring region of `total_len` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a region of at least `total_len` bytes, 128-byte
    /// aligned, valid for the lifetime of the ring, and shared only with other
    /// ring views of the same region.
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

    /// Largest accepted message payload.
    pub fn max_message_length(&self) -> usize {
        self.capacity as usize / 8
    }

    fn trailer(&self) -> &Trailer {
        unsafe { &*self.trailer }
    }

    #[inline]
    fn length_word(&self, index: u64) -> &AtomicU32 {
        // SAFETY: index is masked into the data region; records are 8-byte
        // aligned so the u32 at LENGTH_OFFSET is 4-byte aligned.
        unsafe { &*(self.base.add((index + LENGTH_OFFSET as u64) as usize) as *const AtomicU32) }
    }

    #[inline]
    fn type_word(&self, index: u64) -> &AtomicU32 {
        // SAFETY: as in length_word.
        unsafe { &*(self.base.add((index + TYPE_OFFSET as u64) as usize) as *const AtomicU32) }
    }

    /// Offer a message. Returns `false` when the ring has no room (the
    /// consumer is behind); callers retry after driving progress.
    pub fn offer(&self, msg_type: u32, payload: &[u8]) -> Result<bool> {
        if msg_type == PADDING_MSG_TYPE {
            return Err(Error::Unsupported("message type 0 is reserved"));
        }
        if payload.len() > self.max_message_length() {
            return Err(Error::PayloadTooLarge);
        }
        let record_len = RECORD_HEADER_SIZE + payload.len();
        let aligned = record_align_up(record_len) as u64;
        let trailer = self.trailer();

        let claimed_tail = loop {
            let head = trailer.head.load(Ordering::Acquire);
            let tail = trailer.tail.load(Ordering::Acquire);
            let tail_index = tail & self.mask;
            let to_end = self.capacity - tail_index;

            if aligned <= to_end {
                if tail + aligned - head > self.capacity {
                    return Ok(false);
                }
                if trailer
                    .tail
                    .compare_exchange(tail, tail + aligned, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break tail;
                }
            } else {
                // Record would straddle the wrap point: claim the remainder
                // as padding, then retry from the start of the ring.
                if tail + to_end + aligned - head > self.capacity {
                    return Ok(false);
                }
                if trailer
                    .tail
                    .compare_exchange(tail, tail + to_end, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.type_word(tail_index).store(PADDING_MSG_TYPE, Ordering::Relaxed);
                    self.length_word(tail_index)
                        .store(to_end as u32, Ordering::Release);
                }
            }
        };

        let index = claimed_tail & self.mask;
        self.type_word(index).store(msg_type, Ordering::Relaxed);
        // SAFETY: [index + header, index + record_len) was claimed by the CAS
        // and zeroed by the consumer before the claim could succeed.
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.base.add((index as usize) + RECORD_HEADER_SIZE),
                payload.len(),
            );
        }
        self.length_word(index)
            .store(record_len as u32, Ordering::Release);
        Ok(true)
    }

    /// Drain up to `limit` committed records. Single consumer only.
    ///
    /// The handler borrows the record bytes in place; records are zeroed and
    /// the head advanced after each callback returns.
    pub fn receive(&self, limit: usize, handler: &mut dyn FnMut(u32, &[u8])) -> usize {
        let trailer = self.trailer();
        let mut received = 0;
        while received < limit {
            let head = trailer.head.load(Ordering::Acquire);
            if head == trailer.tail.load(Ordering::Acquire) {
                break;
            }
            let index = head & self.mask;
            let length = self.length_word(index).load(Ordering::Acquire);
            if length == 0 {
                // Claimed but not yet committed.
                break;
            }
            let msg_type = self.type_word(index).load(Ordering::Relaxed);
            let aligned = record_align_up(length as usize) as u64;
            if msg_type != PADDING_MSG_TYPE {
                // SAFETY: committed record within the data region; producers
                // cannot reclaim it until head advances below.
                let payload = unsafe {
                    std::slice::from_raw_parts(
                        self.base.add((index as usize) + RECORD_HEADER_SIZE),
                        length as usize - RECORD_HEADER_SIZE,
                    )
                };
                handler(msg_type, payload);
                received += 1;
            }
            // SAFETY: zeroing the consumed record before advancing head keeps
            // the claimable region all-zero for producers.
            unsafe {
                std::ptr::write_bytes(self.base.add(index as usize), 0, aligned as usize);
            }
            trailer.head.store(head + aligned, Ordering::Release);
        }
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::MmapFile;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ring_file(dir: &TempDir, capacity: usize) -> (MmapFile, MpscRing) {
        let path = dir.path().join("ring.dat");
        let mmap = MmapFile::create(&path, capacity + RING_TRAILER_SIZE).unwrap();
        let ring = unsafe { MpscRing::attach(mmap.as_ptr(), mmap.len()) }.unwrap();
        (mmap, ring)
    }

    #[test]
    fn offer_receive_round_trip() {
        let dir = TempDir::new().unwrap();
        let (_mmap, ring) = ring_file(&dir, 1024);
        assert!(ring.offer(7, b"hello").unwrap());
        assert!(ring.offer(8, b"world").unwrap());

        let mut seen = Vec::new();
        let count = ring.receive(10, &mut |msg_type, payload| {
            seen.push((msg_type, payload.to_vec()));
        });
        assert_eq!(count, 2);
        assert_eq!(seen, vec![(7, b"hello".to_vec()), (8, b"world".to_vec())]);
        assert_eq!(ring.receive(10, &mut |_, _| panic!("ring must be empty")), 0);
    }

    #[test]
    fn fills_and_reports_full() {
        let dir = TempDir::new().unwrap();
        let (_mmap, ring) = ring_file(&dir, 256);
        let payload = [0u8; 24]; // 32-byte records
        let mut accepted = 0;
        while ring.offer(1, &payload).unwrap() {
            accepted += 1;
        }
        assert_eq!(accepted, 256 / 32);
        // Draining frees space again.
        ring.receive(1, &mut |_, _| {});
        assert!(ring.offer(1, &payload).unwrap());
    }

    #[test]
    fn wraps_with_padding() {
        let dir = TempDir::new().unwrap();
        let (_mmap, ring) = ring_file(&dir, 256);
        // 40-byte records: 6 fit with 16 spare; the 7th wraps via padding.
        let payload = [9u8; 32];
        for round in 0..50 {
            assert!(ring.offer(round + 1, &payload).unwrap(), "round {round}");
            let mut seen = 0;
            ring.receive(10, &mut |msg_type, body| {
                assert_eq!(msg_type, round + 1);
                assert_eq!(body, payload);
                seen += 1;
            });
            assert_eq!(seen, 1);
        }
    }

    #[test]
    fn rejects_reserved_type_and_oversize() {
        let dir = TempDir::new().unwrap();
        let (_mmap, ring) = ring_file(&dir, 1024);
        assert!(ring.offer(0, b"x").is_err());
        let huge = vec![0u8; 1024];
        assert!(ring.offer(1, &huge).is_err());
    }

    #[test]
    fn concurrent_producers_deliver_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring.dat");
        let mmap = Arc::new(MmapFile::create(&path, 4096 + RING_TRAILER_SIZE).unwrap());
        let producers = 4;
        let per_producer = 500u32;

        let mut handles = Vec::new();
        for p in 0..producers {
            let mmap = Arc::clone(&mmap);
            handles.push(std::thread::spawn(move || {
                let ring = unsafe { MpscRing::attach(mmap.as_ptr(), mmap.len()) }.unwrap();
                for i in 0..per_producer {
                    let body = [(p as u8 + 1); 16];
                    while !ring.offer(i + 1, &body).unwrap() {
                        std::thread::yield_now();
                    }
                }
            }));
        }

        let ring = unsafe { MpscRing::attach(mmap.as_ptr(), mmap.len()) }.unwrap();
        let expected = producers as usize * per_producer as usize;
        let mut total = 0;
        while total < expected {
            total += ring.receive(64, &mut |msg_type, body| {
                assert!(msg_type >= 1 && msg_type <= per_producer);
                assert_eq!(body.len(), 16);
            });
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(total, expected);
    }
}
