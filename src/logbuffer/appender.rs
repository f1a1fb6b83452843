use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::logbuffer::align_up;
use crate::logbuffer::descriptor::{
    index_by_term_count, pack_tail, tail_term_id, LogBuffer, PARTITION_COUNT,
};
use crate::logbuffer::frame::{
    store_frame_length, FrameHeader, CHECKSUM_OFFSET, FLAG_UNFRAGMENTED, FRAME_ALIGN,
    FRAME_HEADER_SIZE, FRAME_VERSION, TYPE_DATA, TYPE_OFFSET, TYPE_PADDING,
};
use crate::{Error, Result};

/// Result of an append attempt. The non-`Appended` variants are expected
/// conditions the caller retries or backs off on, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Frame committed; the stream position after it.
    Appended(u64),
    /// Flow-control limit reached: a subscriber has not consumed far enough.
    BackPressured,
    /// The term rotated mid-claim; retry immediately.
    AdminAction,
    /// The stream is closed.
    Closed,
}

/// Result of a `try_claim` attempt.
pub enum ClaimOutcome {
    Claimed(BufferClaim),
    BackPressured,
    AdminAction,
    Closed,
}

/// Appends frames to a log buffer.
///
/// Safe for any number of concurrent producers across threads and processes:
/// space is claimed with one atomic add on the active term's raw tail, and
/// the end-of-term rotation converges through idempotent compare-and-swaps so
/// exactly one rotation happens per term boundary.
#[derive(Clone)]
pub struct Appender {
    log: Arc<LogBuffer>,
}

struct Slot {
    index: usize,
    term_id: u32,
    term_offset: u32,
}

enum SlotOutcome {
    Slot(Slot),
    BackPressured,
    AdminAction,
    Closed,
}

impl Appender {
    pub fn new(log: Arc<LogBuffer>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<LogBuffer> {
        &self.log
    }

    /// Largest payload accepted by this log.
    pub fn max_payload_length(&self) -> usize {
        self.log.term_length() / 8 - FRAME_HEADER_SIZE
    }

    /// Append a single unfragmented frame.
    pub fn append(&self, payload: &[u8]) -> Result<AppendOutcome> {
        if payload.len() > self.max_payload_length() {
            return Err(Error::PayloadTooLarge);
        }
        let frame_length = FRAME_HEADER_SIZE + payload.len();
        let slot = match self.claim_slot(frame_length) {
            SlotOutcome::Slot(slot) => slot,
            SlotOutcome::BackPressured => return Ok(AppendOutcome::BackPressured),
            SlotOutcome::AdminAction => return Ok(AppendOutcome::AdminAction),
            SlotOutcome::Closed => return Ok(AppendOutcome::Closed),
        };

        let header = FrameHeader {
            frame_length: 0,
            version: FRAME_VERSION,
            flags: FLAG_UNFRAGMENTED,
            frame_type: TYPE_DATA,
            term_offset: slot.term_offset,
            session_id: self.log.session_id(),
            stream_id: self.log.stream_id(),
            term_id: slot.term_id,
            checksum: FrameHeader::crc32(payload),
            reserved: 0,
        };
        let frame = unsafe { self.log.term_ptr(slot.index).add(slot.term_offset as usize) };
        // SAFETY: the slot was claimed exclusively by the tail advance; no
        // other producer writes this range and no consumer reads it until the
        // length word is committed below.
        unsafe {
            write_header_uncommitted(frame, &header);
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                frame.add(FRAME_HEADER_SIZE),
                payload.len(),
            );
        }
        store_frame_length(frame, frame_length as u32);

        let aligned = align_up(frame_length, FRAME_ALIGN);
        let position = self
            .log
            .compute_position(slot.term_id, slot.term_offset + aligned as u32);
        Ok(AppendOutcome::Appended(position))
    }

    /// Claim a frame slot for zero-copy writing. The claim must be committed
    /// or aborted; dropping it uncommitted aborts it into a padding frame.
    pub fn try_claim(&self, payload_length: usize) -> Result<ClaimOutcome> {
        if payload_length > self.max_payload_length() {
            return Err(Error::PayloadTooLarge);
        }
        let frame_length = FRAME_HEADER_SIZE + payload_length;
        let slot = match self.claim_slot(frame_length) {
            SlotOutcome::Slot(slot) => slot,
            SlotOutcome::BackPressured => return Ok(ClaimOutcome::BackPressured),
            SlotOutcome::AdminAction => return Ok(ClaimOutcome::AdminAction),
            SlotOutcome::Closed => return Ok(ClaimOutcome::Closed),
        };

        let header = FrameHeader {
            frame_length: 0,
            version: FRAME_VERSION,
            flags: FLAG_UNFRAGMENTED,
            frame_type: TYPE_DATA,
            term_offset: slot.term_offset,
            session_id: self.log.session_id(),
            stream_id: self.log.stream_id(),
            term_id: slot.term_id,
            checksum: 0,
            reserved: 0,
        };
        let frame = unsafe { self.log.term_ptr(slot.index).add(slot.term_offset as usize) };
        // SAFETY: exclusive claim, as in append().
        unsafe { write_header_uncommitted(frame, &header) };

        let aligned = align_up(frame_length, FRAME_ALIGN);
        let position = self
            .log
            .compute_position(slot.term_id, slot.term_offset + aligned as u32);
        Ok(ClaimOutcome::Claimed(BufferClaim {
            _log: Arc::clone(&self.log),
            frame,
            payload_length,
            frame_length,
            position,
            state: ClaimState::Open,
        }))
    }

    fn claim_slot(&self, frame_length: usize) -> SlotOutcome {
        let log = &self.log;
        let meta = log.meta();
        if log.is_closed() {
            return SlotOutcome::Closed;
        }
        let aligned = align_up(frame_length, FRAME_ALIGN) as u64;
        let term_length = log.term_length() as u64;

        let term_count = meta.active_term_count.load(Ordering::Acquire);
        let index = index_by_term_count(term_count);
        let expected_term_id = log.initial_term_id().wrapping_add(term_count);

        // Flow-control check against the current tail. The check races with
        // other producers, so a claim can exceed the limit by at most one
        // frame per producer; the driver recomputes the limit with slack for
        // exactly that.
        let raw = meta.raw_tails[index].load(Ordering::Acquire);
        if tail_term_id(raw) == expected_term_id {
            let offset = (raw & 0xFFFF_FFFF).min(term_length);
            let position = log.compute_position(expected_term_id, offset as u32);
            if position + aligned > meta.pub_limit.load(Ordering::Acquire) {
                return SlotOutcome::BackPressured;
            }
        }

        let raw = meta.raw_tails[index].fetch_add(aligned, Ordering::AcqRel);
        let term_id = tail_term_id(raw);
        let term_offset = raw & 0xFFFF_FFFF;
        if term_id != expected_term_id {
            // The partition tail belongs to another term: rotation is in
            // progress around us.
            return SlotOutcome::AdminAction;
        }
        if term_offset + aligned > term_length {
            self.on_term_end(term_count, term_id, term_offset, term_length);
            return SlotOutcome::AdminAction;
        }
        SlotOutcome::Slot(Slot {
            index,
            term_id,
            term_offset: term_offset as u32,
        })
    }

    /// Pad the remainder of the term (first overflowing claim only) and
    /// rotate the log to the next term.
    fn on_term_end(&self, term_count: u32, term_id: u32, term_offset: u64, term_length: u64) {
        let log = &self.log;
        if term_offset < term_length {
            let index = index_by_term_count(term_count);
            let pad_length = (term_length - term_offset) as u32;
            let header = FrameHeader {
                frame_length: 0,
                version: FRAME_VERSION,
                flags: FLAG_UNFRAGMENTED,
                frame_type: TYPE_PADDING,
                term_offset: term_offset as u32,
                session_id: log.session_id(),
                stream_id: log.stream_id(),
                term_id,
                checksum: 0,
                reserved: 0,
            };
            let frame = unsafe { log.term_ptr(index).add(term_offset as usize) };
            // SAFETY: the overflowing fetch_add claimed [term_offset..end of
            // term] for this producer; concurrent overflowers observed
            // term_offset >= term_length and skip the write.
            unsafe { write_header_uncommitted(frame, &header) };
            store_frame_length(frame, pad_length);
        }
        self.rotate(term_count, term_id);
    }

    /// Exactly-once term rotation: both CASes are idempotent, so every
    /// producer that hits the term end may call this and exactly one rotation
    /// results.
    fn rotate(&self, term_count: u32, term_id: u32) {
        let meta = self.log.meta();
        let next_index = index_by_term_count(term_count.wrapping_add(1));
        let next_term_id = term_id.wrapping_add(1);
        let expected_prev = next_term_id.wrapping_sub(PARTITION_COUNT);

        let current = meta.raw_tails[next_index].load(Ordering::Acquire);
        if tail_term_id(current) == expected_prev {
            let _ = meta.raw_tails[next_index].compare_exchange(
                current,
                pack_tail(next_term_id, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        let _ = meta.active_term_count.compare_exchange(
            term_count,
            term_count.wrapping_add(1),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[derive(PartialEq, Eq)]
enum ClaimState {
    Open,
    Resolved,
}

/// A claimed-but-uncommitted frame slot. Write the payload through
/// `payload_mut`, then `commit`. `abort` (or drop) turns the slot into a
/// padding frame so consumers skip it.
pub struct BufferClaim {
    _log: Arc<LogBuffer>,
    frame: *mut u8,
    payload_length: usize,
    frame_length: usize,
    position: u64,
    state: ClaimState,
}

// SAFETY: the claim owns its frame range exclusively until commit/abort.
unsafe impl Send for BufferClaim {}

impl BufferClaim {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: the claimed range is exclusively ours and within the term.
        unsafe {
            std::slice::from_raw_parts_mut(self.frame.add(FRAME_HEADER_SIZE), self.payload_length)
        }
    }

    /// Stream position after this frame once committed.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn commit(mut self) {
        let payload = unsafe {
            std::slice::from_raw_parts(self.frame.add(FRAME_HEADER_SIZE), self.payload_length)
        };
        let checksum = FrameHeader::crc32(payload);
        // SAFETY: checksum word is inside our claimed header, written before
        // the release commit below.
        unsafe {
            std::ptr::copy_nonoverlapping(
                checksum.to_le_bytes().as_ptr(),
                self.frame.add(CHECKSUM_OFFSET),
                4,
            );
        }
        store_frame_length(self.frame, self.frame_length as u32);
        self.state = ClaimState::Resolved;
    }

    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        // SAFETY: type word is inside our claimed header.
        unsafe {
            std::ptr::copy_nonoverlapping(
                TYPE_PADDING.to_le_bytes().as_ptr(),
                self.frame.add(TYPE_OFFSET),
                2,
            );
        }
        store_frame_length(self.frame, self.frame_length as u32);
        self.state = ClaimState::Resolved;
    }
}

impl Drop for BufferClaim {
    fn drop(&mut self) {
        if self.state == ClaimState::Open {
            self.abort_in_place();
        }
    }
}

/// Write every header byte except the length word, which stays zero until the
/// frame is committed.
unsafe fn write_header_uncommitted(frame: *mut u8, header: &FrameHeader) {
    let bytes = header.to_bytes();
    std::ptr::copy_nonoverlapping(bytes.as_ptr().add(4), frame.add(4), FRAME_HEADER_SIZE - 4);
}
