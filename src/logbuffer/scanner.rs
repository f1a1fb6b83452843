use crate::logbuffer::align_up;
use crate::logbuffer::frame::{
    load_frame_length, FrameHeader, FRAME_ALIGN, FRAME_HEADER_SIZE, FRAME_VERSION, TYPE_DATA,
    TYPE_PADDING,
};
use crate::{Error, Result};

/// A committed data frame handed to a scan handler. The payload borrows the
/// mapped term directly; committed frames are never rewritten, so the borrow
/// is stable for the duration of the callback.
pub struct FrameInfo<'a> {
    pub session_id: u32,
    pub stream_id: u32,
    pub term_id: u32,
    pub term_offset: u32,
    pub flags: u8,
    pub payload: &'a [u8],
}

/// Where a term scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Stopped at a frame that is not committed yet (or belongs to an older
    /// term in a partition that has not rotated forward yet).
    NotYetCommitted { offset: u32 },
    /// Consumed up to the end of the term; the caller advances to the next.
    EndOfTerm,
    /// The frame-count limit was reached.
    LimitReached { offset: u32 },
}

/// Scan committed frames in one term, starting at `offset`.
///
/// Data frames are checksum-validated and passed to `handler`; padding frames
/// are skipped. Stops at the first uncommitted frame, at the end of the term,
/// or after `limit` data frames.
pub fn read_term(
    term: *const u8,
    term_length: usize,
    offset: u32,
    limit: usize,
    handler: &mut dyn FnMut(FrameInfo<'_>),
) -> Result<ScanOutcome> {
    read_term_in(term, term_length, None, offset, limit, handler)
}

/// As `read_term`, but treats committed frames whose term id differs from
/// `term_id` as not-yet-written. Required when the partition may still hold
/// frames from three terms ago (consumer is entering a term the producer has
/// not rotated into).
pub fn read_term_in(
    term: *const u8,
    term_length: usize,
    term_id: Option<u32>,
    mut offset: u32,
    limit: usize,
    handler: &mut dyn FnMut(FrameInfo<'_>),
) -> Result<ScanOutcome> {
    let mut frames = 0;
    while (offset as usize) < term_length {
        if frames >= limit {
            return Ok(ScanOutcome::LimitReached { offset });
        }
        // SAFETY: offset < term_length and the term mapping outlives the scan.
        let frame = unsafe { term.add(offset as usize) };
        let frame_length = load_frame_length(frame);
        if frame_length == 0 {
            return Ok(ScanOutcome::NotYetCommitted { offset });
        }
        if (frame_length as usize) < FRAME_HEADER_SIZE
            || offset as usize + frame_length as usize > term_length
        {
            return Err(Error::Corrupt("invalid frame length"));
        }
        // SAFETY: frame_length was validated against the term bounds.
        let bytes = unsafe { std::slice::from_raw_parts(frame, frame_length as usize) };
        let header = FrameHeader::from_bytes(bytes)?;
        if let Some(expected) = term_id {
            if header.term_id != expected {
                return Ok(ScanOutcome::NotYetCommitted { offset });
            }
        }
        if header.version != FRAME_VERSION {
            return Err(Error::Corrupt("unknown frame version"));
        }
        let aligned = align_up(frame_length as usize, FRAME_ALIGN) as u32;
        match header.frame_type {
            TYPE_PADDING => {}
            TYPE_DATA => {
                let payload = &bytes[FRAME_HEADER_SIZE..];
                header.validate_crc(payload)?;
                handler(FrameInfo {
                    session_id: header.session_id,
                    stream_id: header.stream_id,
                    term_id: header.term_id,
                    term_offset: header.term_offset,
                    flags: header.flags,
                    payload,
                });
                frames += 1;
            }
            _ => return Err(Error::Corrupt("unexpected frame type in term")),
        }
        offset += aligned;
    }
    Ok(ScanOutcome::EndOfTerm)
}

/// Advance over committed frames without validating payloads. Returns the
/// first offset that is not committed (possibly the term length). Used by the
/// driver to find the highest contiguous point of a receiving image. When
/// `term_id` is given, a committed frame from another term also stops the
/// scan — the partition still holds an older term there.
pub fn scan_committed(
    term: *const u8,
    term_length: usize,
    term_id: Option<u32>,
    mut offset: u32,
) -> Result<u32> {
    while (offset as usize) < term_length {
        // SAFETY: offset < term_length and the term mapping outlives the scan.
        let frame = unsafe { term.add(offset as usize) };
        let frame_length = load_frame_length(frame);
        if frame_length == 0 {
            break;
        }
        if (frame_length as usize) < FRAME_HEADER_SIZE
            || offset as usize + frame_length as usize > term_length
        {
            return Err(Error::Corrupt("invalid frame length"));
        }
        if let Some(expected) = term_id {
            // SAFETY: a full header fits, checked above.
            let bytes = unsafe { std::slice::from_raw_parts(frame, FRAME_HEADER_SIZE) };
            if FrameHeader::from_bytes(bytes)?.term_id != expected {
                break;
            }
        }
        offset += align_up(frame_length as usize, FRAME_ALIGN) as u32;
    }
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbuffer::appender::{AppendOutcome, Appender};
    use crate::logbuffer::descriptor::{LogBuffer, LogParams, MIN_TERM_LENGTH};
    use crate::logbuffer::frame::store_frame_length;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> Arc<LogBuffer> {
        let log = LogBuffer::create(
            &dir.path().join("t.logbuffer"),
            LogParams {
                term_length: MIN_TERM_LENGTH,
                initial_term_id: 0,
                session_id: 1,
                stream_id: 2,
                mtu: 1408,
            },
        )
        .unwrap();
        log.meta().pub_limit.store(u64::MAX, Ordering::Release);
        log
    }

    #[test]
    fn empty_term_reports_not_committed_at_zero() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let outcome = read_term(log.term_ptr(0), log.term_length(), 0, 10, &mut |_| {
            panic!("no frames expected")
        })
        .unwrap();
        assert_eq!(outcome, ScanOutcome::NotYetCommitted { offset: 0 });
    }

    #[test]
    fn limit_stops_scan() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let appender = Appender::new(Arc::clone(&log));
        for _ in 0..5 {
            assert!(matches!(
                appender.append(b"msg").unwrap(),
                AppendOutcome::Appended(_)
            ));
        }
        let mut count = 0;
        let outcome = read_term(log.term_ptr(0), log.term_length(), 0, 3, &mut |_| count += 1)
            .unwrap();
        assert_eq!(count, 3);
        assert!(matches!(outcome, ScanOutcome::LimitReached { .. }));
    }

    #[test]
    fn stale_term_id_reads_as_unwritten() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let appender = Appender::new(Arc::clone(&log));
        appender.append(b"old term frame").unwrap();
        // A reader expecting term 3 in this partition must not consume term 0
        // leftovers.
        let outcome = read_term_in(
            log.term_ptr(0),
            log.term_length(),
            Some(3),
            0,
            10,
            &mut |_| panic!("stale frame must not be delivered"),
        )
        .unwrap();
        assert_eq!(outcome, ScanOutcome::NotYetCommitted { offset: 0 });
    }

    #[test]
    fn corrupt_length_is_fatal() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        // Commit word with an impossible length.
        store_frame_length(log.term_ptr(0), 7);
        assert!(read_term(log.term_ptr(0), log.term_length(), 0, 10, &mut |_| {}).is_err());
    }

    #[test]
    fn corrupt_checksum_is_fatal() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let appender = Appender::new(Arc::clone(&log));
        appender.append(b"payload").unwrap();
        // Flip a payload byte after commit.
        unsafe {
            *log.term_ptr(0).add(FRAME_HEADER_SIZE) ^= 0xFF;
        }
        assert!(read_term(log.term_ptr(0), log.term_length(), 0, 10, &mut |_| {}).is_err());
    }

    #[test]
    fn scan_committed_tracks_tail() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let appender = Appender::new(Arc::clone(&log));
        appender.append(&[1u8; 40]).unwrap(); // 32 + 40 = 72 -> 96
        appender.append(&[2u8; 10]).unwrap(); // 32 + 10 = 42 -> 64
        let contiguous = scan_committed(log.term_ptr(0), log.term_length(), Some(0), 0).unwrap();
        assert_eq!(contiguous, 96 + 64);
        // A mismatched term id stops the scan immediately.
        let stale = scan_committed(log.term_ptr(0), log.term_length(), Some(9), 0).unwrap();
        assert_eq!(stale, 0);
    }
}
