use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Error, Result};

pub const FRAME_HEADER_SIZE: usize = 32;
pub const FRAME_ALIGN: usize = 32;
pub const FRAME_VERSION: u8 = 1;

pub const TYPE_DATA: u16 = 0x01;
pub const TYPE_PADDING: u16 = 0x02;
pub const TYPE_SETUP: u16 = 0x03;
pub const TYPE_STATUS: u16 = 0x04;
pub const TYPE_NAK: u16 = 0x05;
pub const TYPE_HEARTBEAT: u16 = 0x06;

pub const FLAG_BEGIN: u8 = 0x80;
pub const FLAG_END: u8 = 0x40;
pub const FLAG_UNFRAGMENTED: u8 = FLAG_BEGIN | FLAG_END;
/// Set on the final heartbeat of a cleanly closed stream.
pub const FLAG_EOS: u8 = 0x20;

pub const LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const CHECKSUM_OFFSET: usize = 24;
pub const RESERVED_OFFSET: usize = 28;

/// Frame header, 32 bytes at the start of every frame.
///
/// The length word doubles as the commit word: zero means the frame is not yet
/// visible; producers store the final length last with release semantics, so a
/// consumer that observes a non-zero length also observes the header and
/// payload bytes written before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_length: u32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: u16,
    pub term_offset: u32,
    pub session_id: u32,
    pub stream_id: u32,
    pub term_id: u32,
    pub checksum: u32,
    pub reserved: u32,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&self.frame_length.to_le_bytes());
        buf[VERSION_OFFSET] = self.version;
        buf[FLAGS_OFFSET] = self.flags;
        buf[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&self.frame_type.to_le_bytes());
        buf[TERM_OFFSET_OFFSET..TERM_OFFSET_OFFSET + 4]
            .copy_from_slice(&self.term_offset.to_le_bytes());
        buf[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 4]
            .copy_from_slice(&self.session_id.to_le_bytes());
        buf[STREAM_ID_OFFSET..STREAM_ID_OFFSET + 4]
            .copy_from_slice(&self.stream_id.to_le_bytes());
        buf[TERM_ID_OFFSET..TERM_ID_OFFSET + 4].copy_from_slice(&self.term_id.to_le_bytes());
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[RESERVED_OFFSET..RESERVED_OFFSET + 4].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(Error::Corrupt("frame header truncated"));
        }
        let frame_length = u32::from_le_bytes(
            bytes[LENGTH_OFFSET..LENGTH_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        );
        let version = bytes[VERSION_OFFSET];
        let flags = bytes[FLAGS_OFFSET];
        let frame_type = u16::from_le_bytes(
            bytes[TYPE_OFFSET..TYPE_OFFSET + 2]
                .try_into()
                .expect("slice length"),
        );
        let term_offset = u32::from_le_bytes(
            bytes[TERM_OFFSET_OFFSET..TERM_OFFSET_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        );
        let session_id = u32::from_le_bytes(
            bytes[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        );
        let stream_id = u32::from_le_bytes(
            bytes[STREAM_ID_OFFSET..STREAM_ID_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        );
        let term_id = u32::from_le_bytes(
            bytes[TERM_ID_OFFSET..TERM_ID_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        );
        let checksum = u32::from_le_bytes(
            bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        );
        let reserved = u32::from_le_bytes(
            bytes[RESERVED_OFFSET..RESERVED_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        );
        Ok(Self {
            frame_length,
            version,
            flags,
            frame_type,
            term_offset,
            session_id,
            stream_id,
            term_id,
            checksum,
            reserved,
        })
    }

    pub fn crc32(payload: &[u8]) -> u32 {
        use crc32fast::Hasher;
        let mut hasher = Hasher::new();
        hasher.update(payload);
        hasher.finalize()
    }

    pub fn validate_crc(&self, payload: &[u8]) -> Result<()> {
        if Self::crc32(payload) == self.checksum {
            Ok(())
        } else {
            Err(Error::Corrupt("frame checksum mismatch"))
        }
    }
}

/// Load the frame length (commit word) at `ptr` with acquire semantics.
#[inline]
pub fn load_frame_length(ptr: *const u8) -> u32 {
    // SAFETY: the length word is at offset 0 and frames are 32-byte aligned.
    let atomic = unsafe { &*(ptr as *const AtomicU32) };
    atomic.load(Ordering::Acquire)
}

/// Commit a frame by storing its length word with release semantics. Every
/// byte of header and payload must be written before this call.
#[inline]
pub fn store_frame_length(ptr: *mut u8, frame_length: u32) {
    // SAFETY: the length word is at offset 0 and frames are 32-byte aligned.
    let atomic = unsafe { &*(ptr as *const AtomicU32) };
    atomic.store(frame_length, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_preserves_fields() {
        let header = FrameHeader {
            frame_length: 96,
            version: FRAME_VERSION,
            flags: FLAG_UNFRAGMENTED,
            frame_type: TYPE_DATA,
            term_offset: 4096,
            session_id: 0x1122_3344,
            stream_id: 0x5566_7788,
            term_id: 42,
            checksum: 0x0F0E_0D0C,
            reserved: 7,
        };
        let bytes = header.to_bytes();
        let decoded = FrameHeader::from_bytes(&bytes).expect("decode header");
        assert_eq!(decoded, header);
    }

    #[test]
    fn crc_matches_known_payload() {
        assert_eq!(FrameHeader::crc32(b"hello"), 0x3610A686);
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(FrameHeader::from_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn commit_word_load_store() {
        #[repr(align(32))]
        struct Aligned([u8; FRAME_HEADER_SIZE]);
        let mut buf = Aligned([0u8; FRAME_HEADER_SIZE]);
        let ptr = buf.0.as_mut_ptr();
        assert_eq!(load_frame_length(ptr), 0);
        store_frame_length(ptr, 128);
        assert_eq!(load_frame_length(ptr), 128);
    }
}
