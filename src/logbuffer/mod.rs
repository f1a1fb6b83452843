//! Memory-mapped term buffers.
//!
//! A log buffer is one file per stream: a metadata page of atomics followed by
//! three equal term partitions used in rotation. Producers claim space with an
//! atomic tail advance and make frames visible by committing the frame length
//! word last; consumers scan committed frames and never observe partial writes.

pub mod appender;
pub mod descriptor;
pub mod frame;
pub mod scanner;

pub use appender::{Appender, AppendOutcome, BufferClaim, ClaimOutcome};
pub use descriptor::{LogBuffer, LogMeta, LogParams, SubscriberSlot, MAX_SUBSCRIBER_SLOTS};
pub use frame::FrameHeader;
pub use scanner::{read_term, FrameInfo, ScanOutcome};

/// Aligns a value up to the nearest multiple of `align` (a power of two).
#[inline]
pub(crate) fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}
