//! Lock-free rings for the client/driver control plane.
//!
//! Both rings live inside the CnC file and use the same commit-word discipline
//! as log buffer frames: a record becomes visible when its length word is
//! stored with release semantics, and a zero length word means "not yet
//! written".

pub mod broadcast;
pub mod mpsc;

pub use broadcast::{BroadcastReceiver, BroadcastRing};
pub use mpsc::MpscRing;

pub(crate) const RECORD_HEADER_SIZE: usize = 8;
pub(crate) const RECORD_ALIGN: usize = 8;
pub(crate) const LENGTH_OFFSET: usize = 0;
pub(crate) const TYPE_OFFSET: usize = 4;

/// Message type reserved for padding records that fill the end of the ring.
pub(crate) const PADDING_MSG_TYPE: u32 = 0;

/// Size reserved after each ring's data region for its counters.
pub const RING_TRAILER_SIZE: usize = 256;

#[inline]
pub(crate) fn record_align_up(len: usize) -> usize {
    (len + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}
