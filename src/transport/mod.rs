//! Media endpoints.
//!
//! Two media exist: UDP (unicast and multicast sockets) and IPC, where the
//! mapped log buffer itself is the medium — the committed tail is the signal
//! and no socket or separate notification is involved.

pub mod ipc;
pub mod udp;

pub use ipc::SharedLogMap;
pub use udp::{SocketConfig, UdpChannel};

/// Largest datagram the driver will send or expect. Bounds receive buffers
/// and the per-frame payload on network channels.
pub const MAX_UDP_PAYLOAD: usize = 64 * 1024;
