//! Conduit: reliable, low-latency message transport.
//!
//! Messages move through memory-mapped log buffers with lock-free
//! claim/commit framing. A media driver — embedded via
//! [`driver::MediaDriver::launch`] or standalone via the `conduit-driver`
//! binary — multiplexes streams over UDP unicast, UDP multicast, and
//! intra-host shared memory, handling retransmission, flow control, and
//! buffer lifecycle. Clients publish and subscribe through [`client::Client`]
//! and work directly against the mapped logs on the hot path.
//!
//! ```no_run
//! use conduit::client::{Client, ClientContext, Offer};
//!
//! let client = Client::connect(ClientContext::default())?;
//! let mut publication = client.add_publication("ipc:prices", 1001)?;
//! loop {
//!     match publication.offer(b"tick")? {
//!         Offer::Position(_) => break,
//!         _ => std::thread::yield_now(),
//!     }
//! }
//! # Ok::<(), conduit::Error>(())
//! ```

pub mod channel;
pub mod client;
pub mod clock;
pub mod cnc;
pub mod driver;
pub mod error;
pub mod layout;
pub mod logbuffer;
pub mod mmap;
pub mod protocol;
pub mod ring;
pub mod transport;
pub mod wait;

pub use channel::{ChannelUri, Media};
pub use client::{Client, ClientContext, Offer, Publication, StreamEvent, Subscription};
pub use driver::{DriverConfig, MediaDriver};
pub use error::{Error, Result};
pub use wait::IdleStrategy;
