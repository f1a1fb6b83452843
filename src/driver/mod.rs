//! The media driver.
//!
//! A single duty-cycle thread multiplexes every stream across the media:
//! conductor work (command ring, client liveness, lifecycle housekeeping),
//! receiver work (socket polling, image rebuild, STATUS and NAK emission),
//! and sender work (log scanning, transmission, retransmits, heartbeats).
//! Clients never talk to the driver except through the CnC rings, and the
//! driver never touches the message hot path: producers and consumers work
//! directly against the mapped log buffers.

mod conductor;
mod receiver;
mod sender;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::channel::ChannelUri;
use crate::clock::{Clock, TscClock};
use crate::cnc::{CncFile, DEFAULT_BROADCAST_CAPACITY, DEFAULT_COMMAND_CAPACITY};
use crate::layout::DriverLayout;
use crate::logbuffer::LogBuffer;
use crate::protocol::NakPayload;
use crate::transport::{SharedLogMap, SocketConfig, UdpChannel, MAX_UDP_PAYLOAD};
use crate::wait::{IdleStrategy, Idler};
use crate::{Error, Result};

/// Per-stream lifecycle. Terminal reclamation only happens from `Linger`
/// after the configured timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Active,
    Draining,
    Linger,
    Closed,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub dir: PathBuf,
    /// Default term length for streams whose channel does not override it.
    pub term_length: usize,
    /// Per-frame payload ceiling on network channels.
    pub mtu: usize,
    /// Flow-control window granted to producers past the slowest consumer.
    /// Zero means "half a term", resolved per stream.
    pub window: usize,
    pub client_ttl: Duration,
    pub linger: Duration,
    pub nak_delay: Duration,
    pub heartbeat_interval: Duration,
    pub status_interval: Duration,
    pub setup_interval: Duration,
    pub command_capacity: usize,
    pub broadcast_capacity: usize,
    pub socket: SocketConfig,
    pub idle: IdleStrategy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            dir: DriverLayout::default_dir().root().to_path_buf(),
            term_length: 1 << 20,
            mtu: 1408,
            window: 0,
            client_ttl: Duration::from_secs(10),
            linger: Duration::from_secs(5),
            nak_delay: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(100),
            status_interval: Duration::from_millis(50),
            setup_interval: Duration::from_millis(100),
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            socket: SocketConfig::default(),
            idle: IdleStrategy::default(),
        }
    }
}

impl DriverConfig {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    fn window_for(&self, term_length: usize) -> u64 {
        if self.window > 0 {
            self.window as u64
        } else {
            term_length as u64 / 2
        }
    }
}

/// A registration created by a client command, keyed by registration id.
pub(crate) enum Registration {
    IpcPublication {
        client_id: u64,
        key: (String, u32),
    },
    IpcSubscription {
        client_id: u64,
        key: (String, u32),
        slot: usize,
    },
    UdpPublication {
        client_id: u64,
        channel_key: String,
        session_id: u32,
    },
    UdpSubscription {
        client_id: u64,
        channel_key: String,
        stream_id: u32,
    },
}

pub(crate) struct SendChannel {
    pub uri: ChannelUri,
    pub endpoint: UdpChannel,
    pub sessions: HashMap<u32, SenderSession>,
}

pub(crate) struct SenderSession {
    pub log: Arc<LogBuffer>,
    pub session_id: u32,
    pub stream_id: u32,
    pub state: StreamState,
    /// Scan cursor: everything before it has been offered to the socket.
    pub sender_position: u64,
    /// One pub-log subscriber slot per remote receiver, keyed by address.
    pub receiver_slots: HashMap<SocketAddr, usize>,
    pub receiver_last_status_ns: HashMap<SocketAddr, u64>,
    pub last_setup_ns: u64,
    pub last_heartbeat_ns: u64,
    pub pending_naks: Vec<NakPayload>,
    pub closed_at_ns: Option<u64>,
}

pub(crate) struct RecvChannel {
    pub uri: ChannelUri,
    pub endpoint: UdpChannel,
    /// (registration id, client id, stream id) of subscriptions on this channel.
    pub subs: Vec<(u64, u64, u32)>,
    pub images: HashMap<u32, ReceiverImage>,
}

pub(crate) struct ReceiverImage {
    pub log: Arc<LogBuffer>,
    pub session_id: u32,
    pub stream_id: u32,
    pub control_addr: SocketAddr,
    /// Highest contiguous committed position (everything before it is whole).
    pub rebuild_position: u64,
    /// Highest position the sender has declared (data or heartbeat).
    pub hwm: u64,
    /// Highest term this image has zeroed a partition for.
    pub highest_term_count: u32,
    pub last_status_ns: u64,
    pub last_nak_ns: u64,
    pub nak_backoff_ns: u64,
    pub eos_position: Option<u64>,
    pub state: StreamState,
    pub closed_at_ns: Option<u64>,
}

pub(crate) struct DriverCore {
    pub config: DriverConfig,
    pub layout: DriverLayout,
    pub cnc: Arc<CncFile>,
    pub clock: TscClock,
    /// client id → last keepalive timestamp.
    pub clients: HashMap<u64, u64>,
    pub client_regs: HashMap<u64, Vec<u64>>,
    pub registrations: HashMap<u64, Registration>,
    pub ipc_logs: SharedLogMap,
    pub send_channels: HashMap<String, SendChannel>,
    pub recv_channels: HashMap<String, RecvChannel>,
    pub next_registration_id: u64,
    pub next_session_id: u32,
    pub recv_buf: Vec<u8>,
}

impl DriverCore {
    fn new(config: DriverConfig) -> Result<Self> {
        let layout = DriverLayout::new(&config.dir);
        layout.ensure()?;
        layout.clean()?;
        let clock = TscClock::new();
        let now = clock.now();
        let cnc = CncFile::create(
            &layout.cnc_path(),
            config.command_capacity,
            config.broadcast_capacity,
            now,
        )?;
        log::info!(
            "driver started dir={} term_length={} mtu={}",
            layout.root().display(),
            config.term_length,
            config.mtu
        );
        Ok(Self {
            config,
            layout,
            cnc,
            clock,
            clients: HashMap::new(),
            client_regs: HashMap::new(),
            registrations: HashMap::new(),
            ipc_logs: SharedLogMap::new(),
            send_channels: HashMap::new(),
            recv_channels: HashMap::new(),
            next_registration_id: 1,
            next_session_id: 1,
            recv_buf: vec![0u8; MAX_UDP_PAYLOAD],
        })
    }

    /// One pass of conductor, receiver, and sender work. Returns the amount
    /// of work done so the idle strategy can escalate on empty cycles.
    fn duty_cycle(&mut self) -> usize {
        let now = self.clock.now();
        self.cnc.beat(now);
        let mut work = 0;
        work += self.conductor_work(now);
        work += self.receiver_work(now);
        work += self.sender_work(now);
        work
    }

    fn allocate_registration_id(&mut self) -> u64 {
        let id = self.next_registration_id;
        self.next_registration_id += 1;
        id
    }

    fn allocate_session_id(&mut self) -> u32 {
        let id = self.next_session_id;
        self.next_session_id += 1;
        id
    }
}

/// A running media driver. Dropping the handle shuts the duty-cycle thread
/// down and reclaims the driver directory's CnC file.
pub struct MediaDriver {
    dir: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MediaDriver {
    /// Start a driver on its own thread (embedded mode).
    pub fn launch(config: DriverConfig) -> Result<Self> {
        let dir = config.dir.clone();
        let idle = config.idle;
        let mut core = DriverCore::new(config)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("conduit-driver".to_string())
            .spawn(move || {
                let mut idler = Idler::new(idle);
                while !thread_shutdown.load(Ordering::Acquire) {
                    let work = core.duty_cycle();
                    idler.idle(work);
                }
                core.on_shutdown();
            })
            .map_err(Error::Io)?;
        Ok(Self {
            dir,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Stop the duty cycle and wait for the thread to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
