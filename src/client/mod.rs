//! Client API: `Client` connects to a running media driver through the CnC
//! file; `Publication` and `Subscription` are the producer and consumer
//! handles it hands out. A background conductor thread keeps the client
//! alive (keepalives), routes driver responses, and watches the driver's
//! heartbeat.

mod conductor;
mod publication;
mod subscription;

pub use publication::{Offer, Publication, TryClaim};
pub use subscription::{FragmentContext, Image, StreamEvent, Subscription};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::channel::ChannelUri;
use crate::clock::{Clock, SystemClock};
use crate::cnc::CncFile;
use crate::layout::DriverLayout;
use crate::logbuffer::{Appender, LogBuffer};
use crate::protocol::{
    AddStreamCommand, ClientCommand, ImageMessage, OperationAck, PublicationReady,
    CMD_ADD_PUBLICATION, CMD_ADD_SUBSCRIPTION, CMD_CLIENT_CLOSE, CMD_CLIENT_KEEPALIVE,
    ERR_INVALID_CHANNEL,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ClientContext {
    pub dir: PathBuf,
    pub keepalive_interval: Duration,
    /// Driver heartbeat staleness after which the driver counts as dead.
    pub driver_timeout: Duration,
    /// How long command round-trips may take before failing.
    pub response_timeout: Duration,
}

impl Default for ClientContext {
    fn default() -> Self {
        Self {
            dir: DriverLayout::default_dir().root().to_path_buf(),
            keepalive_interval: Duration::from_millis(500),
            driver_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientContext {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }
}

/// Outcome of a correlated command, filled in by the conductor thread.
pub(crate) enum CommandOutcome {
    PublicationReady(PublicationReady),
    Ack(OperationAck),
    Error { code: u32, message: String },
}

#[derive(Default)]
pub(crate) struct ConductorState {
    pub responses: HashMap<u64, CommandOutcome>,
    /// subscription registration id → images announced for it.
    pub pending_images: HashMap<u64, Vec<ImageMessage>>,
    /// subscription registration id → session ids withdrawn from it.
    pub unavailable_images: HashMap<u64, Vec<u32>>,
    pub driver_dead: bool,
}

pub(crate) struct ClientShared {
    pub cnc: Arc<CncFile>,
    pub client_id: u64,
    pub context: ClientContext,
    pub clock: SystemClock,
    pub state: Mutex<ConductorState>,
    pub cond: Condvar,
}

impl ClientShared {
    /// Offer a command on the ring, retrying while the driver drains it.
    pub(crate) fn send_command(&self, msg_type: u32, body: &[u8]) -> Result<()> {
        let deadline = Instant::now() + self.context.response_timeout;
        loop {
            if self.cnc.command().offer(msg_type, body)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::thread::yield_now();
        }
    }

    /// Block until the conductor files the response for `correlation_id`.
    pub(crate) fn await_response(&self, correlation_id: u64) -> Result<CommandOutcome> {
        let deadline = Instant::now() + self.context.response_timeout;
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Corrupt("client state lock poisoned"))?;
        loop {
            if let Some(outcome) = state.responses.remove(&correlation_id) {
                return Ok(outcome);
            }
            if state.driver_dead {
                return Err(Error::DriverInactive);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .map_err(|_| Error::Corrupt("client state lock poisoned"))?;
            state = guard;
        }
    }

    pub(crate) fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, ConductorState>> {
        self.state
            .lock()
            .map_err(|_| Error::Corrupt("client state lock poisoned"))
    }
}

/// A connection to a media driver.
pub struct Client {
    shared: Arc<ClientShared>,
    shutdown: Arc<AtomicBool>,
    conductor: Option<JoinHandle<()>>,
}

impl Client {
    pub fn connect(context: ClientContext) -> Result<Self> {
        let layout = DriverLayout::new(&context.dir);
        let cnc = CncFile::open(&layout.cnc_path())?;
        let clock = SystemClock;
        if !cnc.driver_active(clock.now(), context.driver_timeout) {
            return Err(Error::DriverInactive);
        }
        let client_id = cnc.allocate_client_id();
        // Snapshot the broadcast cursor before the first command goes out, so
        // the conductor cannot miss a response that beats its thread start.
        let resume_cursor = cnc.broadcast().tail();
        let shared = Arc::new(ClientShared {
            cnc,
            client_id,
            context,
            clock,
            state: Mutex::new(ConductorState::default()),
            cond: Condvar::new(),
        });
        shared.send_command(
            CMD_CLIENT_KEEPALIVE,
            &ClientCommand { client_id }.encode(),
        )?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let conductor =
            conductor::spawn(Arc::clone(&shared), Arc::clone(&shutdown), resume_cursor)?;
        Ok(Self {
            shared,
            shutdown,
            conductor: Some(conductor),
        })
    }

    pub fn client_id(&self) -> u64 {
        self.shared.client_id
    }

    /// Register a publication and map its log buffer. The driver allocates
    /// the session and the log; this call blocks for the response.
    pub fn add_publication(&self, channel: &str, stream_id: u32) -> Result<Publication> {
        // Parse locally first for a better error than a driver round trip.
        ChannelUri::parse(channel)?;
        let correlation_id = self.shared.cnc.next_correlation_id();
        let cmd = AddStreamCommand {
            correlation_id,
            client_id: self.shared.client_id,
            stream_id,
            channel: channel.to_string(),
        };
        self.shared.send_command(CMD_ADD_PUBLICATION, &cmd.encode())?;
        match self.shared.await_response(correlation_id)? {
            CommandOutcome::PublicationReady(ready) => {
                let log = LogBuffer::open(std::path::Path::new(&ready.log_file))?;
                let appender = Appender::new(Arc::clone(&log));
                Ok(Publication::new(
                    Arc::clone(&self.shared),
                    log,
                    appender,
                    ready.registration_id,
                    ready.session_id,
                    stream_id,
                    channel.to_string(),
                ))
            }
            CommandOutcome::Error { code, message } if code == ERR_INVALID_CHANNEL => {
                Err(Error::InvalidChannel(message))
            }
            CommandOutcome::Error { message, .. } => Err(Error::Driver(message)),
            CommandOutcome::Ack(_) => Err(Error::Corrupt("unexpected ack for add publication")),
        }
    }

    /// Register a subscription. Images attach asynchronously as producers
    /// appear; `Subscription::poll` admits them.
    pub fn add_subscription(&self, channel: &str, stream_id: u32) -> Result<Subscription> {
        ChannelUri::parse(channel)?;
        let correlation_id = self.shared.cnc.next_correlation_id();
        let cmd = AddStreamCommand {
            correlation_id,
            client_id: self.shared.client_id,
            stream_id,
            channel: channel.to_string(),
        };
        self.shared.send_command(CMD_ADD_SUBSCRIPTION, &cmd.encode())?;
        match self.shared.await_response(correlation_id)? {
            CommandOutcome::Ack(ack) => Ok(Subscription::new(
                Arc::clone(&self.shared),
                ack.registration_id,
                stream_id,
                channel.to_string(),
            )),
            CommandOutcome::Error { code, message } if code == ERR_INVALID_CHANNEL => {
                Err(Error::InvalidChannel(message))
            }
            CommandOutcome::Error { message, .. } => Err(Error::Driver(message)),
            CommandOutcome::PublicationReady(_) => {
                Err(Error::Corrupt("unexpected publication response for add subscription"))
            }
        }
    }

    /// Whether the driver heartbeat is current.
    pub fn driver_active(&self) -> bool {
        self.shared
            .cnc
            .driver_active(self.shared.clock.now(), self.shared.context.driver_timeout)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.shared.send_command(
            CMD_CLIENT_CLOSE,
            &ClientCommand {
                client_id: self.shared.client_id,
            }
            .encode(),
        );
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.conductor.take() {
            let _ = handle.join();
        }
    }
}
