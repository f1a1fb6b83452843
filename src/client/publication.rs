use std::sync::Arc;

use crate::client::ClientShared;
use crate::logbuffer::frame::FRAME_HEADER_SIZE;
use crate::logbuffer::{AppendOutcome, Appender, BufferClaim, ClaimOutcome, LogBuffer};
use crate::protocol::{RemoveCommand, CMD_REMOVE_PUBLICATION};
use crate::{Error, Result};

/// Outcome of an offer. The non-`Position` variants are flow conditions the
/// caller backs off or retries on, never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Committed; the stream position after the message.
    Position(u64),
    /// A subscriber's position plus the window would be passed; retry after
    /// consumers make progress.
    BackPressured,
    /// Term rotation in progress; retry immediately.
    AdminAction,
    /// No subscriber (or no connected receiver) yet.
    NotConnected,
    Closed,
}

/// Outcome of `try_claim`.
pub enum TryClaim {
    Claim(BufferClaim),
    BackPressured,
    AdminAction,
    NotConnected,
    Closed,
}

/// Producer handle for one stream.
///
/// Safe to move across threads; concurrent publications on the same stream
/// (IPC) interleave through the log's atomic claim path.
pub struct Publication {
    shared: Arc<ClientShared>,
    log: Arc<LogBuffer>,
    appender: Appender,
    registration_id: u64,
    session_id: u32,
    stream_id: u32,
    channel: String,
    position: u64,
    closed: bool,
}

impl Publication {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        log: Arc<LogBuffer>,
        appender: Appender,
        registration_id: u64,
        session_id: u32,
        stream_id: u32,
        channel: String,
    ) -> Self {
        Self {
            shared,
            log,
            appender,
            registration_id,
            session_id,
            stream_id,
            channel,
            position: 0,
            closed: false,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn registration_id(&self) -> u64 {
        self.registration_id
    }

    /// Highest position this handle has committed.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether at least one consumer is attached (an IPC subscriber slot or a
    /// network receiver reporting status).
    pub fn is_connected(&self) -> bool {
        !self.closed && self.log.has_subscribers()
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.log.is_closed()
    }

    /// Largest payload a single offer accepts: bounded by the term (an
    /// eighth) and, on network channels, the MTU.
    pub fn max_payload_length(&self) -> usize {
        self.appender
            .max_payload_length()
            .min(self.log.mtu() as usize - FRAME_HEADER_SIZE)
    }

    /// Offer a message. Copies the payload into the log and commits it.
    pub fn offer(&mut self, payload: &[u8]) -> Result<Offer> {
        if self.is_closed() {
            return Ok(Offer::Closed);
        }
        if payload.len() > self.max_payload_length() {
            return Err(Error::PayloadTooLarge);
        }
        if !self.log.has_subscribers() {
            return Ok(Offer::NotConnected);
        }
        Ok(match self.appender.append(payload)? {
            AppendOutcome::Appended(position) => {
                self.position = position;
                Offer::Position(position)
            }
            AppendOutcome::BackPressured => Offer::BackPressured,
            AppendOutcome::AdminAction => Offer::AdminAction,
            AppendOutcome::Closed => Offer::Closed,
        })
    }

    /// Claim a frame for zero-copy writing; commit or abort the returned
    /// claim promptly so consumers do not stall behind it.
    pub fn try_claim(&mut self, length: usize) -> Result<TryClaim> {
        if self.is_closed() {
            return Ok(TryClaim::Closed);
        }
        if length > self.max_payload_length() {
            return Err(Error::PayloadTooLarge);
        }
        if !self.log.has_subscribers() {
            return Ok(TryClaim::NotConnected);
        }
        Ok(match self.appender.try_claim(length)? {
            ClaimOutcome::Claimed(claim) => {
                self.position = claim.position();
                TryClaim::Claim(claim)
            }
            ClaimOutcome::BackPressured => TryClaim::BackPressured,
            ClaimOutcome::AdminAction => TryClaim::AdminAction,
            ClaimOutcome::Closed => TryClaim::Closed,
        })
    }

    /// Close the publication: the stream drains for remaining consumers and
    /// is reclaimed after the linger timeout.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let correlation_id = self.shared.cnc.next_correlation_id();
        let cmd = RemoveCommand {
            correlation_id,
            client_id: self.shared.client_id,
            registration_id: self.registration_id,
        };
        self.shared.send_command(CMD_REMOVE_PUBLICATION, &cmd.encode())?;
        match self.shared.await_response(correlation_id)? {
            crate::client::CommandOutcome::Ack(_) => Ok(()),
            crate::client::CommandOutcome::Error { message, .. } => Err(Error::Driver(message)),
            _ => Err(Error::Corrupt("unexpected response to remove publication")),
        }
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let correlation_id = self.shared.cnc.next_correlation_id();
            let cmd = RemoveCommand {
                correlation_id,
                client_id: self.shared.client_id,
                registration_id: self.registration_id,
            };
            // Fire and forget; the driver's client TTL covers a lost command.
            let _ = self
                .shared
                .cnc
                .command()
                .offer(CMD_REMOVE_PUBLICATION, &cmd.encode());
        }
    }
}
