use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::client::ClientShared;
use crate::logbuffer::descriptor::index_by_term_count;
use crate::logbuffer::frame::{load_frame_length, FrameHeader, FRAME_ALIGN, FRAME_HEADER_SIZE};
use crate::logbuffer::scanner::{read_term_in, ScanOutcome};
use crate::logbuffer::{align_up, LogBuffer};
use crate::protocol::{RemoveCommand, CMD_REMOVE_SUBSCRIPTION};
use crate::{Error, Result};

/// Frame metadata handed to the fragment handler alongside the payload.
/// `position` is the stream position after the frame.
#[derive(Debug, Clone, Copy)]
pub struct FragmentContext {
    pub session_id: u32,
    pub stream_id: u32,
    pub position: u64,
}

/// Out-of-band consumer notifications, drained via
/// [`Subscription::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ImageAvailable { session_id: u32 },
    ImageUnavailable { session_id: u32 },
    /// Data was lost: the consumer fell behind the retained window and was
    /// skipped forward. Never silent.
    Gap { session_id: u32, lost_bytes: u64 },
    /// The producer closed the stream and everything before the end was
    /// consumed.
    EndOfStream { session_id: u32 },
}

/// One producer's stream as seen by this subscription: a read cursor over the
/// mapped log that only moves forward.
pub struct Image {
    log: Arc<LogBuffer>,
    session_id: u32,
    stream_id: u32,
    slot_index: usize,
    position: u64,
    end_of_stream: bool,
}

impl Image {
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    fn poll(
        &mut self,
        handler: &mut dyn FnMut(&FragmentContext, &[u8]),
        limit: usize,
        events: &mut VecDeque<StreamEvent>,
    ) -> Result<usize> {
        if limit == 0 || self.end_of_stream {
            return Ok(0);
        }
        let log = Arc::clone(&self.log);
        let bits = log.position_bits();
        let term_length = log.term_length();
        let term_count = log.term_count_of_position(self.position);
        let offset = log.term_offset_of_position(self.position);
        let expected_term_id = log.initial_term_id().wrapping_add(term_count);
        let term = log.term_ptr(index_by_term_count(term_count));

        let session_id = self.session_id;
        let stream_id = self.stream_id;
        let base = (term_count as u64) << bits;
        let mut count = 0;
        let outcome = read_term_in(
            term,
            term_length,
            Some(expected_term_id),
            offset,
            limit,
            &mut |frame| {
                let aligned =
                    align_up(FRAME_HEADER_SIZE + frame.payload.len(), FRAME_ALIGN) as u64;
                let context = FragmentContext {
                    session_id,
                    stream_id,
                    position: base + frame.term_offset as u64 + aligned,
                };
                handler(&context, frame.payload);
                count += 1;
            },
        )?;

        self.position = match outcome {
            ScanOutcome::EndOfTerm => (term_count as u64 + 1) << bits,
            ScanOutcome::LimitReached { offset } => base + offset as u64,
            ScanOutcome::NotYetCommitted { offset } => {
                let stopped = base + offset as u64;
                self.detect_overrun(term, offset, term_count, bits, events)
                    .unwrap_or(stopped)
            }
        };

        // Producer closed and we have read everything it wrote.
        let eos = log.meta().end_of_stream_position.load(Ordering::Acquire);
        if eos != u64::MAX && self.position >= eos {
            self.end_of_stream = true;
            events.push_back(StreamEvent::EndOfStream {
                session_id: self.session_id,
            });
        }

        log.update_subscriber(self.slot_index, self.position);
        Ok(count)
    }

    /// At a stopped scan, a committed frame from a *newer* term means the
    /// partition was reused under us: data between our position and that
    /// frame is gone. Skip forward and report the loss.
    fn detect_overrun(
        &mut self,
        term: *const u8,
        offset: u32,
        term_count: u32,
        bits: u32,
        events: &mut VecDeque<StreamEvent>,
    ) -> Option<u64> {
        // SAFETY: offset is within the term; the mapping outlives the call.
        let frame = unsafe { term.add(offset as usize) };
        if load_frame_length(frame) == 0 {
            return None;
        }
        let bytes = unsafe { std::slice::from_raw_parts(frame, FRAME_HEADER_SIZE) };
        let header = FrameHeader::from_bytes(bytes).ok()?;
        let observed_count = self.log.term_count_of(header.term_id);
        if observed_count <= term_count || observed_count >= 1 << 30 {
            return None;
        }
        let old_position = ((term_count as u64) << bits) + offset as u64;
        let new_position = ((observed_count as u64) << bits) + offset as u64;
        events.push_back(StreamEvent::Gap {
            session_id: self.session_id,
            lost_bytes: new_position - old_position,
        });
        log::warn!(
            "image session {} skipped forward {} bytes after falling behind",
            self.session_id,
            new_position - old_position
        );
        Some(new_position)
    }
}

/// Consumer handle for one stream on one channel.
pub struct Subscription {
    shared: Arc<ClientShared>,
    registration_id: u64,
    stream_id: u32,
    channel: String,
    images: Vec<Image>,
    events: VecDeque<StreamEvent>,
    closed: bool,
}

impl Subscription {
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        registration_id: u64,
        stream_id: u32,
        channel: String,
    ) -> Self {
        Self {
            shared,
            registration_id,
            stream_id,
            channel,
            images: Vec::new(),
            events: VecDeque::new(),
            closed: false,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn registration_id(&self) -> u64 {
        self.registration_id
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn is_connected(&self) -> bool {
        !self.images.is_empty()
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// Poll every image for committed fragments, up to `limit` in total.
    /// Newly announced images are admitted first; lifecycle notifications are
    /// queued as events.
    pub fn poll(
        &mut self,
        handler: &mut dyn FnMut(&FragmentContext, &[u8]),
        limit: usize,
    ) -> Result<usize> {
        if self.closed {
            return Err(Error::ChannelClosed);
        }
        self.admit_images()?;
        let mut total = 0;
        for image in &mut self.images {
            if total >= limit {
                break;
            }
            total += image.poll(handler, limit - total, &mut self.events)?;
        }
        Ok(total)
    }

    /// Next queued lifecycle event, if any.
    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    fn admit_images(&mut self) -> Result<()> {
        let (pending, unavailable) = {
            let mut state = self.shared.lock_state()?;
            (
                state.pending_images.remove(&self.registration_id),
                state.unavailable_images.remove(&self.registration_id),
            )
        };
        if let Some(pending) = pending {
            for message in pending {
                if self.images.iter().any(|image| image.session_id == message.session_id) {
                    continue;
                }
                let log = match LogBuffer::open(Path::new(&message.log_file)) {
                    Ok(log) => log,
                    Err(err) => {
                        // The image can be gone again (lingered out) before we
                        // ever polled; that is a lifecycle race, not a fault.
                        log::warn!("image log {} not mappable: {err}", message.log_file);
                        continue;
                    }
                };
                self.images.push(Image {
                    log,
                    session_id: message.session_id,
                    stream_id: message.stream_id,
                    slot_index: message.slot_index as usize,
                    position: message.subscriber_position,
                    end_of_stream: false,
                });
                self.events.push_back(StreamEvent::ImageAvailable {
                    session_id: message.session_id,
                });
            }
        }
        if let Some(unavailable) = unavailable {
            for session_id in unavailable {
                self.images.retain(|image| image.session_id != session_id);
                self.events
                    .push_back(StreamEvent::ImageUnavailable { session_id });
            }
        }
        Ok(())
    }

    /// Unregister from the driver; position slots are released and the stream
    /// may linger out if this was the last interest.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.images.clear();
        let correlation_id = self.shared.cnc.next_correlation_id();
        let cmd = RemoveCommand {
            correlation_id,
            client_id: self.shared.client_id,
            registration_id: self.registration_id,
        };
        self.shared
            .send_command(CMD_REMOVE_SUBSCRIPTION, &cmd.encode())?;
        match self.shared.await_response(correlation_id)? {
            crate::client::CommandOutcome::Ack(_) => Ok(()),
            crate::client::CommandOutcome::Error { message, .. } => Err(Error::Driver(message)),
            _ => Err(Error::Corrupt("unexpected response to remove subscription")),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let correlation_id = self.shared.cnc.next_correlation_id();
            let cmd = RemoveCommand {
                correlation_id,
                client_id: self.shared.client_id,
                registration_id: self.registration_id,
            };
            let _ = self
                .shared
                .cnc
                .command()
                .offer(CMD_REMOVE_SUBSCRIPTION, &cmd.encode());
        }
    }
}
