//! Driver-side sender: scans publication logs and transmits committed frames,
//! answers NAKs from retained terms, emits SETUP and heartbeats, and feeds
//! receiver STATUS back into the flow-control slots.

use std::net::SocketAddr;

use crate::driver::{DriverCore, SendChannel, SenderSession, StreamState};
use crate::logbuffer::descriptor::index_by_term_count;
use crate::logbuffer::frame::{
    load_frame_length, FrameHeader, FLAG_EOS, FRAME_ALIGN, FRAME_HEADER_SIZE, FRAME_VERSION,
    TYPE_HEARTBEAT, TYPE_NAK, TYPE_PADDING, TYPE_SETUP, TYPE_STATUS,
};
use crate::logbuffer::align_up;
use crate::protocol::{NakPayload, SetupPayload, StatusPayload};
use crate::transport::UdpChannel;

/// Frames transmitted per session per duty cycle.
const SEND_LIMIT: usize = 64;
/// Control datagrams drained per send channel per duty cycle.
const CONTROL_POLL_LIMIT: usize = 32;

/// Non-zero owner id for a remote receiver's flow-control slot.
fn receiver_owner_id(addr: &SocketAddr) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    addr.hash(&mut hasher);
    hasher.finish() | 1
}

impl DriverCore {
    pub(crate) fn sender_work(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        for channel in self.send_channels.values_mut() {
            work += poll_control(channel, now_ns, &mut self.recv_buf);
            for session in channel.sessions.values_mut() {
                work += service_session(&channel.endpoint, session, &self.config, now_ns);
            }
        }
        work
    }
}

/// Drain STATUS and NAK frames addressed to this channel's sessions.
fn poll_control(channel: &mut SendChannel, now_ns: u64, buf: &mut [u8]) -> usize {
    let mut work = 0;
    for _ in 0..CONTROL_POLL_LIMIT {
        let (len, from) = match channel.endpoint.poll(buf) {
            Ok(Some(received)) => received,
            Ok(None) => break,
            Err(err) => {
                log::warn!("send channel poll failed: {err}");
                break;
            }
        };
        work += 1;
        if len < FRAME_HEADER_SIZE {
            continue;
        }
        let header = match FrameHeader::from_bytes(&buf[..len]) {
            Ok(header) => header,
            Err(err) => {
                log::warn!("undecodable control frame from {from}: {err}");
                continue;
            }
        };
        let Some(session) = channel.sessions.get_mut(&header.session_id) else {
            continue;
        };
        match header.frame_type {
            TYPE_STATUS => match StatusPayload::decode(&buf[FRAME_HEADER_SIZE..len]) {
                Ok(status) => on_status(session, &status, from, now_ns),
                Err(err) => log::warn!("bad status payload from {from}: {err}"),
            },
            TYPE_NAK => match NakPayload::decode(&buf[FRAME_HEADER_SIZE..len]) {
                Ok(nak) => {
                    log::debug!(
                        "nak from {from}: term={} offset={} len={}",
                        nak.term_id,
                        nak.term_offset,
                        nak.length
                    );
                    session.pending_naks.push(nak);
                }
                Err(err) => log::warn!("bad nak payload from {from}: {err}"),
            },
            other => log::debug!("ignoring frame type {other:#x} on send channel"),
        }
    }
    work
}

/// A receiver's STATUS registers (or advances) its flow-control slot on the
/// publication log, which is what connects the publication and opens the
/// producer limit.
fn on_status(session: &mut SenderSession, status: &StatusPayload, from: SocketAddr, now_ns: u64) {
    let log = &session.log;
    let term_count = log.term_count_of(status.consumption_term_id);
    let position = ((term_count as u64) << log.position_bits()) + status.consumption_term_offset as u64;
    match session.receiver_slots.get(&from) {
        Some(&slot) => log.update_subscriber(slot, position),
        None => match log.register_subscriber(receiver_owner_id(&from), position) {
            Ok(slot) => {
                session.receiver_slots.insert(from, slot);
                if session.state == StreamState::Init {
                    session.state = StreamState::Active;
                }
                log::debug!("receiver {from} connected to session {}", session.session_id);
            }
            Err(err) => {
                log::warn!("cannot track receiver {from}: {err}");
            }
        },
    }
    session.receiver_last_status_ns.insert(from, now_ns);
}

fn service_session(
    endpoint: &UdpChannel,
    session: &mut SenderSession,
    config: &crate::driver::DriverConfig,
    now_ns: u64,
) -> usize {
    let mut work = 0;

    // Periodic SETUP lets receivers join at any time.
    if now_ns.saturating_sub(session.last_setup_ns) >= config.setup_interval.as_nanos() as u64 {
        send_setup(endpoint, session);
        session.last_setup_ns = now_ns;
        work += 1;
    }

    // Retransmits before new data: a receiver with a hole cannot use newer
    // frames anyway.
    let mut data_work = 0;
    for nak in std::mem::take(&mut session.pending_naks) {
        data_work += retransmit(endpoint, session, &nak);
    }
    data_work += transmit_new(endpoint, session);
    if data_work > 0 {
        session.last_heartbeat_ns = now_ns;
        work += data_work;
    }

    // Heartbeat when quiet, carrying the tail (and EOS once draining).
    if now_ns.saturating_sub(session.last_heartbeat_ns) >= config.heartbeat_interval.as_nanos() as u64
    {
        send_heartbeat(endpoint, session);
        session.last_heartbeat_ns = now_ns;
        work += 1;
    }
    work
}

fn send_setup(endpoint: &UdpChannel, session: &SenderSession) {
    let log = &session.log;
    let tail = log.producer_position();
    let term_count = log.term_count_of_position(tail);
    let setup = SetupPayload {
        initial_term_id: log.initial_term_id(),
        active_term_id: log.initial_term_id().wrapping_add(term_count),
        active_term_offset: log.term_offset_of_position(tail),
        term_length: log.term_length() as u32,
        mtu: log.mtu(),
    };
    let payload = setup.encode();
    let header = FrameHeader {
        frame_length: (FRAME_HEADER_SIZE + payload.len()) as u32,
        version: FRAME_VERSION,
        flags: 0,
        frame_type: TYPE_SETUP,
        term_offset: setup.active_term_offset,
        session_id: session.session_id,
        stream_id: session.stream_id,
        term_id: setup.active_term_id,
        checksum: FrameHeader::crc32(&payload),
        reserved: 0,
    };
    let mut datagram = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    datagram.extend_from_slice(&header.to_bytes());
    datagram.extend_from_slice(&payload);
    if let Err(err) = endpoint.send(&datagram) {
        log::warn!("setup send failed: {err}");
    }
}

fn send_heartbeat(endpoint: &UdpChannel, session: &SenderSession) {
    let log = &session.log;
    let tail = log.producer_position();
    let term_count = log.term_count_of_position(tail);
    let eos = matches!(
        session.state,
        StreamState::Draining | StreamState::Linger
    );
    let header = FrameHeader {
        frame_length: FRAME_HEADER_SIZE as u32,
        version: FRAME_VERSION,
        flags: if eos { FLAG_EOS } else { 0 },
        frame_type: TYPE_HEARTBEAT,
        term_offset: log.term_offset_of_position(tail),
        session_id: session.session_id,
        stream_id: session.stream_id,
        term_id: log.initial_term_id().wrapping_add(term_count),
        checksum: 0,
        reserved: 0,
    };
    if let Err(err) = endpoint.send(&header.to_bytes()) {
        log::warn!("heartbeat send failed: {err}");
    }
}

/// Transmit committed frames between the sender position and the producer
/// tail. Data frames go out whole; padding goes out as header only.
fn transmit_new(endpoint: &UdpChannel, session: &mut SenderSession) -> usize {
    let log = &session.log;
    let term_length = log.term_length();
    let mut sent = 0;
    while sent < SEND_LIMIT && session.sender_position < log.producer_position() {
        let term_count = log.term_count_of_position(session.sender_position);
        let offset = log.term_offset_of_position(session.sender_position) as usize;
        let term = log.term_ptr(index_by_term_count(term_count));
        // SAFETY: offset < term_length; the mapping outlives the scan.
        let frame = unsafe { term.add(offset) };
        let frame_length = load_frame_length(frame) as usize;
        if frame_length == 0 {
            break; // claimed but not committed yet
        }
        if frame_length < FRAME_HEADER_SIZE || offset + frame_length > term_length {
            log::warn!(
                "halting transmit on corrupt frame at position {}",
                session.sender_position
            );
            break;
        }
        // SAFETY: bounds checked above; committed frames are immutable.
        let bytes = unsafe { std::slice::from_raw_parts(frame, frame_length) };
        let wire_len = match FrameHeader::from_bytes(bytes) {
            Ok(header) if header.frame_type == TYPE_PADDING => FRAME_HEADER_SIZE,
            Ok(_) => frame_length,
            Err(err) => {
                log::warn!("halting transmit: {err}");
                break;
            }
        };
        if let Err(err) = endpoint.send(&bytes[..wire_len]) {
            log::warn!("data send failed: {err}");
        }
        session.sender_position += align_up(frame_length, FRAME_ALIGN) as u64;
        sent += 1;
    }
    session
        .log
        .meta()
        .sender_position
        .store(session.sender_position, std::sync::atomic::Ordering::Release);
    sent
}

/// Answer a NAK by resending committed frames in the requested range. Frames
/// already cleaned away are gone; flow control keeps live receivers inside
/// the retained window, so that only happens to dead ones.
fn retransmit(endpoint: &UdpChannel, session: &SenderSession, nak: &NakPayload) -> usize {
    let log = &session.log;
    let term_length = log.term_length();
    let term_count = log.term_count_of(nak.term_id);
    if term_count >= 1 << 30 {
        return 0;
    }
    let producer_term_count = log.term_count_of_position(log.producer_position());
    if producer_term_count.wrapping_sub(term_count) >= 2 {
        log::debug!("nak for rotated-out term {}; ignoring", nak.term_id);
        return 0;
    }
    let term = log.term_ptr(index_by_term_count(term_count));
    let mut offset = nak.term_offset as usize;
    let end = (nak.term_offset as usize)
        .saturating_add(nak.length as usize)
        .min(term_length);
    let mut sent = 0;
    while offset < end && sent < SEND_LIMIT {
        // SAFETY: offset < term_length; the mapping outlives the scan.
        let frame = unsafe { term.add(offset) };
        let frame_length = load_frame_length(frame) as usize;
        if frame_length == 0 {
            break;
        }
        if frame_length < FRAME_HEADER_SIZE || offset + frame_length > term_length {
            break;
        }
        // SAFETY: bounds checked above.
        let bytes = unsafe { std::slice::from_raw_parts(frame, frame_length) };
        let wire_len = match FrameHeader::from_bytes(bytes) {
            Ok(header) if header.frame_type == TYPE_PADDING => FRAME_HEADER_SIZE,
            Ok(_) => frame_length,
            Err(_) => break,
        };
        if let Err(err) = endpoint.send(&bytes[..wire_len]) {
            log::warn!("retransmit send failed: {err}");
            break;
        }
        offset += align_up(frame_length, FRAME_ALIGN);
        sent += 1;
    }
    sent
}
