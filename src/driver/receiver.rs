//! Driver-side receiver: polls receive channels, rebuilds images from
//! incoming frames, and drives reliability from the consuming side (STATUS
//! advertisement, gap detection, NAK emission).

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use crate::driver::{DriverConfig, DriverCore, RecvChannel, ReceiverImage, StreamState};
use crate::layout::DriverLayout;
use crate::logbuffer::descriptor::{index_by_term_count, LogParams, PARTITION_COUNT};
use crate::logbuffer::frame::{
    load_frame_length, store_frame_length, FrameHeader, FLAG_EOS, FRAME_ALIGN, FRAME_HEADER_SIZE,
    FRAME_VERSION, TYPE_DATA, TYPE_HEARTBEAT, TYPE_NAK, TYPE_PADDING, TYPE_SETUP, TYPE_STATUS,
};
use crate::logbuffer::scanner::scan_committed;
use crate::logbuffer::{align_up, LogBuffer};
use crate::protocol::{
    ImageMessage, NakPayload, SetupPayload, StatusPayload, RSP_IMAGE_AVAILABLE,
};

/// Datagrams drained per channel per duty cycle.
const POLL_LIMIT: usize = 64;

fn channel_hash(canonical: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
}

impl DriverCore {
    pub(crate) fn receiver_work(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        let mut announcements: Vec<Vec<u8>> = Vec::new();
        let layout = self.layout.clone();
        for (key, channel) in self.recv_channels.iter_mut() {
            work += poll_channel(channel, key, &layout, &mut self.recv_buf, &mut announcements);
            work += service_images(channel, &self.config, now_ns);
        }
        if !announcements.is_empty() {
            work += announcements.len();
            for body in announcements {
                self.broadcast(RSP_IMAGE_AVAILABLE, &body);
            }
            self.cnc.notify_clients();
        }
        work
    }
}

fn poll_channel(
    channel: &mut RecvChannel,
    canonical: &str,
    layout: &DriverLayout,
    buf: &mut [u8],
    announcements: &mut Vec<Vec<u8>>,
) -> usize {
    let mut work = 0;
    for _ in 0..POLL_LIMIT {
        let (len, from) = match channel.endpoint.poll(buf) {
            Ok(Some(received)) => received,
            Ok(None) => break,
            Err(err) => {
                log::warn!("receive poll failed on {canonical}: {err}");
                break;
            }
        };
        work += 1;
        if len < FRAME_HEADER_SIZE {
            log::warn!("runt datagram ({len} bytes) from {from}");
            continue;
        }
        let header = match FrameHeader::from_bytes(&buf[..len]) {
            Ok(header) => header,
            Err(err) => {
                log::warn!("undecodable frame from {from}: {err}");
                continue;
            }
        };
        if header.version != FRAME_VERSION {
            log::warn!("frame version {} from {from} not supported", header.version);
            continue;
        }
        match header.frame_type {
            TYPE_SETUP => on_setup(
                channel,
                canonical,
                &header,
                &buf[FRAME_HEADER_SIZE..len],
                from,
                layout,
                announcements,
            ),
            TYPE_DATA => on_data(channel, &header, &buf[..len], from),
            TYPE_PADDING => on_padding(channel, &header, &buf[..len], from),
            TYPE_HEARTBEAT => on_heartbeat(channel, &header, from),
            TYPE_STATUS | TYPE_NAK => {
                // Control frames for the sending side; nothing to do on a
                // receive channel.
            }
            other => log::warn!("unexpected frame type {other:#x} from {from}"),
        }
    }
    work
}

fn on_setup(
    channel: &mut RecvChannel,
    canonical: &str,
    header: &FrameHeader,
    payload: &[u8],
    from: SocketAddr,
    layout: &DriverLayout,
    announcements: &mut Vec<Vec<u8>>,
) {
    let setup = match SetupPayload::decode(payload) {
        Ok(setup) => setup,
        Err(err) => {
            log::warn!("bad setup payload from {from}: {err}");
            return;
        }
    };
    if let Some(image) = channel.images.get_mut(&header.session_id) {
        image.control_addr = from;
        return;
    }
    let subscribers: Vec<(u64, u64)> = channel
        .subs
        .iter()
        .filter(|&&(_, _, stream)| stream == header.stream_id)
        .map(|&(reg, client, _)| (reg, client))
        .collect();
    if subscribers.is_empty() {
        return;
    }
    let path = layout.image_path(channel_hash(canonical), header.session_id, header.stream_id);
    let log = match LogBuffer::create(
        &path,
        LogParams {
            term_length: setup.term_length as usize,
            initial_term_id: setup.initial_term_id,
            session_id: header.session_id,
            stream_id: header.stream_id,
            mtu: setup.mtu,
        },
    ) {
        Ok(log) => log,
        Err(err) => {
            log::warn!("cannot create image log for session {}: {err}", header.session_id);
            return;
        }
    };
    // Join at the sender's live tail; history before it was never subscribed.
    let join_position = log.compute_position(setup.active_term_id, setup.active_term_offset);
    let join_term_count = log.term_count_of_position(join_position);
    let mut image = ReceiverImage {
        log,
        session_id: header.session_id,
        stream_id: header.stream_id,
        control_addr: from,
        rebuild_position: join_position,
        hwm: join_position,
        highest_term_count: join_term_count,
        last_status_ns: 0,
        last_nak_ns: 0,
        nak_backoff_ns: 0,
        eos_position: None,
        state: StreamState::Active,
        closed_at_ns: None,
    };
    for (registration_id, client_id) in subscribers {
        match image.log.register_subscriber(registration_id, join_position) {
            Ok(slot) => announcements.push(
                ImageMessage {
                    client_id,
                    subscription_id: registration_id,
                    session_id: header.session_id,
                    stream_id: header.stream_id,
                    subscriber_position: join_position,
                    slot_index: slot as u32,
                    log_file: path.to_string_lossy().into_owned(),
                }
                .encode(),
            ),
            Err(err) => log::warn!(
                "no position slot for subscription {registration_id} on session {}: {err}",
                header.session_id
            ),
        }
    }
    log::debug!(
        "image created session={} stream={} join={join_position}",
        header.session_id,
        header.stream_id
    );
    channel.images.insert(header.session_id, image);
}

fn on_data(channel: &mut RecvChannel, header: &FrameHeader, frame: &[u8], from: SocketAddr) {
    let Some(image) = channel.images.get_mut(&header.session_id) else {
        // No SETUP seen yet; the sender keeps repeating it.
        return;
    };
    image.control_addr = from;
    if header.frame_length as usize != frame.len() {
        log::warn!("frame length {} does not match datagram {}", header.frame_length, frame.len());
        return;
    }
    insert_frame(image, header, frame);
}

/// Padding travels as a header-only datagram whose length word names the full
/// padded span; inserting just the header lets the rebuild cross it.
fn on_padding(channel: &mut RecvChannel, header: &FrameHeader, frame: &[u8], from: SocketAddr) {
    let Some(image) = channel.images.get_mut(&header.session_id) else {
        return;
    };
    image.control_addr = from;
    insert_frame(image, header, frame);
}

/// Insert a received frame into the image log at its exact (term, offset).
/// Duplicates (retransmits already received) are skipped by the commit word.
fn insert_frame(image: &mut ReceiverImage, header: &FrameHeader, frame: &[u8]) {
    let log = &image.log;
    let term_length = log.term_length() as u64;
    let term_count = log.term_count_of(header.term_id);
    if term_count >= 1 << 30 {
        // Wrapped negative: frame predates the image's initial term.
        return;
    }
    let aligned = align_up(header.frame_length as usize, FRAME_ALIGN) as u64;
    if header.term_offset as u64 + aligned > term_length {
        log::warn!("frame overruns term: offset={} len={aligned}", header.term_offset);
        return;
    }
    let position = ((term_count as u64) << log.position_bits()) + header.term_offset as u64;
    if position + aligned <= image.rebuild_position {
        return; // already rebuilt past it
    }
    // Reusing a partition three terms on requires every consumer to have
    // left it; the sender's flow control keeps it that way, so a violation
    // means a broken or spoofed sender.
    let oldest_needed = log
        .min_subscriber_position()
        .unwrap_or(image.rebuild_position);
    if position >= oldest_needed + (PARTITION_COUNT as u64 - 1) * term_length {
        log::warn!("frame too far ahead of consumers; dropping (position={position})");
        return;
    }

    // Entering a new term reuses the partition of the term three back; zero
    // it first so its stale frames cannot read as committed.
    if term_count > image.highest_term_count {
        let first_new = image.highest_term_count + 1;
        let oldest_to_clean = first_new.max(term_count.saturating_sub(PARTITION_COUNT - 1));
        for tc in oldest_to_clean..=term_count {
            log.clean_term(index_by_term_count(tc));
        }
        image.highest_term_count = term_count;
    }

    let index = index_by_term_count(term_count);
    let dst = unsafe { log.term_ptr(index).add(header.term_offset as usize) };
    if load_frame_length(dst) != 0 {
        return; // duplicate
    }
    // SAFETY: bounds validated above; commit word ordering makes the write
    // safe against concurrent consumers.
    unsafe {
        std::ptr::copy_nonoverlapping(frame.as_ptr().add(4), dst.add(4), frame.len() - 4);
    }
    store_frame_length(dst, header.frame_length);

    let end = position + aligned;
    if end > image.hwm {
        image.hwm = end;
    }
    advance_rebuild(image);
}

/// Advance the highest-contiguous marker over committed frames, crossing term
/// boundaries as whole terms complete.
fn advance_rebuild(image: &mut ReceiverImage) {
    let log = &image.log;
    let term_length = log.term_length();
    loop {
        let term_count = log.term_count_of_position(image.rebuild_position);
        let offset = log.term_offset_of_position(image.rebuild_position);
        let index = index_by_term_count(term_count);
        let term_id = log.initial_term_id().wrapping_add(term_count);
        match scan_committed(log.term_ptr(index), term_length, Some(term_id), offset) {
            Ok(new_offset) => {
                image.rebuild_position += (new_offset - offset) as u64;
                if new_offset as usize != term_length {
                    break;
                }
                // Term complete; continue into the next one.
            }
            Err(err) => {
                log::warn!("image rebuild halted: {err}");
                break;
            }
        }
    }
    if image.rebuild_position > image.hwm {
        image.hwm = image.rebuild_position;
    }
    image
        .log
        .meta()
        .receiver_hwm
        .store(image.hwm, Ordering::Release);
    // Progress cancels NAK backoff escalation.
    image.nak_backoff_ns = 0;
}

fn on_heartbeat(channel: &mut RecvChannel, header: &FrameHeader, from: SocketAddr) {
    let Some(image) = channel.images.get_mut(&header.session_id) else {
        return;
    };
    image.control_addr = from;
    let position = image
        .log
        .compute_position(header.term_id, header.term_offset);
    if position > image.hwm {
        image.hwm = position;
        image
            .log
            .meta()
            .receiver_hwm
            .store(image.hwm, Ordering::Release);
    }
    if header.flags & FLAG_EOS != 0 && image.eos_position.is_none() {
        image.eos_position = Some(position);
        image
            .log
            .meta()
            .end_of_stream_position
            .store(position, Ordering::Release);
        image.state = StreamState::Draining;
        log::debug!("session {} end of stream at {position}", header.session_id);
    }
}

/// Time-based per-image duties: STATUS advertisement, NAK emission, and the
/// draining-to-linger transition once consumers reach end of stream.
fn service_images(channel: &mut RecvChannel, config: &DriverConfig, now_ns: u64) -> usize {
    let mut work = 0;
    for image in channel.images.values_mut() {
        if image.state == StreamState::Linger || image.state == StreamState::Closed {
            continue;
        }
        let consumption = image
            .log
            .min_subscriber_position()
            .unwrap_or(image.rebuild_position);

        // STATUS: advertise consumption and window.
        if now_ns.saturating_sub(image.last_status_ns) >= config.status_interval.as_nanos() as u64 {
            let term_count = image.log.term_count_of_position(consumption);
            let status = StatusPayload {
                consumption_term_id: image.log.initial_term_id().wrapping_add(term_count),
                consumption_term_offset: image.log.term_offset_of_position(consumption),
                window: config.window_for(image.log.term_length()) as u32,
            };
            send_control(
                &channel.endpoint,
                image,
                TYPE_STATUS,
                &status.encode(),
                status.consumption_term_id,
                status.consumption_term_offset,
            );
            image.last_status_ns = now_ns;
            work += 1;
        }

        // NAK: a persistent hole past the NAK delay asks for retransmission,
        // with exponential backoff while the same hole persists.
        if image.rebuild_position < image.hwm {
            let delay = config.nak_delay.as_nanos() as u64 + image.nak_backoff_ns;
            if now_ns.saturating_sub(image.last_nak_ns) >= delay {
                let term_count = image.log.term_count_of_position(image.rebuild_position);
                let term_offset = image.log.term_offset_of_position(image.rebuild_position);
                let gap = (image.hwm - image.rebuild_position)
                    .min((image.log.term_length() as u32 - term_offset) as u64);
                let nak = NakPayload {
                    term_id: image.log.initial_term_id().wrapping_add(term_count),
                    term_offset,
                    length: gap as u32,
                };
                send_control(
                    &channel.endpoint,
                    image,
                    TYPE_NAK,
                    &nak.encode(),
                    nak.term_id,
                    nak.term_offset,
                );
                image.last_nak_ns = now_ns;
                image.nak_backoff_ns = (image.nak_backoff_ns * 2)
                    .clamp(config.nak_delay.as_nanos() as u64, 16 * config.nak_delay.as_nanos() as u64);
                work += 1;
            }
        }

        // End of stream: once every consumer has drained to the EOS point,
        // start the linger countdown.
        if let Some(eos) = image.eos_position {
            if consumption >= eos && image.closed_at_ns.is_none() {
                image.state = StreamState::Linger;
                image.closed_at_ns = Some(now_ns);
            }
        }
    }
    work
}

fn send_control(
    endpoint: &crate::transport::UdpChannel,
    image: &ReceiverImage,
    frame_type: u16,
    payload: &[u8],
    term_id: u32,
    term_offset: u32,
) {
    let header = FrameHeader {
        frame_length: (FRAME_HEADER_SIZE + payload.len()) as u32,
        version: FRAME_VERSION,
        flags: 0,
        frame_type,
        term_offset,
        session_id: image.session_id,
        stream_id: image.stream_id,
        term_id,
        checksum: FrameHeader::crc32(payload),
        reserved: 0,
    };
    let mut datagram = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    datagram.extend_from_slice(&header.to_bytes());
    datagram.extend_from_slice(payload);
    if let Err(err) = endpoint.send_to(&datagram, image.control_addr) {
        log::warn!("failed to send control frame: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbuffer::descriptor::MIN_TERM_LENGTH;
    use crate::logbuffer::frame::FLAG_UNFRAGMENTED;
    use tempfile::TempDir;

    fn test_image(dir: &TempDir) -> ReceiverImage {
        let log = LogBuffer::create(
            &dir.path().join("image.logbuffer"),
            LogParams {
                term_length: MIN_TERM_LENGTH,
                initial_term_id: 10,
                session_id: 1,
                stream_id: 2,
                mtu: 1408,
            },
        )
        .expect("image log");
        ReceiverImage {
            log,
            session_id: 1,
            stream_id: 2,
            control_addr: "127.0.0.1:1".parse().expect("literal address"),
            rebuild_position: 0,
            hwm: 0,
            highest_term_count: 0,
            last_status_ns: 0,
            last_nak_ns: 0,
            nak_backoff_ns: 0,
            eos_position: None,
            state: StreamState::Active,
            closed_at_ns: None,
        }
    }

    fn data_frame(term_id: u32, term_offset: u32, payload: &[u8]) -> (FrameHeader, Vec<u8>) {
        let header = FrameHeader {
            frame_length: (FRAME_HEADER_SIZE + payload.len()) as u32,
            version: FRAME_VERSION,
            flags: FLAG_UNFRAGMENTED,
            frame_type: TYPE_DATA,
            term_offset,
            session_id: 1,
            stream_id: 2,
            term_id,
            checksum: FrameHeader::crc32(payload),
            reserved: 0,
        };
        let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(payload);
        (header, bytes)
    }

    #[test]
    fn in_order_frames_advance_rebuild() {
        let dir = TempDir::new().expect("tempdir");
        let mut image = test_image(&dir);
        let (header, bytes) = data_frame(10, 0, &[1u8; 32]); // 64 aligned
        insert_frame(&mut image, &header, &bytes);
        assert_eq!(image.rebuild_position, 64);
        assert_eq!(image.hwm, 64);
    }

    #[test]
    fn gap_holds_rebuild_until_filled() {
        let dir = TempDir::new().expect("tempdir");
        let mut image = test_image(&dir);
        // Second frame arrives first: hwm moves, rebuild does not.
        let (header_b, bytes_b) = data_frame(10, 64, &[2u8; 32]);
        insert_frame(&mut image, &header_b, &bytes_b);
        assert_eq!(image.rebuild_position, 0);
        assert_eq!(image.hwm, 128);

        // The retransmit fills the hole and rebuild jumps over both.
        let (header_a, bytes_a) = data_frame(10, 0, &[1u8; 32]);
        insert_frame(&mut image, &header_a, &bytes_a);
        assert_eq!(image.rebuild_position, 128);
    }

    #[test]
    fn duplicate_frames_are_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let mut image = test_image(&dir);
        let (header, bytes) = data_frame(10, 0, &[3u8; 32]);
        insert_frame(&mut image, &header, &bytes);
        insert_frame(&mut image, &header, &bytes);
        assert_eq!(image.rebuild_position, 64);
        assert_eq!(image.hwm, 64);
    }

    #[test]
    fn frame_before_join_is_dropped() {
        let dir = TempDir::new().expect("tempdir");
        let mut image = test_image(&dir);
        // Term id 5 predates initial term 10 (wraps negative).
        let (header, bytes) = data_frame(5, 0, &[4u8; 32]);
        insert_frame(&mut image, &header, &bytes);
        assert_eq!(image.rebuild_position, 0);
        assert_eq!(image.hwm, 0);
    }
}
