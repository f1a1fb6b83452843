//! Driver-side conductor: command processing, registration lifecycle, client
//! liveness, and log buffer housekeeping (flow-control limits, partition
//! cleaning, linger reclamation).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::channel::{ChannelUri, Media};
use crate::driver::{DriverCore, RecvChannel, Registration, SendChannel, SenderSession, StreamState};
use crate::logbuffer::descriptor::{validate_term_length, LogParams, PARTITION_COUNT};
use crate::logbuffer::LogBuffer;
use crate::protocol::{
    AddStreamCommand, ClientCommand, ErrorResponse, ImageMessage, OperationAck, PublicationReady,
    RemoveCommand, CMD_ADD_PUBLICATION, CMD_ADD_SUBSCRIPTION, CMD_CLIENT_CLOSE,
    CMD_CLIENT_KEEPALIVE, CMD_REMOVE_PUBLICATION, CMD_REMOVE_SUBSCRIPTION, ERR_GENERIC,
    ERR_INVALID_CHANNEL, ERR_SLOTS_EXHAUSTED, ERR_UNKNOWN_REGISTRATION, RSP_ERROR,
    RSP_IMAGE_AVAILABLE, RSP_IMAGE_UNAVAILABLE, RSP_OPERATION_SUCCESS, RSP_PUBLICATION_READY,
    RSP_SUBSCRIPTION_READY,
};
use crate::transport::UdpChannel;
use crate::Result;

/// Commands drained from the ring per duty cycle.
const COMMAND_LIMIT: usize = 16;

/// Stable key for a channel inside image file names.
fn channel_hash(canonical: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
}

impl DriverCore {
    pub(crate) fn conductor_work(&mut self, now_ns: u64) -> usize {
        let cnc = Arc::clone(&self.cnc);
        let mut commands: Vec<(u32, Vec<u8>)> = Vec::new();
        cnc.command().receive(COMMAND_LIMIT, &mut |msg_type, body| {
            commands.push((msg_type, body.to_vec()));
        });
        let mut work = commands.len();
        for (msg_type, body) in commands {
            self.dispatch(msg_type, &body, now_ns);
        }
        work += self.housekeeping(now_ns);
        if work > 0 {
            self.cnc.notify_clients();
        }
        work
    }

    fn dispatch(&mut self, msg_type: u32, body: &[u8], now_ns: u64) {
        let outcome = match msg_type {
            CMD_ADD_PUBLICATION => {
                AddStreamCommand::decode(body).map(|cmd| self.on_add_publication(cmd, now_ns))
            }
            CMD_ADD_SUBSCRIPTION => {
                AddStreamCommand::decode(body).map(|cmd| self.on_add_subscription(cmd, now_ns))
            }
            CMD_REMOVE_PUBLICATION => {
                RemoveCommand::decode(body).map(|cmd| self.on_remove(cmd, now_ns, true))
            }
            CMD_REMOVE_SUBSCRIPTION => {
                RemoveCommand::decode(body).map(|cmd| self.on_remove(cmd, now_ns, false))
            }
            CMD_CLIENT_KEEPALIVE => ClientCommand::decode(body).map(|cmd| {
                self.clients.insert(cmd.client_id, now_ns);
            }),
            CMD_CLIENT_CLOSE => ClientCommand::decode(body).map(|cmd| {
                self.remove_client(cmd.client_id, now_ns);
            }),
            other => {
                log::warn!("unknown command type {other:#x}");
                return;
            }
        };
        if let Err(err) = outcome {
            log::warn!("dropping malformed command type {msg_type:#x}: {err}");
        }
    }

    // ----- publications -----

    fn on_add_publication(&mut self, cmd: AddStreamCommand, now_ns: u64) {
        self.track_client(cmd.client_id, now_ns);
        let uri = match ChannelUri::parse(&cmd.channel) {
            Ok(uri) => uri,
            Err(err) => {
                self.respond_error(&cmd, ERR_INVALID_CHANNEL, &err.to_string());
                return;
            }
        };
        let result = match uri.media() {
            Media::Ipc => self.add_ipc_publication(&cmd, &uri, now_ns),
            Media::UdpUnicast | Media::UdpMulticast => self.add_udp_publication(&cmd, &uri),
        };
        match result {
            Ok((registration_id, session_id, log_file)) => {
                self.registered(cmd.client_id, registration_id);
                self.broadcast(
                    RSP_PUBLICATION_READY,
                    &PublicationReady {
                        correlation_id: cmd.correlation_id,
                        client_id: cmd.client_id,
                        registration_id,
                        session_id,
                        stream_id: cmd.stream_id,
                        log_file,
                    }
                    .encode(),
                );
            }
            Err(err) => self.respond_error(&cmd, ERR_GENERIC, &err.to_string()),
        }
    }

    fn add_ipc_publication(
        &mut self,
        cmd: &AddStreamCommand,
        uri: &ChannelUri,
        _now_ns: u64,
    ) -> Result<(u64, u32, String)> {
        let key = (uri.canonical(), cmd.stream_id);
        let entry = self.ipc_stream(&key, uri)?;
        entry.publishers += 1;
        // A publisher joining a draining stream revives it.
        entry.log.meta().is_closed.store(0, Ordering::Release);
        entry
            .log
            .meta()
            .end_of_stream_position
            .store(u64::MAX, Ordering::Release);
        let session_id = entry.session_id;
        let log = Arc::clone(&entry.log);
        let log_file = self
            .layout
            .log_path(session_id, cmd.stream_id)
            .to_string_lossy()
            .into_owned();
        self.refresh_limit(&log);
        let registration_id = self.allocate_registration_id();
        self.registrations.insert(
            registration_id,
            Registration::IpcPublication {
                client_id: cmd.client_id,
                key,
            },
        );
        Ok((registration_id, session_id, log_file))
    }

    fn add_udp_publication(
        &mut self,
        cmd: &AddStreamCommand,
        uri: &ChannelUri,
    ) -> Result<(u64, u32, String)> {
        let canonical = uri.canonical();
        if !self.send_channels.contains_key(&canonical) {
            let endpoint = UdpChannel::sender(uri, &self.config.socket)?;
            let channel = SendChannel {
                uri: uri.clone(),
                endpoint,
                sessions: HashMap::new(),
            };
            log::debug!("opened send channel {}", channel.uri);
            self.send_channels.insert(canonical.clone(), channel);
        }
        let session_id = self.allocate_session_id();
        let term_length =
            validate_term_length(uri.term_length().unwrap_or(self.config.term_length))?;
        let mtu = self.config.mtu.min(term_length / 8) as u32;
        let path = self.layout.log_path(session_id, cmd.stream_id);
        let log = LogBuffer::create(
            &path,
            LogParams {
                term_length,
                initial_term_id: session_id,
                session_id,
                stream_id: cmd.stream_id,
                mtu,
            },
        )?;
        let channel = self
            .send_channels
            .get_mut(&canonical)
            .expect("send channel inserted above");
        channel.sessions.insert(
            session_id,
            SenderSession {
                log,
                session_id,
                stream_id: cmd.stream_id,
                state: StreamState::Init,
                sender_position: 0,
                receiver_slots: HashMap::new(),
                receiver_last_status_ns: HashMap::new(),
                last_setup_ns: 0,
                last_heartbeat_ns: 0,
                pending_naks: Vec::new(),
                closed_at_ns: None,
            },
        );
        let registration_id = self.allocate_registration_id();
        self.registrations.insert(
            registration_id,
            Registration::UdpPublication {
                client_id: cmd.client_id,
                channel_key: canonical,
                session_id,
            },
        );
        Ok((registration_id, session_id, path.to_string_lossy().into_owned()))
    }

    // ----- subscriptions -----

    fn on_add_subscription(&mut self, cmd: AddStreamCommand, now_ns: u64) {
        self.track_client(cmd.client_id, now_ns);
        let uri = match ChannelUri::parse(&cmd.channel) {
            Ok(uri) => uri,
            Err(err) => {
                self.respond_error(&cmd, ERR_INVALID_CHANNEL, &err.to_string());
                return;
            }
        };
        let registration_id = self.allocate_registration_id();
        let result = match uri.media() {
            Media::Ipc => self.add_ipc_subscription(&cmd, &uri, registration_id),
            Media::UdpUnicast | Media::UdpMulticast => {
                self.add_udp_subscription(&cmd, &uri, registration_id)
            }
        };
        match result {
            Ok(images) => {
                self.registered(cmd.client_id, registration_id);
                self.broadcast(
                    RSP_SUBSCRIPTION_READY,
                    &OperationAck {
                        correlation_id: cmd.correlation_id,
                        client_id: cmd.client_id,
                        registration_id,
                    }
                    .encode(),
                );
                for image in images {
                    self.broadcast(RSP_IMAGE_AVAILABLE, &image.encode());
                }
            }
            Err(err) => {
                let code = match err {
                    crate::Error::Unsupported("no free subscriber slot") => ERR_SLOTS_EXHAUSTED,
                    _ => ERR_GENERIC,
                };
                self.respond_error(&cmd, code, &err.to_string());
            }
        }
    }

    fn add_ipc_subscription(
        &mut self,
        cmd: &AddStreamCommand,
        uri: &ChannelUri,
        registration_id: u64,
    ) -> Result<Vec<ImageMessage>> {
        let key = (uri.canonical(), cmd.stream_id);
        let entry = self.ipc_stream(&key, uri)?;
        let position = entry.log.producer_position();
        let slot = entry.log.register_subscriber(registration_id, position)?;
        entry.subscribers += 1;
        let session_id = entry.session_id;
        let log = Arc::clone(&entry.log);
        let log_file = self
            .layout
            .log_path(session_id, cmd.stream_id)
            .to_string_lossy()
            .into_owned();
        self.refresh_limit(&log);
        self.registrations.insert(
            registration_id,
            Registration::IpcSubscription {
                client_id: cmd.client_id,
                key,
                slot,
            },
        );
        Ok(vec![ImageMessage {
            client_id: cmd.client_id,
            subscription_id: registration_id,
            session_id,
            stream_id: cmd.stream_id,
            subscriber_position: position,
            slot_index: slot as u32,
            log_file,
        }])
    }

    fn add_udp_subscription(
        &mut self,
        cmd: &AddStreamCommand,
        uri: &ChannelUri,
        registration_id: u64,
    ) -> Result<Vec<ImageMessage>> {
        let canonical = uri.canonical();
        if !self.recv_channels.contains_key(&canonical) {
            let endpoint = UdpChannel::receiver(uri, &self.config.socket)?;
            let channel = RecvChannel {
                uri: uri.clone(),
                endpoint,
                subs: Vec::new(),
                images: HashMap::new(),
            };
            log::debug!("opened receive channel {}", channel.uri);
            self.recv_channels.insert(canonical.clone(), channel);
        }
        let channel = self
            .recv_channels
            .get_mut(&canonical)
            .expect("recv channel inserted above");
        channel.subs.push((registration_id, cmd.client_id, cmd.stream_id));
        // Sessions already flowing on this channel become images for the new
        // subscription immediately.
        let mut images = Vec::new();
        for image in channel.images.values() {
            if image.stream_id != cmd.stream_id {
                continue;
            }
            let slot = image
                .log
                .register_subscriber(registration_id, image.rebuild_position)?;
            images.push(ImageMessage {
                client_id: cmd.client_id,
                subscription_id: registration_id,
                session_id: image.session_id,
                stream_id: image.stream_id,
                subscriber_position: image.rebuild_position,
                slot_index: slot as u32,
                log_file: self
                    .layout
                    .image_path(channel_hash(&canonical), image.session_id, image.stream_id)
                    .to_string_lossy()
                    .into_owned(),
            });
        }
        self.registrations.insert(
            registration_id,
            Registration::UdpSubscription {
                client_id: cmd.client_id,
                channel_key: canonical,
                stream_id: cmd.stream_id,
            },
        );
        Ok(images)
    }

    // ----- removals -----

    fn on_remove(&mut self, cmd: RemoveCommand, now_ns: u64, expect_publication: bool) {
        self.track_client(cmd.client_id, now_ns);
        let matches = match self.registrations.get(&cmd.registration_id) {
            Some(Registration::IpcPublication { client_id, .. })
            | Some(Registration::UdpPublication { client_id, .. }) => {
                expect_publication && *client_id == cmd.client_id
            }
            Some(Registration::IpcSubscription { client_id, .. })
            | Some(Registration::UdpSubscription { client_id, .. }) => {
                !expect_publication && *client_id == cmd.client_id
            }
            None => false,
        };
        if !matches {
            self.broadcast(
                RSP_ERROR,
                &ErrorResponse {
                    correlation_id: cmd.correlation_id,
                    client_id: cmd.client_id,
                    code: ERR_UNKNOWN_REGISTRATION,
                    message: "unknown registration".to_string(),
                }
                .encode(),
            );
            return;
        }
        self.apply_removal(cmd.registration_id, now_ns);
        if let Some(regs) = self.client_regs.get_mut(&cmd.client_id) {
            regs.retain(|&id| id != cmd.registration_id);
        }
        self.broadcast(
            RSP_OPERATION_SUCCESS,
            &OperationAck {
                correlation_id: cmd.correlation_id,
                client_id: cmd.client_id,
                registration_id: cmd.registration_id,
            }
            .encode(),
        );
    }

    /// Tear down one registration. Shared by explicit removes, client close,
    /// and client timeout.
    fn apply_removal(&mut self, registration_id: u64, now_ns: u64) {
        let Some(registration) = self.registrations.remove(&registration_id) else {
            return;
        };
        match registration {
            Registration::IpcPublication { key, .. } => {
                if let Some(entry) = self.ipc_logs.get_mut(&key) {
                    entry.publishers = entry.publishers.saturating_sub(1);
                    if entry.publishers == 0 {
                        let eos = entry.log.producer_position();
                        entry
                            .log
                            .meta()
                            .end_of_stream_position
                            .store(eos, Ordering::Release);
                        entry.log.close();
                        log::debug!(
                            "ipc stream {}#{} draining at position {eos}",
                            key.0,
                            key.1
                        );
                    }
                    if entry.is_unreferenced() {
                        entry.closed_at_ns = Some(now_ns);
                    }
                }
            }
            Registration::IpcSubscription { key, slot, .. } => {
                if let Some(entry) = self.ipc_logs.get_mut(&key) {
                    entry.log.release_subscriber(slot);
                    entry.subscribers = entry.subscribers.saturating_sub(1);
                    if entry.is_unreferenced() {
                        entry.closed_at_ns = Some(now_ns);
                    } else {
                        let log = Arc::clone(&entry.log);
                        self.refresh_limit(&log);
                    }
                }
            }
            Registration::UdpPublication {
                channel_key,
                session_id,
                ..
            } => {
                if let Some(channel) = self.send_channels.get_mut(&channel_key) {
                    if let Some(session) = channel.sessions.get_mut(&session_id) {
                        let eos = session.log.producer_position();
                        session
                            .log
                            .meta()
                            .end_of_stream_position
                            .store(eos, Ordering::Release);
                        session.log.close();
                        session.state = StreamState::Draining;
                        session.closed_at_ns = Some(now_ns);
                    }
                }
            }
            Registration::UdpSubscription {
                channel_key,
                stream_id,
                ..
            } => {
                if let Some(channel) = self.recv_channels.get_mut(&channel_key) {
                    channel.subs.retain(|&(reg, _, _)| reg != registration_id);
                    let still_subscribed = channel
                        .subs
                        .iter()
                        .any(|&(_, _, stream)| stream == stream_id);
                    for image in channel.images.values_mut() {
                        if image.stream_id != stream_id {
                            continue;
                        }
                        image.log.release_slots_of(registration_id);
                        if !still_subscribed {
                            image.state = StreamState::Linger;
                            image.closed_at_ns = Some(now_ns);
                        }
                    }
                }
            }
        }
    }

    fn remove_client(&mut self, client_id: u64, now_ns: u64) {
        self.clients.remove(&client_id);
        if let Some(regs) = self.client_regs.remove(&client_id) {
            log::debug!("releasing {} registrations of client {client_id}", regs.len());
            for registration_id in regs {
                self.apply_removal(registration_id, now_ns);
            }
        }
    }

    // ----- housekeeping -----

    pub(crate) fn housekeeping(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        work += self.timeout_clients(now_ns);
        work += self.maintain_ipc(now_ns);
        work += self.maintain_send_channels(now_ns);
        work += self.maintain_recv_channels(now_ns);
        work
    }

    fn timeout_clients(&mut self, now_ns: u64) -> usize {
        let ttl = self.config.client_ttl.as_nanos() as u64;
        let expired: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, &last)| now_ns.saturating_sub(last) > ttl)
            .map(|(&id, _)| id)
            .collect();
        let count = expired.len();
        for client_id in expired {
            log::warn!("client {client_id} timed out; reclaiming its resources");
            self.remove_client(client_id, now_ns);
        }
        count
    }

    fn maintain_ipc(&mut self, now_ns: u64) -> usize {
        let window = |log: &LogBuffer| self.config.window_for(log.term_length());
        let mut logs: Vec<Arc<LogBuffer>> = Vec::new();
        for (_, entry) in self.ipc_logs.iter_mut() {
            logs.push(Arc::clone(&entry.log));
        }
        for log in &logs {
            clean_one_partition(log);
            update_limit(log, window(log));
        }
        let linger = self.config.linger.as_nanos() as u64;
        let reaped = self.ipc_logs.reap_expired(now_ns, linger);
        let count = reaped.len();
        for ((channel, stream_id), log) in reaped {
            let path = self.layout.log_path(log.session_id(), stream_id);
            remove_log_file(&path);
            log::debug!("reclaimed ipc stream {channel}#{stream_id}");
        }
        count
    }

    fn maintain_send_channels(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        let linger = self.config.linger.as_nanos() as u64;
        let status_ttl = 10 * self.config.status_interval.as_nanos() as u64;
        let window = self.config.window;
        let default_window = |term_length: usize| {
            if window > 0 {
                window as u64
            } else {
                term_length as u64 / 2
            }
        };
        let mut dead_files = Vec::new();
        for channel in self.send_channels.values_mut() {
            channel.sessions.retain(|_, session| {
                // Drop receivers that stopped reporting status.
                let stale: Vec<std::net::SocketAddr> = session
                    .receiver_last_status_ns
                    .iter()
                    .filter(|(_, &last)| now_ns.saturating_sub(last) > status_ttl)
                    .map(|(&addr, _)| addr)
                    .collect();
                for addr in stale {
                    session.receiver_last_status_ns.remove(&addr);
                    if let Some(slot) = session.receiver_slots.remove(&addr) {
                        session.log.release_subscriber(slot);
                        log::debug!(
                            "receiver {addr} timed out on session {}",
                            session.session_id
                        );
                    }
                }

                clean_one_partition(&session.log);
                update_limit(&session.log, default_window(session.log.term_length()));

                match session.closed_at_ns {
                    Some(closed) if now_ns.saturating_sub(closed) >= linger => {
                        session.state = StreamState::Closed;
                        dead_files.push((session.session_id, session.stream_id));
                        false
                    }
                    Some(_) => {
                        if session.state == StreamState::Draining {
                            session.state = StreamState::Linger;
                        }
                        true
                    }
                    None => true,
                }
            });
        }
        for (session_id, stream_id) in dead_files {
            remove_log_file(&self.layout.log_path(session_id, stream_id));
            work += 1;
        }
        self.send_channels.retain(|_, channel| !channel.sessions.is_empty());
        work
    }

    fn maintain_recv_channels(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        let linger = self.config.linger.as_nanos() as u64;
        let mut unavailable = Vec::new();
        for (key, channel) in self.recv_channels.iter_mut() {
            let hash = channel_hash(key);
            channel.images.retain(|_, image| {
                match image.closed_at_ns {
                    Some(closed) if now_ns.saturating_sub(closed) >= linger => {
                        for &(reg, client, stream) in &channel.subs {
                            if stream == image.stream_id {
                                unavailable.push(ImageMessage {
                                    client_id: client,
                                    subscription_id: reg,
                                    session_id: image.session_id,
                                    stream_id: image.stream_id,
                                    subscriber_position: image.rebuild_position,
                                    slot_index: 0,
                                    log_file: String::new(),
                                });
                            }
                        }
                        remove_log_file(&self.layout.image_path(
                            hash,
                            image.session_id,
                            image.stream_id,
                        ));
                        false
                    }
                    _ => true,
                }
            });
        }
        for message in unavailable {
            self.broadcast(RSP_IMAGE_UNAVAILABLE, &message.encode());
            work += 1;
        }
        self.recv_channels
            .retain(|_, channel| !channel.subs.is_empty() || !channel.images.is_empty());
        work
    }

    pub(crate) fn on_shutdown(&mut self) {
        log::info!("driver shutting down");
        for (_, entry) in self.ipc_logs.iter_mut() {
            entry.log.close();
        }
        for channel in self.send_channels.values() {
            for session in channel.sessions.values() {
                session.log.close();
            }
        }
    }

    // ----- helpers -----

    /// Fetch or create the shared IPC log for a (channel, stream).
    fn ipc_stream(
        &mut self,
        key: &(String, u32),
        uri: &ChannelUri,
    ) -> Result<&mut crate::transport::ipc::SharedLogEntry> {
        let term_length =
            validate_term_length(uri.term_length().unwrap_or(self.config.term_length))?;
        let stream_id = key.1;
        let session_id = if self.ipc_logs.get(key).is_none() {
            self.allocate_session_id()
        } else {
            0 // unused; entry exists
        };
        let layout = self.layout.clone();
        self.ipc_logs.get_or_create_with(key.clone(), || {
            let path = layout.log_path(session_id, stream_id);
            let log = LogBuffer::create(
                &path,
                LogParams {
                    term_length,
                    initial_term_id: session_id,
                    session_id,
                    stream_id,
                    // IPC has no datagram limit; the term bound applies alone.
                    mtu: (term_length / 8) as u32,
                },
            )?;
            Ok((log, session_id))
        })
    }

    fn track_client(&mut self, client_id: u64, now_ns: u64) {
        self.clients.insert(client_id, now_ns);
        self.client_regs.entry(client_id).or_default();
    }

    fn registered(&mut self, client_id: u64, registration_id: u64) {
        self.client_regs
            .entry(client_id)
            .or_default()
            .push(registration_id);
    }

    fn refresh_limit(&self, log: &LogBuffer) {
        update_limit(log, self.config.window_for(log.term_length()));
    }

    fn respond_error(&self, cmd: &AddStreamCommand, code: u32, message: &str) {
        self.broadcast(
            RSP_ERROR,
            &ErrorResponse {
                correlation_id: cmd.correlation_id,
                client_id: cmd.client_id,
                code,
                message: message.to_string(),
            }
            .encode(),
        );
    }

    pub(crate) fn broadcast(&self, msg_type: u32, body: &[u8]) {
        if let Err(err) = self.cnc.broadcast().transmit(msg_type, body) {
            log::warn!("failed to broadcast response type {msg_type:#x}: {err}");
        }
    }
}

/// Recompute a log's flow-control limit: the slowest consumer plus the
/// window, clamped so producers never enter a partition housekeeping has not
/// zeroed yet. No consumers means no limit advance (producers stay gated on
/// connection state).
fn update_limit(log: &LogBuffer, window: u64) {
    let meta = log.meta();
    let clean_position = meta.clean_count.load(Ordering::Acquire) << log.position_bits();
    if let Some(min) = log.min_subscriber_position() {
        let limit = (min + window).min(clean_position);
        meta.pub_limit.store(limit, Ordering::Release);
    } else {
        meta.pub_limit.store(0, Ordering::Release);
    }
}

/// Zero at most one reusable partition per call. The partition holding term
/// `clean_count - PARTITION_COUNT`'s data may be zeroed once every consumer
/// has moved past that term's end.
fn clean_one_partition(log: &LogBuffer) {
    let meta = log.meta();
    let clean_count = meta.clean_count.load(Ordering::Acquire);
    let min = log
        .min_subscriber_position()
        .unwrap_or_else(|| log.producer_position());
    let min_term_count = min >> log.position_bits();
    if min_term_count + 2 >= clean_count {
        log.clean_term((clean_count % PARTITION_COUNT as u64) as usize);
        meta.clean_count.store(clean_count + 1, Ordering::Release);
    }
}

fn remove_log_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("failed to remove {}: {err}", path.display());
        }
    }
}
