//! Client-side conductor thread: drains the driver's broadcast ring, files
//! correlated responses, tracks image availability, sends keepalives, and
//! watches the driver heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::client::{ClientShared, CommandOutcome};
use crate::clock::Clock;
use crate::protocol::{
    ClientCommand, ErrorResponse, ImageMessage, OperationAck, PublicationReady,
    CMD_CLIENT_KEEPALIVE, RSP_ERROR, RSP_IMAGE_AVAILABLE, RSP_IMAGE_UNAVAILABLE,
    RSP_OPERATION_SUCCESS, RSP_PUBLICATION_READY, RSP_SUBSCRIPTION_READY,
};
use crate::{Error, Result};

/// Longest the conductor parks between duty cycles. Bounds both shutdown
/// latency and driver-death detection latency.
const MAX_PARK: Duration = Duration::from_millis(100);

pub(crate) fn spawn(
    shared: Arc<ClientShared>,
    shutdown: Arc<AtomicBool>,
    resume_cursor: u64,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("conduit-client-{}", shared.client_id))
        .spawn(move || run(&shared, &shutdown, resume_cursor))
        .map_err(Error::Io)
}

fn run(shared: &ClientShared, shutdown: &AtomicBool, resume_cursor: u64) {
    let cnc = Arc::clone(&shared.cnc);
    let mut receiver = cnc.broadcast().receiver_from(resume_cursor);
    let mut last_keepalive_ns = 0u64;
    let mut reported_laps = 0u64;
    let keepalive_ns = shared.context.keepalive_interval.as_nanos() as u64;

    while !shutdown.load(Ordering::Acquire) {
        let now_ns = shared.clock.now();

        if now_ns.saturating_sub(last_keepalive_ns) >= keepalive_ns {
            let body = ClientCommand {
                client_id: shared.client_id,
            }
            .encode();
            if let Ok(true) = shared.cnc.command().offer(CMD_CLIENT_KEEPALIVE, &body) {
                last_keepalive_ns = now_ns;
            }
        }

        let mut delivered = Vec::new();
        receiver.receive(32, &mut |msg_type, body| {
            delivered.push((msg_type, body.to_vec()));
        });
        let had_responses = !delivered.is_empty();
        for (msg_type, body) in delivered {
            dispatch(shared, msg_type, &body);
        }
        if receiver.lapped_count() > reported_laps {
            reported_laps = receiver.lapped_count();
            log::warn!("fell behind the driver broadcast; some notifications were lost");
        }

        let driver_dead = !shared
            .cnc
            .driver_active(now_ns, shared.context.driver_timeout);
        if driver_dead {
            if let Ok(mut state) = shared.state.lock() {
                if !state.driver_dead {
                    log::warn!("driver heartbeat stale; marking driver dead");
                    state.driver_dead = true;
                }
            }
            shared.cond.notify_all();
        }

        if had_responses {
            shared.cond.notify_all();
        } else {
            let park = shared.context.keepalive_interval.min(MAX_PARK);
            let _ = shared.cnc.await_notify(park);
        }
    }
}

fn dispatch(shared: &ClientShared, msg_type: u32, body: &[u8]) {
    let result = match msg_type {
        RSP_PUBLICATION_READY => PublicationReady::decode(body).map(|ready| {
            if ready.client_id == shared.client_id {
                file_response(shared, ready.correlation_id, CommandOutcome::PublicationReady(ready));
            }
        }),
        RSP_SUBSCRIPTION_READY | RSP_OPERATION_SUCCESS => OperationAck::decode(body).map(|ack| {
            if ack.client_id == shared.client_id {
                file_response(shared, ack.correlation_id, CommandOutcome::Ack(ack));
            }
        }),
        RSP_ERROR => ErrorResponse::decode(body).map(|err| {
            if err.client_id == shared.client_id {
                file_response(
                    shared,
                    err.correlation_id,
                    CommandOutcome::Error {
                        code: err.code,
                        message: err.message,
                    },
                );
            }
        }),
        RSP_IMAGE_AVAILABLE => ImageMessage::decode(body).map(|image| {
            if image.client_id == shared.client_id {
                if let Ok(mut state) = shared.state.lock() {
                    state
                        .pending_images
                        .entry(image.subscription_id)
                        .or_default()
                        .push(image);
                }
            }
        }),
        RSP_IMAGE_UNAVAILABLE => ImageMessage::decode(body).map(|image| {
            if image.client_id == shared.client_id {
                if let Ok(mut state) = shared.state.lock() {
                    state
                        .unavailable_images
                        .entry(image.subscription_id)
                        .or_default()
                        .push(image.session_id);
                }
            }
        }),
        other => {
            log::debug!("ignoring broadcast type {other:#x}");
            Ok(())
        }
    };
    if let Err(err) = result {
        log::warn!("undecodable broadcast type {msg_type:#x}: {err}");
    }
}

fn file_response(shared: &ClientShared, correlation_id: u64, outcome: CommandOutcome) {
    if let Ok(mut state) = shared.state.lock() {
        state.responses.insert(correlation_id, outcome);
    }
}
