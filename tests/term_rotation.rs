//! The canonical sizing scenario: 1000 messages of 100 bytes through a
//! 64 KiB term buffer, with a subscription attached before publishing starts.
//! Each frame occupies 160 aligned bytes (32-byte header + 100-byte payload,
//! rounded to the 32-byte frame alignment), so a term holds 409 frames and
//! the stream must rotate exactly twice.

use std::time::{Duration, Instant};

use conduit::client::{Client, ClientContext, Offer};
use conduit::driver::{DriverConfig, MediaDriver};
use tempfile::tempdir;

const TERM_LENGTH: usize = 64 * 1024;
const MESSAGE_COUNT: usize = 1000;
const MESSAGE_LEN: usize = 100;
const ALIGNED_FRAME: usize = 160;

#[test]
fn thousand_messages_rotate_twice_and_arrive_in_order() {
    let dir = tempdir().expect("tempdir");
    let config = DriverConfig {
        term_length: TERM_LENGTH,
        ..DriverConfig::with_dir(dir.path())
    };
    let _driver = MediaDriver::launch(config).expect("driver");
    let client = Client::connect(ClientContext::with_dir(dir.path())).expect("client");

    let mut subscription = client.add_subscription("ipc:sized", 42).expect("subscription");
    let mut publication = client.add_publication("ipc:sized", 42).expect("publication");

    let make_payload = |i: usize| {
        let mut payload = format!("message-{i:04}").into_bytes();
        payload.resize(MESSAGE_LEN, b'.');
        payload
    };

    // The total exceeds the flow-control window, so the producer must drain
    // the subscription whenever it gets backpressured.
    let mut received: Vec<Vec<u8>> = Vec::with_capacity(MESSAGE_COUNT);
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut sent = 0;
    while sent < MESSAGE_COUNT {
        match publication.offer(&make_payload(sent)).expect("offer") {
            Offer::Position(_) => sent += 1,
            Offer::BackPressured | Offer::AdminAction | Offer::NotConnected => {
                subscription
                    .poll(&mut |_, payload| received.push(payload.to_vec()), 64)
                    .expect("poll");
                assert!(Instant::now() < deadline, "publish stalled");
            }
            Offer::Closed => panic!("stream closed unexpectedly"),
        }
    }
    while received.len() < MESSAGE_COUNT {
        subscription
            .poll(&mut |_, payload| received.push(payload.to_vec()), 64)
            .expect("poll");
        assert!(Instant::now() < deadline, "drain stalled");
    }

    assert_eq!(received.len(), MESSAGE_COUNT);
    for (i, payload) in received.iter().enumerate() {
        assert_eq!(payload, &make_payload(i), "message {i} out of order or corrupt");
    }

    // Exactly two rotations: 409 + 409 + 182 frames across three terms.
    let frames_per_term = TERM_LENGTH / ALIGNED_FRAME;
    assert_eq!(frames_per_term, 409);
    let expected_terms = MESSAGE_COUNT.div_ceil(frames_per_term);
    assert_eq!(expected_terms, 3);
    let final_term = (publication.position() >> TERM_LENGTH.trailing_zeros()) as usize;
    assert_eq!(final_term, expected_terms - 1, "unexpected rotation count");

    // And the tail lands exactly where 182 frames of term 2 put it.
    let frames_in_last_term = MESSAGE_COUNT - 2 * frames_per_term;
    let expected_position =
        (2 * TERM_LENGTH + frames_in_last_term * ALIGNED_FRAME) as u64;
    assert_eq!(publication.position(), expected_position);
}
