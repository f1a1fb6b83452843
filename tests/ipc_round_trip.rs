use std::time::{Duration, Instant};

use conduit::client::{Client, ClientContext, Offer, StreamEvent};
use conduit::driver::{DriverConfig, MediaDriver};
use tempfile::tempdir;

fn test_config(dir: &std::path::Path) -> DriverConfig {
    DriverConfig {
        term_length: 64 * 1024,
        linger: Duration::from_millis(200),
        ..DriverConfig::with_dir(dir)
    }
}

fn offer_blocking(publication: &mut conduit::Publication, payload: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match publication.offer(payload).expect("offer") {
            Offer::Position(_) => return,
            Offer::Closed => panic!("publication closed mid-test"),
            _ => {
                assert!(Instant::now() < deadline, "offer timed out");
                std::thread::yield_now();
            }
        }
    }
}

#[test]
fn publish_and_receive_byte_identical() {
    let dir = tempdir().expect("tempdir");
    let _driver = MediaDriver::launch(test_config(dir.path())).expect("driver");
    let client = Client::connect(ClientContext::with_dir(dir.path())).expect("client");

    let mut subscription = client.add_subscription("ipc:orders", 7).expect("subscription");
    let mut publication = client.add_publication("ipc:orders", 7).expect("publication");
    assert_eq!(publication.stream_id(), 7);

    let payloads: Vec<Vec<u8>> = (0u32..50)
        .map(|i| format!("order-{i}: qty={}", i * 3).into_bytes())
        .collect();
    for payload in &payloads {
        offer_blocking(&mut publication, payload);
    }

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.len() < payloads.len() {
        subscription
            .poll(
                &mut |context, payload| {
                    assert_eq!(context.stream_id, 7);
                    received.push(payload.to_vec());
                },
                16,
            )
            .expect("poll");
        assert!(Instant::now() < deadline, "receive timed out");
    }
    assert_eq!(received, payloads);
}

#[test]
fn positions_are_monotonic_and_consumer_never_passes_producer() {
    let dir = tempdir().expect("tempdir");
    let _driver = MediaDriver::launch(test_config(dir.path())).expect("driver");
    let client = Client::connect(ClientContext::with_dir(dir.path())).expect("client");

    let mut subscription = client.add_subscription("ipc:ticks", 1).expect("subscription");
    let mut publication = client.add_publication("ipc:ticks", 1).expect("publication");

    let mut last_producer = 0;
    let mut last_consumer = 0;
    let deadline = Instant::now() + Duration::from_secs(20);
    for i in 0u32..500 {
        offer_blocking(&mut publication, &i.to_le_bytes());
        assert!(publication.position() > last_producer);
        last_producer = publication.position();

        loop {
            let mut end_position = None;
            subscription
                .poll(&mut |context, _| end_position = Some(context.position), 4)
                .expect("poll");
            if let Some(position) = end_position {
                assert!(position > last_consumer);
                assert!(position <= publication.position());
                last_consumer = position;
                break;
            }
            assert!(Instant::now() < deadline, "consumer starved");
        }
    }
}

#[test]
fn close_signals_end_of_stream_and_lingers_out() {
    let dir = tempdir().expect("tempdir");
    let _driver = MediaDriver::launch(test_config(dir.path())).expect("driver");
    let client = Client::connect(ClientContext::with_dir(dir.path())).expect("client");

    let mut subscription = client.add_subscription("ipc:eos", 3).expect("subscription");
    let mut publication = client.add_publication("ipc:eos", 3).expect("publication");
    let session_id = publication.session_id();

    offer_blocking(&mut publication, b"last words");
    publication.close().expect("close publication");

    // The subscription still drains the stream, then observes end of stream.
    let mut saw_payload = false;
    let mut saw_eos = false;
    let deadline = Instant::now() + Duration::from_secs(10);
    while !saw_eos {
        subscription
            .poll(&mut |_, payload| saw_payload = payload == b"last words", 8)
            .expect("poll");
        while let Some(event) = subscription.poll_event() {
            if event == (StreamEvent::EndOfStream { session_id }) {
                saw_eos = true;
            }
        }
        assert!(Instant::now() < deadline, "end of stream not observed");
    }
    assert!(saw_payload);

    // After the last interest closes, the linger expires and the log file is
    // reclaimed.
    subscription.close().expect("close subscription");
    let log_path = conduit::layout::DriverLayout::new(dir.path()).log_path(session_id, 3);
    let deadline = Instant::now() + Duration::from_secs(10);
    while log_path.exists() {
        assert!(Instant::now() < deadline, "log file never reclaimed");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn publication_without_subscriber_is_not_connected() {
    let dir = tempdir().expect("tempdir");
    let _driver = MediaDriver::launch(test_config(dir.path())).expect("driver");
    let client = Client::connect(ClientContext::with_dir(dir.path())).expect("client");

    let mut publication = client.add_publication("ipc:lonely", 9).expect("publication");
    assert!(!publication.is_connected());
    assert_eq!(publication.offer(b"void").expect("offer"), Offer::NotConnected);
}

#[test]
fn invalid_channel_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let _driver = MediaDriver::launch(test_config(dir.path())).expect("driver");
    let client = Client::connect(ClientContext::with_dir(dir.path())).expect("client");
    assert!(client.add_publication("bogus:nope", 1).is_err());
    assert!(client.add_subscription("udp:unicast?endpoint=не адрес", 1).is_err());
}
