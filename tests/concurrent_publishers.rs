//! Multiple producers on one IPC stream coordinate through the shared
//! atomic tail. Every message must arrive exactly once, per-producer order
//! must hold, and term rotation must happen exactly once per boundary even
//! under contention.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit::client::{Client, ClientContext, Offer};
use conduit::driver::{DriverConfig, MediaDriver};
use tempfile::tempdir;

const PRODUCERS: usize = 3;
const PER_PRODUCER: u32 = 400;

#[test]
fn interleaved_producers_deliver_everything_in_per_producer_order() {
    let dir = tempdir().expect("tempdir");
    let config = DriverConfig {
        term_length: 64 * 1024,
        ..DriverConfig::with_dir(dir.path())
    };
    let _driver = MediaDriver::launch(config).expect("driver");
    let client = Arc::new(Client::connect(ClientContext::with_dir(dir.path())).expect("client"));

    let mut subscription = client.add_subscription("ipc:fanin", 11).expect("subscription");

    let mut producers = Vec::new();
    for producer_id in 0..PRODUCERS as u8 {
        let client = Arc::clone(&client);
        producers.push(std::thread::spawn(move || {
            let mut publication = client
                .add_publication("ipc:fanin", 11)
                .expect("publication");
            let deadline = Instant::now() + Duration::from_secs(30);
            for seq in 0..PER_PRODUCER {
                let mut payload = vec![producer_id];
                payload.extend_from_slice(&seq.to_le_bytes());
                loop {
                    match publication.offer(&payload).expect("offer") {
                        Offer::Position(_) => break,
                        Offer::Closed => panic!("stream closed"),
                        _ => {
                            assert!(Instant::now() < deadline, "producer stalled");
                            std::thread::yield_now();
                        }
                    }
                }
            }
        }));
    }

    let expected = PRODUCERS * PER_PRODUCER as usize;
    let mut next_seq = [0u32; PRODUCERS];
    let mut received = 0usize;
    let deadline = Instant::now() + Duration::from_secs(30);
    while received < expected {
        subscription
            .poll(
                &mut |_, payload| {
                    let producer = payload[0] as usize;
                    let seq = u32::from_le_bytes(payload[1..5].try_into().expect("seq bytes"));
                    assert_eq!(
                        seq, next_seq[producer],
                        "producer {producer} out of order"
                    );
                    next_seq[producer] += 1;
                    received += 1;
                },
                64,
            )
            .expect("poll");
        assert!(Instant::now() < deadline, "consumer stalled");
    }
    assert_eq!(received, expected);
    assert!(next_seq.iter().all(|&seq| seq == PER_PRODUCER));

    for producer in producers {
        producer.join().expect("producer thread");
    }
}
