use criterion::{black_box, BatchSize, Criterion};
use criterion::{criterion_group, criterion_main};
use std::time::Duration;
use tempfile::tempdir;

use conduit::client::{Client, ClientContext, Offer};
use conduit::driver::{DriverConfig, MediaDriver};

const MESSAGES_PER_ITER: usize = 1_000;

/// Full-stack IPC round trip: embedded driver, publication, subscription.
fn bench_ipc_round_trip(c: &mut Criterion) {
    c.bench_function("ipc_round_trip_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().expect("tempdir");
                let config = DriverConfig {
                    term_length: 4 * 1024 * 1024,
                    ..DriverConfig::with_dir(dir.path())
                };
                let driver = MediaDriver::launch(config).expect("driver");
                let client =
                    Client::connect(ClientContext::with_dir(dir.path())).expect("client");
                let subscription = client.add_subscription("ipc:bench", 1).expect("sub");
                let publication = client.add_publication("ipc:bench", 1).expect("pub");
                (dir, driver, client, subscription, publication)
            },
            |(_dir, _driver, _client, mut subscription, mut publication)| {
                let payload = [0u8; 128];
                let mut received = 0usize;
                let mut sent = 0usize;
                while received < MESSAGES_PER_ITER {
                    if sent < MESSAGES_PER_ITER {
                        match publication.offer(black_box(&payload)).expect("offer") {
                            Offer::Position(_) => sent += 1,
                            Offer::Closed => panic!("closed"),
                            _ => std::thread::sleep(Duration::from_micros(10)),
                        }
                    }
                    subscription
                        .poll(&mut |_, _| received += 1, 64)
                        .expect("poll");
                }
            },
            BatchSize::PerIteration,
        );
    });
}

criterion_group!(benches, bench_ipc_round_trip);
criterion_main!(benches);
