use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::tempdir;

use conduit::logbuffer::descriptor::{LogBuffer, LogParams};
use conduit::logbuffer::{AppendOutcome, Appender};

const APPENDS_PER_ITER: usize = 10_000;

fn bench_offer(c: &mut Criterion) {
    let mut group = c.benchmark_group("offer");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let log = LogBuffer::create(
                        &dir.path().join("bench.logbuffer"),
                        LogParams {
                            term_length: 16 * 1024 * 1024,
                            initial_term_id: 0,
                            session_id: 1,
                            stream_id: 1,
                            mtu: 8192,
                        },
                    )
                    .expect("log");
                    log.meta().pub_limit.store(u64::MAX, Ordering::Release);
                    let appender = Appender::new(Arc::clone(&log));
                    let payload = vec![0u8; size];
                    (dir, log, appender, payload)
                },
                |(_dir, _log, appender, payload)| {
                    for _ in 0..APPENDS_PER_ITER {
                        match appender.append(black_box(&payload)).expect("append") {
                            AppendOutcome::Appended(_) | AppendOutcome::AdminAction => {}
                            other => panic!("unexpected outcome: {other:?}"),
                        }
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_offer);
criterion_main!(benches);
