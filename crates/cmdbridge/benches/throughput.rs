use cmdbridge::{
    Bridge, ChannelConfig, CommandId, Flags, Module, RunningFlag, StaticOptions, WriterChannel,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

const WORDS: u64 = 1_000_000;
const COMMANDS: u64 = 100_000;
const DATA_CAPACITY: usize = 1 << 16;

fn bench_data_words(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_words");
    group.throughput(Throughput::Elements(WORDS));

    group.bench_function("spsc_push_pull", |b| {
        b.iter(|| {
            let config = ChannelConfig::with_capacities(16, DATA_CAPACITY);
            let (mut w, mut r) = WriterChannel::anonymous_pair(&config).unwrap();

            let producer = thread::spawn(move || {
                let mut sent = 0u64;
                while sent < WORDS {
                    if w.data.push(sent as u32).is_ok() {
                        sent += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            });

            let mut received = 0u64;
            while received < WORDS {
                match r.data.pull() {
                    Some(word) => {
                        black_box(word);
                        received += 1;
                    }
                    None => std::hint::spin_loop(),
                }
            }

            producer.join().unwrap();
        });
    });

    group.finish();
}

fn bench_blobs(c: &mut Criterion) {
    let mut group = c.benchmark_group("blobs");

    for size in [16usize, 256, 4096] {
        let count = 100_000u64;
        group.throughput(Throughput::Bytes(count * size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let config = ChannelConfig::with_capacities(16, DATA_CAPACITY);
                let (mut w, mut r) = WriterChannel::anonymous_pair(&config).unwrap();
                let payload = vec![0xA5u8; size];

                let producer = thread::spawn(move || {
                    let mut sent = 0u64;
                    while sent < count {
                        if w.data.push_blob(&payload).is_ok() {
                            sent += 1;
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                });

                let mut received = 0u64;
                while received < count {
                    match r.data.pull_blob_with(|bytes| black_box(bytes.len())) {
                        Some(_) => received += 1,
                        None => std::hint::spin_loop(),
                    }
                }

                producer.join().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_commands(c: &mut Criterion) {
    let mut group = c.benchmark_group("commands");
    group.throughput(Throughput::Elements(COMMANDS));

    // Same thread writes and reads through a loopback bridge, so the cost
    // measured is framing plus locking rather than cross-core traffic.
    group.bench_function("loopback_issue_read", |b| {
        let bridge = Bridge::<Module>::loopback(
            &ChannelConfig::with_capacities(1024, DATA_CAPACITY),
            Arc::new(StaticOptions::default()),
            RunningFlag::new(true),
        )
        .unwrap();

        b.iter(|| {
            for i in 0..COMMANDS {
                bridge
                    .issue(CommandId::user(1), i, Flags::NONE, |cmd| {
                        cmd.send_many([i as u32, 0, 0, 0])
                    })
                    .unwrap();
                let header = bridge.pop_front().unwrap();
                black_box(header);
                for _ in 0..4 {
                    black_box(bridge.get_data().unwrap());
                }
            }
        });
    });

    group.bench_function("loopback_batch_64", |b| {
        let bridge = Bridge::<Module>::loopback(
            &ChannelConfig::with_capacities(1024, DATA_CAPACITY),
            Arc::new(StaticOptions::default()),
            RunningFlag::new(true),
        )
        .unwrap();

        b.iter(|| {
            for chunk in 0..COMMANDS / 64 {
                bridge.begin_batch().unwrap();
                for i in 0..64 {
                    bridge
                        .issue(CommandId::user(2), chunk * 64 + i, Flags::NONE, |cmd| {
                            cmd.send_data(i as u32)
                        })
                        .unwrap();
                }
                bridge.end_batch().unwrap();
                for _ in 0..64 {
                    black_box(bridge.pop_front().unwrap());
                    black_box(bridge.get_data().unwrap());
                }
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_data_words, bench_blobs, bench_commands);
criterion_main!(benches);
