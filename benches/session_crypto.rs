use beamlink::e2e_common::establish_pair;
use beamlink::session::Session;
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};

fn bench_handshake(c: &mut Criterion) {
    c.bench_function("establish_pair", |b| {
        b.iter(|| establish_pair().expect("handshake"))
    });
}

fn bench_seal_open(c: &mut Criterion) {
    let (alice, bob): (Session, Session) = establish_pair().expect("handshake");
    let mut group = c.benchmark_group("session_crypto");
    for size in [64usize, 1024, 16 * 1024, 256 * 1024] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", size), &payload, |b, payload| {
            b.iter(|| alice.encrypt(black_box(payload)).expect("encrypt"))
        });
        group.bench_with_input(BenchmarkId::new("encrypt_decrypt", size), &payload, |b, payload| {
            b.iter_batched(
                || alice.encrypt(payload).expect("encrypt"),
                |sealed| bob.decrypt(black_box(&sealed)).expect("decrypt"),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_handshake, bench_seal_open);
criterion_main!(benches);
