use beamlink::acoustic::modulation::{demodulate, synthesize};
use beamlink::profile::BeamConfig;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_synthesis(c: &mut Criterion) {
    let config = BeamConfig::default().compile().expect("default beam config");
    let mut group = c.benchmark_group("parametric_synthesis");
    for size in [16usize, 128, 1024] {
        let frame: Vec<u8> = (0..size).map(|i| i as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("synthesize", size), &frame, |b, frame| {
            b.iter(|| synthesize(&config, black_box(frame)))
        });
        let wave = synthesize(&config, &frame);
        group.bench_with_input(BenchmarkId::new("demodulate", size), &wave, |b, wave| {
            b.iter(|| demodulate(black_box(&wave.samples), wave.samples_per_symbol))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_synthesis);
criterion_main!(benches);
