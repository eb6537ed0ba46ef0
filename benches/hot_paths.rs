use criterion::{black_box, criterion_group, criterion_main, Criterion};
use potiron::field::catalog;
use potiron::field::normalize::Normalizer;
use potiron::histogram::HistogramBuffer;
use potiron::route::protocols::ProtocolTable;
use potiron::route::{KeyMode, KeyRouter};

fn dissector_lines(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            let (proto, tdport, udport) = if i % 4 == 0 {
                (17, String::new(), "53".to_string())
            } else {
                (6, format!("{}", 80 + (i % 16)), String::new())
            };
            format!(
                "{}.{:06} 60 {proto} 10.0.{}.{} 192.0.2.{} 64 0x00 {} {} {tdport} {udport} {} {} 255 255",
                1_704_067_200 + (i / 1000),
                i % 1_000_000,
                (i / 256) % 256,
                i % 256,
                i % 32,
                40_000 + (i % 2000),
                if proto == 17 { "40000" } else { "" },
                i * 1448,
                i * 7,
            )
        })
        .collect()
}

fn bench_normalize(c: &mut Criterion) {
    let normalizer = Normalizer::new(catalog::resolve_filter(&[]).unwrap());
    let lines = dissector_lines(1024);

    c.bench_function("normalize_1024_lines", |b| {
        b.iter(|| {
            for (i, line) in lines.iter().enumerate() {
                black_box(normalizer.normalize(i + 1, line).unwrap());
            }
        })
    });
}

fn bench_aggregate(c: &mut Criterion) {
    let normalizer = Normalizer::new(catalog::resolve_filter(&[]).unwrap());
    let router = KeyRouter::new(KeyMode::Combined, ProtocolTable::default());
    let records: Vec<_> = dissector_lines(1024)
        .iter()
        .enumerate()
        .map(|(i, line)| normalizer.normalize(i + 1, line).unwrap())
        .collect();

    c.bench_function("route_and_aggregate_1024_records", |b| {
        b.iter(|| {
            let mut buffer = HistogramBuffer::new();
            for record in &records {
                let prefix = router.route("honeypot-1", record).unwrap();
                buffer.record(&prefix, record);
            }
            black_box(buffer.into_batch())
        })
    });
}

criterion_group!(benches, bench_normalize, bench_aggregate);
criterion_main!(benches);
