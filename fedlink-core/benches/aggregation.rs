use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fedlink_core::aggregation::{
    Aggregator, Contribution, Elastic, Ingestion, Naive, Parameter, Parameters, Payload, IMPORTANCE, PARAM,
};
use fedlink_core::info::{TaskInfo, TRAIN_INSTANCES};

const PARAM_LENS: &[usize] = &[1_000, 100_000];
const CONTRIBUTORS: usize = 16;

fn contribution(len: usize, seed: usize) -> Contribution {
    let mut payload = Payload::new();
    payload.insert(PARAM.into(), (0..len).map(|i| ((i + seed) % 17) as f32).collect());
    payload.insert(IMPORTANCE.into(), (0..len).map(|i| ((i * seed) % 5) as f32).collect());
    let mut c = Contribution::new();
    c.insert("w".into(), payload);
    c
}

fn current(len: usize) -> Parameters {
    let mut p = Parameters::new();
    p.insert("w".into(), Parameter::trainable(vec![0.0; len]));
    p
}

/// Ingest a full round and finalize it, per ingestion mode
fn bench_round(c: &mut Criterion) {
    let mut group = c.benchmark_group("round");
    let info = TaskInfo::new().with(TRAIN_INSTANCES, 64i64);

    for &len in PARAM_LENS {
        let contributions: Vec<_> = (0..CONTRIBUTORS).map(|s| contribution(len, s + 1)).collect();
        let params = current(len);
        group.throughput(Throughput::Elements((len * CONTRIBUTORS) as u64));

        for (name, ingestion) in [("merge", Ingestion::Merge), ("stack", Ingestion::Stack)] {
            group.bench_with_input(BenchmarkId::new(name, len), &len, |b, _| {
                b.iter(|| {
                    let mut agg = Aggregator::new(Naive, ingestion);
                    for c in &contributions {
                        agg.ingest(black_box(c), &info, &params).unwrap();
                    }
                    black_box(agg.finalize(&params).unwrap());
                });
            });
        }
    }
    group.finish();
}

/// Finalization cost of the importance-weighted policy alone
fn bench_elastic_finalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("elastic_finalize");
    let info = TaskInfo::new().with(TRAIN_INSTANCES, 64i64);

    for &len in PARAM_LENS {
        let params = current(len);
        let mut agg = Aggregator::new(Elastic::new(0.5).unwrap(), Ingestion::Merge);
        for s in 0..CONTRIBUTORS {
            agg.ingest(&contribution(len, s + 1), &info, &params).unwrap();
        }
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| black_box(agg.finalize(black_box(&params)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_round, bench_elastic_finalize);
criterion_main!(benches);
