use bandmix::stats::{StatisticsOptions, compute_statistics};
use bandmix::transform::{MatrixTransformApplier, TransformationMatrix};
use bandmix::{Raster, SchedulerConfig, SplitStrategy, TileScheduler};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_raster(side: usize, bands: usize) -> Raster {
    let mut rng = StdRng::seed_from_u64(0xBA4D_0001 + side as u64);
    let data = (0..side * side * bands).map(|_| rng.sample(Standard)).collect();
    Raster::from_vec(side, side, bands, data).expect("raster shape")
}

fn scheduler(strategy: SplitStrategy) -> TileScheduler {
    TileScheduler::new(&SchedulerConfig {
        threads: None,
        memory_budget_bytes: None,
        strategy,
    })
    .expect("thread pool")
}

fn benchmark_statistics(c: &mut Criterion) {
    let bands = 8;
    let strategies = [
        ("stripes", SplitStrategy::Stripes),
        ("tiles64", SplitStrategy::Tiles { tile_size: 64 }),
    ];

    let mut group = c.benchmark_group("band_statistics");
    for side in [256_usize, 512] {
        let raster = random_raster(side, bands);
        group.throughput(Throughput::Elements((side * side) as u64));
        for (name, strategy) in strategies {
            let sched = scheduler(strategy);
            group.bench_with_input(BenchmarkId::new(name, side), &raster, |b, input| {
                b.iter(|| {
                    let stats =
                        compute_statistics(&sched, black_box(input), &StatisticsOptions::default())
                            .expect("statistics");
                    black_box(stats);
                });
            });
        }
    }
    group.finish();
}

fn benchmark_apply(c: &mut Criterion) {
    let bands = 8;
    let sched = scheduler(SplitStrategy::Stripes);
    let applier = MatrixTransformApplier::new(&sched);
    let mut rng = StdRng::seed_from_u64(7);
    let matrix = TransformationMatrix::forward(Array2::from_shape_fn((4, bands), |_| {
        rng.sample(Standard)
    }));

    let mut group = c.benchmark_group("matrix_apply");
    for side in [256_usize, 512] {
        let raster = random_raster(side, bands);
        group.throughput(Throughput::Elements((side * side) as u64));
        group.bench_with_input(BenchmarkId::new("4x8", side), &raster, |b, input| {
            b.iter(|| {
                let out = applier.apply(black_box(input), &matrix).expect("apply");
                black_box(out);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_statistics, benchmark_apply);
criterion_main!(benches);
