use approx::assert_abs_diff_eq;
use bandmix::stats::{StatisticsOptions, compute_statistics};
use bandmix::transform::{
    Direction, IcaConfig, IcaEngine, MatrixTransformApplier, MnfConfig, MnfEngine, PcaConfig,
    PcaEngine, PcaParameters, TransformationMatrix,
};
use bandmix::{
    JobConfig, PassObserver, PassStage, Raster, SchedulerConfig, SplitStrategy, TileScheduler,
    TransformError, TransformKind,
};
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Three correlated bands driven by two latent factors plus small Gaussian noise.
fn correlated_raster(width: usize, height: usize, seed: u64) -> Raster {
    let mut rng = StdRng::seed_from_u64(seed);
    let latent = Normal::new(0.0, 1.0).unwrap();
    let jitter = Normal::new(0.0, 0.05).unwrap();
    let pixels: Vec<Vec<f64>> = (0..width * height)
        .map(|_| {
            let a = latent.sample(&mut rng);
            let b = latent.sample(&mut rng);
            vec![
                50.0 + 4.0 * a + jitter.sample(&mut rng),
                20.0 + 2.0 * a + 1.0 * b + jitter.sample(&mut rng),
                -5.0 + 0.5 * a - 3.0 * b + jitter.sample(&mut rng),
            ]
        })
        .collect();
    Raster::from_pixels(width, height, &pixels).unwrap()
}

fn scheduler(threads: usize, strategy: SplitStrategy) -> TileScheduler {
    TileScheduler::new(&SchedulerConfig {
        threads: Some(threads),
        memory_budget_bytes: Some(4096),
        strategy,
    })
    .unwrap()
}

fn assert_rasters_close(lhs: &Raster, rhs: &Raster, tol: f64) {
    assert_eq!(lhs.bands(), rhs.bands());
    assert_eq!(lhs.n_pixels(), rhs.n_pixels());
    for (a, b) in lhs.as_slice().iter().zip(rhs.as_slice()) {
        assert_abs_diff_eq!(a, b, epsilon = tol);
    }
}

#[test]
fn statistics_match_a_direct_computation_for_any_split() {
    init_logging();
    let raster = correlated_raster(37, 23, 11);
    let pixels = raster.to_pixel_matrix();
    let n = pixels.nrows() as f64;
    let mean = pixels.mean_axis(Axis(0)).unwrap();
    let centered = &pixels - &mean;
    let expected_cov = centered.t().dot(&centered) / (n - 1.0);

    for sched in [
        scheduler(1, SplitStrategy::Stripes),
        scheduler(3, SplitStrategy::Stripes),
        scheduler(4, SplitStrategy::Tiles { tile_size: 5 }),
        scheduler(8, SplitStrategy::Tiles { tile_size: 64 }),
    ] {
        let stats = compute_statistics(&sched, &raster, &StatisticsOptions::default()).unwrap();
        assert_eq!(stats.relevant_pixels, raster.n_pixels() as u64);
        let got_mean = stats.mean().unwrap();
        let got_cov = stats.covariance().unwrap();
        for b in 0..3 {
            assert_abs_diff_eq!(got_mean[b], mean[b], epsilon = 1e-9);
            for c in 0..3 {
                assert_abs_diff_eq!(got_cov[(b, c)], expected_cov[(b, c)], epsilon = 1e-8);
            }
        }
    }
}

#[test]
fn pca_reconstruction_does_not_depend_on_the_split() {
    init_logging();
    let raster = correlated_raster(31, 19, 3);
    let config = PcaConfig {
        components: Some(2),
        ..PcaConfig::default()
    };

    let mut reconstructions = Vec::new();
    for sched in [
        scheduler(1, SplitStrategy::Stripes),
        scheduler(6, SplitStrategy::Tiles { tile_size: 4 }),
    ] {
        let mut engine = PcaEngine::new(config.clone(), &sched);
        let components = engine.forward(&raster).unwrap();
        assert_eq!(components.bands(), 2);
        reconstructions.push(engine.reverse(&components).unwrap());
    }
    assert_rasters_close(&reconstructions[0], &reconstructions[1], 1e-8);

    // Two latent factors explain almost everything, so two components reconstruct well.
    let error = reconstructions[0]
        .as_slice()
        .iter()
        .zip(raster.as_slice())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0_f64, f64::max);
    assert!(error < 0.5, "max reconstruction error {error}");
}

#[test]
fn pca_full_rank_round_trip_with_standardization() {
    init_logging();
    let raster = correlated_raster(24, 24, 5);
    let config = PcaConfig {
        use_variance: true,
        whiten: true,
        ..PcaConfig::default()
    };
    let sched = scheduler(4, SplitStrategy::Stripes);
    let mut engine = PcaEngine::new(config, &sched);
    let components = engine.forward(&raster).unwrap();
    let restored = engine.reverse(&components).unwrap();
    assert_rasters_close(&restored, &raster, 1e-8);

    let ratio = engine.explained_variance_ratio().unwrap();
    assert_abs_diff_eq!(ratio.sum(), 1.0, epsilon = 1e-12);
}

#[test]
fn more_components_than_bands_is_a_dimension_mismatch() {
    let raster = Raster::zeros(4, 4, 2).unwrap();
    let sched = scheduler(2, SplitStrategy::Stripes);
    let config = PcaConfig {
        components: Some(3),
        ..PcaConfig::default()
    };
    let err = PcaEngine::new(config, &sched).forward(&raster).unwrap_err();
    assert!(matches!(err, TransformError::DimensionMismatch { .. }));
}

#[test]
fn mnf_reverse_without_parameters_is_missing() {
    let raster = correlated_raster(8, 8, 1);
    let sched = scheduler(2, SplitStrategy::Stripes);
    let err = MnfEngine::new(MnfConfig::default(), &sched)
        .reverse(&raster)
        .unwrap_err();
    assert!(matches!(err, TransformError::MissingParameter(_)));
}

#[test]
fn mnf_full_rank_round_trip_with_estimated_noise() {
    init_logging();
    let raster = correlated_raster(20, 16, 8);
    let sched = scheduler(3, SplitStrategy::Tiles { tile_size: 6 });
    let mut engine = MnfEngine::new(MnfConfig::default(), &sched);
    let components = engine.forward(&raster).unwrap();
    assert_eq!(components.bands(), 3);
    let snr = engine.eigenvalues().unwrap();
    assert!(snr[0] >= snr[1] && snr[1] >= snr[2]);

    let restored = engine.reverse(&components).unwrap();
    assert_rasters_close(&restored, &raster, 1e-7);
}

#[test]
fn ica_recovers_uniform_sources_and_inverts() {
    init_logging();
    let (width, height) = (48, 40);
    let mut rng = StdRng::seed_from_u64(29);
    let uniform = Uniform::new(-1.0, 1.0);
    let sources: Vec<[f64; 2]> = (0..width * height)
        .map(|_| [uniform.sample(&mut rng), uniform.sample(&mut rng)])
        .collect();
    let pixels: Vec<Vec<f64>> = sources
        .iter()
        .map(|[s0, s1]| vec![3.0 + s0 + 0.6 * s1, -1.0 + 0.4 * s0 - s1])
        .collect();
    let raster = Raster::from_pixels(width, height, &pixels).unwrap();

    let sched = scheduler(4, SplitStrategy::Stripes);
    let config = IcaConfig {
        iterations: 100,
        ..IcaConfig::default()
    };
    let mut engine = IcaEngine::new(config, &sched);
    let unmixed = engine.forward(&raster).unwrap();
    assert!(engine.iterations_run() >= 1);

    let source_band = |k: usize| -> Vec<f64> { sources.iter().map(|s| s[k]).collect() };
    for k in 0..2 {
        let truth = source_band(k);
        let best = (0..2)
            .map(|c| abs_correlation(&unmixed.band(c), &truth))
            .fold(0.0_f64, f64::max);
        assert!(best > 0.95, "source {k} recovered with correlation {best}");
    }

    let restored = engine.reverse(&unmixed).unwrap();
    assert_rasters_close(&restored, &raster, 1e-8);
}

fn abs_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
    let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
    let vb: f64 = b.iter().map(|y| (y - mb).powi(2)).sum();
    (cov / (va * vb).sqrt()).abs()
}

#[test]
fn identity_matrix_copies_pixels_exactly() {
    let raster = correlated_raster(9, 7, 2);
    let sched = scheduler(3, SplitStrategy::Tiles { tile_size: 2 });
    let applier = MatrixTransformApplier::new(&sched);
    for direction in [Direction::Forward, Direction::Reverse] {
        let identity = TransformationMatrix::new(Array2::eye(3), direction);
        let out = applier.apply(&raster, &identity).unwrap();
        assert_eq!(out, raster);
    }
}

#[test]
fn applier_matches_a_dense_product() {
    let raster = correlated_raster(6, 5, 4);
    let matrix = Array2::from_shape_vec((2, 3), vec![1.0, -2.0, 0.5, 0.0, 3.0, 1.0]).unwrap();
    let sched = scheduler(2, SplitStrategy::Tiles { tile_size: 3 });
    let out = MatrixTransformApplier::new(&sched)
        .apply(&raster, &TransformationMatrix::forward(matrix.clone()))
        .unwrap();
    let expected = raster.to_pixel_matrix().dot(&matrix.t());
    assert_eq!(out.bands(), 2);
    for (p, row) in expected.outer_iter().enumerate() {
        let (x, y) = (p % raster.width(), p / raster.width());
        for b in 0..2 {
            assert_abs_diff_eq!(out.pixel(x, y)[b], row[b], epsilon = 1e-12);
        }
    }
}

#[test]
fn saved_parameters_transform_a_second_raster_identically() {
    let first = correlated_raster(16, 12, 21);
    let second = correlated_raster(10, 10, 22);
    let sched = scheduler(2, SplitStrategy::Stripes);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pca.toml");

    let mut trained = PcaEngine::new(PcaConfig::default(), &sched);
    trained.forward(&first).unwrap();
    trained.parameters().save(&path).unwrap();
    let expected = trained.forward(&second).unwrap();

    let mut reloaded = PcaEngine::new(PcaConfig::default(), &sched)
        .with_parameters(PcaParameters::load(&path).unwrap());
    let got = reloaded.forward(&second).unwrap();
    assert_rasters_close(&got, &expected, 1e-9);
}

#[test]
fn job_config_file_drives_an_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.toml");
    std::fs::write(
        &path,
        r#"
transform = "pca"
direction = "forward"

[scheduler]
threads = 2

[scheduler.strategy]
kind = "tiles"
tile_size = 3

[pca]
components = 1
whiten = true
"#,
    )
    .unwrap();

    let job = JobConfig::load(&path).unwrap();
    assert_eq!(job.transform, TransformKind::Pca);
    assert_eq!(job.direction, Direction::Forward);
    let sched = TileScheduler::new(&job.scheduler).unwrap();
    assert_eq!(sched.threads(), 2);

    let raster = correlated_raster(12, 9, 13);
    let mut engine = PcaEngine::new(job.pca.clone(), &sched);
    let out = engine.forward(&raster).unwrap();
    assert_eq!(out.bands(), 1);

    let stats = compute_statistics(&sched, &out, &StatisticsOptions::default()).unwrap();
    assert_abs_diff_eq!(stats.covariance().unwrap()[(0, 0)], 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(stats.mean().unwrap()[0], 0.0, epsilon = 1e-9);
}

#[derive(Default)]
struct CountingObserver {
    passes: AtomicUsize,
    regions: AtomicUsize,
    finished: AtomicUsize,
}

impl PassObserver for CountingObserver {
    fn on_pass_start(&self, _stage: PassStage, total_regions: usize) {
        self.passes.fetch_add(1, Ordering::SeqCst);
        self.regions.fetch_add(total_regions, Ordering::SeqCst);
    }

    fn on_region_done(&self, _stage: PassStage) {
        self.regions.fetch_sub(1, Ordering::SeqCst);
    }

    fn on_pass_finish(&self, _stage: PassStage) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn observer_sees_every_region_of_every_pass() {
    let observer = Arc::new(CountingObserver::default());
    let sched = scheduler(3, SplitStrategy::Tiles { tile_size: 4 }).with_observer(observer.clone());
    let raster = correlated_raster(13, 11, 7);
    let mut engine = PcaEngine::new(PcaConfig::default(), &sched);
    engine.forward(&raster).unwrap();

    // One statistics pass and one apply pass.
    assert_eq!(observer.passes.load(Ordering::SeqCst), 2);
    assert_eq!(observer.finished.load(Ordering::SeqCst), 2);
    assert_eq!(observer.regions.load(Ordering::SeqCst), 0);
}

#[test]
fn ignored_values_do_not_shift_the_mean() {
    let mut raster = correlated_raster(8, 8, 17);
    let clean = compute_statistics(
        &scheduler(1, SplitStrategy::Stripes),
        &raster,
        &StatisticsOptions::default(),
    )
    .unwrap();

    // Append a row of fill values by building a taller raster.
    let mut data = raster.clone().into_vec();
    data.extend(std::iter::repeat_n(-9999.0, 8 * 3));
    raster = Raster::from_vec(8, 9, 3, data).unwrap();
    let options = StatisticsOptions {
        ignore_value: Some(-9999.0),
        ..StatisticsOptions::default()
    };
    let masked = compute_statistics(&scheduler(2, SplitStrategy::Stripes), &raster, &options).unwrap();
    assert_eq!(masked.ignored_user_pixels, 8);
    let expected: &Array1<f64> = clean.mean().unwrap();
    for (a, b) in masked.mean().unwrap().iter().zip(expected) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
}
