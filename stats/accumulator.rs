use crate::error::{Result, TransformError};
use crate::progress::PassStage;
use crate::raster::{Raster, Region};
use crate::tiling::TileScheduler;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Switches for one statistics pass. Second-order statistics imply first-order ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsOptions {
    pub enable_min_max: bool,
    pub enable_first_order: bool,
    pub enable_second_order: bool,
    /// Bessel's correction `n / (n - 1)` on covariances.
    pub unbiased: bool,
    /// Skip pixels whose band sum is not finite.
    pub ignore_infinite: bool,
    /// Skip pixels whose every band equals this value.
    pub ignore_value: Option<f64>,
}

impl Default for StatisticsOptions {
    fn default() -> Self {
        Self {
            enable_min_max: true,
            enable_first_order: true,
            enable_second_order: true,
            unbiased: true,
            ignore_infinite: true,
            ignore_value: None,
        }
    }
}

/// Partial sums owned by exactly one worker thread during a pass.
#[derive(Clone, Debug)]
pub struct AccumulatorState {
    count: u64,
    ignored_infinite: u64,
    ignored_user: u64,
    sum: Vec<f64>,
    // Row-major bands × bands, only the upper triangle is filled during a pass.
    cross: Vec<f64>,
    min: Vec<f64>,
    max: Vec<f64>,
    component_sum: f64,
    component_sumsq: f64,
    scratch: Vec<f64>,
}

impl AccumulatorState {
    fn new(bands: usize) -> Self {
        Self {
            count: 0,
            ignored_infinite: 0,
            ignored_user: 0,
            sum: vec![0.0; bands],
            cross: vec![0.0; bands * bands],
            min: vec![f64::INFINITY; bands],
            max: vec![f64::NEG_INFINITY; bands],
            component_sum: 0.0,
            component_sumsq: 0.0,
            scratch: vec![0.0; bands],
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    fn accumulate_region(&mut self, raster: &Raster, region: &Region, pass: &PassSettings<'_>) {
        for pixel in raster.region_pixels(region) {
            self.accumulate_pixel(pixel, pass);
        }
    }

    fn accumulate_pixel(&mut self, pixel: &[f64], pass: &PassSettings<'_>) {
        let options = pass.options;
        if options.ignore_infinite && !pixel.iter().sum::<f64>().is_finite() {
            self.ignored_infinite += 1;
            return;
        }
        if let Some(ignored) = options.ignore_value {
            if pixel.iter().all(|&value| value == ignored) {
                self.ignored_user += 1;
                return;
            }
        }
        self.count += 1;

        if options.enable_min_max {
            for ((lo, hi), &value) in self.min.iter_mut().zip(self.max.iter_mut()).zip(pixel) {
                if value < *lo {
                    *lo = value;
                }
                if value > *hi {
                    *hi = value;
                }
            }
        }

        if !pass.first_order {
            return;
        }

        let centered: &[f64] = match pass.reference {
            Some(reference) => {
                for ((dst, &value), &center) in self.scratch.iter_mut().zip(pixel).zip(reference) {
                    *dst = value - center;
                }
                &self.scratch
            }
            None => pixel,
        };

        for (acc, &value) in self.sum.iter_mut().zip(centered) {
            *acc += value;
        }
        for &value in pixel {
            self.component_sum += value;
        }

        if options.enable_second_order {
            let bands = centered.len();
            for r in 0..bands {
                let xr = centered[r];
                let row = &mut self.cross[r * bands..(r + 1) * bands];
                for c in r..bands {
                    row[c] += xr * centered[c];
                }
            }
            for &value in pixel {
                self.component_sumsq += value * value;
            }
        }
    }

    fn merge(&mut self, other: &AccumulatorState) {
        self.count += other.count;
        self.ignored_infinite += other.ignored_infinite;
        self.ignored_user += other.ignored_user;
        for (acc, value) in self.sum.iter_mut().zip(&other.sum) {
            *acc += value;
        }
        for (acc, value) in self.cross.iter_mut().zip(&other.cross) {
            *acc += value;
        }
        for (acc, &value) in self.min.iter_mut().zip(&other.min) {
            *acc = acc.min(value);
        }
        for (acc, &value) in self.max.iter_mut().zip(&other.max) {
            *acc = acc.max(value);
        }
        self.component_sum += other.component_sum;
        self.component_sumsq += other.component_sumsq;
    }
}

struct PassSettings<'a> {
    options: &'a StatisticsOptions,
    first_order: bool,
    reference: Option<&'a [f64]>,
}

/// Output of [`StatisticsAccumulator::synthetize`].
///
/// Fields are `None` when the matching statistics were disabled for the pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BandStatistics {
    pub relevant_pixels: u64,
    pub ignored_infinite_pixels: u64,
    pub ignored_user_pixels: u64,
    pub unbiased: bool,
    pub component_mean: Option<f64>,
    pub component_correlation: Option<f64>,
    pub component_covariance: Option<f64>,
    pub sum: Option<Array1<f64>>,
    pub mean: Option<Array1<f64>>,
    pub min: Option<Array1<f64>>,
    pub max: Option<Array1<f64>>,
    pub covariance: Option<Array2<f64>>,
    /// Second moment `E[x · xᵗ]`.
    pub correlation: Option<Array2<f64>>,
}

impl BandStatistics {
    pub fn bands(&self) -> usize {
        self.mean
            .as_ref()
            .or(self.min.as_ref())
            .map(|values| values.len())
            .unwrap_or(0)
    }

    pub fn mean(&self) -> Result<&Array1<f64>> {
        self.mean
            .as_ref()
            .ok_or(TransformError::MissingParameter("mean (first-order statistics disabled)"))
    }

    pub fn covariance(&self) -> Result<&Array2<f64>> {
        self.covariance
            .as_ref()
            .ok_or(TransformError::MissingParameter("covariance (second-order statistics disabled)"))
    }

    pub fn variance(&self) -> Result<Array1<f64>> {
        Ok(self.covariance()?.diag().to_owned())
    }

    /// Per-band standard deviation; a band without variance cannot normalize data.
    pub fn std_dev(&self) -> Result<Array1<f64>> {
        let variance = self.variance()?;
        if let Some((band, &value)) = variance.iter().enumerate().find(|(_, v)| **v <= 0.0) {
            return Err(TransformError::DegenerateStatistics(format!(
                "band {band} has variance {value:e}; cannot normalize by standard deviation"
            )));
        }
        Ok(variance.mapv(f64::sqrt))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Open,
    Synthetized,
}

/// Streaming per-band statistics with an explicit `reset → accumulate → synthetize`
/// lifecycle.
///
/// Every `accumulate` call is one full pass over a raster; several calls between a
/// reset and a synthetize pool their samples. Once synthetized, the accumulator
/// refuses new samples until it is reset.
#[derive(Debug)]
pub struct StatisticsAccumulator {
    bands: usize,
    options: StatisticsOptions,
    reference_mean: Option<Vec<f64>>,
    partials: Vec<AccumulatorState>,
    phase: Phase,
}

impl StatisticsAccumulator {
    pub fn new(bands: usize, options: StatisticsOptions) -> Result<Self> {
        if bands == 0 {
            return Err(TransformError::invalid("statistics need at least one band"));
        }
        Ok(Self {
            bands,
            options,
            reference_mean: None,
            partials: Vec::new(),
            phase: Phase::Open,
        })
    }

    /// Centered mode: samples are accumulated relative to `mean`, which improves the
    /// conditioning of the covariance when the data sit far from the origin.
    pub fn with_reference_mean(mut self, mean: &Array1<f64>) -> Result<Self> {
        if mean.len() != self.bands {
            return Err(TransformError::mismatch("reference mean length", self.bands, mean.len()));
        }
        self.reference_mean = Some(mean.to_vec());
        Ok(self)
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn options(&self) -> &StatisticsOptions {
        &self.options
    }

    pub fn reset(&mut self) {
        self.partials.clear();
        self.phase = Phase::Open;
    }

    /// Number of per-thread partial states collected since the last reset.
    pub fn partial_count(&self) -> usize {
        self.partials.len()
    }

    pub fn accumulate(&mut self, scheduler: &TileScheduler, raster: &Raster) -> Result<()> {
        self.accumulate_stage(scheduler, raster, PassStage::Statistics)
    }

    pub fn accumulate_stage(
        &mut self,
        scheduler: &TileScheduler,
        raster: &Raster,
        stage: PassStage,
    ) -> Result<()> {
        if self.phase == Phase::Synthetized {
            return Err(TransformError::StaleAccumulator);
        }
        if raster.bands() != self.bands {
            return Err(TransformError::mismatch("raster band count", self.bands, raster.bands()));
        }

        let bands = self.bands;
        let pass = PassSettings {
            options: &self.options,
            first_order: self.options.enable_first_order || self.options.enable_second_order,
            reference: self.reference_mean.as_deref(),
        };
        let states = scheduler.accumulate(
            stage,
            raster,
            || AccumulatorState::new(bands),
            |state, raster, region| state.accumulate_region(raster, region, &pass),
        );
        log::trace!("{stage}: collected {} thread-local partials", states.len());
        self.partials.extend(states);
        Ok(())
    }

    /// Single-threaded reduction of every partial into the final statistics.
    pub fn synthetize(&mut self) -> Result<BandStatistics> {
        let bands = self.bands;
        let mut total = AccumulatorState::new(bands);
        for partial in &self.partials {
            total.merge(partial);
        }

        let n = total.count;
        if n == 0 {
            return Err(TransformError::EmptyData);
        }
        let n_f = n as f64;
        let first_order = self.options.enable_first_order || self.options.enable_second_order;
        let reference = self
            .reference_mean
            .as_ref()
            .map(|mean| Array1::from_vec(mean.clone()))
            .unwrap_or_else(|| Array1::zeros(bands));

        let regul = |count: f64| {
            if self.options.unbiased && count > 1.0 {
                count / (count - 1.0)
            } else {
                1.0
            }
        };

        let mut stats = BandStatistics {
            relevant_pixels: n,
            ignored_infinite_pixels: total.ignored_infinite,
            ignored_user_pixels: total.ignored_user,
            unbiased: self.options.unbiased,
            component_mean: None,
            component_correlation: None,
            component_covariance: None,
            sum: None,
            mean: None,
            min: None,
            max: None,
            covariance: None,
            correlation: None,
        };

        if self.options.enable_min_max {
            stats.min = Some(Array1::from_vec(total.min.clone()));
            stats.max = Some(Array1::from_vec(total.max.clone()));
        }

        if first_order {
            let centered_mean = Array1::from_vec(total.sum.clone()) / n_f;
            let mean = &centered_mean + &reference;
            stats.sum = Some(&mean * n_f);
            stats.mean = Some(mean);

            let scalars = n_f * bands as f64;
            let component_mean = total.component_sum / scalars;
            stats.component_mean = Some(component_mean);

            if self.options.enable_second_order {
                let mut moment = Array2::<f64>::zeros((bands, bands));
                for r in 0..bands {
                    for c in r..bands {
                        let value = total.cross[r * bands + c] / n_f;
                        moment[(r, c)] = value;
                        moment[(c, r)] = value;
                    }
                }

                let factor = regul(n_f);
                let covariance = Array2::from_shape_fn((bands, bands), |(r, c)| {
                    factor * (moment[(r, c)] - centered_mean[r] * centered_mean[c])
                });
                let correlation = Array2::from_shape_fn((bands, bands), |(r, c)| {
                    moment[(r, c)]
                        + centered_mean[r] * reference[c]
                        + reference[r] * centered_mean[c]
                        + reference[r] * reference[c]
                });
                stats.covariance = Some(covariance);
                stats.correlation = Some(correlation);

                let component_correlation = total.component_sumsq / scalars;
                stats.component_correlation = Some(component_correlation);
                stats.component_covariance = Some(
                    regul(scalars) * (component_correlation - component_mean * component_mean),
                );
            }
        }

        log::debug!(
            "Synthetized statistics over {} pixels ({} non-finite, {} user-ignored) from {} partials",
            n,
            total.ignored_infinite,
            total.ignored_user,
            self.partials.len()
        );
        self.phase = Phase::Synthetized;
        Ok(stats)
    }

    /// One complete pass over `raster`; the reset is implicit.
    pub fn compute(&mut self, scheduler: &TileScheduler, raster: &Raster) -> Result<BandStatistics> {
        self.reset();
        self.accumulate(scheduler, raster)?;
        self.synthetize()
    }
}

/// Convenience wrapper: fresh accumulator, one pass, one synthesis.
pub fn compute_statistics(
    scheduler: &TileScheduler,
    raster: &Raster,
    options: &StatisticsOptions,
) -> Result<BandStatistics> {
    StatisticsAccumulator::new(raster.bands(), options.clone())?.compute(scheduler, raster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiling::{SchedulerConfig, SplitStrategy};
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn square_raster() -> Raster {
        Raster::from_pixels(
            2,
            2,
            &[vec![0.0, 0.0], vec![2.0, 0.0], vec![0.0, 2.0], vec![2.0, 2.0]],
        )
        .unwrap()
    }

    fn random_raster(width: usize, height: usize, bands: usize, seed: u64) -> Raster {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..width * height * bands)
            .map(|idx| 1000.0 + (idx % bands) as f64 * 3.0 + rng.gen_range(-5.0..5.0))
            .collect();
        Raster::from_vec(width, height, bands, data).unwrap()
    }

    fn scheduler(threads: usize, strategy: SplitStrategy) -> TileScheduler {
        TileScheduler::new(&SchedulerConfig {
            threads: Some(threads),
            memory_budget_bytes: Some(2048),
            strategy,
        })
        .unwrap()
    }

    #[test]
    fn four_pixel_square_has_known_moments() {
        let sched = TileScheduler::with_threads(2).unwrap();
        let stats = compute_statistics(&sched, &square_raster(), &StatisticsOptions::default()).unwrap();

        let mean = stats.mean().unwrap();
        assert_abs_diff_eq!(mean[0], 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(mean[1], 1.0, epsilon = 1e-15);
        let cov = stats.covariance().unwrap();
        assert_abs_diff_eq!(cov[(0, 0)], 4.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[(1, 1)], 4.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[(0, 1)], 0.0, epsilon = 1e-12);
        assert_eq!(stats.min.as_ref().unwrap().to_vec(), vec![0.0, 0.0]);
        assert_eq!(stats.max.as_ref().unwrap().to_vec(), vec![2.0, 2.0]);
        assert_eq!(stats.relevant_pixels, 4);
        assert_abs_diff_eq!(stats.sum.as_ref().unwrap()[0], 4.0, epsilon = 1e-12);
        let correlation = stats.correlation.as_ref().unwrap();
        assert_abs_diff_eq!(correlation[(0, 0)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(correlation[(0, 1)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn biased_estimator_divides_by_count() {
        let sched = TileScheduler::with_threads(1).unwrap();
        let options = StatisticsOptions {
            unbiased: false,
            ..StatisticsOptions::default()
        };
        let stats = compute_statistics(&sched, &square_raster(), &options).unwrap();
        assert_abs_diff_eq!(stats.covariance().unwrap()[(0, 0)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn results_do_not_depend_on_tiling_or_threads() {
        let raster = random_raster(37, 23, 4, 99);
        let options = StatisticsOptions::default();
        let reference = compute_statistics(&scheduler(1, SplitStrategy::Stripes), &raster, &options).unwrap();

        for sched in [
            scheduler(4, SplitStrategy::Stripes),
            scheduler(3, SplitStrategy::Tiles { tile_size: 5 }),
            scheduler(8, SplitStrategy::Tiles { tile_size: 16 }),
        ] {
            let stats = compute_statistics(&sched, &raster, &options).unwrap();
            for (a, b) in stats.mean().unwrap().iter().zip(reference.mean().unwrap().iter()) {
                assert!((a - b).abs() <= 1e-9 * b.abs().max(1.0));
            }
            for (a, b) in stats
                .covariance()
                .unwrap()
                .iter()
                .zip(reference.covariance().unwrap().iter())
            {
                assert!((a - b).abs() <= 1e-6 * b.abs().max(1.0), "{a} vs {b}");
            }
            assert_eq!(stats.min, reference.min);
            assert_eq!(stats.max, reference.max);
        }
    }

    #[test]
    fn centered_mode_matches_plain_accumulation() {
        let raster = random_raster(16, 16, 3, 5);
        let sched = TileScheduler::with_threads(3).unwrap();
        let plain = compute_statistics(&sched, &raster, &StatisticsOptions::default()).unwrap();

        let mut centered = StatisticsAccumulator::new(3, StatisticsOptions::default())
            .unwrap()
            .with_reference_mean(&ndarray::array![1000.0, 1003.0, 1006.0])
            .unwrap();
        let stats = centered.compute(&sched, &raster).unwrap();

        for (a, b) in stats.mean().unwrap().iter().zip(plain.mean().unwrap().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
        for (a, b) in stats.covariance().unwrap().iter().zip(plain.covariance().unwrap().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
        for (a, b) in stats.correlation.unwrap().iter().zip(plain.correlation.unwrap().iter()) {
            assert!((a - b).abs() <= 1e-9 * b.abs());
        }
    }

    #[test]
    fn non_finite_and_user_values_are_skipped_and_counted() {
        let raster = Raster::from_pixels(
            3,
            2,
            &[
                vec![1.0, 1.0],
                vec![f64::NAN, 2.0],
                vec![3.0, 3.0],
                vec![-9.0, -9.0],
                vec![f64::INFINITY, 0.0],
                vec![5.0, 5.0],
            ],
        )
        .unwrap();
        let options = StatisticsOptions {
            ignore_value: Some(-9.0),
            ..StatisticsOptions::default()
        };
        let stats = compute_statistics(&TileScheduler::with_threads(2).unwrap(), &raster, &options).unwrap();

        assert_eq!(stats.relevant_pixels, 3);
        assert_eq!(stats.ignored_infinite_pixels, 2);
        assert_eq!(stats.ignored_user_pixels, 1);
        assert_abs_diff_eq!(stats.mean().unwrap()[0], 3.0, epsilon = 1e-12);
        assert_eq!(stats.min.unwrap()[0], 1.0);
    }

    #[test]
    fn a_pass_without_relevant_pixels_is_empty() {
        let raster = Raster::from_vec(2, 1, 1, vec![f64::NAN, f64::INFINITY]).unwrap();
        let err = compute_statistics(
            &TileScheduler::with_threads(1).unwrap(),
            &raster,
            &StatisticsOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::EmptyData));
    }

    #[test]
    fn synthetize_without_accumulate_is_empty() {
        let mut acc = StatisticsAccumulator::new(2, StatisticsOptions::default()).unwrap();
        assert!(matches!(acc.synthetize(), Err(TransformError::EmptyData)));
    }

    #[test]
    fn accumulating_after_synthesis_requires_a_reset() {
        let sched = TileScheduler::with_threads(2).unwrap();
        let raster = square_raster();
        let mut acc = StatisticsAccumulator::new(2, StatisticsOptions::default()).unwrap();
        acc.accumulate(&sched, &raster).unwrap();
        acc.synthetize().unwrap();

        let err = acc.accumulate(&sched, &raster).unwrap_err();
        assert!(matches!(err, TransformError::StaleAccumulator));

        acc.reset();
        acc.accumulate(&sched, &raster).unwrap();
        assert_eq!(acc.synthetize().unwrap().relevant_pixels, 4);
    }

    #[test]
    fn several_passes_pool_their_samples() {
        let sched = TileScheduler::with_threads(2).unwrap();
        let top = Raster::from_pixels(2, 1, &[vec![0.0, 0.0], vec![2.0, 0.0]]).unwrap();
        let bottom = Raster::from_pixels(2, 1, &[vec![0.0, 2.0], vec![2.0, 2.0]]).unwrap();
        let mut acc = StatisticsAccumulator::new(2, StatisticsOptions::default()).unwrap();
        acc.accumulate(&sched, &top).unwrap();
        acc.accumulate(&sched, &bottom).unwrap();
        let stats = acc.synthetize().unwrap();
        assert_eq!(stats.relevant_pixels, 4);
        assert_abs_diff_eq!(stats.covariance().unwrap()[(1, 1)], 4.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn band_count_mismatch_is_rejected() {
        let mut acc = StatisticsAccumulator::new(3, StatisticsOptions::default()).unwrap();
        let err = acc
            .accumulate(&TileScheduler::with_threads(1).unwrap(), &square_raster())
            .unwrap_err();
        assert!(matches!(err, TransformError::DimensionMismatch { .. }));
    }

    #[test]
    fn zero_variance_band_cannot_be_normalized() {
        let raster = Raster::from_pixels(2, 1, &[vec![1.0, 5.0], vec![3.0, 5.0]]).unwrap();
        let stats = compute_statistics(
            &TileScheduler::with_threads(1).unwrap(),
            &raster,
            &StatisticsOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            stats.std_dev(),
            Err(TransformError::DegenerateStatistics(_))
        ));
    }

    #[test]
    fn disabled_second_order_leaves_covariance_unset() {
        let options = StatisticsOptions {
            enable_second_order: false,
            ..StatisticsOptions::default()
        };
        let stats = compute_statistics(&TileScheduler::with_threads(1).unwrap(), &square_raster(), &options).unwrap();
        assert!(stats.mean.is_some());
        assert!(matches!(
            stats.covariance(),
            Err(TransformError::MissingParameter(_))
        ));
    }

    #[test]
    fn component_statistics_pool_every_sample() {
        let stats = compute_statistics(
            &TileScheduler::with_threads(1).unwrap(),
            &square_raster(),
            &StatisticsOptions::default(),
        )
        .unwrap();
        // Samples: 0,0,2,0,0,2,2,2 -> mean 1, E[x²] = 2, unbiased variance 8/7.
        assert_abs_diff_eq!(stats.component_mean.unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.component_correlation.unwrap(), 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.component_covariance.unwrap(), 8.0 / 7.0, epsilon = 1e-12);
    }
}
