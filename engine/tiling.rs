use crate::error::{Result, TransformError};
use crate::progress::{NoopPassObserver, PassObserver, PassStage};
use crate::raster::{Raster, Region};
use core::fmt;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::sync::Arc;
use thread_local::ThreadLocal;

pub const DEFAULT_MEMORY_BUDGET_BYTES: usize = 256 * 1024 * 1024;
const MEMORY_BUDGET_ENV: &str = "BANDMIX_MEMORY_BUDGET_BYTES";

/// Memory budget for one streaming pass, honouring `BANDMIX_MEMORY_BUDGET_BYTES`.
/// A value of zero lifts the limit.
pub fn memory_budget_bytes() -> usize {
    match std::env::var(MEMORY_BUDGET_ENV) {
        Ok(value) => match value.parse::<u64>() {
            Ok(0) => usize::MAX,
            Ok(parsed) => usize::try_from(parsed).unwrap_or(usize::MAX),
            Err(_) => DEFAULT_MEMORY_BUDGET_BYTES,
        },
        Err(_) => DEFAULT_MEMORY_BUDGET_BYTES,
    }
}

/// How the pixel domain is cut into regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SplitStrategy {
    /// Full-width row stripes sized to the memory budget.
    Stripes,
    /// Square tiles on a fixed grid; edge tiles are clipped.
    Tiles { tile_size: usize },
}

impl Default for SplitStrategy {
    fn default() -> Self {
        Self::Stripes
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker count; `None` uses every available CPU.
    pub threads: Option<usize>,
    /// Bytes of pixel data a single pass may hold in flight; `None` reads the
    /// environment override or falls back to the default.
    pub memory_budget_bytes: Option<usize>,
    pub strategy: SplitStrategy,
}

/// Splits rasters into disjoint regions and runs per-region work on a fixed pool.
///
/// Every pass is a barrier: `accumulate` and `for_each_region_mut` only return once
/// every region has been processed. Regions are visited exactly once per pass, in no
/// particular order.
#[derive(Clone)]
pub struct TileScheduler {
    pool: Arc<ThreadPool>,
    threads: usize,
    memory_budget: usize,
    strategy: SplitStrategy,
    observer: Arc<dyn PassObserver>,
}

impl fmt::Debug for TileScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileScheduler")
            .field("threads", &self.threads)
            .field("memory_budget", &self.memory_budget)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl TileScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let threads = config.threads.unwrap_or_else(num_cpus::get).max(1);
        if let SplitStrategy::Tiles { tile_size: 0 } = config.strategy {
            return Err(TransformError::invalid("tile size must be positive"));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("bandmix-worker-{idx}"))
            .build()
            .map_err(|err| TransformError::ThreadPool(err.to_string()))?;
        let memory_budget = config
            .memory_budget_bytes
            .unwrap_or_else(memory_budget_bytes)
            .max(1);
        Ok(Self {
            pool: Arc::new(pool),
            threads,
            memory_budget,
            strategy: config.strategy,
            observer: Arc::new(NoopPassObserver),
        })
    }

    pub fn with_threads(threads: usize) -> Result<Self> {
        Self::new(&SchedulerConfig {
            threads: Some(threads),
            ..SchedulerConfig::default()
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn PassObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn memory_budget(&self) -> usize {
        self.memory_budget
    }

    pub fn strategy(&self) -> SplitStrategy {
        self.strategy
    }

    /// Cuts a `width × height` raster of `bands` samples per pixel into a row-major
    /// grid of disjoint regions that covers it exactly.
    pub fn split(&self, width: usize, height: usize, bands: usize) -> Vec<Region> {
        if width == 0 || height == 0 {
            return Vec::new();
        }
        match self.strategy {
            SplitStrategy::Stripes => {
                let row_bytes = width
                    .saturating_mul(bands.max(1))
                    .saturating_mul(core::mem::size_of::<f64>());
                let per_worker = self.memory_budget / self.threads;
                let budget_rows = (per_worker / row_bytes.max(1)).max(1);
                let balanced_rows = height.div_ceil(self.threads).max(1);
                let rows = budget_rows.min(balanced_rows).min(height);
                (0..height)
                    .step_by(rows)
                    .map(|y| Region::new(0, y, width, rows.min(height - y)))
                    .collect()
            }
            SplitStrategy::Tiles { tile_size } => {
                let tile = tile_size.max(1);
                let mut regions = Vec::new();
                for y in (0..height).step_by(tile) {
                    for x in (0..width).step_by(tile) {
                        regions.push(Region::new(
                            x,
                            y,
                            tile.min(width - x),
                            tile.min(height - y),
                        ));
                    }
                }
                regions
            }
        }
    }

    /// Runs `work` over every region of `raster` with one lazily created state per
    /// worker thread, then returns the per-thread states once the pass completed.
    ///
    /// A state is only ever touched by the thread that created it.
    pub fn accumulate<S, I, F>(&self, stage: PassStage, raster: &Raster, init: I, work: F) -> Vec<S>
    where
        S: Send,
        I: Fn() -> S + Sync,
        F: Fn(&mut S, &Raster, &Region) + Sync,
    {
        let regions = self.split(raster.width(), raster.height(), raster.bands());
        log::debug!(
            "{stage}: {} regions over {} threads",
            regions.len(),
            self.threads
        );
        self.observer.on_pass_start(stage, regions.len());

        let states: ThreadLocal<RefCell<S>> = ThreadLocal::with_capacity(self.threads);
        let observer = &self.observer;
        self.pool.install(|| {
            regions.par_iter().for_each(|region| {
                let cell = states.get_or(|| RefCell::new(init()));
                work(&mut cell.borrow_mut(), raster, region);
                observer.on_region_done(stage);
            });
        });

        self.observer.on_pass_finish(stage);
        states.into_iter().map(RefCell::into_inner).collect()
    }

    /// Hands every region of `output` its own disjoint row segments (each
    /// `region.width * bands` samples long) and runs `work` on them in parallel.
    pub fn for_each_region_mut<F>(&self, stage: PassStage, output: &mut Raster, work: F)
    where
        F: Fn(&Region, &mut [&mut [f64]]) + Sync,
    {
        let width = output.width();
        let bands = output.bands();
        let regions = self.split(width, output.height(), bands);
        log::debug!(
            "{stage}: {} output regions over {} threads",
            regions.len(),
            self.threads
        );
        self.observer.on_pass_start(stage, regions.len());

        let row_len = width * bands;
        let mut jobs: Vec<(Region, Vec<&mut [f64]>)> = Vec::with_capacity(regions.len());
        let mut rest: &mut [f64] = output.as_mut_slice();
        let mut idx = 0;
        while idx < regions.len() {
            let stripe_y = regions[idx].y;
            let stripe_height = regions[idx].height;
            let mut end = idx;
            while end < regions.len() && regions[end].y == stripe_y {
                end += 1;
            }
            let (stripe, tail) = std::mem::take(&mut rest).split_at_mut(row_len * stripe_height);
            rest = tail;

            let group = &regions[idx..end];
            let mut segments: Vec<Vec<&mut [f64]>> = group
                .iter()
                .map(|region| Vec::with_capacity(region.height))
                .collect();
            for row in stripe.chunks_mut(row_len) {
                let mut row_rest = row;
                for (slot, region) in segments.iter_mut().zip(group) {
                    let (segment, tail) =
                        std::mem::take(&mut row_rest).split_at_mut(region.width * bands);
                    slot.push(segment);
                    row_rest = tail;
                }
            }
            jobs.extend(group.iter().copied().zip(segments));
            idx = end;
        }

        let observer = &self.observer;
        self.pool.install(|| {
            jobs.into_par_iter().for_each(|(region, mut rows)| {
                work(&region, &mut rows);
                observer.on_region_done(stage);
            });
        });

        self.observer.on_pass_finish(stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler(threads: usize, budget: usize, strategy: SplitStrategy) -> TileScheduler {
        TileScheduler::new(&SchedulerConfig {
            threads: Some(threads),
            memory_budget_bytes: Some(budget),
            strategy,
        })
        .expect("scheduler")
    }

    fn coverage(regions: &[Region], width: usize, height: usize) -> Vec<usize> {
        let mut hits = vec![0usize; width * height];
        for region in regions {
            for y in region.rows() {
                for x in region.x..region.x + region.width {
                    hits[y * width + x] += 1;
                }
            }
        }
        hits
    }

    #[test]
    fn stripes_cover_every_pixel_once() {
        let sched = scheduler(3, 64, SplitStrategy::Stripes);
        let regions = sched.split(7, 10, 2);
        assert!(regions.len() > 1);
        assert!(coverage(&regions, 7, 10).iter().all(|&hits| hits == 1));
    }

    #[test]
    fn stripes_give_every_worker_work_under_a_large_budget() {
        let sched = scheduler(4, usize::MAX, SplitStrategy::Stripes);
        let regions = sched.split(16, 16, 3);
        assert_eq!(regions.len(), 4);
    }

    #[test]
    fn tiles_cover_every_pixel_once_with_clipped_edges() {
        let sched = scheduler(2, 1 << 20, SplitStrategy::Tiles { tile_size: 4 });
        let regions = sched.split(10, 9, 1);
        assert_eq!(regions.len(), 9);
        assert!(coverage(&regions, 10, 9).iter().all(|&hits| hits == 1));
        assert!(regions.iter().any(|r| r.width == 2 && r.height == 1));
    }

    #[test]
    fn zero_tile_size_is_rejected() {
        let err = TileScheduler::new(&SchedulerConfig {
            strategy: SplitStrategy::Tiles { tile_size: 0 },
            ..SchedulerConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, TransformError::InvalidInput(_)));
    }

    #[derive(Default)]
    struct CountingObserver {
        started: AtomicUsize,
        regions: AtomicUsize,
        finished: AtomicUsize,
    }

    impl PassObserver for CountingObserver {
        fn on_pass_start(&self, _stage: PassStage, total_regions: usize) {
            self.started.fetch_add(total_regions, Ordering::SeqCst);
        }
        fn on_region_done(&self, _stage: PassStage) {
            self.regions.fetch_add(1, Ordering::SeqCst);
        }
        fn on_pass_finish(&self, _stage: PassStage) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn accumulate_visits_each_pixel_exactly_once() {
        let observer = Arc::new(CountingObserver::default());
        let sched = scheduler(4, 128, SplitStrategy::Tiles { tile_size: 3 })
            .with_observer(observer.clone());
        let raster = Raster::from_vec(11, 7, 1, vec![1.0; 77]).unwrap();

        let states = sched.accumulate(
            PassStage::Statistics,
            &raster,
            || 0usize,
            |count, raster, region| {
                *count += raster.region_pixels(region).count();
            },
        );

        assert!(!states.is_empty() && states.len() <= 4);
        assert_eq!(states.iter().sum::<usize>(), 77);
        let expected_regions = sched.split(11, 7, 1).len();
        assert_eq!(observer.started.load(Ordering::SeqCst), expected_regions);
        assert_eq!(observer.regions.load(Ordering::SeqCst), expected_regions);
        assert_eq!(observer.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn region_writes_land_on_their_own_pixels() {
        for strategy in [SplitStrategy::Stripes, SplitStrategy::Tiles { tile_size: 3 }] {
            let sched = scheduler(3, 96, strategy);
            let mut output = Raster::zeros(8, 5, 2).unwrap();
            sched.for_each_region_mut(PassStage::Apply, &mut output, |region, rows| {
                for (row_offset, row) in rows.iter_mut().enumerate() {
                    let y = region.y + row_offset;
                    for (col, pixel) in row.chunks_exact_mut(2).enumerate() {
                        let x = region.x + col;
                        pixel[0] = x as f64;
                        pixel[1] = y as f64;
                    }
                }
            });
            for y in 0..5 {
                for x in 0..8 {
                    assert_eq!(output.pixel(x, y), &[x as f64, y as f64]);
                }
            }
        }
    }
}
