#![deny(unused_variables)]
#![deny(unused_imports)]

use bandmix::transform::{
    ContrastKind, Direction, FixedPointRule, IcaEngine, IcaParameters, MnfEngine, MnfParameters,
    PcaEngine, PcaParameters,
};
use bandmix::{
    JobConfig, PassObserver, PassStage, Raster, SplitStrategy, TileScheduler, TransformError,
    TransformKind,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{path} holds {found} bytes but a {width}x{height}x{bands} f64 raster needs {expected}")]
    RasterSize {
        path: String,
        width: usize,
        height: usize,
        bands: usize,
        expected: usize,
        found: usize,
    },

    #[error("a {width}x{height}x{bands} f64 raster does not fit in addressable memory")]
    RasterTooLarge {
        width: usize,
        height: usize,
        bands: usize,
    },
}

#[derive(Parser)]
#[command(
    name = "bandmix",
    version,
    about = "Streaming PCA, MNF and ICA band transforms over raw f64 rasters."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Principal component analysis
    #[command(about = "Principal component analysis")]
    Pca {
        #[command(flatten)]
        common: CommonArgs,

        /// Divide by the per-band standard deviation after centering
        #[arg(long)]
        use_variance: bool,

        /// Scale components to unit variance
        #[arg(long)]
        whiten: bool,

        /// Do not center the bands before projecting
        #[arg(long)]
        no_normalize: bool,
    },

    /// Maximum noise fraction
    #[command(about = "Maximum noise fraction (components ranked by signal-to-noise ratio)")]
    Mnf {
        #[command(flatten)]
        common: CommonArgs,

        /// Raw noise raster on the same grid; estimated from local activity otherwise
        #[arg(long, value_name = "PATH")]
        noise: Option<PathBuf>,

        /// Window radius of the local-activity noise estimate
        #[arg(long, value_name = "R")]
        noise_radius: Option<usize>,

        /// Scale components to unit signal variance
        #[arg(long)]
        whiten: bool,
    },

    /// Independent component analysis
    #[command(about = "Independent component analysis (whitening PCA + fixed-point unmixing)")]
    Ica {
        #[command(flatten)]
        common: CommonArgs,

        /// Maximum number of fixed-point sweeps
        #[arg(long, value_name = "N")]
        iterations: Option<usize>,

        /// Convergence threshold on the L1 change of the unmixing matrix
        #[arg(long, value_name = "EPS")]
        threshold: Option<f64>,

        /// Step size of the fixed-point update
        #[arg(long)]
        mu: Option<f64>,

        #[arg(long, value_enum)]
        contrast: Option<ContrastCli>,

        #[arg(long, value_enum)]
        rule: Option<RuleCli>,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Raw little-endian f64 raster, band-interleaved by pixel
    #[arg(long, value_name = "PATH")]
    input: PathBuf,

    #[arg(long)]
    width: usize,

    #[arg(long)]
    height: usize,

    /// Band count of the input raster
    #[arg(long)]
    bands: usize,

    /// Where the transformed raster is written (same raw layout)
    #[arg(long, value_name = "PATH")]
    output: PathBuf,

    /// Job configuration (.toml); command-line flags take precedence
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// forward or reverse
    #[arg(long)]
    direction: Option<String>,

    /// Number of components to keep
    #[arg(long, value_name = "K")]
    components: Option<usize>,

    /// Parameters (.toml) saved by an earlier run
    #[arg(long, value_name = "PATH")]
    params_in: Option<PathBuf>,

    /// Save the estimated parameters (.toml)
    #[arg(long, value_name = "PATH")]
    params_out: Option<PathBuf>,

    /// Worker threads; defaults to every CPU
    #[arg(long)]
    threads: Option<usize>,

    /// Process square tiles of this size instead of row stripes
    #[arg(long, value_name = "PIXELS")]
    tile_size: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ContrastCli {
    Tanh,
    Cube,
    Gauss,
}

impl From<ContrastCli> for ContrastKind {
    fn from(value: ContrastCli) -> Self {
        match value {
            ContrastCli::Tanh => ContrastKind::Tanh,
            ContrastCli::Cube => ContrastKind::Cube,
            ContrastCli::Gauss => ContrastKind::Gauss,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum RuleCli {
    Newton,
    Plain,
}

impl From<RuleCli> for FixedPointRule {
    fn from(value: RuleCli) -> Self {
        match value {
            RuleCli::Newton => FixedPointRule::Newton,
            RuleCli::Plain => FixedPointRule::Plain,
        }
    }
}

/// Reports every streaming pass on a single stderr progress bar.
struct ProgressBarObserver {
    bar: ProgressBar,
}

impl ProgressBarObserver {
    fn new() -> Self {
        let draw_target = if io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} regions {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl PassObserver for ProgressBarObserver {
    fn on_pass_start(&self, stage: PassStage, total_regions: usize) {
        self.bar.reset();
        self.bar.set_length(total_regions as u64);
        self.bar.set_message(stage.describe());
    }

    fn on_region_done(&self, _stage: PassStage) {
        self.bar.inc(1);
    }

    fn on_pass_finish(&self, _stage: PassStage) {
        self.bar.finish_and_clear();
    }
}

/// Byte length of a raw `width × height × bands` f64 raster.
fn raster_byte_len(width: usize, height: usize, bands: usize) -> Result<usize, CliError> {
    width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(bands))
        .and_then(|n| n.checked_mul(std::mem::size_of::<f64>()))
        .ok_or(CliError::RasterTooLarge {
            width,
            height,
            bands,
        })
}

fn read_raw(path: &Path, width: usize, height: usize, bands: usize) -> Result<Raster, CliError> {
    let expected = raster_byte_len(width, height, bands)?;
    let file = File::open(path)?;
    // SAFETY: the file is opened read-only and not modified while mapped.
    let mmap = unsafe { Mmap::map(&file)? };
    if mmap.len() != expected {
        return Err(CliError::RasterSize {
            path: path.display().to_string(),
            width,
            height,
            bands,
            expected,
            found: mmap.len(),
        });
    }
    let mut data = Vec::with_capacity(expected / std::mem::size_of::<f64>());
    for chunk in mmap.chunks_exact(8) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        data.push(f64::from_le_bytes(bytes));
    }
    Ok(Raster::from_vec(width, height, bands, data)?)
}

fn write_raw(path: &Path, raster: &Raster) -> Result<(), CliError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for value in raster.as_slice() {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

fn apply_common_overrides(job: &mut JobConfig, common: &CommonArgs) -> Result<(), CliError> {
    if let Some(direction) = &common.direction {
        job.direction = direction.parse::<Direction>()?;
    }
    if let Some(threads) = common.threads {
        job.scheduler.threads = Some(threads);
    }
    if let Some(tile_size) = common.tile_size {
        job.scheduler.strategy = SplitStrategy::Tiles { tile_size };
    }
    if let Some(components) = common.components {
        job.pca.components = Some(components);
        job.mnf.components = Some(components);
        job.ica.components = Some(components);
    }
    Ok(())
}

fn run_pca(
    job: &JobConfig,
    common: &CommonArgs,
    scheduler: &TileScheduler,
    raster: &Raster,
) -> Result<Raster, CliError> {
    let mut engine = PcaEngine::new(job.pca.clone(), scheduler);
    if let Some(path) = &common.params_in {
        engine = engine.with_parameters(PcaParameters::load(path)?);
    }
    let output = match job.direction {
        Direction::Forward => engine.forward(raster)?,
        Direction::Reverse => engine.reverse(raster)?,
    };
    if let Some(values) = engine.eigenvalues() {
        log::info!("Eigenvalues: {values:.6e}");
    }
    if let Some(path) = &common.params_out {
        engine.parameters().save(path)?;
    }
    Ok(output)
}

fn run_mnf(
    job: &JobConfig,
    common: &CommonArgs,
    noise: Option<Raster>,
    scheduler: &TileScheduler,
    raster: &Raster,
) -> Result<Raster, CliError> {
    let mut engine = MnfEngine::new(job.mnf.clone(), scheduler);
    if let Some(noise) = noise {
        engine = engine.with_noise_raster(noise);
    }
    if let Some(path) = &common.params_in {
        engine = engine.with_parameters(MnfParameters::load(path)?);
    }
    let output = match job.direction {
        Direction::Forward => engine.forward(raster)?,
        Direction::Reverse => engine.reverse(raster)?,
    };
    if let Some(values) = engine.eigenvalues() {
        log::info!("Signal-to-noise ratios: {values:.6e}");
    }
    if let Some(path) = &common.params_out {
        engine.parameters().save(path)?;
    }
    Ok(output)
}

fn run_ica(
    job: &JobConfig,
    common: &CommonArgs,
    scheduler: &TileScheduler,
    raster: &Raster,
) -> Result<Raster, CliError> {
    let mut engine = IcaEngine::new(job.ica.clone(), scheduler);
    if let Some(path) = &common.params_in {
        engine = engine.with_parameters(IcaParameters::load(path)?);
    }
    let output = match job.direction {
        Direction::Forward => engine.forward(raster)?,
        Direction::Reverse => engine.reverse(raster)?,
    };
    if job.direction == Direction::Forward && engine.iterations_run() > 0 {
        log::info!(
            "ICA ran {} sweeps (converged: {})",
            engine.iterations_run(),
            engine.converged()
        );
    }
    if let Some(path) = &common.params_out {
        engine.parameters().save(path)?;
    }
    Ok(output)
}

/// The subcommand picks the transform; a disagreeing config file is overridden.
/// Returns whether the file named a different transform.
fn select_transform(job: &mut JobConfig, kind: TransformKind) -> bool {
    let overridden = job.transform != kind;
    if overridden {
        log::warn!(
            "Config file selects {:?} but the {:?} subcommand was run; using {:?}",
            job.transform,
            kind,
            kind
        );
    }
    job.transform = kind;
    overridden
}

fn run(cli: Cli) -> Result<(), CliError> {
    let start = Instant::now();
    let (kind, common) = match &cli.command {
        Commands::Pca { common, .. } => (TransformKind::Pca, common),
        Commands::Mnf { common, .. } => (TransformKind::Mnf, common),
        Commands::Ica { common, .. } => (TransformKind::Ica, common),
    };

    let mut job = match &common.config {
        Some(path) => {
            let mut job = JobConfig::load(path)?;
            select_transform(&mut job, kind);
            job
        }
        None => JobConfig {
            transform: kind,
            ..JobConfig::default()
        },
    };
    apply_common_overrides(&mut job, common)?;

    let mut noise_path = None;
    match &cli.command {
        Commands::Pca {
            use_variance,
            whiten,
            no_normalize,
            ..
        } => {
            job.pca.use_variance |= *use_variance;
            job.pca.whiten |= *whiten;
            if *no_normalize {
                job.pca.normalize = false;
            }
        }
        Commands::Mnf {
            noise,
            noise_radius,
            whiten,
            ..
        } => {
            noise_path = noise.clone();
            if let Some(radius) = noise_radius {
                job.mnf.noise_radius = *radius;
            }
            job.mnf.whiten |= *whiten;
        }
        Commands::Ica {
            iterations,
            threshold,
            mu,
            contrast,
            rule,
            ..
        } => {
            if let Some(iterations) = iterations {
                job.ica.iterations = *iterations;
            }
            if let Some(threshold) = threshold {
                job.ica.convergence_threshold = *threshold;
            }
            if let Some(mu) = mu {
                job.ica.mu = *mu;
            }
            if let Some(contrast) = contrast {
                job.ica.contrast = (*contrast).into();
            }
            if let Some(rule) = rule {
                job.ica.rule = (*rule).into();
            }
        }
    }

    let scheduler =
        TileScheduler::new(&job.scheduler)?.with_observer(Arc::new(ProgressBarObserver::new()));
    log::info!(
        "{:?} {} on {}x{}x{} with {} threads",
        job.transform,
        job.direction,
        common.width,
        common.height,
        common.bands,
        scheduler.threads()
    );

    let raster = read_raw(&common.input, common.width, common.height, common.bands)?;
    let output = match job.transform {
        TransformKind::Pca => run_pca(&job, common, &scheduler, &raster)?,
        TransformKind::Mnf => {
            let noise = match &noise_path {
                Some(path) => Some(read_raw(path, common.width, common.height, common.bands)?),
                None => None,
            };
            run_mnf(&job, common, noise, &scheduler, &raster)?
        }
        TransformKind::Ica => run_ica(&job, common, &scheduler, &raster)?,
    };

    write_raw(&common.output, &output)?;
    log::info!(
        "Wrote {} bands to {} in {:.2?}",
        output.bands(),
        common.output.display(),
        start.elapsed()
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raster_byte_len_counts_f64_samples() {
        assert_eq!(raster_byte_len(10, 4, 3).unwrap(), 10 * 4 * 3 * 8);
    }

    #[test]
    fn oversized_raster_dimensions_are_rejected() {
        let err = raster_byte_len(usize::MAX / 2, 3, 2).unwrap_err();
        assert!(matches!(err, CliError::RasterTooLarge { bands: 2, .. }));
    }

    #[test]
    fn oversized_dimensions_fail_before_the_file_is_opened() {
        let err = read_raw(Path::new("does-not-exist.raw"), usize::MAX, 2, 2).unwrap_err();
        assert!(matches!(err, CliError::RasterTooLarge { .. }));
    }

    #[test]
    fn subcommand_overrides_a_disagreeing_config() {
        let mut job = JobConfig {
            transform: TransformKind::Mnf,
            ..JobConfig::default()
        };
        assert!(select_transform(&mut job, TransformKind::Ica));
        assert_eq!(job.transform, TransformKind::Ica);
        assert!(!select_transform(&mut job, TransformKind::Ica));
    }
}
