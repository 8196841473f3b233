use super::matrix::{BandAffine, MatrixTransformApplier, TransformationMatrix};
use super::noise::{LocalActivity, NoiseExtractor};
use super::{
    EngineState, check_vector_len, resolve_components, reverse_matrix, scale_rows,
    standardize_covariance,
};
use crate::config::{load_toml, save_toml};
use crate::error::{Result, TransformError};
use crate::linalg::{check_square, check_symmetric, generalized_eigendecompose, whitening_scales};
use crate::progress::PassStage;
use crate::raster::Raster;
use crate::stats::{StatisticsAccumulator, StatisticsOptions, compute_statistics};
use crate::tiling::TileScheduler;
use ndarray::{Array1, Array2, s};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MnfConfig {
    pub components: Option<usize>,
    pub normalize: bool,
    pub use_variance: bool,
    /// Scale component `k` by `1 / √snr_k` so components have unit signal variance.
    pub whiten: bool,
    /// Fall back to the local-activity extractor when no noise raster or noise
    /// covariance was given.
    pub estimate_noise: bool,
    pub noise_radius: usize,
    pub statistics: StatisticsOptions,
}

impl Default for MnfConfig {
    fn default() -> Self {
        Self {
            components: None,
            normalize: true,
            use_variance: false,
            whiten: false,
            estimate_noise: true,
            noise_radius: 1,
            statistics: StatisticsOptions::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MnfParameters {
    pub mean: Option<Array1<f64>>,
    pub std_dev: Option<Array1<f64>>,
    /// Signal-to-noise ratios, descending.
    pub eigenvalues: Option<Array1<f64>>,
    pub covariance: Option<Array2<f64>>,
    pub noise_covariance: Option<Array2<f64>>,
    pub transformation: Option<TransformationMatrix>,
}

impl MnfParameters {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_toml(self, path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_toml(path)
    }
}

/// Maximum noise fraction: components ranked by signal-to-noise ratio.
///
/// Noise information comes from, in order of precedence: a supplied noise
/// covariance, a supplied noise raster, the configured [`NoiseExtractor`].
pub struct MnfEngine {
    config: MnfConfig,
    scheduler: TileScheduler,
    state: EngineState,
    bands: Option<usize>,
    noise_raster: Option<Raster>,
    noise_extractor: Option<Box<dyn NoiseExtractor>>,
    supplied_mean: Option<Array1<f64>>,
    supplied_std_dev: Option<Array1<f64>>,
    supplied_covariance: Option<Array2<f64>>,
    supplied_noise_covariance: Option<Array2<f64>>,
    supplied_transformation: Option<TransformationMatrix>,
    mean: Option<Array1<f64>>,
    std_dev: Option<Array1<f64>>,
    covariance: Option<Array2<f64>>,
    noise_covariance: Option<Array2<f64>>,
    eigenvalues: Option<Array1<f64>>,
    transformation: Option<TransformationMatrix>,
}

impl std::fmt::Debug for MnfEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MnfEngine")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("bands", &self.bands)
            .field("has_noise_raster", &self.noise_raster.is_some())
            .field("has_noise_extractor", &self.noise_extractor.is_some())
            .finish()
    }
}

impl MnfEngine {
    pub fn new(config: MnfConfig, scheduler: &TileScheduler) -> Self {
        if config.use_variance && !config.normalize {
            log::warn!("use_variance has no effect while normalization is disabled");
        }
        let noise_extractor: Option<Box<dyn NoiseExtractor>> = if config.estimate_noise {
            Some(Box::new(LocalActivity {
                radius: config.noise_radius,
            }))
        } else {
            None
        };
        Self {
            config,
            scheduler: scheduler.clone(),
            state: EngineState::Uninitialized,
            bands: None,
            noise_raster: None,
            noise_extractor,
            supplied_mean: None,
            supplied_std_dev: None,
            supplied_covariance: None,
            supplied_noise_covariance: None,
            supplied_transformation: None,
            mean: None,
            std_dev: None,
            covariance: None,
            noise_covariance: None,
            eigenvalues: None,
            transformation: None,
        }
    }

    pub fn with_noise_raster(mut self, noise: Raster) -> Self {
        self.noise_raster = Some(noise);
        self
    }

    pub fn with_noise_extractor(mut self, extractor: Box<dyn NoiseExtractor>) -> Self {
        self.noise_extractor = Some(extractor);
        self
    }

    pub fn with_mean(mut self, mean: Array1<f64>) -> Self {
        self.supplied_mean = Some(mean);
        self
    }

    pub fn with_std_dev(mut self, std_dev: Array1<f64>) -> Self {
        self.supplied_std_dev = Some(std_dev);
        self
    }

    pub fn with_covariance(mut self, covariance: Array2<f64>) -> Self {
        self.supplied_covariance = Some(covariance);
        self
    }

    pub fn with_noise_covariance(mut self, covariance: Array2<f64>) -> Self {
        self.supplied_noise_covariance = Some(covariance);
        self
    }

    pub fn with_transformation(mut self, transformation: TransformationMatrix) -> Self {
        self.supplied_transformation = Some(transformation);
        self
    }

    pub fn with_parameters(mut self, parameters: MnfParameters) -> Self {
        self.supplied_mean = parameters.mean;
        self.supplied_std_dev = parameters.std_dev;
        self.supplied_covariance = parameters.covariance;
        self.supplied_noise_covariance = parameters.noise_covariance;
        self.supplied_transformation = parameters.transformation;
        self.eigenvalues = parameters.eigenvalues;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn mean(&self) -> Option<&Array1<f64>> {
        self.mean.as_ref().or(self.supplied_mean.as_ref())
    }

    pub fn std_dev(&self) -> Option<&Array1<f64>> {
        self.std_dev.as_ref().or(self.supplied_std_dev.as_ref())
    }

    pub fn covariance(&self) -> Option<&Array2<f64>> {
        self.covariance.as_ref().or(self.supplied_covariance.as_ref())
    }

    pub fn noise_covariance(&self) -> Option<&Array2<f64>> {
        self.noise_covariance
            .as_ref()
            .or(self.supplied_noise_covariance.as_ref())
    }

    /// Signal-to-noise ratio of every component, descending.
    pub fn eigenvalues(&self) -> Option<&Array1<f64>> {
        self.eigenvalues.as_ref()
    }

    pub fn transformation(&self) -> Option<&TransformationMatrix> {
        self.transformation.as_ref()
    }

    pub fn parameters(&self) -> MnfParameters {
        MnfParameters {
            mean: self.mean().cloned(),
            std_dev: self.std_dev().cloned(),
            eigenvalues: self.eigenvalues.clone(),
            covariance: self.covariance().cloned(),
            noise_covariance: self.noise_covariance().cloned(),
            transformation: self.transformation.clone(),
        }
    }

    fn normalizes_by_std(&self) -> bool {
        self.config.normalize && self.config.use_variance
    }

    fn check_supplied(&self, raster: &Raster) -> Result<()> {
        let bands = raster.bands();
        check_vector_len("supplied mean length", self.supplied_mean.as_ref(), bands)?;
        check_vector_len("supplied std-dev length", self.supplied_std_dev.as_ref(), bands)?;
        for (what, matrix) in [
            ("supplied covariance", &self.supplied_covariance),
            ("supplied noise covariance", &self.supplied_noise_covariance),
        ] {
            if let Some(matrix) = matrix {
                let n = check_square(what, matrix)?;
                if n != bands {
                    return Err(TransformError::mismatch(what, bands, n));
                }
                check_symmetric(what, matrix)?;
            }
        }
        if let Some(noise) = &self.noise_raster {
            if noise.bands() != bands {
                return Err(TransformError::mismatch("noise raster band count", bands, noise.bands()));
            }
            if !noise.same_extent(raster) {
                return Err(TransformError::mismatch(
                    "noise raster pixel count",
                    raster.n_pixels(),
                    noise.n_pixels(),
                ));
            }
        }
        if let Some(transformation) = &self.supplied_transformation {
            let (_, cols) = transformation.effective_dim();
            if cols != bands {
                return Err(TransformError::mismatch(
                    "supplied transformation column count",
                    bands,
                    cols,
                ));
            }
        }
        Ok(())
    }

    /// Signal statistics from `raster` and noise statistics from the configured
    /// noise source, skipping whatever was supplied.
    pub fn compute_statistics(&mut self, raster: &Raster) -> Result<()> {
        self.check_supplied(raster)?;
        let by_std = self.normalizes_by_std();
        let need_matrices = self.supplied_transformation.is_none();
        let need_mean = self.config.normalize && self.supplied_mean.is_none();
        let need_std = by_std && self.supplied_std_dev.is_none();
        let need_signal = need_matrices && self.supplied_covariance.is_none();
        let need_noise = need_matrices && self.supplied_noise_covariance.is_none();

        let mut mean = self.supplied_mean.clone();
        let mut std_dev = self.supplied_std_dev.clone();
        let mut covariance = None;
        if need_mean || need_std || need_signal {
            let stats = compute_statistics(&self.scheduler, raster, &self.config.statistics)?;
            log::info!(
                "MNF signal statistics over {} pixels and {} bands",
                stats.relevant_pixels,
                raster.bands()
            );
            if mean.is_none() {
                mean = Some(stats.mean()?.clone());
            }
            if need_std {
                std_dev = Some(stats.std_dev()?);
            }
            if need_signal {
                covariance = Some(stats.covariance()?.clone());
            }
        }

        let noise_covariance = if need_noise {
            Some(self.estimate_noise_covariance(raster)?)
        } else {
            None
        };

        let standardize = |matrix: Array2<f64>| match (&std_dev, by_std) {
            (Some(std_dev), true) => standardize_covariance(&matrix, std_dev),
            _ => matrix,
        };
        self.covariance = covariance.map(standardize);
        self.noise_covariance = noise_covariance.map(standardize);
        self.mean = mean;
        self.std_dev = std_dev;
        self.bands = Some(raster.bands());
        self.transformation = None;
        self.state = EngineState::StatisticsReady;
        Ok(())
    }

    fn estimate_noise_covariance(&self, raster: &Raster) -> Result<Array2<f64>> {
        let extracted;
        let noise = match (&self.noise_raster, &self.noise_extractor) {
            (Some(noise), _) => noise,
            (None, Some(extractor)) => {
                extracted = extractor.extract(&self.scheduler, raster)?;
                &extracted
            }
            (None, None) => {
                return Err(TransformError::MissingParameter(
                    "noise covariance, noise raster or noise extractor",
                ));
            }
        };
        let mut accumulator =
            StatisticsAccumulator::new(noise.bands(), self.config.statistics.clone())?;
        accumulator.accumulate_stage(&self.scheduler, noise, PassStage::NoiseStatistics)?;
        let stats = accumulator.synthetize()?;
        log::info!("MNF noise statistics over {} pixels", stats.relevant_pixels);
        Ok(stats.covariance()?.clone())
    }

    pub fn build_transform(&mut self) -> Result<()> {
        if let Some(supplied) = &self.supplied_transformation {
            let forward = supplied.effective()?.into_owned();
            log::info!(
                "Using supplied {} MNF transformation ({}x{})",
                supplied.direction,
                forward.nrows(),
                forward.ncols()
            );
            self.bands = Some(forward.ncols());
            self.transformation = Some(TransformationMatrix::forward(forward));
            self.state = EngineState::TransformReady;
            return Ok(());
        }

        let signal = self
            .covariance()
            .ok_or(TransformError::MissingParameter("signal covariance"))?;
        let noise = self
            .noise_covariance()
            .ok_or(TransformError::MissingParameter("noise covariance"))?;
        let bands = check_square("signal covariance", signal)?;
        let k = resolve_components(self.config.components, bands)?;

        let solution = generalized_eigendecompose(signal, noise)?;
        let mut forward = solution.leading_rows(k);
        if self.config.whiten {
            let scales = whitening_scales(&solution.values.slice(s![..k]).to_owned())?;
            scale_rows(&mut forward, &scales);
        }
        log::info!(
            "MNF transform: {k} components from {bands} bands, leading SNR {:.6e}",
            solution.values.get(0).copied().unwrap_or(0.0)
        );

        self.bands = Some(bands);
        self.eigenvalues = Some(solution.values);
        self.transformation = Some(TransformationMatrix::forward(forward));
        self.state = EngineState::TransformReady;
        Ok(())
    }

    fn normalization(&self) -> Result<Option<BandAffine>> {
        if !self.config.normalize {
            return Ok(None);
        }
        let mean = self
            .mean()
            .ok_or(TransformError::MissingParameter("mean vector"))?
            .clone();
        let scale = if self.normalizes_by_std() {
            Some(
                self.std_dev()
                    .ok_or(TransformError::MissingParameter("standard deviation vector"))?
                    .clone(),
            )
        } else {
            None
        };
        BandAffine::new(mean, scale).map(Some)
    }

    pub fn forward(&mut self, raster: &Raster) -> Result<Raster> {
        if let Some(bands) = self.bands {
            if bands != raster.bands() {
                return Err(TransformError::mismatch("raster band count", bands, raster.bands()));
            }
        }
        if self.supplied_transformation.is_none() {
            resolve_components(self.config.components, raster.bands())?;
        }
        if self.state == EngineState::Uninitialized {
            self.compute_statistics(raster)?;
        }
        if self.transformation.is_none() {
            self.build_transform()?;
        }

        let pre = self.normalization()?;
        let transformation = self
            .transformation
            .as_ref()
            .ok_or(TransformError::MissingParameter("transformation matrix"))?;
        let output = MatrixTransformApplier::new(&self.scheduler).apply_affine(
            raster,
            pre.as_ref(),
            transformation,
            None,
        )?;
        self.state = EngineState::Applied;
        Ok(output)
    }

    pub fn reverse(&mut self, raster: &Raster) -> Result<Raster> {
        if self.transformation.is_none() {
            let can_rebuild = self.supplied_transformation.is_some()
                || (self.covariance().is_some() && self.noise_covariance().is_some());
            if !can_rebuild {
                return Err(TransformError::MissingParameter(
                    "MNF transformation matrix or signal and noise covariances",
                ));
            }
            self.build_transform()?;
        }
        let transformation = self
            .transformation
            .as_ref()
            .ok_or(TransformError::MissingParameter("transformation matrix"))?;
        let components = transformation.matrix.nrows();
        if raster.bands() != components {
            return Err(TransformError::mismatch(
                "reverse input band count",
                components,
                raster.bands(),
            ));
        }

        let post = self.normalization()?;
        let inverse = reverse_matrix(self.supplied_transformation.as_ref(), &transformation.matrix);
        let output = MatrixTransformApplier::new(&self.scheduler).apply_affine(
            raster,
            None,
            &inverse,
            post.as_ref(),
        )?;
        self.state = EngineState::Applied;
        Ok(output)
    }
}
