use super::matrix::{BandAffine, MatrixTransformApplier, TransformationMatrix};
use super::{
    EngineState, check_vector_len, resolve_components, reverse_matrix, scale_rows,
    standardize_covariance,
};
use crate::config::{load_toml, save_toml};
use crate::error::{Result, TransformError};
use crate::linalg::{
    check_square, check_symmetric, inner_product_components, symmetric_eigendecompose,
    whitening_scales,
};
use crate::raster::Raster;
use crate::stats::{InnerProduct, InnerProductAccumulator, StatisticsOptions, compute_statistics};
use crate::tiling::TileScheduler;
use ndarray::{Array1, Array2, Axis, s};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which second-order statistic feeds the eigendecomposition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StatisticsMode {
    /// Band covariance matrix (B × B).
    #[default]
    Covariance,
    /// Gram matrix of the bands taken as training images. `center_data` removes the
    /// mean image first; `mean_component` appends the mean image as an extra output band.
    InnerProduct {
        center_data: bool,
        mean_component: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaConfig {
    /// Leading components to keep; `None` keeps every band.
    pub components: Option<usize>,
    /// Subtract the mean before projecting.
    pub normalize: bool,
    /// Also divide by the standard deviation. Ignored unless `normalize` is set.
    pub use_variance: bool,
    /// Scale component `k` by `1 / √λ_k`.
    pub whiten: bool,
    pub mode: StatisticsMode,
    pub statistics: StatisticsOptions,
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            components: None,
            normalize: true,
            use_variance: false,
            whiten: false,
            mode: StatisticsMode::Covariance,
            statistics: StatisticsOptions::default(),
        }
    }
}

/// Everything needed to re-run a PCA on another raster or to invert it later.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PcaParameters {
    pub mean: Option<Array1<f64>>,
    pub std_dev: Option<Array1<f64>>,
    pub eigenvalues: Option<Array1<f64>>,
    pub covariance: Option<Array2<f64>>,
    pub transformation: Option<TransformationMatrix>,
}

impl PcaParameters {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_toml(self, path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_toml(path)
    }
}

/// Principal component analysis over a streamed raster.
///
/// Runs at most one statistics pass (skipped when every needed statistic was
/// supplied), solves the eigenproblem once, then streams the projection. Statistics
/// and the transform are retained, so the same engine can project further rasters or
/// invert its own output.
#[derive(Debug)]
pub struct PcaEngine {
    config: PcaConfig,
    scheduler: TileScheduler,
    state: EngineState,
    bands: Option<usize>,
    supplied_mean: Option<Array1<f64>>,
    supplied_std_dev: Option<Array1<f64>>,
    supplied_covariance: Option<Array2<f64>>,
    supplied_transformation: Option<TransformationMatrix>,
    mean: Option<Array1<f64>>,
    std_dev: Option<Array1<f64>>,
    covariance: Option<Array2<f64>>,
    inner_product: Option<InnerProduct>,
    eigenvalues: Option<Array1<f64>>,
    transformation: Option<TransformationMatrix>,
}

impl PcaEngine {
    pub fn new(config: PcaConfig, scheduler: &TileScheduler) -> Self {
        if config.use_variance && !config.normalize {
            log::warn!("use_variance has no effect while normalization is disabled");
        }
        Self {
            config,
            scheduler: scheduler.clone(),
            state: EngineState::Uninitialized,
            bands: None,
            supplied_mean: None,
            supplied_std_dev: None,
            supplied_covariance: None,
            supplied_transformation: None,
            mean: None,
            std_dev: None,
            covariance: None,
            inner_product: None,
            eigenvalues: None,
            transformation: None,
        }
    }

    pub fn with_mean(mut self, mean: Array1<f64>) -> Self {
        self.supplied_mean = Some(mean);
        self
    }

    pub fn with_std_dev(mut self, std_dev: Array1<f64>) -> Self {
        self.supplied_std_dev = Some(std_dev);
        self
    }

    /// A supplied covariance is taken to be already in normalized space.
    pub fn with_covariance(mut self, covariance: Array2<f64>) -> Self {
        self.supplied_covariance = Some(covariance);
        self
    }

    pub fn with_transformation(mut self, transformation: TransformationMatrix) -> Self {
        self.supplied_transformation = Some(transformation);
        self
    }

    /// Reuses a snapshot from an earlier run. The stored transformation, when present,
    /// skips the eigendecomposition.
    pub fn with_parameters(mut self, parameters: PcaParameters) -> Self {
        self.supplied_mean = parameters.mean;
        self.supplied_std_dev = parameters.std_dev;
        self.supplied_covariance = parameters.covariance;
        self.supplied_transformation = parameters.transformation;
        self.eigenvalues = parameters.eigenvalues;
        self
    }

    pub fn config(&self) -> &PcaConfig {
        &self.config
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

    /// The matrix that was (or will be) decomposed.
    pub fn covariance(&self) -> Option<&Array2<f64>> {
        self.covariance.as_ref().or(self.supplied_covariance.as_ref())
    }

    pub fn inner_product(&self) -> Option<&InnerProduct> {
        self.inner_product.as_ref()
    }

    /// All eigenvalues, descending.
    pub fn eigenvalues(&self) -> Option<&Array1<f64>> {
        self.eigenvalues.as_ref()
    }

    /// Share of the total variance carried by each kept component.
    pub fn explained_variance_ratio(&self) -> Option<Array1<f64>> {
        let values = self.eigenvalues.as_ref()?;
        let kept = self.transformation.as_ref()?.matrix.nrows().min(values.len());
        let total = values.sum();
        if total <= 0.0 {
            return None;
        }
        Some(values.slice(s![..kept]).mapv(|value| value / total))
    }

    /// The forward (bands → components) matrix once built.
    pub fn transformation(&self) -> Option<&TransformationMatrix> {
        self.transformation.as_ref()
    }

    pub fn parameters(&self) -> PcaParameters {
        PcaParameters {
            mean: self.mean().cloned(),
            std_dev: self.std_dev().cloned(),
            eigenvalues: self.eigenvalues.clone(),
            covariance: self.covariance().cloned(),
            transformation: self.transformation.clone(),
        }
    }

    fn normalizes_by_std(&self) -> bool {
        self.config.normalize && self.config.use_variance
    }

    fn check_supplied(&self, bands: usize) -> Result<()> {
        check_vector_len("supplied mean length", self.supplied_mean.as_ref(), bands)?;
        check_vector_len("supplied std-dev length", self.supplied_std_dev.as_ref(), bands)?;
        if let Some(covariance) = &self.supplied_covariance {
            let n = check_square("supplied covariance", covariance)?;
            if n != bands {
                return Err(TransformError::mismatch("supplied covariance size", bands, n));
            }
            check_symmetric("supplied covariance", covariance)?;
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

    /// Estimates whatever the transform still needs from `raster`.
    pub fn compute_statistics(&mut self, raster: &Raster) -> Result<()> {
        let bands = raster.bands();
        self.check_supplied(bands)?;

        match self.config.mode {
            StatisticsMode::Covariance => self.covariance_statistics(raster)?,
            StatisticsMode::InnerProduct { center_data, .. } => {
                if self.supplied_transformation.is_none() {
                    let product = InnerProductAccumulator::new(bands, center_data)?
                        .compute(&self.scheduler, raster)?;
                    self.inner_product = Some(product);
                }
            }
        }

        self.bands = Some(bands);
        self.transformation = None;
        self.state = EngineState::StatisticsReady;
        Ok(())
    }

    fn covariance_statistics(&mut self, raster: &Raster) -> Result<()> {
        let by_std = self.normalizes_by_std();
        let need_mean = self.config.normalize && self.supplied_mean.is_none();
        let need_std = by_std && self.supplied_std_dev.is_none();
        let need_covariance =
            self.supplied_transformation.is_none() && self.supplied_covariance.is_none();

        if !(need_mean || need_std || need_covariance) {
            log::info!("Every PCA statistic was supplied; skipping the statistics pass");
            return Ok(());
        }

        let stats = compute_statistics(&self.scheduler, raster, &self.config.statistics)?;
        log::info!(
            "PCA statistics over {} pixels and {} bands",
            stats.relevant_pixels,
            raster.bands()
        );

        let mean = match &self.supplied_mean {
            Some(mean) => mean.clone(),
            None => stats.mean()?.clone(),
        };
        let std_dev = match (&self.supplied_std_dev, need_std) {
            (Some(std_dev), _) => Some(std_dev.clone()),
            (None, true) => Some(stats.std_dev()?),
            (None, false) => None,
        };
        let covariance = if need_covariance {
            let covariance = stats.covariance()?;
            Some(match (&std_dev, by_std) {
                (Some(std_dev), true) => standardize_covariance(covariance, std_dev),
                _ => covariance.clone(),
            })
        } else {
            None
        };

        self.mean = Some(mean);
        self.std_dev = std_dev;
        self.covariance = covariance;
        Ok(())
    }

    /// Solves the eigenproblem (or adopts the supplied matrix) and fixes the
    /// forward transform.
    pub fn build_transform(&mut self) -> Result<()> {
        if let Some(supplied) = &self.supplied_transformation {
            let forward = supplied.effective()?.into_owned();
            log::info!(
                "Using supplied {} transformation ({}x{})",
                supplied.direction,
                forward.nrows(),
                forward.ncols()
            );
            self.bands = Some(forward.ncols());
            self.transformation = Some(TransformationMatrix::forward(forward));
            self.state = EngineState::TransformReady;
            return Ok(());
        }

        let (values, forward) = match self.config.mode {
            StatisticsMode::Covariance => {
                let covariance = self
                    .covariance()
                    .ok_or(TransformError::MissingParameter("covariance matrix"))?;
                let bands = check_square("covariance", covariance)?;
                let k = resolve_components(self.config.components, bands)?;
                let solution = symmetric_eigendecompose(covariance)?;
                let mut forward = solution.leading_rows(k);
                if self.config.whiten {
                    let scales = whitening_scales(&solution.values.slice(s![..k]).to_owned())?;
                    scale_rows(&mut forward, &scales);
                }
                (solution.values, forward)
            }
            StatisticsMode::InnerProduct {
                center_data,
                mean_component,
            } => {
                let product = self
                    .inner_product
                    .as_ref()
                    .ok_or(TransformError::MissingParameter("inner product matrix"))?;
                let bands = product.gram.nrows();
                // Removing the mean image leaves at most B - 1 informative components.
                let k = match (self.config.components, center_data) {
                    (None, true) => bands.saturating_sub(1).max(1),
                    (requested, _) => resolve_components(requested, bands)?,
                };
                let (values, weights) = inner_product_components(&product.gram, k)?;
                let mut forward = if center_data {
                    let centering = Array2::<f64>::eye(bands) - 1.0 / bands as f64;
                    weights.dot(&centering)
                } else {
                    weights
                };
                if mean_component {
                    let mean_row = Array2::from_elem((1, bands), 1.0 / bands as f64);
                    forward = ndarray::concatenate(Axis(0), &[forward.view(), mean_row.view()])
                        .map_err(|err| TransformError::invalid(err.to_string()))?;
                }
                (values, forward)
            }
        };

        log::info!(
            "PCA transform: {} components from {} bands, leading eigenvalue {:.6e}",
            forward.nrows(),
            forward.ncols(),
            values.get(0).copied().unwrap_or(0.0)
        );
        self.bands = Some(forward.ncols());
        self.eigenvalues = Some(values);
        self.transformation = Some(TransformationMatrix::forward(forward));
        self.state = EngineState::TransformReady;
        Ok(())
    }

    fn normalization(&self) -> Result<Option<BandAffine>> {
        if !self.config.normalize || self.config.mode != StatisticsMode::Covariance {
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

    fn check_input_bands(&self, raster: &Raster) -> Result<()> {
        match self.bands {
            Some(bands) if bands != raster.bands() => {
                Err(TransformError::mismatch("raster band count", bands, raster.bands()))
            }
            _ => Ok(()),
        }
    }

    /// Projects `raster` onto the leading components, estimating and solving first
    /// when needed.
    pub fn forward(&mut self, raster: &Raster) -> Result<Raster> {
        self.check_input_bands(raster)?;
        if self.supplied_transformation.is_none() {
            resolve_components(self.config.components, raster.bands())?;
        }
        if self.state == EngineState::Uninitialized {
            self.compute_statistics(raster)?;
        }
        if self.transformation.is_none() {
            self.build_transform()?;
        }
        self.check_input_bands(raster)?;

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

    /// Maps components back to bands through the pseudo-inverse and undoes the
    /// normalization.
    pub fn reverse(&mut self, raster: &Raster) -> Result<Raster> {
        if self.transformation.is_none() {
            let can_rebuild = self.supplied_transformation.is_some()
                || self.covariance().is_some()
                || self.inner_product.is_some();
            if !can_rebuild {
                return Err(TransformError::MissingParameter(
                    "transformation matrix or covariance",
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
