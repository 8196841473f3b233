use super::matrix::{BandAffine, MatrixTransformApplier, TransformationMatrix};
use super::pca::{PcaConfig, PcaEngine, StatisticsMode};
use super::{EngineState, check_vector_len, reverse_matrix};
use crate::config::{load_toml, save_toml};
use crate::error::{Result, TransformError};
use crate::linalg::inverse_sqrt_psd;
use crate::progress::PassStage;
use crate::raster::{Raster, Region};
use crate::stats::StatisticsOptions;
use crate::tiling::TileScheduler;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Non-quadratic function `g` (with derivative `g'`) whose expectation over a
/// projection measures its non-Gaussianity.
pub trait ContrastFunction: Send + Sync {
    fn value(&self, u: f64) -> f64;
    fn derivative(&self, u: f64) -> f64;
    fn name(&self) -> &str {
        "custom"
    }
}

/// `tanh(u)`; robust general-purpose choice.
#[derive(Clone, Copy, Debug, Default)]
pub struct Tanh;

impl ContrastFunction for Tanh {
    fn value(&self, u: f64) -> f64 {
        u.tanh()
    }
    fn derivative(&self, u: f64) -> f64 {
        let t = u.tanh();
        1.0 - t * t
    }
    fn name(&self) -> &str {
        "tanh"
    }
}

/// `u³`; the kurtosis contrast.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cube;

impl ContrastFunction for Cube {
    fn value(&self, u: f64) -> f64 {
        u * u * u
    }
    fn derivative(&self, u: f64) -> f64 {
        3.0 * u * u
    }
    fn name(&self) -> &str {
        "cube"
    }
}

/// `u · exp(-u²/2)`; suited to highly super-Gaussian sources.
#[derive(Clone, Copy, Debug, Default)]
pub struct Gauss;

impl ContrastFunction for Gauss {
    fn value(&self, u: f64) -> f64 {
        u * (-0.5 * u * u).exp()
    }
    fn derivative(&self, u: f64) -> f64 {
        (1.0 - u * u) * (-0.5 * u * u).exp()
    }
    fn name(&self) -> &str {
        "gauss"
    }
}

/// Contrast built from a pair of closures.
pub struct FnContrast<G, D> {
    value: G,
    derivative: D,
}

impl<G, D> FnContrast<G, D>
where
    G: Fn(f64) -> f64 + Send + Sync,
    D: Fn(f64) -> f64 + Send + Sync,
{
    pub fn new(value: G, derivative: D) -> Self {
        Self { value, derivative }
    }
}

impl<G, D> ContrastFunction for FnContrast<G, D>
where
    G: Fn(f64) -> f64 + Send + Sync,
    D: Fn(f64) -> f64 + Send + Sync,
{
    fn value(&self, u: f64) -> f64 {
        (self.value)(u)
    }
    fn derivative(&self, u: f64) -> f64 {
        (self.derivative)(u)
    }
}

/// Built-in contrasts selectable from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContrastKind {
    #[default]
    Tanh,
    Cube,
    Gauss,
}

impl ContrastKind {
    pub fn build(self) -> Arc<dyn ContrastFunction> {
        match self {
            Self::Tanh => Arc::new(Tanh),
            Self::Cube => Arc::new(Cube),
            Self::Gauss => Arc::new(Gauss),
        }
    }
}

/// How one unmixing vector is moved per sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixedPointRule {
    /// `w ← w − μ·(E[g·z] − β·w) / (E[g'] − β)` with `β = E[u·g(u)]`.
    #[default]
    Newton,
    /// `w ← w − μ·(E[g·z] − E[g']·w) / E[g']`. Converges on super-Gaussian sources
    /// only; sub-Gaussian sources (uniform, for instance) are repelled from the
    /// separating directions and the iteration does not separate them.
    Plain,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcaConfig {
    /// Whitened PCA components to unmix; `None` keeps every band.
    pub components: Option<usize>,
    /// Maximum number of sweeps over all components.
    pub iterations: usize,
    /// Stop once `Σ|W − W_old|` falls below this.
    pub convergence_threshold: f64,
    /// Step size μ.
    pub mu: f64,
    pub contrast: ContrastKind,
    pub rule: FixedPointRule,
    pub statistics: StatisticsOptions,
}

impl Default for IcaConfig {
    fn default() -> Self {
        Self {
            components: None,
            iterations: 50,
            convergence_threshold: 1e-4,
            mu: 1.0,
            contrast: ContrastKind::Tanh,
            rule: FixedPointRule::Newton,
            statistics: StatisticsOptions::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IcaParameters {
    pub mean: Option<Array1<f64>>,
    /// Eigenvalues of the whitening PCA.
    pub eigenvalues: Option<Array1<f64>>,
    /// `K × B` PCA whitening matrix.
    pub whitening: Option<Array2<f64>>,
    /// `K × K` unmixing matrix, unmixing vectors as rows.
    pub unmixing: Option<Array2<f64>>,
    /// `unmixing · whitening`.
    pub transformation: Option<TransformationMatrix>,
}

impl IcaParameters {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_toml(self, path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_toml(path)
    }
}

#[derive(Clone, Debug)]
struct ContrastMoments {
    count: u64,
    g_z: Vec<f64>,
    dg: f64,
    u_g: f64,
}

impl ContrastMoments {
    fn new(components: usize) -> Self {
        Self {
            count: 0,
            g_z: vec![0.0; components],
            dg: 0.0,
            u_g: 0.0,
        }
    }

    fn accumulate_region(
        &mut self,
        raster: &Raster,
        region: &Region,
        w: &[f64],
        contrast: &dyn ContrastFunction,
    ) {
        for z in raster.region_pixels(region) {
            let u: f64 = w.iter().zip(z).map(|(a, b)| a * b).sum();
            if !u.is_finite() {
                continue;
            }
            let g = contrast.value(u);
            self.count += 1;
            for (acc, &value) in self.g_z.iter_mut().zip(z) {
                *acc += g * value;
            }
            self.dg += contrast.derivative(u);
            self.u_g += u * g;
        }
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        for (acc, value) in self.g_z.iter_mut().zip(&other.g_z) {
            *acc += value;
        }
        self.dg += other.dg;
        self.u_g += other.u_g;
    }
}

/// Independent component analysis: whitening PCA followed by symmetric fixed-point
/// refinement of an orthonormal unmixing matrix.
pub struct IcaEngine {
    config: IcaConfig,
    scheduler: TileScheduler,
    contrast: Arc<dyn ContrastFunction>,
    state: EngineState,
    supplied_mean: Option<Array1<f64>>,
    supplied_whitening: Option<Array2<f64>>,
    supplied_unmixing: Option<Array2<f64>>,
    supplied_transformation: Option<TransformationMatrix>,
    mean: Option<Array1<f64>>,
    eigenvalues: Option<Array1<f64>>,
    whitening: Option<Array2<f64>>,
    unmixing: Option<Array2<f64>>,
    transformation: Option<TransformationMatrix>,
    iterations_run: usize,
    converged: bool,
    last_delta: Option<f64>,
}

impl fmt::Debug for IcaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IcaEngine")
            .field("config", &self.config)
            .field("contrast", &self.contrast.name())
            .field("state", &self.state)
            .field("iterations_run", &self.iterations_run)
            .field("converged", &self.converged)
            .finish()
    }
}

impl IcaEngine {
    pub fn new(config: IcaConfig, scheduler: &TileScheduler) -> Self {
        let contrast = config.contrast.build();
        Self {
            config,
            scheduler: scheduler.clone(),
            contrast,
            state: EngineState::Uninitialized,
            supplied_mean: None,
            supplied_whitening: None,
            supplied_unmixing: None,
            supplied_transformation: None,
            mean: None,
            eigenvalues: None,
            whitening: None,
            unmixing: None,
            transformation: None,
            iterations_run: 0,
            converged: false,
            last_delta: None,
        }
    }

    pub fn with_contrast(mut self, contrast: impl ContrastFunction + 'static) -> Self {
        self.contrast = Arc::new(contrast);
        self
    }

    pub fn with_parameters(mut self, parameters: IcaParameters) -> Self {
        self.supplied_mean = parameters.mean;
        self.supplied_whitening = parameters.whitening;
        self.supplied_unmixing = parameters.unmixing;
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

    pub fn eigenvalues(&self) -> Option<&Array1<f64>> {
        self.eigenvalues.as_ref()
    }

    pub fn whitening(&self) -> Option<&Array2<f64>> {
        self.whitening.as_ref().or(self.supplied_whitening.as_ref())
    }

    /// `W`, unmixing vectors as rows.
    pub fn unmixing(&self) -> Option<&Array2<f64>> {
        self.unmixing.as_ref().or(self.supplied_unmixing.as_ref())
    }

    /// `F = W · P`.
    pub fn transformation(&self) -> Option<&TransformationMatrix> {
        self.transformation.as_ref()
    }

    pub fn iterations_run(&self) -> usize {
        self.iterations_run
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    /// `Σ|W − W_old|` of the last sweep.
    pub fn last_delta(&self) -> Option<f64> {
        self.last_delta
    }

    pub fn parameters(&self) -> IcaParameters {
        IcaParameters {
            mean: self.mean().cloned(),
            eigenvalues: self.eigenvalues.clone(),
            whitening: self.whitening().cloned(),
            unmixing: self.unmixing().cloned(),
            transformation: self.transformation.clone(),
        }
    }

    fn pca_config(&self) -> PcaConfig {
        PcaConfig {
            components: self.config.components,
            normalize: true,
            use_variance: false,
            whiten: true,
            mode: StatisticsMode::Covariance,
            statistics: self.config.statistics.clone(),
        }
    }

    fn centering(&self) -> Result<BandAffine> {
        let mean = self
            .mean()
            .ok_or(TransformError::MissingParameter("ICA mean vector"))?
            .clone();
        BandAffine::new(mean, None)
    }

    /// Composes `F = W · P` from retained or supplied pieces, if they are all there.
    fn compose(&mut self) -> Result<bool> {
        if self.mean().is_none() {
            return Ok(false);
        }
        if let Some(supplied) = &self.supplied_transformation {
            let forward = supplied.effective()?.into_owned();
            self.transformation = Some(TransformationMatrix::forward(forward));
            return Ok(true);
        }
        let (Some(whitening), Some(unmixing)) = (self.whitening(), self.unmixing()) else {
            return Ok(false);
        };
        let k = whitening.nrows();
        if unmixing.dim() != (k, k) {
            return Err(TransformError::mismatch("unmixing matrix size", k, unmixing.nrows()));
        }
        let forward = unmixing.dot(whitening);
        self.transformation = Some(TransformationMatrix::forward(forward));
        Ok(true)
    }

    /// Runs both phases on `raster`: whitening PCA, then the fixed-point iteration.
    pub fn fit(&mut self, raster: &Raster) -> Result<()> {
        let bands = raster.bands();
        check_vector_len("supplied mean length", self.supplied_mean.as_ref(), bands)?;
        if self.supplied_transformation.is_some() {
            if !self.compose()? {
                return Err(TransformError::MissingParameter("ICA mean vector"));
            }
            self.state = EngineState::TransformReady;
            return Ok(());
        }

        let (whitened, mean, whitening) = match (&self.supplied_mean, &self.supplied_whitening) {
            (Some(mean), Some(whitening)) => {
                if whitening.ncols() != bands {
                    return Err(TransformError::mismatch(
                        "whitening matrix column count",
                        bands,
                        whitening.ncols(),
                    ));
                }
                let centering = BandAffine::new(mean.clone(), None)?;
                let whitened = MatrixTransformApplier::new(&self.scheduler).apply_affine(
                    raster,
                    Some(&centering),
                    &TransformationMatrix::forward(whitening.clone()),
                    None,
                )?;
                (whitened, mean.clone(), whitening.clone())
            }
            _ => {
                let mut pca = PcaEngine::new(self.pca_config(), &self.scheduler);
                if let Some(mean) = &self.supplied_mean {
                    pca = pca.with_mean(mean.clone());
                }
                let whitened = pca.forward(raster)?;
                self.eigenvalues = pca.eigenvalues().cloned();
                let mean = pca
                    .mean()
                    .ok_or(TransformError::MissingParameter("PCA mean vector"))?
                    .clone();
                let whitening = pca
                    .transformation()
                    .ok_or(TransformError::MissingParameter("PCA whitening matrix"))?
                    .matrix
                    .clone();
                (whitened, mean, whitening)
            }
        };
        self.state = EngineState::StatisticsReady;

        let unmixing = match &self.supplied_unmixing {
            Some(unmixing) => unmixing.clone(),
            None => self.optimize(&whitened)?,
        };
        let k = whitening.nrows();
        if unmixing.dim() != (k, k) {
            return Err(TransformError::mismatch("unmixing matrix size", k, unmixing.nrows()));
        }

        self.transformation = Some(TransformationMatrix::forward(unmixing.dot(&whitening)));
        self.mean = Some(mean);
        self.whitening = Some(whitening);
        self.unmixing = Some(unmixing);
        self.state = EngineState::TransformReady;
        Ok(())
    }

    fn contrast_moments(&self, whitened: &Raster, w: &[f64]) -> Result<ContrastMoments> {
        let k = whitened.bands();
        let contrast = self.contrast.as_ref();
        let partials = self.scheduler.accumulate(
            PassStage::IcaOptimization,
            whitened,
            || ContrastMoments::new(k),
            |state, raster, region| state.accumulate_region(raster, region, w, contrast),
        );
        let mut total = ContrastMoments::new(k);
        for partial in &partials {
            total.merge(partial);
        }
        if total.count == 0 {
            return Err(TransformError::EmptyData);
        }
        Ok(total)
    }

    fn update_vector(&self, w: &Array1<f64>, moments: &ContrastMoments) -> Result<Array1<f64>> {
        let n = moments.count as f64;
        let g_z = Array1::from_vec(moments.g_z.clone()) / n;
        let dg = moments.dg / n;
        let beta = moments.u_g / n;
        let mu = self.config.mu;

        let (gradient, denominator) = match self.config.rule {
            FixedPointRule::Newton => (&g_z - &(w * beta), dg - beta),
            FixedPointRule::Plain => (&g_z - &(w * dg), dg),
        };
        if denominator.abs() <= f64::EPSILON || !denominator.is_finite() {
            return Err(TransformError::DegenerateStatistics(format!(
                "fixed-point denominator {denominator:e} vanished; the projection looks Gaussian"
            )));
        }
        let updated = w - &(gradient * (mu / denominator));
        let norm = updated.dot(&updated).sqrt();
        if norm <= f64::EPSILON || !norm.is_finite() {
            return Err(TransformError::DegenerateStatistics(
                "unmixing vector collapsed to zero".to_string(),
            ));
        }
        Ok(updated / norm)
    }

    fn optimize(&mut self, whitened: &Raster) -> Result<Array2<f64>> {
        let k = whitened.bands();
        let mut unmixing = Array2::<f64>::eye(k);
        self.converged = false;
        self.iterations_run = 0;
        self.last_delta = None;
        log::info!(
            "ICA on {k} whitened components: contrast {}, {:?} rule, at most {} sweeps",
            self.contrast.name(),
            self.config.rule,
            self.config.iterations
        );

        for sweep in 0..self.config.iterations {
            let previous = unmixing.clone();
            for component in 0..k {
                let w = unmixing.row(component).to_owned();
                let moments = self.contrast_moments(whitened, &w.to_vec())?;
                let updated = self.update_vector(&w, &moments)?;
                unmixing.row_mut(component).assign(&updated);
            }
            let decorrelation = inverse_sqrt_psd(&unmixing.dot(&unmixing.t()))?;
            unmixing = decorrelation.dot(&unmixing);

            let delta: f64 = (&unmixing - &previous).mapv(f64::abs).sum();
            self.iterations_run = sweep + 1;
            self.last_delta = Some(delta);
            log::debug!("ICA sweep {}: |dW|_1 = {delta:.3e}", sweep + 1);
            if delta < self.config.convergence_threshold {
                self.converged = true;
                break;
            }
        }

        if self.converged {
            log::info!("ICA converged after {} sweeps", self.iterations_run);
        } else {
            log::warn!(
                "ICA stopped after {} sweeps without reaching the threshold {:e} (last delta {:e})",
                self.iterations_run,
                self.config.convergence_threshold,
                self.last_delta.unwrap_or(f64::NAN)
            );
        }
        Ok(unmixing)
    }

    pub fn forward(&mut self, raster: &Raster) -> Result<Raster> {
        if self.transformation.is_none() {
            self.fit(raster)?;
        }
        let transformation = self
            .transformation
            .as_ref()
            .ok_or(TransformError::MissingParameter("ICA transformation matrix"))?;
        let centering = self.centering()?;
        let output = MatrixTransformApplier::new(&self.scheduler).apply_affine(
            raster,
            Some(&centering),
            transformation,
            None,
        )?;
        self.state = EngineState::Applied;
        Ok(output)
    }

    /// Needs the mean and either the composed transform or both whitening and
    /// unmixing matrices, from an earlier forward run or from supplied parameters.
    pub fn reverse(&mut self, raster: &Raster) -> Result<Raster> {
        if self.transformation.is_none() && !self.compose()? {
            return Err(TransformError::MissingParameter(
                "ICA mean with whitening and unmixing matrices",
            ));
        }
        let transformation = self
            .transformation
            .as_ref()
            .ok_or(TransformError::MissingParameter("ICA transformation matrix"))?;
        let components = transformation.matrix.nrows();
        if raster.bands() != components {
            return Err(TransformError::mismatch(
                "reverse input band count",
                components,
                raster.bands(),
            ));
        }
        let centering = self.centering()?;
        let inverse = reverse_matrix(self.supplied_transformation.as_ref(), &transformation.matrix);
        let output = MatrixTransformApplier::new(&self.scheduler).apply_affine(
            raster,
            None,
            &inverse,
            Some(&centering),
        )?;
        self.state = EngineState::Applied;
        Ok(output)
    }
}
