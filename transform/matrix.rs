use crate::config::{load_toml, save_toml};
use crate::error::{Result, TransformError};
use crate::linalg::pseudo_inverse;
use crate::progress::PassStage;
use crate::raster::Raster;
use crate::tiling::TileScheduler;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Which way a transform runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = TransformError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "forward" | "fwd" => Ok(Self::Forward),
            "reverse" | "inverse" | "inv" => Ok(Self::Reverse),
            _ => Err(TransformError::UnsupportedDirection(value.to_string())),
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = TransformError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Direction> for String {
    fn from(direction: Direction) -> Self {
        direction.as_str().to_string()
    }
}

/// A dense `R × C` band-mixing matrix with a direction tag.
///
/// A `Forward` matrix is used as stored. A `Reverse` matrix stands for the inverse of
/// the stored one: wherever it is used, its pseudo-inverse is taken exactly once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformationMatrix {
    pub direction: Direction,
    pub matrix: Array2<f64>,
}

impl TransformationMatrix {
    pub fn new(matrix: Array2<f64>, direction: Direction) -> Self {
        Self { direction, matrix }
    }

    pub fn forward(matrix: Array2<f64>) -> Self {
        Self::new(matrix, Direction::Forward)
    }

    pub fn reverse(matrix: Array2<f64>) -> Self {
        Self::new(matrix, Direction::Reverse)
    }

    pub fn identity(bands: usize) -> Self {
        Self::forward(Array2::eye(bands))
    }

    /// The matrix that is actually multiplied with pixels: the stored matrix for
    /// `Forward`, its pseudo-inverse for `Reverse`.
    pub fn effective(&self) -> Result<Cow<'_, Array2<f64>>> {
        match self.direction {
            Direction::Forward => Ok(Cow::Borrowed(&self.matrix)),
            Direction::Reverse if is_identity(&self.matrix) => Ok(Cow::Borrowed(&self.matrix)),
            Direction::Reverse => Ok(Cow::Owned(pseudo_inverse(&self.matrix)?)),
        }
    }

    /// Shape `(rows, cols)` of the effective matrix, without inverting anything.
    pub fn effective_dim(&self) -> (usize, usize) {
        let (rows, cols) = self.matrix.dim();
        match self.direction {
            Direction::Forward => (rows, cols),
            Direction::Reverse => (cols, rows),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_toml(self, path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_toml(path)
    }
}

/// Exactly square with ones on the diagonal and zeros elsewhere.
pub fn is_identity(matrix: &Array2<f64>) -> bool {
    matrix.is_square()
        && matrix
            .indexed_iter()
            .all(|((r, c), &value)| value == if r == c { 1.0 } else { 0.0 })
}

/// Per-band affine stage: `(x - shift) / scale` before the product, `x * scale + shift`
/// after it. A missing scale means 1.
#[derive(Clone, Debug, PartialEq)]
pub struct BandAffine {
    pub shift: Array1<f64>,
    pub scale: Option<Array1<f64>>,
}

impl BandAffine {
    pub fn new(shift: Array1<f64>, scale: Option<Array1<f64>>) -> Result<Self> {
        if let Some(scale) = &scale {
            if scale.len() != shift.len() {
                return Err(TransformError::mismatch("affine scale length", shift.len(), scale.len()));
            }
        }
        Ok(Self { shift, scale })
    }

    pub fn len(&self) -> usize {
        self.shift.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shift.is_empty()
    }
}

/// Contiguous copy of an affine stage, cheap to read from worker threads.
struct AffineKernel {
    shift: Vec<f64>,
    scale: Option<Vec<f64>>,
}

impl AffineKernel {
    fn from_stage(stage: Option<&BandAffine>, what: &'static str, bands: usize) -> Result<Option<Self>> {
        let Some(stage) = stage else {
            return Ok(None);
        };
        if stage.len() != bands {
            return Err(TransformError::mismatch(what, bands, stage.len()));
        }
        Ok(Some(Self {
            shift: stage.shift.to_vec(),
            scale: stage.scale.as_ref().map(|scale| scale.to_vec()),
        }))
    }

    #[inline]
    fn normalize(&self, input: &[f64], out: &mut [f64]) {
        match &self.scale {
            Some(scale) => {
                for (((dst, &x), &shift), &scale) in out.iter_mut().zip(input).zip(&self.shift).zip(scale) {
                    *dst = (x - shift) / scale;
                }
            }
            None => {
                for ((dst, &x), &shift) in out.iter_mut().zip(input).zip(&self.shift) {
                    *dst = x - shift;
                }
            }
        }
    }

    #[inline]
    fn denormalize(&self, values: &mut [f64]) {
        match &self.scale {
            Some(scale) => {
                for ((value, &shift), &scale) in values.iter_mut().zip(&self.shift).zip(scale) {
                    *value = *value * scale + shift;
                }
            }
            None => {
                for (value, &shift) in values.iter_mut().zip(&self.shift) {
                    *value += shift;
                }
            }
        }
    }
}

/// Streams `output[p] = post(M · pre(input[p]))` over every pixel of a raster.
///
/// Purely local per pixel, so every region is written independently by one worker.
#[derive(Clone, Debug)]
pub struct MatrixTransformApplier {
    scheduler: TileScheduler,
}

impl MatrixTransformApplier {
    pub fn new(scheduler: &TileScheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
        }
    }

    pub fn apply(&self, raster: &Raster, matrix: &TransformationMatrix) -> Result<Raster> {
        self.apply_affine(raster, None, matrix, None)
    }

    pub fn apply_affine(
        &self,
        raster: &Raster,
        pre: Option<&BandAffine>,
        matrix: &TransformationMatrix,
        post: Option<&BandAffine>,
    ) -> Result<Raster> {
        let effective = matrix.effective()?;
        let (out_bands, in_bands) = effective.dim();
        if in_bands != raster.bands() {
            return Err(TransformError::mismatch(
                "transformation matrix column count",
                raster.bands(),
                in_bands,
            ));
        }
        if out_bands == 0 {
            return Err(TransformError::invalid("transformation matrix has no rows"));
        }
        let pre = AffineKernel::from_stage(pre, "pre-transform stage length", in_bands)?;
        let post = AffineKernel::from_stage(post, "post-transform stage length", out_bands)?;

        let identity = is_identity(&effective);
        if identity && pre.is_none() && post.is_none() {
            log::debug!("Identity transformation; copying {} pixels", raster.n_pixels());
            return Ok(raster.clone());
        }

        let coefficients: Vec<f64> = effective.iter().copied().collect();
        log::info!(
            "Applying {}x{} {} transformation to a {}x{} raster",
            out_bands,
            in_bands,
            matrix.direction,
            raster.width(),
            raster.height()
        );

        let mut output = Raster::zeros(raster.width(), raster.height(), out_bands)?;
        self.scheduler
            .for_each_region_mut(PassStage::Apply, &mut output, |region, rows| {
                let mut scratch = vec![0.0; in_bands];
                for (offset, out_row) in rows.iter_mut().enumerate() {
                    let in_row = raster.region_row(region, region.y + offset);
                    for (input, out) in in_row
                        .chunks_exact(in_bands)
                        .zip(out_row.chunks_exact_mut(out_bands))
                    {
                        let source: &[f64] = match &pre {
                            Some(kernel) => {
                                kernel.normalize(input, &mut scratch);
                                &scratch
                            }
                            None => input,
                        };
                        if identity {
                            out.copy_from_slice(source);
                        } else {
                            for (dst, row) in out.iter_mut().zip(coefficients.chunks_exact(in_bands)) {
                                *dst = row.iter().zip(source).map(|(m, x)| m * x).sum();
                            }
                        }
                        if let Some(kernel) = &post {
                            kernel.denormalize(out);
                        }
                    }
                }
            });
        Ok(output)
    }
}
