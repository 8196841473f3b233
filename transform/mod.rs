pub mod ica;
pub mod matrix;
pub mod mnf;
pub mod noise;
pub mod pca;

use crate::error::{Result, TransformError};
use ndarray::{Array1, Array2};
use std::fmt;

pub use ica::{
    ContrastFunction, ContrastKind, Cube, FixedPointRule, FnContrast, Gauss, IcaConfig, IcaEngine,
    IcaParameters, Tanh,
};
pub use matrix::{BandAffine, Direction, MatrixTransformApplier, TransformationMatrix, is_identity};
pub use mnf::{MnfConfig, MnfEngine, MnfParameters};
pub use noise::{LocalActivity, NoiseExtractor};
pub use pca::{PcaConfig, PcaEngine, PcaParameters, StatisticsMode};

/// Lifecycle shared by every engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    StatisticsReady,
    TransformReady,
    Applied,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::StatisticsReady => "statistics ready",
            Self::TransformReady => "transform ready",
            Self::Applied => "applied",
        };
        f.write_str(name)
    }
}

/// `None` keeps every band.
pub(crate) fn resolve_components(requested: Option<usize>, bands: usize) -> Result<usize> {
    match requested {
        None => Ok(bands),
        Some(0) => Err(TransformError::invalid("at least one component must be requested")),
        Some(k) if k > bands => Err(TransformError::mismatch("requested component count", bands, k)),
        Some(k) => Ok(k),
    }
}

pub(crate) fn scale_rows(matrix: &mut Array2<f64>, scales: &Array1<f64>) {
    for (mut row, &scale) in matrix.rows_mut().into_iter().zip(scales.iter()) {
        row *= scale;
    }
}

/// `cov[i][j] / (s_i · s_j)`: the covariance of standardized bands.
pub(crate) fn standardize_covariance(covariance: &Array2<f64>, std_dev: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn(covariance.dim(), |(i, j)| {
        covariance[(i, j)] / (std_dev[i] * std_dev[j])
    })
}

/// The matrix that realizes the reverse direction. A supplied `Reverse` matrix is used
/// as stored; anything else is the pseudo-inverse of the forward matrix.
pub(crate) fn reverse_matrix(
    supplied: Option<&TransformationMatrix>,
    forward: &Array2<f64>,
) -> TransformationMatrix {
    match supplied {
        Some(supplied) if supplied.direction == Direction::Reverse => {
            TransformationMatrix::forward(supplied.matrix.clone())
        }
        _ => TransformationMatrix::reverse(forward.clone()),
    }
}

pub(crate) fn check_vector_len(what: &'static str, vector: Option<&Array1<f64>>, bands: usize) -> Result<()> {
    match vector {
        Some(vector) if vector.len() != bands => Err(TransformError::mismatch(what, bands, vector.len())),
        _ => Ok(()),
    }
}
