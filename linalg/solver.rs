use super::faer_ndarray::{FaerCholesky, FaerEigh, FaerSvd};
use crate::error::{Result, TransformError};
use core::cmp::Ordering;
use faer::Side;
use ndarray::{Array1, Array2};

/// Relative tolerance used when validating caller-supplied symmetric matrices.
pub const SYMMETRY_TOLERANCE: f64 = 1.0e-8;
/// Eigenvalues at or below `EIGENVALUE_EPSILON * max(1, λ_max)` count as zero.
pub const EIGENVALUE_EPSILON: f64 = 1.0e-10;

/// Eigenvalues in descending order with the matching eigenvectors as columns.
#[derive(Clone, Debug)]
pub struct EigenSolution {
    pub values: Array1<f64>,
    pub vectors: Array2<f64>,
}

impl EigenSolution {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The `k` leading eigenvectors laid out as the rows of a `k × n` matrix.
    pub fn leading_rows(&self, k: usize) -> Array2<f64> {
        let n = self.vectors.nrows();
        Array2::from_shape_fn((k, n), |(row, col)| self.vectors[(col, row)])
    }
}

pub fn check_square(what: &'static str, matrix: &Array2<f64>) -> Result<usize> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(TransformError::mismatch(what, rows, cols));
    }
    if rows == 0 {
        return Err(TransformError::invalid(format!("{what} must not be empty")));
    }
    Ok(rows)
}

/// Rejects caller-supplied matrices that are not symmetric up to a relative tolerance.
pub fn check_symmetric(what: &'static str, matrix: &Array2<f64>) -> Result<()> {
    let n = check_square(what, matrix)?;
    let scale = matrix.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
    for i in 0..n {
        for j in (i + 1)..n {
            if (matrix[(i, j)] - matrix[(j, i)]).abs() > SYMMETRY_TOLERANCE * scale {
                return Err(TransformError::invalid(format!(
                    "{what} is not symmetric at ({i}, {j})"
                )));
            }
        }
    }
    Ok(())
}

fn symmetrize(matrix: &Array2<f64>) -> Array2<f64> {
    (matrix + &matrix.t()) * 0.5
}

fn sort_descending(values: Array1<f64>, vectors: Array2<f64>) -> EigenSolution {
    let mut order: Vec<usize> = (0..values.len()).collect();
    // Stable sort: ties keep the order produced by the solver.
    order.sort_by(|&i, &j| values[j].partial_cmp(&values[i]).unwrap_or(Ordering::Equal));
    let sorted_values = Array1::from_iter(order.iter().map(|&idx| values[idx]));
    let mut sorted_vectors = Array2::zeros(vectors.dim());
    for (dst, &src) in order.iter().enumerate() {
        sorted_vectors.column_mut(dst).assign(&vectors.column(src));
    }
    EigenSolution {
        values: sorted_values,
        vectors: sorted_vectors,
    }
}

/// Eigendecomposition of a symmetric matrix, eigenvalues descending.
pub fn symmetric_eigendecompose(matrix: &Array2<f64>) -> Result<EigenSolution> {
    check_square("symmetric matrix", matrix)?;
    let (values, vectors) = symmetrize(matrix).eigh(Side::Lower)?;
    Ok(sort_descending(values, vectors))
}

/// Per-component whitening factors `1 / √λ`.
pub fn whitening_scales(values: &Array1<f64>) -> Result<Array1<f64>> {
    let max = values.iter().fold(1.0_f64, |acc, &v| acc.max(v));
    let tolerance = EIGENVALUE_EPSILON * max;
    values
        .iter()
        .enumerate()
        .map(|(idx, &value)| {
            if value > tolerance {
                Ok(value.sqrt().recip())
            } else {
                Err(TransformError::DegenerateStatistics(format!(
                    "eigenvalue {idx} ({value:e}) is not positive; whitening is undefined"
                )))
            }
        })
        .collect()
}

/// Solves `signal · w = λ · noise · w`.
///
/// The returned basis `V` (columns) satisfies `Vᵗ · noise · V = I`, and the values
/// are the signal-to-noise ratios of the columns, descending.
pub fn generalized_eigendecompose(signal: &Array2<f64>, noise: &Array2<f64>) -> Result<EigenSolution> {
    let n = check_square("signal covariance", signal)?;
    let m = check_square("noise covariance", noise)?;
    if n != m {
        return Err(TransformError::mismatch("noise covariance size", n, m));
    }

    let factor = symmetrize(noise).cholesky(Side::Lower).map_err(|err| {
        TransformError::DegenerateStatistics(format!(
            "noise covariance is not positive definite ({err})"
        ))
    })?;
    // With N = L·Lᵗ: L⁻¹ = Lᵗ·N⁻¹, so L⁻¹·S·L⁻ᵗ = Lᵗ·N⁻¹·S·N⁻¹·L and L⁻ᵗ·U = N⁻¹·L·U.
    let lower = factor.lower();
    let noise_inv_signal = factor.solve_mat(&symmetrize(signal));
    let sandwich = factor.solve_mat(&noise_inv_signal.t());
    let reduced = lower.t().dot(&sandwich).dot(&lower);

    let solution = symmetric_eigendecompose(&reduced)?;
    let basis = factor.solve_mat(&lower.dot(&solution.vectors));
    if basis.iter().any(|value| !value.is_finite()) {
        return Err(TransformError::DegenerateStatistics(
            "generalized eigenbasis is not finite".to_string(),
        ));
    }
    Ok(EigenSolution {
        values: solution.values,
        vectors: basis,
    })
}

/// Moore-Penrose inverse through the SVD.
pub fn pseudo_inverse(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let (rows, cols) = matrix.dim();
    if rows == 0 || cols == 0 {
        return Err(TransformError::invalid("cannot invert an empty matrix"));
    }
    let factors = matrix.svd_full()?;
    let largest = factors
        .singular_values
        .iter()
        .fold(0.0_f64, |acc, &s| acc.max(s));
    let tolerance = (rows.max(cols) as f64) * f64::EPSILON * largest;

    let mut inverse = Array2::<f64>::zeros((cols, rows));
    for (idx, &sigma) in factors.singular_values.iter().enumerate() {
        if sigma <= tolerance {
            continue;
        }
        let v = factors.vt.row(idx);
        let u = factors.u.column(idx);
        for a in 0..cols {
            let scaled = v[a] / sigma;
            for b in 0..rows {
                inverse[(a, b)] += scaled * u[b];
            }
        }
    }
    Ok(inverse)
}

/// `m^(-1/2)` for a symmetric positive definite `m`, computed from its SVD.
pub fn inverse_sqrt_psd(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let n = check_square("decorrelation matrix", matrix)?;
    let factors = symmetrize(matrix).svd_full()?;
    let largest = factors
        .singular_values
        .iter()
        .fold(0.0_f64, |acc, &s| acc.max(s));
    let tolerance = EIGENVALUE_EPSILON * largest.max(1.0);

    let mut result = Array2::<f64>::zeros((n, n));
    for (idx, &sigma) in factors.singular_values.iter().enumerate() {
        if sigma <= tolerance {
            return Err(TransformError::DegenerateStatistics(format!(
                "singular value {idx} ({sigma:e}) prevents symmetric decorrelation"
            )));
        }
        let u = factors.u.column(idx);
        let scale = sigma.sqrt().recip();
        for a in 0..n {
            for b in 0..n {
                result[(a, b)] += scale * u[a] * u[b];
            }
        }
    }
    Ok(result)
}

/// Principal components of `T` training images from their `T × T` Gram matrix.
///
/// Returns the `k` leading eigenvalues and a `k × T` weight matrix. Row `i` is
/// `v_i / √λ_i`, so weighting the images by it yields the i-th eigen-image with unit
/// L2 norm over all pixels. Eigen-images with a null eigenvalue (a centered Gram
/// matrix always has one) get an all-zero row.
pub fn inner_product_components(gram: &Array2<f64>, k: usize) -> Result<(Array1<f64>, Array2<f64>)> {
    let t = check_square("inner product matrix", gram)?;
    if k == 0 {
        return Err(TransformError::invalid("at least one component must be requested"));
    }
    if k > t {
        return Err(TransformError::mismatch("requested component count", t, k));
    }
    let solution = symmetric_eigendecompose(gram)?;
    let values = solution.values.slice(ndarray::s![..k]).to_owned();
    let tolerance = EIGENVALUE_EPSILON * solution.values.iter().fold(1.0_f64, |acc, &v| acc.max(v));
    let mut weights = solution.leading_rows(k);
    for (idx, (mut row, &value)) in weights.rows_mut().into_iter().zip(values.iter()).enumerate() {
        if value > tolerance {
            row *= value.sqrt().recip();
        } else {
            log::warn!("Eigen-image {idx} has a null eigenvalue ({value:e}); its weights are zero");
            row.fill(0.0);
        }
    }
    Ok((values, weights))
}
