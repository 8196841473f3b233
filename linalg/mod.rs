pub mod faer_ndarray;
pub mod solver;

pub use solver::{
    EigenSolution, check_square, check_symmetric, generalized_eigendecompose,
    inner_product_components, inverse_sqrt_psd, pseudo_inverse, symmetric_eigendecompose,
    whitening_scales,
};
