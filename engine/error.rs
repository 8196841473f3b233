use crate::linalg::faer_ndarray::FaerLinalgError;
use thiserror::Error;

/// The single error type surfaced by every statistics pass, solver and engine.
///
/// Errors are raised synchronously where they are detected, which is almost always
/// during the "solve" stage, before any streaming apply pass has started.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Statistics cannot be calculated with zero relevant pixels.")]
    EmptyData,

    #[error("Degenerate statistics: {0}")]
    DegenerateStatistics(String),

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Unsupported transform direction '{0}'; expected 'forward' or 'reverse'.")]
    UnsupportedDirection(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(
        "The accumulator was already synthetized; call reset() before starting a new statistics pass."
    )]
    StaleAccumulator,

    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(String),

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),

    #[error("Failed to read or write parameter file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML file: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to serialize to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl TransformError {
    pub(crate) fn mismatch(what: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            what,
            expected,
            found,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

pub type Result<T, E = TransformError> = std::result::Result<T, E>;
