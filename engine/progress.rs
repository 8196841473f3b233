use std::fmt;

/// Streaming passes reported while statistics are estimated or transforms applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassStage {
    Statistics,
    NoiseExtraction,
    NoiseStatistics,
    InnerProduct,
    IcaOptimization,
    Apply,
}

impl PassStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Statistics => "band statistics",
            Self::NoiseExtraction => "noise extraction",
            Self::NoiseStatistics => "noise statistics",
            Self::InnerProduct => "inner product accumulation",
            Self::IcaOptimization => "ICA fixed-point pass",
            Self::Apply => "matrix transform",
        }
    }
}

impl fmt::Display for PassStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress of a streaming pass.
///
/// Region callbacks arrive from worker threads in no particular order.
pub trait PassObserver: Send + Sync {
    fn on_pass_start(&self, stage: PassStage, total_regions: usize) {
        let _ = (stage, total_regions);
    }
    fn on_region_done(&self, stage: PassStage) {
        let _ = stage;
    }
    fn on_pass_finish(&self, stage: PassStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopPassObserver;

impl PassObserver for NoopPassObserver {}
