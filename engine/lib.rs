#![deny(unused_variables)]
#![deny(unused_imports)]
//! Streaming spectral transforms (PCA, MNF, ICA) for multi-band rasters that are
//! processed region by region on a fixed worker pool.

pub mod config;
pub mod error;
pub mod progress;
pub mod raster;
pub mod tiling;

#[path = "../linalg/mod.rs"]
pub mod linalg;

#[path = "../stats/mod.rs"]
pub mod stats;

#[path = "../transform/mod.rs"]
pub mod transform;

pub use config::{JobConfig, TransformKind};
pub use error::{Result, TransformError};
pub use progress::{NoopPassObserver, PassObserver, PassStage};
pub use raster::{Raster, Region};
pub use tiling::{SchedulerConfig, SplitStrategy, TileScheduler};
