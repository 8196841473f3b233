pub mod accumulator;
pub mod inner_product;

pub use accumulator::{
    AccumulatorState, BandStatistics, StatisticsAccumulator, StatisticsOptions, compute_statistics,
};
pub use inner_product::{InnerProduct, InnerProductAccumulator};
