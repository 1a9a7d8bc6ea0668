pub mod aggregation;
pub mod join;

pub use aggregation::AggregationStage;
pub use join::JoinStage;
