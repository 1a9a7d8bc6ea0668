pub mod aggregate;
pub mod reading;
pub mod station;

pub use aggregate::AggregateRecord;
pub use reading::{EnrichedReading, Reading};
pub use station::StationMetadata;
