pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod processors;
pub mod readers;
pub mod store;
pub mod transport;
pub mod utils;

pub use crate::config::PipelineConfig;
pub use error::{ProcessingError, Result};
pub use models::{AggregateRecord, EnrichedReading, Reading, StationMetadata};
pub use pipeline::{MemoryTopics, Pipeline, PipelineStats, PipelineTopics, ShutdownHandle};
pub use store::{MetadataTable, StateStore};
