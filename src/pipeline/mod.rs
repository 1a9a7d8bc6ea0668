//! Runs one partition worker per partition over shared stores.
//!
//! Every topic handed to a pipeline must have the configured partition count,
//! so a station's registrations, readings and aggregates share a partition
//! and are only ever touched by one worker.

pub mod retry;
pub mod worker;

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use validator::Validate;

use crate::config::PipelineConfig;
use crate::error::{ProcessingError, Result};
use crate::models::{AggregateRecord, StationMetadata};
use crate::store::{MetadataTable, StateStore};
use crate::transport::{MemoryTopic, TopicSink, TopicSource};
use crate::utils::constants::{
    TEMPERATURES_AGGREGATED_TOPIC, TEMPERATURE_VALUES_TOPIC, WEATHER_STATIONS_TOPIC,
};

pub use retry::RetryPolicy;
pub use worker::{CycleSummary, DriverState, PartitionWorker, PipelineStats};

/// The three topics a pipeline reads from and writes to.
#[derive(Clone)]
pub struct PipelineTopics {
    pub stations: Arc<dyn TopicSource<StationMetadata>>,
    pub readings: Arc<dyn TopicSource<String>>,
    pub output: Arc<dyn TopicSink<AggregateRecord>>,
}

/// In-process topics, used by the replay command and tests.
#[derive(Clone)]
pub struct MemoryTopics {
    pub stations: Arc<MemoryTopic<StationMetadata>>,
    pub readings: Arc<MemoryTopic<String>>,
    pub output: Arc<MemoryTopic<AggregateRecord>>,
}

impl MemoryTopics {
    pub fn new(partitions: usize) -> Self {
        Self {
            stations: MemoryTopic::new(WEATHER_STATIONS_TOPIC, partitions),
            readings: MemoryTopic::new(TEMPERATURE_VALUES_TOPIC, partitions),
            output: MemoryTopic::new(TEMPERATURES_AGGREGATED_TOPIC, partitions),
        }
    }

    pub fn register_station(&self, station: StationMetadata) -> Result<()> {
        self.stations.send(station.station_id, station).map(|_| ())
    }

    pub fn send_reading(&self, station_id: u32, payload: impl Into<String>) -> Result<()> {
        self.readings.send(station_id, payload.into()).map(|_| ())
    }

    /// True once `group` has committed every input record.
    pub fn drained(&self, group: &str) -> bool {
        self.stations.lag(group) == 0 && self.readings.lag(group) == 0
    }

    pub fn pipeline_topics(&self) -> PipelineTopics {
        PipelineTopics {
            stations: Arc::new(Arc::clone(&self.stations)),
            readings: Arc::new(Arc::clone(&self.readings)),
            output: Arc::new(Arc::clone(&self.output)),
        }
    }
}

/// Requests a cooperative stop of every worker of a pipeline.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    metadata: Arc<MetadataTable>,
    store: Arc<StateStore>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, metadata: Arc<MetadataTable>, store: Arc<StateStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            metadata,
            store,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Validate `config` and open both stores, restoring them from their
    /// changelogs when a state directory is configured.
    pub fn open(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let (metadata, store) = match &config.state_dir {
            Some(dir) => (MetadataTable::open_dir(dir)?, StateStore::open_dir(dir)?),
            None => (MetadataTable::in_memory(), StateStore::in_memory()),
        };

        Ok(Self::new(config, Arc::new(metadata), Arc::new(store)))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: Arc::clone(&self.shutdown),
        }
    }

    /// Current aggregate for a station.
    pub fn query(&self, station_id: u32) -> Option<AggregateRecord> {
        self.store.read(station_id)
    }

    pub fn station(&self, station_id: u32) -> Option<StationMetadata> {
        self.metadata.lookup(station_id)
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Run every partition worker until shutdown or the first worker failure.
    ///
    /// A failing worker stops the others cleanly and its error is returned.
    pub async fn run(&self, topics: PipelineTopics) -> Result<PipelineStats> {
        let partitions = self.config.partitions;
        for (name, count) in [
            (topics.stations.name(), topics.stations.partitions()),
            (topics.readings.name(), topics.readings.partitions()),
        ] {
            if count != partitions {
                return Err(ProcessingError::Config(format!(
                    "topic {} has {} partitions but the pipeline expects {}",
                    name, count, partitions
                )));
            }
        }

        let producer = topics.output.producer();
        let retry = RetryPolicy::from_config(&self.config);
        let mut workers = JoinSet::new();

        for partition in 0..partitions {
            let worker = PartitionWorker::new(
                partition,
                topics.stations.consumer(&self.config.group_id, partition)?,
                topics.readings.consumer(&self.config.group_id, partition)?,
                Arc::clone(&producer),
                Arc::clone(&self.metadata),
                Arc::clone(&self.store),
            )
            .with_retry(retry.clone())
            .with_poll(self.config.poll_wait(), self.config.max_poll_records);

            workers.spawn(worker.run(self.shutdown.subscribe()));
        }

        info!(
            partitions,
            group = %self.config.group_id,
            output = topics.output.name(),
            "Pipeline started"
        );

        let mut stats = PipelineStats::default();
        let mut failure = None;

        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(ProcessingError::from).and_then(|result| result);
            match outcome {
                Ok(worker_stats) => stats.merge(&worker_stats),
                Err(err) => {
                    if failure.is_none() {
                        error!(error = %err, "Stopping pipeline after worker failure");
                        self.shutdown.send_replace(true);
                        failure = Some(err);
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => {
                info!(
                    readings = stats.readings_aggregated,
                    emitted = stats.records_emitted,
                    "Pipeline stopped"
                );
                Ok(stats)
            }
        }
    }
}
