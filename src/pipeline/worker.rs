use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ProcessingError, Result};
use crate::models::{AggregateRecord, EnrichedReading, Reading, StationMetadata};
use crate::pipeline::retry::RetryPolicy;
use crate::processors::{AggregationStage, JoinStage};
use crate::store::{MetadataTable, StateStore};
use crate::transport::{Consumer, ConsumerRecord, Producer};
use crate::utils::constants::{DEFAULT_MAX_POLL_RECORDS, DEFAULT_POLL_WAIT_MS};

/// Where a partition worker is in its processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Polling,
    Processing,
    Committing,
    /// Terminal for this run. Offsets of the failed cycle stay uncommitted.
    Failed,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Idle => "idle",
            DriverState::Polling => "polling",
            DriverState::Processing => "processing",
            DriverState::Committing => "committing",
            DriverState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Counters for one worker, or merged across a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub workers: usize,
    pub cycles: u64,
    pub metadata_applied: u64,
    pub readings_aggregated: u64,
    pub decode_errors: u64,
    pub retries: u64,
    pub records_emitted: u64,
}

impl PipelineStats {
    pub fn merge(&mut self, other: &PipelineStats) {
        self.workers += other.workers;
        self.cycles += other.cycles;
        self.metadata_applied += other.metadata_applied;
        self.readings_aggregated += other.readings_aggregated;
        self.decode_errors += other.decode_errors;
        self.retries += other.retries;
        self.records_emitted += other.records_emitted;
    }

    pub fn summary(&self) -> String {
        let mut summary = String::new();

        summary.push_str("=== Pipeline Summary ===\n");
        summary.push_str(&format!("Workers: {}\n", self.workers));
        summary.push_str(&format!("Cycles: {}\n", self.cycles));
        summary.push_str(&format!("Station updates applied: {}\n", self.metadata_applied));
        summary.push_str(&format!("Readings aggregated: {}\n", self.readings_aggregated));
        summary.push_str(&format!("Malformed readings skipped: {}\n", self.decode_errors));
        summary.push_str(&format!("Retries: {}\n", self.retries));
        summary.push_str(&format!("Aggregates emitted: {}\n", self.records_emitted));

        summary
    }
}

/// Outcome of one poll-process-commit cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub metadata_applied: usize,
    pub readings_aggregated: usize,
    pub decode_errors: usize,
    pub emitted: usize,
}

impl CycleSummary {
    pub fn is_empty(&self) -> bool {
        self.metadata_applied == 0 && self.readings_aggregated == 0 && self.decode_errors == 0
    }
}

/// Drives one partition: registrations and readings in, aggregates out.
///
/// Records are processed strictly one at a time. Registrations polled in a
/// cycle are applied before any reading of that cycle is joined.
pub struct PartitionWorker {
    partition: usize,
    state: DriverState,
    stations: Box<dyn Consumer<StationMetadata>>,
    readings: Box<dyn Consumer<String>>,
    output: Arc<dyn Producer<AggregateRecord>>,
    metadata: Arc<MetadataTable>,
    store: Arc<StateStore>,
    join: JoinStage,
    aggregation: AggregationStage,
    retry: RetryPolicy,
    poll_wait: Duration,
    max_poll_records: usize,
    stats: PipelineStats,
}

impl PartitionWorker {
    pub fn new(
        partition: usize,
        stations: Box<dyn Consumer<StationMetadata>>,
        readings: Box<dyn Consumer<String>>,
        output: Arc<dyn Producer<AggregateRecord>>,
        metadata: Arc<MetadataTable>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            partition,
            state: DriverState::Idle,
            stations,
            readings,
            output,
            join: JoinStage::new(Arc::clone(&metadata)),
            aggregation: AggregationStage::new(Arc::clone(&store)),
            metadata,
            store,
            retry: RetryPolicy::default(),
            poll_wait: Duration::from_millis(DEFAULT_POLL_WAIT_MS),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            stats: PipelineStats {
                workers: 1,
                ..Default::default()
            },
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll(mut self, wait: Duration, max_records: usize) -> Self {
        self.poll_wait = wait;
        self.max_poll_records = max_records.max(1);
        self
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Run cycles until `shutdown` flips to true, then flush and stop.
    ///
    /// A shutdown request lets the cycle in flight finish its commit.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<PipelineStats> {
        info!(
            partition = self.partition,
            stations = %self.stations.topic_partition(),
            readings = %self.readings.topic_partition(),
            "Partition worker started"
        );

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }
            self.run_cycle().await?;
        }

        self.close()?;
        info!(
            partition = self.partition,
            cycles = self.stats.cycles,
            emitted = self.stats.records_emitted,
            "Partition worker stopped"
        );
        Ok(self.stats)
    }

    /// One poll-process-commit cycle. On error the worker is left `Failed`.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary> {
        if self.state == DriverState::Failed {
            return Err(ProcessingError::Config(format!(
                "partition {} worker has failed and must be restarted",
                self.partition
            )));
        }

        match self.cycle().await {
            Ok(summary) => {
                self.state = DriverState::Idle;
                Ok(summary)
            }
            Err(err) => {
                error!(
                    partition = self.partition,
                    error = %err,
                    "Partition worker failed; uncommitted input will be reprocessed on restart"
                );
                self.state = DriverState::Failed;
                Err(err)
            }
        }
    }

    /// Flush both stores so nothing applied stays buffered.
    pub fn close(&mut self) -> Result<()> {
        self.metadata.flush()?;
        self.store.flush()?;
        self.state = DriverState::Idle;
        Ok(())
    }

    async fn cycle(&mut self) -> Result<CycleSummary> {
        self.state = DriverState::Polling;
        let (stations, readings) = self.poll_inputs().await?;

        let mut summary = CycleSummary::default();
        if stations.is_empty() && readings.is_empty() {
            return Ok(summary);
        }

        self.state = DriverState::Processing;
        for record in stations {
            self.apply_station(record).await?;
            summary.metadata_applied += 1;
        }

        let mut outputs = Vec::with_capacity(readings.len());
        for record in readings {
            let reading = match Reading::parse(record.key, &record.value) {
                Ok(reading) => reading,
                Err(err) => {
                    warn!(
                        partition = self.partition,
                        offset = record.offset,
                        station_id = record.key,
                        error = %err,
                        "Skipping malformed reading"
                    );
                    summary.decode_errors += 1;
                    continue;
                }
            };

            let enriched = self.join.join(reading);
            outputs.push(self.aggregate(&enriched).await?);
            summary.readings_aggregated += 1;
        }

        self.state = DriverState::Committing;
        self.flush_stores().await?;
        for record in outputs {
            self.emit(record).await?;
            summary.emitted += 1;
        }
        self.commit_inputs().await?;

        self.stats.cycles += 1;
        self.stats.metadata_applied += summary.metadata_applied as u64;
        self.stats.readings_aggregated += summary.readings_aggregated as u64;
        self.stats.decode_errors += summary.decode_errors as u64;
        self.stats.records_emitted += summary.emitted as u64;

        debug!(
            partition = self.partition,
            metadata = summary.metadata_applied,
            readings = summary.readings_aggregated,
            skipped = summary.decode_errors,
            "Committed cycle"
        );
        Ok(summary)
    }

    /// Readings wait up to the poll bound; registrations are then drained
    /// without waiting, so any registration produced before those readings
    /// is in this cycle whatever its batch size.
    async fn poll_inputs(
        &mut self,
    ) -> Result<(Vec<ConsumerRecord<StationMetadata>>, Vec<ConsumerRecord<String>>)> {
        let (wait, max) = (self.poll_wait, self.max_poll_records);

        let mut failed = 0;
        let readings = loop {
            match self.readings.poll(wait, max).await {
                Ok(records) => break records,
                Err(err) => self.retry_or_fail(err, &mut failed, "poll readings").await?,
            }
        };

        let mut stations = Vec::new();
        loop {
            let mut failed = 0;
            let batch = loop {
                match self.stations.poll(Duration::ZERO, max).await {
                    Ok(records) => break records,
                    Err(err) => self.retry_or_fail(err, &mut failed, "poll stations").await?,
                }
            };

            let drained = batch.len() < max;
            stations.extend(batch);
            if drained {
                break;
            }
        }

        Ok((stations, readings))
    }

    async fn apply_station(&mut self, record: ConsumerRecord<StationMetadata>) -> Result<()> {
        let mut failed = 0;
        loop {
            match self.metadata.upsert(record.key, record.value.clone()) {
                Ok(()) => return Ok(()),
                Err(err) => self.retry_or_fail(err, &mut failed, "upsert station").await?,
            }
        }
    }

    async fn aggregate(&mut self, enriched: &EnrichedReading) -> Result<AggregateRecord> {
        let mut failed = 0;
        loop {
            match self.aggregation.aggregate(enriched) {
                Ok(record) => return Ok(record),
                Err(err) => self.retry_or_fail(err, &mut failed, "aggregate reading").await?,
            }
        }
    }

    async fn flush_stores(&mut self) -> Result<()> {
        let mut failed = 0;
        loop {
            let flushed = self.metadata.flush().and_then(|_| self.store.flush());
            match flushed {
                Ok(()) => return Ok(()),
                Err(err) => self.retry_or_fail(err, &mut failed, "flush stores").await?,
            }
        }
    }

    async fn emit(&mut self, record: AggregateRecord) -> Result<()> {
        let mut failed = 0;
        loop {
            match self.output.send(record.station_id, record.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => self.retry_or_fail(err, &mut failed, "emit aggregate").await?,
            }
        }
    }

    async fn commit_inputs(&mut self) -> Result<()> {
        let mut failed = 0;
        loop {
            match self.stations.commit().await {
                Ok(()) => break,
                Err(err) => self.retry_or_fail(err, &mut failed, "commit stations").await?,
            }
        }

        let mut failed = 0;
        loop {
            match self.readings.commit().await {
                Ok(()) => return Ok(()),
                Err(err) => self.retry_or_fail(err, &mut failed, "commit readings").await?,
            }
        }
    }

    async fn retry_or_fail(
        &mut self,
        err: ProcessingError,
        failed_attempts: &mut u32,
        operation: &str,
    ) -> Result<()> {
        *failed_attempts += 1;

        match self.retry.next_delay(&err, *failed_attempts) {
            Some(delay) => {
                warn!(
                    partition = self.partition,
                    operation,
                    attempt = *failed_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient failure"
                );
                self.stats.retries += 1;
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Err(err),
        }
    }
}
