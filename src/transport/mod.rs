//! Seam to the message broker.
//!
//! The pipeline only needs ordered, partitioned, key/value logs with
//! consumer-group offsets. `MemoryTopic` provides that in-process; a network
//! client would implement the same traits.

pub mod memory;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

pub use memory::{MemoryConsumer, MemoryProducer, MemoryTopic};

/// A topic name and partition number.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: usize,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: usize) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// One record read from a topic partition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord<V> {
    pub partition: usize,
    pub offset: u64,
    pub key: u32,
    pub value: V,
}

/// Partition a station id consistently across every topic.
///
/// All topics of one pipeline share a partition count, so a station's
/// registrations and readings always land on the same worker.
pub fn partition_for(station_id: u32, partitions: usize) -> usize {
    debug_assert!(partitions > 0);
    station_id as usize % partitions
}

/// Reads one partition of a topic on behalf of a consumer group.
#[async_trait]
pub trait Consumer<V>: Send {
    fn topic_partition(&self) -> TopicPartition;

    /// Next batch past the current position, at most `max_records`.
    ///
    /// Waits at most `wait` for data and returns an empty batch on timeout.
    async fn poll(&mut self, wait: Duration, max_records: usize) -> Result<Vec<ConsumerRecord<V>>>;

    /// Mark everything returned by `poll` so far as consumed for the group.
    async fn commit(&mut self) -> Result<()>;

    /// Offset of the next record `poll` will return.
    fn position(&self) -> u64;
}

/// Appends keyed records to a topic.
#[async_trait]
pub trait Producer<V>: Send + Sync {
    async fn send(&self, key: u32, value: V) -> Result<()>;
}

/// A topic the pipeline consumes from.
pub trait TopicSource<V>: Send + Sync {
    fn name(&self) -> &str;

    fn partitions(&self) -> usize;

    /// Consumer for `partition`, resuming from the group's committed offset.
    fn consumer(&self, group: &str, partition: usize) -> Result<Box<dyn Consumer<V>>>;
}

/// A topic the pipeline produces to.
pub trait TopicSink<V>: Send + Sync {
    fn name(&self) -> &str;

    fn producer(&self) -> Arc<dyn Producer<V>>;
}
