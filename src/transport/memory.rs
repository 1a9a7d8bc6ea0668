use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

use crate::error::{ProcessingError, Result};
use crate::transport::{
    partition_for, Consumer, ConsumerRecord, Producer, TopicPartition, TopicSink, TopicSource,
};

struct Partition<V> {
    log: Mutex<Vec<(u32, V)>>,
    appended: Notify,
}

/// In-process partitioned topic with consumer-group offsets.
///
/// Consumers without a committed offset start from the earliest record.
pub struct MemoryTopic<V> {
    name: String,
    partitions: Vec<Partition<V>>,
    committed: Mutex<HashMap<(String, usize), u64>>,
    unavailable: AtomicBool,
}

impl<V> MemoryTopic<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, partitions: usize) -> Arc<Self> {
        let partitions = partitions.max(1);
        Arc::new(Self {
            name: name.into(),
            partitions: (0..partitions)
                .map(|_| Partition {
                    log: Mutex::new(Vec::new()),
                    appended: Notify::new(),
                })
                .collect(),
            committed: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        })
    }

    /// Simulate the broker being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Append a record to the partition owning `key`.
    pub fn send(&self, key: u32, value: V) -> Result<u64> {
        self.check_available()?;

        let partition = &self.partitions[partition_for(key, self.partitions.len())];
        let offset = {
            let mut log = partition.log.lock();
            log.push((key, value));
            (log.len() - 1) as u64
        };
        partition.appended.notify_waiters();

        trace!(topic = %self.name, key, offset, "Appended record");
        Ok(offset)
    }

    /// Every record in the topic, partition by partition.
    pub fn records(&self) -> Vec<ConsumerRecord<V>> {
        (0..self.partitions.len())
            .flat_map(|partition| self.partition_records(partition))
            .collect()
    }

    pub fn partition_records(&self, partition: usize) -> Vec<ConsumerRecord<V>> {
        self.partitions
            .get(partition)
            .map(|p| {
                p.log
                    .lock()
                    .iter()
                    .enumerate()
                    .map(|(offset, (key, value))| ConsumerRecord {
                        partition,
                        offset: offset as u64,
                        key: *key,
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.log.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn committed_offset(&self, group: &str, partition: usize) -> Option<u64> {
        self.committed
            .lock()
            .get(&(group.to_string(), partition))
            .copied()
    }

    /// Records not yet committed by `group`, across all partitions.
    pub fn lag(&self, group: &str) -> u64 {
        (0..self.partitions.len())
            .map(|partition| {
                let end = self.partitions[partition].log.lock().len() as u64;
                end.saturating_sub(self.committed_offset(group, partition).unwrap_or(0))
            })
            .sum()
    }

    pub fn consumer_for(self: &Arc<Self>, group: &str, partition: usize) -> Result<MemoryConsumer<V>> {
        if partition >= self.partitions.len() {
            return Err(ProcessingError::Config(format!(
                "topic {} has no partition {}",
                self.name, partition
            )));
        }

        Ok(MemoryConsumer {
            position: self.committed_offset(group, partition).unwrap_or(0),
            topic: Arc::clone(self),
            group: group.to_string(),
            partition,
        })
    }

    pub fn producer_for(self: &Arc<Self>) -> MemoryProducer<V> {
        MemoryProducer {
            topic: Arc::clone(self),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProcessingError::transport(&self.name, "broker unavailable"));
        }
        Ok(())
    }

    fn fetch(&self, partition: usize, from: u64, max_records: usize) -> Vec<ConsumerRecord<V>> {
        let log = self.partitions[partition].log.lock();
        log.iter()
            .enumerate()
            .skip(from as usize)
            .take(max_records)
            .map(|(offset, (key, value))| ConsumerRecord {
                partition,
                offset: offset as u64,
                key: *key,
                value: value.clone(),
            })
            .collect()
    }
}

impl<V> TopicSource<V> for Arc<MemoryTopic<V>>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn partitions(&self) -> usize {
        self.partitions.len()
    }

    fn consumer(&self, group: &str, partition: usize) -> Result<Box<dyn Consumer<V>>> {
        Ok(Box::new(self.consumer_for(group, partition)?))
    }
}

impl<V> TopicSink<V> for Arc<MemoryTopic<V>>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn producer(&self) -> Arc<dyn Producer<V>> {
        Arc::new(self.producer_for())
    }
}

pub struct MemoryConsumer<V> {
    topic: Arc<MemoryTopic<V>>,
    group: String,
    partition: usize,
    position: u64,
}

#[async_trait]
impl<V> Consumer<V> for MemoryConsumer<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.name.clone(), self.partition)
    }

    async fn poll(&mut self, wait: Duration, max_records: usize) -> Result<Vec<ConsumerRecord<V>>> {
        let mut waited = false;

        loop {
            // Registered before the fetch so an append in between still wakes us.
            let appended = self.topic.partitions[self.partition].appended.notified();

            self.topic.check_available()?;
            let records = self.topic.fetch(self.partition, self.position, max_records);
            if let Some(last) = records.last() {
                self.position = last.offset + 1;
                return Ok(records);
            }

            if waited || wait.is_zero() {
                return Ok(records);
            }

            let _ = tokio::time::timeout(wait, appended).await;
            waited = true;
        }
    }

    async fn commit(&mut self) -> Result<()> {
        self.topic.check_available()?;
        self.topic
            .committed
            .lock()
            .insert((self.group.clone(), self.partition), self.position);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}

pub struct MemoryProducer<V> {
    topic: Arc<MemoryTopic<V>>,
}

#[async_trait]
impl<V> Producer<V> for MemoryProducer<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn send(&self, key: u32, value: V) -> Result<()> {
        self.topic.send(key, value).map(|_| ())
    }
}
