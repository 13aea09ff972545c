use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::{Offset, TopicPartitionList};
use tracing::warn;

use crate::context::TrackerContext;
use crate::error::ConsumerError;
use crate::types::{EpochOffset, TopicOffsets, UNKNOWN_EPOCH};

/// The group-coordination capabilities the offset tracker needs from a client.
///
/// Every call that reaches the broker waits for its answer. Implementations
/// are only driven through `OffsetCommitter`, which serialises commits.
#[async_trait]
pub trait OffsetCoordinator: Send + Sync {
    /// Commit all `offsets` as one request, failing if any partition is rejected.
    async fn commit(&self, offsets: TopicOffsets) -> Result<(), ConsumerError>;

    /// Read back the offsets the coordinator holds for the current assignment.
    async fn committed(&self) -> Result<TopicOffsets, ConsumerError>;

    /// Move the consumption position of every partition in `offsets` back to it.
    async fn rewind(&self, offsets: TopicOffsets) -> Result<(), ConsumerError>;

    /// Stage an offset for the client's own autocommit. Local, no I/O.
    fn store(&self, topic: &str, partition: i32, offset: EpochOffset)
        -> Result<(), ConsumerError>;

    /// Offset of the first record delivered on each owned partition since it
    /// was assigned. Local, no I/O.
    fn delivered_from(&self) -> HashMap<i32, i64>;
}

/// `OffsetCoordinator` backed by an rdkafka consumer.
///
/// librdkafka's commit, seek and committed calls block the calling thread, so
/// they run on the blocking pool.
pub struct KafkaCoordinator {
    consumer: Arc<StreamConsumer<TrackerContext>>,
    timeout: Duration,
}

impl KafkaCoordinator {
    pub fn new(consumer: Arc<StreamConsumer<TrackerContext>>, timeout: Duration) -> Self {
        Self { consumer, timeout }
    }
}

pub fn to_partition_list(offsets: &TopicOffsets) -> KafkaResult<TopicPartitionList> {
    let mut list = TopicPartitionList::new();
    for (topic, partitions) in offsets {
        for (partition, offset) in partitions {
            list.add_partition_offset(topic, *partition, Offset::Offset(offset.offset))?;
        }
    }
    Ok(list)
}

/// Collect the concrete offsets of a partition list. Partitions without a
/// committed offset are left out.
pub fn from_partition_list(list: &TopicPartitionList) -> TopicOffsets {
    let mut offsets: TopicOffsets = HashMap::new();
    for elem in list.elements() {
        if let Offset::Offset(offset) = elem.offset() {
            offsets
                .entry(elem.topic().to_owned())
                .or_default()
                .insert(elem.partition(), EpochOffset::new(offset, UNKNOWN_EPOCH));
        }
    }
    offsets
}

/// Check a read-back of committed offsets against the commit request.
///
/// librdkafka reports a synchronous commit as successful when only some
/// partitions were rejected, so each requested partition must be stored at
/// the requested offset or past it (an autocommit may have moved it further).
pub fn verify_commit(
    requested: &TopicPartitionList,
    stored: &TopicPartitionList,
) -> Result<(), ConsumerError> {
    for elem in stored.elements() {
        elem.error().map_err(ConsumerError::Commit)?;
    }

    let stored = stored.to_topic_map();
    for elem in requested.elements() {
        let Offset::Offset(requested) = elem.offset() else {
            continue;
        };
        let key = (elem.topic().to_owned(), elem.partition());
        match stored.get(&key) {
            Some(Offset::Offset(offset)) if *offset >= requested => {}
            _ => {
                return Err(ConsumerError::CommitRejected {
                    topic: key.0,
                    partition: key.1,
                    requested,
                })
            }
        }
    }
    Ok(())
}

#[async_trait]
impl OffsetCoordinator for KafkaCoordinator {
    async fn commit(&self, offsets: TopicOffsets) -> Result<(), ConsumerError> {
        let consumer = self.consumer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let list = to_partition_list(&offsets).map_err(ConsumerError::Commit)?;
            consumer
                .commit(&list, CommitMode::Sync)
                .map_err(ConsumerError::Commit)?;

            let stored = consumer
                .committed_offsets(list.clone(), timeout)
                .map_err(ConsumerError::Commit)?;
            verify_commit(&list, &stored)
        })
        .await?
    }

    async fn committed(&self) -> Result<TopicOffsets, ConsumerError> {
        let consumer = self.consumer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            consumer
                .committed(timeout)
                .map(|list| from_partition_list(&list))
                .map_err(ConsumerError::Snapshot)
        })
        .await?
    }

    async fn rewind(&self, offsets: TopicOffsets) -> Result<(), ConsumerError> {
        let consumer = self.consumer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let assigned = consumer
                .assignment()
                .map(|list| list.to_topic_map())
                .map_err(ConsumerError::Rewind)?;

            let mut first_error = None;
            for (topic, partitions) in &offsets {
                for (partition, offset) in partitions {
                    // Seeking a partition this member no longer owns always fails
                    if !assigned.contains_key(&(topic.clone(), *partition)) {
                        continue;
                    }
                    if let Err(e) =
                        consumer.seek(topic, *partition, Offset::Offset(offset.offset), timeout)
                    {
                        warn!(
                            topic = topic.as_str(),
                            partition = *partition,
                            offset = offset.offset,
                            "Failed to rewind partition: {e}"
                        );
                        first_error.get_or_insert(e);
                    }
                }
            }

            match first_error {
                Some(e) => Err(ConsumerError::Rewind(e)),
                None => Ok(()),
            }
        })
        .await?
    }

    fn store(
        &self,
        topic: &str,
        partition: i32,
        offset: EpochOffset,
    ) -> Result<(), ConsumerError> {
        self.consumer
            .store_offset(topic, partition, offset.offset)
            .map_err(ConsumerError::Store)
    }

    fn delivered_from(&self) -> HashMap<i32, i64> {
        self.consumer.context().delivered_from()
    }
}
