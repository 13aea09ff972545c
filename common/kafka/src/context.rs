use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Offset, Statistics, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::metrics_consts::{CONSUMER_LAG, PARTITION_COMMIT_ERRORS, REBALANCES};

/// Called with the partitions of the tracked topic that are about to be revoked.
pub type RevokeHook = Arc<dyn Fn(&[i32]) + Send + Sync>;

/// Client context of the tracked consumer.
///
/// Runs on the client's poll path: exports lag from statistics, logs
/// rebalances and commit results, and resolves where partitions without a
/// committed offset should start when resetting to a timestamp.
pub struct TrackerContext {
    topic: String,
    reset_timestamp: Option<i64>,
    timeout: Duration,
    on_revoked: Option<RevokeHook>,
    /// partition -> position the first fetched record has to be at or past
    pending_seeks: Mutex<HashMap<i32, Offset>>,
    /// partition -> offset of the first record handed to the application
    delivered_from: Mutex<HashMap<i32, i64>>,
}

impl TrackerContext {
    pub fn new(
        topic: impl Into<String>,
        reset_timestamp: Option<i64>,
        timeout: Duration,
        on_revoked: Option<RevokeHook>,
    ) -> Self {
        Self {
            topic: topic.into(),
            reset_timestamp,
            timeout,
            on_revoked,
            pending_seeks: Mutex::new(HashMap::new()),
            delivered_from: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<i32, Offset>> {
        self.pending_seeks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the timestamp target of `partition`, if its first record has not
    /// been checked yet.
    pub fn take_pending_seek(&self, partition: i32) -> Option<Offset> {
        self.pending().remove(&partition)
    }

    fn delivered(&self) -> MutexGuard<'_, HashMap<i32, i64>> {
        self.delivered_from
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember where delivery on `partition` started. Later records on the
    /// same partition do not move it until the partition is revoked.
    pub fn note_delivered(&self, partition: i32, offset: i64) {
        self.delivered().entry(partition).or_insert(offset);
    }

    pub fn delivered_from(&self) -> HashMap<i32, i64> {
        self.delivered().clone()
    }

    fn forget_partitions(&self, partitions: &[i32]) {
        let mut pending = self.pending();
        let mut delivered = self.delivered();
        for partition in partitions {
            pending.remove(partition);
            delivered.remove(partition);
        }
    }

    fn resolve_timestamp_offsets(
        &self,
        consumer: &BaseConsumer<Self>,
        assigned: &TopicPartitionList,
        timestamp: i64,
    ) -> KafkaResult<HashMap<i32, Offset>> {
        let committed = consumer.committed_offsets(assigned.clone(), self.timeout)?;

        let mut lookup = TopicPartitionList::new();
        for elem in committed.elements_for_topic(&self.topic) {
            if !matches!(elem.offset(), Offset::Offset(_)) {
                lookup.add_partition_offset(
                    &self.topic,
                    elem.partition(),
                    Offset::Offset(timestamp),
                )?;
            }
        }
        if lookup.count() == 0 {
            return Ok(HashMap::new());
        }

        let resolved = consumer.offsets_for_times(lookup, self.timeout)?;
        Ok(resolved
            .elements()
            .iter()
            .map(|elem| (elem.partition(), elem.offset()))
            .collect())
    }

    fn partitions_of_topic(&self, list: &TopicPartitionList) -> Vec<i32> {
        list.elements_for_topic(&self.topic)
            .iter()
            .map(|elem| elem.partition())
            .collect()
    }
}

impl ClientContext for TrackerContext {
    fn stats(&self, stats: Statistics) {
        for (topic, stats) in stats.topics {
            for (partition, stats) in stats.partitions {
                // -1 is librdkafka's internal unassigned partition
                if partition < 0 || stats.consumer_lag < 0 {
                    continue;
                }
                metrics::gauge!(
                    CONSUMER_LAG,
                    "topic" => topic.clone(),
                    "partition" => partition.to_string()
                )
                .set(stats.consumer_lag as f64);
            }
        }
    }
}

impl ConsumerContext for TrackerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                let revoked = self.partitions_of_topic(partitions);
                if revoked.is_empty() {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }
                info!(
                    topic = self.topic.as_str(),
                    partitions = ?revoked,
                    "Partitions revoked"
                );
                metrics::counter!(REBALANCES, "kind" => "revoke").increment(1);

                self.forget_partitions(&revoked);

                if let Some(hook) = &self.on_revoked {
                    hook(&revoked);
                }
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!(topic = self.topic.as_str(), "Rebalance failed: {e}");
                metrics::counter!(REBALANCES, "kind" => "error").increment(1);
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        let Rebalance::Assign(partitions) = rebalance else {
            return;
        };

        let assigned = self.partitions_of_topic(partitions);
        if assigned.is_empty() {
            debug!("Skipping empty assign rebalance");
            return;
        }
        info!(
            topic = self.topic.as_str(),
            partitions = ?assigned,
            "Partitions assigned"
        );
        metrics::counter!(REBALANCES, "kind" => "assign").increment(1);

        let Some(timestamp) = self.reset_timestamp else {
            return;
        };
        match self.resolve_timestamp_offsets(base_consumer, partitions, timestamp) {
            Ok(targets) => {
                if !targets.is_empty() {
                    info!(
                        topic = self.topic.as_str(),
                        timestamp = timestamp,
                        partitions = targets.len(),
                        "Starting uncommitted partitions at reset timestamp"
                    );
                }
                self.pending().extend(targets);
            }
            Err(e) => {
                // Those partitions fall back to the earliest offset
                warn!(
                    topic = self.topic.as_str(),
                    timestamp = timestamp,
                    "Failed to resolve offsets for reset timestamp: {e}"
                );
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(topic = self.topic.as_str(), "Offset commit reported an error: {e}");
        }

        for elem in offsets.elements() {
            if let Err(e) = elem.error() {
                error!(
                    topic = elem.topic(),
                    partition = elem.partition(),
                    offset = ?elem.offset(),
                    "Failed to commit partition offset: {e}"
                );
                metrics::counter!(
                    PARTITION_COMMIT_ERRORS,
                    "topic" => elem.topic().to_owned(),
                    "partition" => elem.partition().to_string()
                )
                .increment(1);
            }
        }
    }
}
