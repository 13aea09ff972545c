//! Offset Tracker - bookkeeping for offsets marked as processed but not yet committed
//!
//! Holds the uncommitted set (one entry per partition, last mark wins), the
//! committed snapshot last read back from the group coordinator, and the time
//! of the last commit. It performs no I/O; `OffsetCommitter` owns it behind a
//! lock and drives the coordinator.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::metrics_consts::OUT_OF_ORDER_MARKS;
use crate::types::{EpochOffset, TopicOffsets};

pub struct OffsetTracker {
    topic: String,
    /// partition -> latest offset marked safe to commit
    uncommitted: HashMap<i32, EpochOffset>,
    /// Last state known to be durable at the coordinator
    committed: TopicOffsets,
    last_commit: Option<Instant>,
}

impl OffsetTracker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            uncommitted: HashMap::new(),
            committed: HashMap::new(),
            last_commit: None,
        }
    }

    /// Record `offset` as the latest processed position of `partition`.
    ///
    /// The most recent mark always replaces the previous one. Ordering is the
    /// caller's responsibility; a mark that moves backwards is still applied,
    /// but it is logged and counted. Returns the replaced entry, if any.
    pub fn mark(&mut self, partition: i32, offset: EpochOffset) -> Option<EpochOffset> {
        let previous = self.uncommitted.insert(partition, offset);

        match previous {
            Some(prev) if offset.offset < prev.offset => {
                warn!(
                    topic = self.topic.as_str(),
                    partition = partition,
                    previous_offset = prev.offset,
                    new_offset = offset.offset,
                    "Offset marked out of order"
                );
                metrics::counter!(
                    OUT_OF_ORDER_MARKS,
                    "topic" => self.topic.clone(),
                    "partition" => partition.to_string()
                )
                .increment(1);
            }
            None => {
                debug!(
                    topic = self.topic.as_str(),
                    partition = partition,
                    offset = offset.offset,
                    "Tracking partition"
                );
            }
            _ => {}
        }

        previous
    }

    pub fn uncommitted(&self) -> &HashMap<i32, EpochOffset> {
        &self.uncommitted
    }

    pub fn is_empty(&self) -> bool {
        self.uncommitted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.uncommitted.len()
    }

    /// The whole uncommitted set, shaped as a single commit request.
    pub fn commit_request(&self) -> TopicOffsets {
        HashMap::from([(self.topic.clone(), self.uncommitted.clone())])
    }

    /// Apply a successful commit of `request`.
    ///
    /// Only entries that still hold the committed value are removed, so a
    /// partition marked again while the commit was in flight stays tracked.
    pub fn complete_commit(&mut self, request: &TopicOffsets, at: Instant) {
        let sent = request.get(&self.topic).into_iter().flatten();
        for (partition, offset) in sent {
            if self.uncommitted.get(partition) == Some(offset) {
                self.uncommitted.remove(partition);
            }
        }
        self.last_commit = Some(at);
    }

    /// Drop every uncommitted entry, returning what was discarded.
    pub fn clear(&mut self) -> HashMap<i32, EpochOffset> {
        std::mem::take(&mut self.uncommitted)
    }

    pub fn committed(&self) -> &TopicOffsets {
        &self.committed
    }

    pub fn set_committed(&mut self, snapshot: TopicOffsets) {
        self.committed = snapshot;
    }

    /// Fold offsets the coordinator acknowledged into the snapshot, for when
    /// it cannot be read back.
    pub fn merge_committed(&mut self, acknowledged: &TopicOffsets) {
        for (topic, partitions) in acknowledged {
            self.committed
                .entry(topic.clone())
                .or_default()
                .extend(partitions.iter().map(|(p, o)| (*p, *o)));
        }
    }

    pub fn committed_offset(&self, partition: i32) -> Option<EpochOffset> {
        self.committed
            .get(&self.topic)
            .and_then(|partitions| partitions.get(&partition))
            .copied()
    }

    /// Where a rollback moves each partition: its committed offset, or the
    /// first offset delivered on it when nothing was ever committed.
    pub fn rewind_targets(&self, delivered_from: &HashMap<i32, i64>) -> TopicOffsets {
        let mut targets = self.committed.get(&self.topic).cloned().unwrap_or_default();
        for (partition, offset) in delivered_from {
            if self.committed_offset(*partition).is_none() {
                targets.insert(*partition, EpochOffset::at(*offset));
            }
        }
        HashMap::from([(self.topic.clone(), targets)])
    }

    pub fn last_commit(&self) -> Option<Instant> {
        self.last_commit
    }

    pub fn stamp_commit(&mut self, at: Instant) {
        self.last_commit = Some(at);
    }

    /// Whether at least `interval` has passed since the last commit.
    pub fn commit_due(&self, interval: Duration, now: Instant) -> bool {
        match self.last_commit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= interval,
        }
    }
}
