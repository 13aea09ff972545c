use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::coordinator::OffsetCoordinator;
use crate::error::ConsumerError;
use crate::metrics_consts::{
    OFFSET_COMMITS, OFFSET_COMMIT_DURATION, OFFSET_COMMIT_ERRORS, OFFSET_ROLLBACKS,
    UNCOMMITTED_PARTITIONS,
};
use crate::offset_tracker::OffsetTracker;
use crate::types::{EpochOffset, KafkaRecord, TopicOffsets};

/// Applies the tracker's bookkeeping against a group coordinator.
///
/// Marks only touch local state. Commits, corrective commits and rollbacks
/// take `commit_lock` for their whole round trip, so at most one request is
/// ever in flight, while the state lock is only held to copy or mutate maps.
pub struct OffsetCommitter<C> {
    topic: String,
    autocommit: bool,
    only_marked: bool,
    state: Mutex<OffsetTracker>,
    commit_lock: tokio::sync::Mutex<()>,
    coordinator: C,
}

impl<C: OffsetCoordinator> OffsetCommitter<C> {
    pub fn new(topic: impl Into<String>, autocommit: bool, only_marked: bool, coordinator: C) -> Self {
        let topic = topic.into();
        Self {
            state: Mutex::new(OffsetTracker::new(topic.clone())),
            topic,
            autocommit,
            only_marked,
            commit_lock: tokio::sync::Mutex::new(()),
            coordinator,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    // A panic while holding the lock cannot leave the maps half-updated
    fn state(&self) -> MutexGuard<'_, OffsetTracker> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `record` has been handled and its offset may be committed.
    pub fn mark_processed(&self, record: &KafkaRecord) {
        self.mark_offset(record.partition, record.epoch_offset());
    }

    pub fn mark_offset(&self, partition: i32, offset: EpochOffset) {
        let tracked = {
            let mut state = self.state();
            state.mark(partition, offset);
            state.len()
        };
        metrics::gauge!(UNCOMMITTED_PARTITIONS, "topic" => self.topic.clone()).set(tracked as f64);

        if self.autocommit && self.only_marked {
            // Fails for partitions revoked since the record was delivered,
            // which the next owner will redeliver anyway
            if let Err(e) = self.coordinator.store(&self.topic, partition, offset) {
                warn!(
                    topic = self.topic.as_str(),
                    partition = partition,
                    offset = offset.offset,
                    "Failed to store marked offset: {e}"
                );
            }
        }
    }

    /// Commit every tracked partition in one request.
    ///
    /// With autocommit on, only a forced commit does anything. On failure the
    /// coordinator error is returned and the tracked offsets are kept, so the
    /// next call resends them.
    pub async fn commit(&self, force_sync: bool) -> Result<(), ConsumerError> {
        if self.autocommit && !force_sync {
            return Ok(());
        }

        let _commit = self.commit_lock.lock().await;

        let (request, partitions) = {
            let state = self.state();
            if state.is_empty() {
                return Ok(());
            }
            (state.commit_request(), state.len())
        };

        self.send(request.clone(), "batch").await?;
        let snapshot = self.read_snapshot().await;

        let remaining = {
            let mut state = self.state();
            state.complete_commit(&request, Instant::now());
            apply_snapshot(&mut state, snapshot, &request);
            state.len()
        };
        metrics::gauge!(UNCOMMITTED_PARTITIONS, "topic" => self.topic.clone())
            .set(remaining as f64);

        debug!(
            topic = self.topic.as_str(),
            partitions = partitions,
            "Committed offsets"
        );
        Ok(())
    }

    /// Commit unless the previous attempt was less than `interval` ago.
    ///
    /// The attempt time is stamped before committing, so callers on a hot
    /// loop cannot trigger more than one attempt per interval even while the
    /// coordinator keeps failing.
    pub async fn commit_after(&self, interval: Duration) -> Result<(), ConsumerError> {
        {
            let mut state = self.state();
            let now = Instant::now();
            if !state.commit_due(interval, now) {
                return Ok(());
            }
            state.stamp_commit(now);
        }

        self.commit(false).await
    }

    /// Forget everything marked since the last commit and move the consumer
    /// back to the committed offsets, so those records are delivered again.
    ///
    /// A partition with nothing committed goes back to the first record
    /// delivered on it, whether or not anything on it was marked.
    pub async fn rollback(&self) -> Result<(), ConsumerError> {
        let _commit = self.commit_lock.lock().await;

        let snapshot = self.read_snapshot().await;
        let delivered_from = self.coordinator.delivered_from();
        let (discarded, targets) = {
            let mut state = self.state();
            if let Ok(snapshot) = snapshot {
                state.set_committed(snapshot);
            }
            (state.clear(), state.rewind_targets(&delivered_from))
        };
        metrics::gauge!(UNCOMMITTED_PARTITIONS, "topic" => self.topic.clone()).set(0.0);
        metrics::counter!(OFFSET_ROLLBACKS, "topic" => self.topic.clone()).increment(1);

        let rewindable = targets.get(&self.topic);
        for partition in discarded.keys() {
            if !rewindable.is_some_and(|p| p.contains_key(partition)) {
                warn!(
                    topic = self.topic.as_str(),
                    partition = *partition,
                    "Nothing committed or delivered to roll back to, partition keeps its position"
                );
            }
        }

        info!(
            topic = self.topic.as_str(),
            discarded = discarded.len(),
            "Rolling back to committed offsets"
        );

        if targets.values().all(HashMap::is_empty) {
            return Ok(());
        }
        self.coordinator.rewind(targets).await
    }

    /// Commit a single partition out of band, leaving the tracked offsets alone.
    pub async fn manual_commit(
        &self,
        partition: i32,
        offset: EpochOffset,
    ) -> Result<(), ConsumerError> {
        let _commit = self.commit_lock.lock().await;

        let request = HashMap::from([(
            self.topic.clone(),
            HashMap::from([(partition, offset)]),
        )]);

        self.send(request.clone(), "manual").await?;
        let snapshot = self.read_snapshot().await;
        apply_snapshot(&mut self.state(), snapshot, &request);

        info!(
            topic = self.topic.as_str(),
            partition = partition,
            offset = offset.offset,
            "Committed offset manually"
        );
        Ok(())
    }

    /// Replace the committed snapshot with what the coordinator holds now.
    pub async fn refresh_snapshot(&self) -> Result<(), ConsumerError> {
        let snapshot = self.coordinator.committed().await?;
        self.state().set_committed(snapshot);
        Ok(())
    }

    pub fn uncommitted(&self) -> HashMap<i32, EpochOffset> {
        self.state().uncommitted().clone()
    }

    pub fn committed_snapshot(&self) -> TopicOffsets {
        self.state().committed().clone()
    }

    pub fn last_commit(&self) -> Option<Instant> {
        self.state().last_commit()
    }

    async fn send(&self, request: TopicOffsets, kind: &'static str) -> Result<(), ConsumerError> {
        let start = Instant::now();
        let result = self.coordinator.commit(request).await;
        metrics::histogram!(OFFSET_COMMIT_DURATION, "kind" => kind)
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!(OFFSET_COMMITS, "topic" => self.topic.clone(), "kind" => kind)
                    .increment(1);
                Ok(())
            }
            Err(e) => {
                metrics::counter!(OFFSET_COMMIT_ERRORS, "topic" => self.topic.clone(), "kind" => kind)
                    .increment(1);
                error!(topic = self.topic.as_str(), kind, "Failed to commit offsets: {e}");
                Err(e)
            }
        }
    }

    async fn read_snapshot(&self) -> Result<TopicOffsets, ConsumerError> {
        let snapshot = self.coordinator.committed().await;
        if let Err(e) = &snapshot {
            warn!(
                topic = self.topic.as_str(),
                "Failed to refresh committed offsets, using cached snapshot: {e}"
            );
        }
        snapshot
    }
}

fn apply_snapshot(
    state: &mut OffsetTracker,
    snapshot: Result<TopicOffsets, ConsumerError>,
    acknowledged: &TopicOffsets,
) {
    match snapshot {
        Ok(snapshot) => state.set_committed(snapshot),
        Err(_) => state.merge_committed(acknowledged),
    }
}
