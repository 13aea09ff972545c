use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client_config::{consumer_client_config, ConsumerSettings};
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::context::{RevokeHook, TrackerContext};
use crate::coordinator::KafkaCoordinator;
use crate::delivery::{exit_on_fatal, DeliveryLoop, FatalHandler};
use crate::error::{ConfigError, ConsumerError};
use crate::offset_committer::OffsetCommitter;
use crate::types::{EpochOffset, KafkaRecord, TopicOffsets};

const DEFAULT_COORDINATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// A validated, not yet connected consumer of one topic.
pub struct SingleTopicConsumer {
    client_config: ClientConfig,
    settings: ConsumerSettings,
    coordinator_timeout: Duration,
    on_revoked: Option<RevokeHook>,
    on_fatal: FatalHandler,
}

impl SingleTopicConsumer {
    /// Validate the configuration and build the client settings. No I/O.
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, ConfigError> {
        let settings = ConsumerSettings::try_from(consumer_config)?;
        let client_config = consumer_client_config(common_config, &settings)?;

        Ok(Self {
            client_config,
            settings,
            coordinator_timeout: DEFAULT_COORDINATOR_TIMEOUT,
            on_revoked: None,
            on_fatal: exit_on_fatal(),
        })
    }

    /// Called with the partitions being taken away, before the revocation completes
    pub fn on_revoked(mut self, hook: impl Fn(&[i32]) + Send + Sync + 'static) -> Self {
        self.on_revoked = Some(Arc::new(hook));
        self
    }

    /// Replace the default handler, which exits the process, for delivery
    /// errors the loop cannot recover from. The loop stops after calling it.
    pub fn on_fatal(mut self, handler: impl Fn(&KafkaError) + Send + Sync + 'static) -> Self {
        self.on_fatal = Arc::new(handler);
        self
    }

    /// Timeout of seeks and committed-offset lookups
    pub fn with_coordinator_timeout(mut self, timeout: Duration) -> Self {
        self.coordinator_timeout = timeout;
        self
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Connect, subscribe and start delivering records.
    ///
    /// Records arrive on the returned receiver one at a time. The receiver is
    /// closed once the consumer is stopped or hits a fatal error.
    pub async fn start(
        self,
    ) -> Result<(TrackedConsumer, mpsc::Receiver<KafkaRecord>), ConsumerError> {
        let topic = self.settings.topic.clone();
        let context = TrackerContext::new(
            topic.clone(),
            self.settings.offset_reset.timestamp_ms(),
            self.coordinator_timeout,
            self.on_revoked,
        );

        let consumer: StreamConsumer<TrackerContext> = self
            .client_config
            .create_with_context(context)
            .map_err(ConsumerError::Create)?;
        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|error| ConsumerError::Subscribe {
                topic: topic.clone(),
                error,
            })?;
        let consumer = Arc::new(consumer);

        let committer = OffsetCommitter::new(
            topic.clone(),
            self.settings.auto_commit,
            self.settings.auto_commit_only_marked,
            KafkaCoordinator::new(consumer.clone(), self.coordinator_timeout),
        );
        if let Err(e) = committer.refresh_snapshot().await {
            warn!(topic = topic.as_str(), "Failed to load committed offsets: {e}");
        }

        let (tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let delivery = DeliveryLoop {
            consumer: consumer.clone(),
            tx,
            shutdown: shutdown.clone(),
            drain_timeout: self.settings.drain_timeout,
            seek_timeout: self.coordinator_timeout,
            offset_reset: self.settings.offset_reset,
            on_fatal: self.on_fatal,
        };
        let task = tokio::spawn(delivery.run());

        info!(
            topic = topic.as_str(),
            group = self.settings.group.as_str(),
            autocommit = self.settings.auto_commit,
            "Kafka consumer started"
        );

        let tracked = TrackedConsumer {
            inner: Arc::new(Inner {
                consumer,
                committer,
                shutdown,
                task: Mutex::new(Some(task)),
            }),
        };
        Ok((tracked, rx))
    }
}

/// Handle to a running consumer. Cloning shares the same consumer.
#[derive(Clone)]
pub struct TrackedConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: Arc<StreamConsumer<TrackerContext>>,
    committer: OffsetCommitter<KafkaCoordinator>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TrackedConsumer {
    pub fn topic(&self) -> &str {
        self.inner.committer.topic()
    }

    /// Record that `record` has been handled. Never waits on the network.
    pub fn mark_processed(&self, record: &KafkaRecord) {
        self.inner.committer.mark_processed(record);
    }

    /// Commit every partition marked since the last commit.
    ///
    /// With autocommit on this does nothing unless `force_sync` is set.
    pub async fn commit(&self, force_sync: bool) -> Result<(), ConsumerError> {
        self.inner.committer.commit(force_sync).await
    }

    /// `commit(false)`, at most once per `interval`
    pub async fn commit_after(&self, interval: Duration) -> Result<(), ConsumerError> {
        self.inner.committer.commit_after(interval).await
    }

    /// Drop everything marked since the last commit and seek back to the
    /// committed offsets, so the records after them are delivered again.
    /// Partitions never committed go back to their first delivered record.
    pub async fn rollback(&self) -> Result<(), ConsumerError> {
        self.inner.committer.rollback().await
    }

    /// Commit one partition directly, for example to move past a record that
    /// can never be processed.
    pub async fn manual_commit(
        &self,
        partition: i32,
        offset: EpochOffset,
    ) -> Result<(), ConsumerError> {
        self.inner.committer.manual_commit(partition, offset).await
    }

    pub fn uncommitted(&self) -> HashMap<i32, EpochOffset> {
        self.inner.committer.uncommitted()
    }

    pub fn committed_snapshot(&self) -> TopicOffsets {
        self.inner.committer.committed_snapshot()
    }

    pub fn last_commit(&self) -> Option<Instant> {
        self.inner.committer.last_commit()
    }

    /// Stop delivering and leave the group.
    ///
    /// A record fetched before the call is still handed over if the
    /// application takes it within the drain timeout. The receiver is closed
    /// once this returns. Offsets are not committed here.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let task = self.inner.task.lock().await.take();
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            error!("Delivery loop task failed: {e}");
        }

        self.inner.consumer.unsubscribe();
        info!(topic = self.topic(), "Kafka consumer stopped");
    }
}
