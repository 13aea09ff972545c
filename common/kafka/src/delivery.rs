use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Offset;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::TrackerContext;
use crate::metrics_consts::{CONSUMER_ERRORS, RECORDS_DELIVERED, RECORDS_SKIPPED_BEFORE_TIMESTAMP};
use crate::options::OffsetReset;
use crate::types::KafkaRecord;

/// Invoked when the delivery loop hits an error it cannot continue past.
pub type FatalHandler = Arc<dyn Fn(&KafkaError) + Send + Sync>;

/// The default fatal handler: a consumer that silently stops delivering is
/// worse than one that restarts, so the process exits.
pub fn exit_on_fatal() -> FatalHandler {
    Arc::new(|e: &KafkaError| {
        error!("Exiting on fatal kafka consumer error: {e}");
        std::process::exit(1);
    })
}

/// What the delivery loop does with an error returned by a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Expected during rebalances and resets, the client recovers by itself
    Benign,
    /// Connectivity trouble, librdkafka keeps reconnecting
    Transient,
    Fatal,
    /// The client is shutting down
    Closed,
}

impl ErrorDisposition {
    /// Reset errors are only expected when the client is allowed to reset.
    /// Under `OffsetReset::NoReset` they mean the position is gone and are fatal.
    pub fn classify(error: &KafkaError, offset_reset: OffsetReset) -> Self {
        match error {
            KafkaError::MessageConsumption(code) => match code {
                RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut => {
                    ErrorDisposition::Benign
                }
                RDKafkaErrorCode::OffsetOutOfRange | RDKafkaErrorCode::AutoOffsetReset => {
                    if offset_reset == OffsetReset::NoReset {
                        ErrorDisposition::Fatal
                    } else {
                        ErrorDisposition::Benign
                    }
                }
                _ => ErrorDisposition::Fatal,
            },
            KafkaError::MessageConsumptionFatal(_) => ErrorDisposition::Fatal,
            KafkaError::Global(code) => match code {
                RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::Fatal => ErrorDisposition::Fatal,
                _ => ErrorDisposition::Transient,
            },
            KafkaError::Canceled => ErrorDisposition::Closed,
            _ => ErrorDisposition::Fatal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorDisposition::Benign => "benign",
            ErrorDisposition::Transient => "transient",
            ErrorDisposition::Fatal => "fatal",
            ErrorDisposition::Closed => "closed",
        }
    }
}

/// Where to move a partition whose first fetched record is at `offset`, when
/// it has to start at the offset resolved for the reset timestamp. `None`
/// means the record is already at or past it and is delivered.
pub fn timestamp_seek(target: Offset, offset: i64) -> Option<Offset> {
    match target {
        Offset::Offset(start) if offset < start => Some(target),
        // No record at or after the timestamp yet
        Offset::End => Some(Offset::End),
        _ => None,
    }
}

/// Polls the client and hands records to the application one at a time.
pub(crate) struct DeliveryLoop {
    pub consumer: Arc<StreamConsumer<TrackerContext>>,
    pub tx: mpsc::Sender<KafkaRecord>,
    pub shutdown: CancellationToken,
    pub drain_timeout: Duration,
    pub seek_timeout: Duration,
    pub offset_reset: OffsetReset,
    pub on_fatal: FatalHandler,
}

impl DeliveryLoop {
    pub async fn run(self) {
        info!("Starting delivery loop");

        loop {
            let fetched = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                fetched = self.consumer.recv() => fetched,
            };

            let record = match fetched {
                Ok(message) => KafkaRecord::from(&message),
                Err(e) => {
                    if self.handle_error(e) {
                        continue;
                    }
                    break;
                }
            };

            if self.skip_before_reset_timestamp(&record).await {
                continue;
            }
            if !self.hand_off(record).await {
                break;
            }
        }

        info!("Delivery loop stopped");
    }

    /// Returns whether the loop keeps going.
    fn handle_error(&self, e: KafkaError) -> bool {
        let disposition = ErrorDisposition::classify(&e, self.offset_reset);
        metrics::counter!(CONSUMER_ERRORS, "disposition" => disposition.as_str()).increment(1);

        match disposition {
            ErrorDisposition::Benign => {
                debug!("Ignoring kafka consumer error: {e}");
                true
            }
            ErrorDisposition::Transient => {
                warn!("Kafka client error, waiting for reconnect: {e}");
                true
            }
            ErrorDisposition::Fatal => {
                error!("Fatal kafka consumer error: {e}");
                (self.on_fatal)(&e);
                false
            }
            ErrorDisposition::Closed => {
                debug!("Kafka consumer closed");
                false
            }
        }
    }

    async fn skip_before_reset_timestamp(&self, record: &KafkaRecord) -> bool {
        let Some(target) = self.consumer.context().take_pending_seek(record.partition) else {
            return false;
        };
        let Some(seek_to) = timestamp_seek(target, record.offset) else {
            return false;
        };

        let consumer = self.consumer.clone();
        let topic = record.topic.clone();
        let partition = record.partition;
        let timeout = self.seek_timeout;
        let seeked =
            tokio::task::spawn_blocking(move || consumer.seek(&topic, partition, seek_to, timeout))
                .await;

        match seeked {
            Ok(Ok(())) => {
                info!(
                    topic = record.topic.as_str(),
                    partition = record.partition,
                    offset = record.offset,
                    seek_to = ?seek_to,
                    "Skipping records before reset timestamp"
                );
                metrics::counter!(
                    RECORDS_SKIPPED_BEFORE_TIMESTAMP,
                    "topic" => record.topic.clone()
                )
                .increment(1);
                true
            }
            Ok(Err(e)) => {
                warn!(
                    topic = record.topic.as_str(),
                    partition = record.partition,
                    "Failed to seek to reset timestamp, delivering from current position: {e}"
                );
                false
            }
            Err(e) => {
                warn!("Seek task failed: {e}");
                false
            }
        }
    }

    /// Returns whether the loop keeps going.
    async fn hand_off(&self, record: KafkaRecord) -> bool {
        let (permit, stopping) = tokio::select! {
            permit = self.tx.reserve() => (permit, false),
            _ = self.shutdown.cancelled() => {
                // Already fetched, give the application a last chance to take it
                match tokio::time::timeout(self.drain_timeout, self.tx.reserve()).await {
                    Ok(permit) => (permit, true),
                    Err(_) => {
                        warn!(
                            topic = record.topic.as_str(),
                            partition = record.partition,
                            offset = record.offset,
                            "Drain timeout elapsed, record will be redelivered"
                        );
                        return false;
                    }
                }
            }
        };

        match permit {
            Ok(permit) => {
                metrics::counter!(RECORDS_DELIVERED, "topic" => record.topic.clone()).increment(1);
                self.consumer
                    .context()
                    .note_delivered(record.partition, record.offset);
                permit.send(record);
                !stopping
            }
            Err(_) => {
                debug!("Record receiver dropped");
                false
            }
        }
    }
}
