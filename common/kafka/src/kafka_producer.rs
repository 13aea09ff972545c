use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::ClientContext;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::client_config::{producer_client_config, ProducerSettings};
use crate::config::{KafkaConfig, ProducerConfig};
use crate::error::ProduceError;
use crate::metrics_consts::{PRODUCER_QUEUE_DEPTH, RECORDS_PRODUCED};

pub struct KafkaContext;

impl ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        metrics::gauge!(PRODUCER_QUEUE_DEPTH).set(stats.msg_cnt as f64);
    }
}

/// A record waiting in the asynchronous send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// Told about every queued record the broker did not accept.
pub type DeliveryCallback = Arc<dyn Fn(&PendingRecord, &ProduceError) + Send + Sync>;

/// Producer for a single topic.
///
/// In sync mode every send waits for the broker acknowledgement. Otherwise
/// sends go through a bounded queue to a background task and failures are
/// only reported to logs, metrics and the delivery callback.
pub struct KafkaProducer {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    sync: bool,
    stopped: AtomicBool,
    message_timeout: Duration,
    queue: Mutex<Option<mpsc::Sender<PendingRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaProducer {
    pub async fn create(
        config: &KafkaConfig,
        producer_config: &ProducerConfig,
    ) -> Result<Self, ProduceError> {
        Self::create_with_callback(config, producer_config, None).await
    }

    pub async fn create_with_callback(
        config: &KafkaConfig,
        producer_config: &ProducerConfig,
        on_error: Option<DeliveryCallback>,
    ) -> Result<Self, ProduceError> {
        let settings = ProducerSettings::try_from(producer_config)?;
        let client_config = producer_client_config(config, &settings)?;

        let producer: FutureProducer<KafkaContext> = client_config
            .create_with_context(KafkaContext)
            .map_err(ProduceError::Create)?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(ProduceError::Create(error));
            }
        }

        let (queue, worker) = if settings.sync {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel(settings.channel_capacity);
            let worker = tokio::spawn(produce_queued(
                producer.clone(),
                settings.topic.clone(),
                rx,
                on_error,
            ));
            (Some(tx), Some(worker))
        };

        Ok(KafkaProducer {
            producer,
            topic: settings.topic,
            sync: settings.sync,
            stopped: AtomicBool::new(false),
            message_timeout: Duration::from_millis(u64::from(settings.message_timeout_ms)),
            queue: Mutex::new(queue),
            worker: Mutex::new(worker),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    pub async fn send(&self, key: Option<&[u8]>, value: &[u8]) -> Result<(), ProduceError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ProduceError::Closed);
        }

        if self.sync {
            let ack = enqueue(&self.producer, &self.topic, key, value)?;
            return await_ack(ack, &self.topic).await;
        }

        let queue = self.queue.lock().await.clone();
        let Some(queue) = queue else {
            return Err(ProduceError::Closed);
        };
        queue
            .send(PendingRecord {
                key: key.map(<[u8]>::to_vec),
                value: value.to_vec(),
            })
            .await
            .map_err(|_| ProduceError::Closed)
    }

    pub async fn send_json<T: Serialize>(
        &self,
        value: &T,
        key: Option<&str>,
    ) -> Result<(), ProduceError> {
        let payload =
            serde_json::to_vec(value).map_err(|error| ProduceError::Serialization { error })?;
        self.send(key.map(str::as_bytes), &payload).await
    }

    /// Wait until everything handed to the client has been acknowledged or
    /// has failed, or until `timeout` passes.
    pub async fn flush(&self, timeout: Duration) -> Result<(), ProduceError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|_| ProduceError::Canceled)?
            .map_err(|error| ProduceError::Produce { error })
    }

    /// Close the send queue, wait for the background task to hand over what
    /// is queued, then flush.
    pub async fn stop(&self) -> Result<(), ProduceError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.queue.lock().await.take();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Producer task failed: {e}");
            }
        }
        self.flush(self.message_timeout).await
    }
}

fn enqueue(
    producer: &FutureProducer<KafkaContext>,
    topic: &str,
    key: Option<&[u8]>,
    value: &[u8],
) -> Result<DeliveryFuture, ProduceError> {
    let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(value);
    if let Some(key) = key {
        record = record.key(key);
    }

    producer.send_result(record).map_err(|(error, _)| {
        metrics::counter!(RECORDS_PRODUCED, "topic" => topic.to_owned(), "outcome" => "rejected")
            .increment(1);
        ProduceError::Produce { error }
    })
}

async fn await_ack(ack: DeliveryFuture, topic: &str) -> Result<(), ProduceError> {
    let (outcome, result) = match ack.await {
        Ok(Ok(_)) => ("success", Ok(())),
        Ok(Err((error, _))) => ("failed", Err(ProduceError::Produce { error })),
        // Cancelled: timeout
        Err(_) => ("canceled", Err(ProduceError::Canceled)),
    };
    metrics::counter!(RECORDS_PRODUCED, "topic" => topic.to_owned(), "outcome" => outcome)
        .increment(1);
    result
}

fn report_failure(record: &PendingRecord, error: &ProduceError, on_error: Option<&DeliveryCallback>) {
    warn!("Failed to produce queued record: {error}");
    if let Some(on_error) = on_error {
        on_error(record, error);
    }
}

async fn produce_queued(
    producer: FutureProducer<KafkaContext>,
    topic: String,
    mut rx: mpsc::Receiver<PendingRecord>,
    on_error: Option<DeliveryCallback>,
) {
    let mut acks = JoinSet::new();

    loop {
        tokio::select! {
            queued = rx.recv() => {
                let Some(record) = queued else {
                    break;
                };
                match enqueue(&producer, &topic, record.key.as_deref(), &record.value) {
                    Ok(ack) => {
                        let topic = topic.clone();
                        acks.spawn(async move {
                            let result = await_ack(ack, &topic).await;
                            (record, result)
                        });
                    }
                    Err(e) => report_failure(&record, &e, on_error.as_ref()),
                }
            }
            Some(done) = acks.join_next(), if !acks.is_empty() => {
                if let Ok((record, Err(e))) = done {
                    report_failure(&record, &e, on_error.as_ref());
                }
            }
        }
    }

    while let Some(done) = acks.join_next().await {
        if let Ok((record, Err(e))) = done {
            report_failure(&record, &e, on_error.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};
    use serde_derive::Serialize;

    use super::*;
    use crate::test::{create_mock_kafka, mock_kafka_config};

    const TOPIC: &str = "produced_events";

    fn producer_config(sync: bool) -> ProducerConfig {
        ProducerConfig {
            kafka_producer_topic: TOPIC.to_string(),
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_producer_queue_messages: 1000,
            kafka_message_timeout_ms: 500,
            kafka_producer_partitioner: "consistent_random".to_string(),
            kafka_producer_sync: sync,
            kafka_producer_channel_capacity: 10,
        }
    }

    #[derive(Serialize)]
    struct Event {
        uuid: uuid::Uuid,
        name: &'static str,
    }

    #[tokio::test]
    async fn sync_send_waits_for_ack() {
        let (_cluster, producer) = create_mock_kafka(TOPIC).await.unwrap();
        assert!(producer.is_sync());

        producer.send(Some(b"key"), b"value").await.unwrap();
        producer
            .send_json(
                &Event {
                    uuid: uuid::Uuid::new_v4(),
                    name: "signed_up",
                },
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sync_send_reports_broker_errors() {
        let (cluster, producer) = create_mock_kafka(TOPIC).await.unwrap();

        // Simulate unretriable errors
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);

        let result = producer.send(None, b"too big").await;
        assert!(matches!(result, Err(ProduceError::Produce { .. })));
    }

    #[tokio::test]
    async fn async_send_reports_failures_to_callback() {
        let cluster: MockCluster<'static, DefaultProducerContext> =
            MockCluster::new(1).expect("failed to create mock brokers");
        cluster.create_topic(TOPIC, 1, 1).unwrap();

        let failures = Arc::new(StdMutex::new(Vec::new()));
        let callback: DeliveryCallback = {
            let failures = failures.clone();
            Arc::new(move |record: &PendingRecord, _: &ProduceError| {
                failures.lock().unwrap().push(record.clone());
            })
        };

        let producer = KafkaProducer::create_with_callback(
            &mock_kafka_config(&cluster),
            &producer_config(false),
            Some(callback),
        )
        .await
        .unwrap();
        assert!(!producer.is_sync());

        producer.send(None, b"delivered").await.unwrap();
        producer.flush(Duration::from_secs(5)).await.unwrap();

        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        producer.send(Some(b"k"), b"rejected").await.unwrap();

        producer.stop().await.unwrap();

        let failures = failures.lock().unwrap();
        assert_eq!(
            *failures,
            vec![PendingRecord {
                key: Some(b"k".to_vec()),
                value: b"rejected".to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn send_after_stop_is_rejected() {
        let cluster: MockCluster<'static, DefaultProducerContext> =
            MockCluster::new(1).expect("failed to create mock brokers");
        let producer =
            KafkaProducer::create(&mock_kafka_config(&cluster), &producer_config(false))
                .await
                .unwrap();

        producer.stop().await.unwrap();

        assert!(matches!(
            producer.send(None, b"late").await,
            Err(ProduceError::Closed)
        ));
    }

    #[tokio::test]
    async fn invalid_partitioner_is_rejected() {
        let cluster: MockCluster<'static, DefaultProducerContext> =
            MockCluster::new(1).expect("failed to create mock brokers");
        let mut config = producer_config(true);
        config.kafka_producer_partitioner = "roundrobin".to_string();

        let result = KafkaProducer::create(&mock_kafka_config(&cluster), &config).await;
        assert!(matches!(result, Err(ProduceError::Config(_))));
    }
}
