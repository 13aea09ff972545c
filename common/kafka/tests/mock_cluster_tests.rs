use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common_kafka::config::{ConsumerConfig, EnvMsDuration, KafkaConfig};
use common_kafka::test::{create_mock_kafka, mock_kafka_config};
use common_kafka::{
    ConsumerError, EpochOffset, KafkaProducer, KafkaRecord, SingleTopicConsumer, TrackedConsumer,
};
use rdkafka::types::{RDKafkaApiKey, RDKafkaErrorCode, RDKafkaRespErr};
use tokio::sync::mpsc::Receiver;
use tokio::time::timeout;

const TOPIC: &str = "tracked_events";
const RECORDS: usize = 6;

fn consumer_config(group: &str) -> ConsumerConfig {
    ConsumerConfig {
        kafka_consumer_group: group.to_string(),
        kafka_consumer_topic: TOPIC.to_string(),
        kafka_consumer_offset_reset: "earliest".to_string(),
        kafka_consumer_auto_commit: false,
        kafka_consumer_auto_commit_only_marked: false,
        kafka_consumer_auto_commit_interval_ms: 5000,
        kafka_consumer_assignment_strategy: "range".to_string(),
        kafka_consumer_session_timeout_ms: 10000,
        kafka_consumer_read_committed: false,
        kafka_consumer_drain_timeout_ms: EnvMsDuration(Duration::from_millis(500)),
    }
}

async fn produce_keyed(producer: &KafkaProducer, key: &str, count: usize) {
    for i in 0..count {
        producer
            .send(Some(key.as_bytes()), format!("event {i}").as_bytes())
            .await
            .unwrap();
    }
}

async fn start(
    config: &ConsumerConfig,
    kafka: &KafkaConfig,
) -> (TrackedConsumer, Receiver<KafkaRecord>) {
    SingleTopicConsumer::new(kafka, config)
        .unwrap()
        .on_fatal(|e| panic!("unexpected consumer error: {e}"))
        .start()
        .await
        .unwrap()
}

async fn next(records: &mut Receiver<KafkaRecord>) -> KafkaRecord {
    timeout(Duration::from_secs(30), records.recv())
        .await
        .expect("timed out waiting for records")
        .expect("delivery channel closed early")
}

/// Receive until a record of `partition` at `offset` shows up
async fn redelivered(records: &mut Receiver<KafkaRecord>, partition: i32, offset: i64) -> bool {
    for _ in 0..20 {
        let record = next(records).await;
        if record.partition == partition && record.offset == offset {
            return true;
        }
    }
    false
}

#[tokio::test]
async fn consume_mark_and_commit() {
    let (cluster, producer) = create_mock_kafka(TOPIC).await.unwrap();
    for i in 0..RECORDS {
        let key = format!("user-{i}");
        producer
            .send(Some(key.as_bytes()), format!("event {i}").as_bytes())
            .await
            .unwrap();
    }

    let (consumer, mut records) =
        SingleTopicConsumer::new(&mock_kafka_config(&cluster), &consumer_config("tracker"))
            .unwrap()
            .on_fatal(|e| panic!("unexpected consumer error: {e}"))
            .start()
            .await
            .unwrap();

    let mut received: Vec<KafkaRecord> = Vec::new();
    while received.len() < RECORDS {
        let record = timeout(Duration::from_secs(30), records.recv())
            .await
            .expect("timed out waiting for records")
            .expect("delivery channel closed early");
        consumer.mark_processed(&record);
        received.push(record);
    }

    let mut last_marked: HashMap<i32, i64> = HashMap::new();
    for record in &received {
        assert_eq!(record.topic, TOPIC);
        assert!(record.value_str().unwrap().starts_with("event "));
        last_marked.insert(record.partition, record.offset);
    }
    assert_eq!(consumer.uncommitted().len(), last_marked.len());

    consumer.commit(true).await.unwrap();

    assert!(consumer.uncommitted().is_empty());
    assert!(consumer.last_commit().is_some());
    let snapshot = consumer.committed_snapshot();
    for (partition, offset) in &last_marked {
        assert_eq!(snapshot[TOPIC][partition], EpochOffset::at(*offset));
    }

    consumer.stop().await;
    let closed = timeout(Duration::from_secs(10), records.recv())
        .await
        .expect("channel not closed after stop");
    assert!(closed.is_none());
}

#[tokio::test]
async fn invalid_config_fails_before_connecting() {
    let (cluster, _producer) = create_mock_kafka(TOPIC).await.unwrap();
    let mut config = consumer_config("tracker");
    config.kafka_consumer_assignment_strategy = "sticky".to_string();

    let result = SingleTopicConsumer::new(&mock_kafka_config(&cluster), &config);
    assert!(result.is_err());
}

#[tokio::test]
async fn rollback_redelivers_from_committed_offset() {
    let (cluster, producer) = create_mock_kafka(TOPIC).await.unwrap();
    produce_keyed(&producer, "same-user", 6).await;
    let (consumer, mut records) =
        start(&consumer_config("rollback"), &mock_kafka_config(&cluster)).await;

    let mut last = next(&mut records).await;
    consumer.mark_processed(&last);
    for _ in 0..2 {
        last = next(&mut records).await;
        consumer.mark_processed(&last);
    }
    consumer.commit(true).await.unwrap();
    let committed = last.offset;

    for _ in 0..2 {
        let record = next(&mut records).await;
        consumer.mark_processed(&record);
    }
    assert!(!consumer.uncommitted().is_empty());

    consumer.rollback().await.unwrap();

    assert!(consumer.uncommitted().is_empty());
    assert!(redelivered(&mut records, last.partition, committed).await);
    consumer.stop().await;
}

#[tokio::test]
async fn rollback_without_commit_redelivers_from_first_record() {
    let (cluster, producer) = create_mock_kafka(TOPIC).await.unwrap();
    produce_keyed(&producer, "same-user", 3).await;
    let (consumer, mut records) =
        start(&consumer_config("rollback-fresh"), &mock_kafka_config(&cluster)).await;

    let first = next(&mut records).await;
    consumer.mark_processed(&first);
    let second = next(&mut records).await;
    consumer.mark_processed(&second);
    assert!(consumer.committed_snapshot().is_empty());

    consumer.rollback().await.unwrap();

    assert!(redelivered(&mut records, first.partition, first.offset).await);
    consumer.stop().await;
}

#[tokio::test]
async fn stop_hands_over_fetched_record() {
    let (cluster, producer) = create_mock_kafka(TOPIC).await.unwrap();
    produce_keyed(&producer, "same-user", 3).await;
    let mut config = consumer_config("draining");
    config.kafka_consumer_drain_timeout_ms = EnvMsDuration(Duration::from_secs(5));
    let (consumer, mut records) = start(&config, &mock_kafka_config(&cluster)).await;

    let first = next(&mut records).await;
    // one record waits in the channel, the loop holds the next one
    tokio::time::sleep(Duration::from_secs(2)).await;

    let stopping = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.stop().await })
    };

    let mut drained = Vec::new();
    while let Some(record) = timeout(Duration::from_secs(10), records.recv())
        .await
        .expect("channel not closed after stop")
    {
        drained.push(record.offset);
    }
    stopping.await.unwrap();

    assert_eq!(first.offset, 0);
    assert_eq!(drained, vec![1, 2]);
}

#[tokio::test]
async fn fatal_error_calls_handler_and_closes_receiver() {
    let (cluster, producer) = create_mock_kafka(TOPIC).await.unwrap();
    produce_keyed(&producer, "same-user", 1).await;
    let mut config = consumer_config("no-reset");
    // a new group has no committed offset to start from
    config.kafka_consumer_offset_reset = "none".to_string();

    let fatal: Arc<Mutex<Vec<Option<RDKafkaErrorCode>>>> = Arc::new(Mutex::new(Vec::new()));
    let (consumer, mut records) = {
        let fatal = fatal.clone();
        SingleTopicConsumer::new(&mock_kafka_config(&cluster), &config)
            .unwrap()
            .on_fatal(move |e| fatal.lock().unwrap().push(e.rdkafka_error_code()))
            .start()
            .await
            .unwrap()
    };

    let closed = timeout(Duration::from_secs(30), records.recv())
        .await
        .expect("receiver not closed after fatal error");
    assert!(closed.is_none());

    let fatal = fatal.lock().unwrap().clone();
    assert_eq!(fatal.len(), 1);
    assert!(matches!(
        fatal[0],
        Some(RDKafkaErrorCode::AutoOffsetReset | RDKafkaErrorCode::OffsetOutOfRange)
    ));
    consumer.stop().await;
}

#[tokio::test]
async fn rejected_partition_commit_keeps_offsets() {
    let (cluster, producer) = create_mock_kafka(TOPIC).await.unwrap();
    produce_keyed(&producer, "same-user", 2).await;
    let (consumer, mut records) =
        start(&consumer_config("rejected"), &mock_kafka_config(&cluster)).await;

    let record = next(&mut records).await;
    consumer.mark_processed(&record);

    cluster.request_errors(
        RDKafkaApiKey::OffsetCommit,
        &[RDKafkaRespErr::RD_KAFKA_RESP_ERR_OFFSET_METADATA_TOO_LARGE],
    );
    let err = consumer.commit(true).await.unwrap_err();
    assert!(matches!(
        err,
        ConsumerError::Commit(_) | ConsumerError::CommitRejected { .. }
    ));
    assert_eq!(
        consumer.uncommitted()[&record.partition],
        record.epoch_offset()
    );
    assert!(consumer.committed_snapshot().is_empty());

    // the retry resends the same offsets
    consumer.commit(true).await.unwrap();
    assert!(consumer.uncommitted().is_empty());
    assert_eq!(
        consumer.committed_snapshot()[TOPIC][&record.partition].offset,
        record.offset
    );
    consumer.stop().await;
}
