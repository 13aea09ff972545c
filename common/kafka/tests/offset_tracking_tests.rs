use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common_kafka::offset_committer::OffsetCommitter;
use common_kafka::test::{topic_offsets, MockCoordinator};
use common_kafka::types::UNKNOWN_EPOCH;
use common_kafka::{ConsumerError, EpochOffset, KafkaRecord};
use rdkafka::types::RDKafkaErrorCode;

const TOPIC: &str = "clickhouse_events_json";

fn record(partition: i32, offset: i64) -> KafkaRecord {
    KafkaRecord {
        key: Some(format!("key-{offset}").into_bytes()),
        value: Some(b"{}".to_vec()),
        topic: TOPIC.to_string(),
        partition,
        offset,
        epoch: UNKNOWN_EPOCH,
        timestamp: None,
    }
}

fn manual_committer() -> OffsetCommitter<MockCoordinator> {
    OffsetCommitter::new(TOPIC, false, false, MockCoordinator::new())
}

#[tokio::test]
async fn commit_two_partitions_in_one_request() {
    let committer = manual_committer();
    committer.mark_processed(&record(0, 10));
    committer.mark_processed(&record(1, 20));

    committer.commit(true).await.unwrap();

    assert_eq!(
        committer.coordinator().commits(),
        vec![topic_offsets(TOPIC, &[(0, 10), (1, 20)])]
    );
    assert!(committer.uncommitted().is_empty());
}

#[tokio::test]
async fn failed_commit_is_retried_with_same_offsets() {
    let committer = manual_committer();
    committer.mark_processed(&record(0, 10));
    committer
        .coordinator()
        .fail_next_commit(RDKafkaErrorCode::NotCoordinator);

    let result = committer.commit(true).await;
    assert!(matches!(result, Err(ConsumerError::Commit(_))));
    assert_eq!(
        committer.uncommitted(),
        HashMap::from([(0, EpochOffset::at(10))])
    );

    committer.commit(true).await.unwrap();

    let expected = topic_offsets(TOPIC, &[(0, 10)]);
    assert_eq!(committer.coordinator().commits(), vec![expected.clone(), expected]);
    assert!(committer.uncommitted().is_empty());
}

#[tokio::test]
async fn autocommit_skips_unforced_commits() {
    let committer = OffsetCommitter::new(TOPIC, true, false, MockCoordinator::new());
    committer.mark_processed(&record(0, 10));

    committer.commit(false).await.unwrap();
    committer.commit_after(Duration::ZERO).await.unwrap();

    assert!(committer.coordinator().commits().is_empty());
    assert_eq!(committer.uncommitted().len(), 1);
}

#[tokio::test]
async fn periodic_commits_from_a_consuming_loop() {
    let committer = manual_committer();
    let interval = Duration::from_millis(100);

    for offset in 0..50 {
        committer.mark_processed(&record(offset as i32 % 2, offset));
        committer.commit_after(interval).await.unwrap();
    }

    // first call always commits, the rest land inside the interval
    assert_eq!(committer.coordinator().commits().len(), 1);

    tokio::time::sleep(interval).await;
    committer.commit_after(interval).await.unwrap();

    let commits = committer.coordinator().commits();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[1], topic_offsets(TOPIC, &[(0, 48), (1, 49)]));
}

#[tokio::test]
async fn rollback_redelivers_from_committed_offsets() {
    let committer = manual_committer();
    committer.mark_processed(&record(0, 10));
    committer.mark_processed(&record(1, 20));
    committer.commit(true).await.unwrap();

    committer.mark_processed(&record(0, 15));
    committer.mark_processed(&record(1, 25));
    committer.rollback().await.unwrap();

    assert!(committer.uncommitted().is_empty());
    assert_eq!(committer.coordinator().commits().len(), 1);
    assert_eq!(
        committer.coordinator().rewinds(),
        vec![topic_offsets(TOPIC, &[(0, 10), (1, 20)])]
    );
}

#[tokio::test]
async fn poison_record_skipped_with_manual_commit() {
    let committer = manual_committer();
    committer.mark_processed(&record(2, 7));

    committer
        .manual_commit(2, EpochOffset::at(9))
        .await
        .unwrap();

    assert_eq!(
        committer.coordinator().committed_offsets(),
        topic_offsets(TOPIC, &[(2, 9)])
    );
    assert_eq!(committer.uncommitted()[&2], EpochOffset::at(7));
}

#[tokio::test]
async fn concurrent_marks_and_commits() {
    let coordinator = MockCoordinator::new();
    coordinator.delay_commits(Duration::from_millis(5));
    let committer = Arc::new(OffsetCommitter::new(TOPIC, false, false, coordinator));

    let mut handles = Vec::new();
    for partition in 0..4 {
        let committer = committer.clone();
        handles.push(tokio::spawn(async move {
            for offset in 0..20 {
                committer.mark_processed(&record(partition, offset));
                if offset % 5 == 4 {
                    committer.commit(true).await?;
                }
            }
            Ok::<_, ConsumerError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    committer.commit(true).await.unwrap();

    assert!(committer.uncommitted().is_empty());
    assert_eq!(committer.coordinator().max_in_flight(), 1);
    assert_eq!(
        committer.coordinator().committed_offsets(),
        topic_offsets(TOPIC, &[(0, 19), (1, 19), (2, 19), (3, 19)])
    );
}
