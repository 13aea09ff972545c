// ==== Offset tracker metrics ====
/// Counter for offset commit requests sent to the group coordinator
pub const OFFSET_COMMITS: &str = "kafka_offset_commits_total";

/// Counter for commit requests rejected by the coordinator
pub const OFFSET_COMMIT_ERRORS: &str = "kafka_offset_commit_errors_total";

/// Histogram for commit round trip duration
pub const OFFSET_COMMIT_DURATION: &str = "kafka_offset_commit_duration_seconds";

/// Gauge for partitions marked processed but not yet committed
pub const UNCOMMITTED_PARTITIONS: &str = "kafka_uncommitted_partitions";

/// Counter for marks that moved a partition backwards
pub const OUT_OF_ORDER_MARKS: &str = "kafka_out_of_order_marks_total";

/// Counter for rollbacks to the committed snapshot
pub const OFFSET_ROLLBACKS: &str = "kafka_offset_rollbacks_total";

/// Counter for per-partition errors reported in commit callbacks
pub const PARTITION_COMMIT_ERRORS: &str = "kafka_partition_commit_errors_total";

// ==== Delivery loop metrics ====
/// Counter for records handed to the application
pub const RECORDS_DELIVERED: &str = "kafka_consumer_records_delivered_total";

/// Counter for consumer errors, labelled by disposition
pub const CONSUMER_ERRORS: &str = "kafka_consumer_errors_total";

/// Counter for records skipped while seeking to a reset timestamp
pub const RECORDS_SKIPPED_BEFORE_TIMESTAMP: &str = "kafka_consumer_records_skipped_total";

/// Counter for rebalance events, labelled by kind
pub const REBALANCES: &str = "kafka_consumer_rebalances_total";

/// Gauge for consumer lag per partition, from client statistics
pub const CONSUMER_LAG: &str = "kafka_consumer_lag";

// ==== Producer metrics ====
/// Counter for produced records, labelled by outcome
pub const RECORDS_PRODUCED: &str = "kafka_producer_records_total";

/// Gauge for messages waiting in the client's producer queue
pub const PRODUCER_QUEUE_DEPTH: &str = "kafka_producer_queue_depth";
