use rdkafka::error::KafkaError;
use thiserror::Error;

/// Invalid or unsupported configuration, reported before any client is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognized compression codec: {0}")]
    UnsupportedCompression(String),
    #[error("SASL mechanism not supported: {0}")]
    UnsupportedSaslMechanism(String),
    #[error("unrecognized partition assignment strategy: {0}")]
    UnsupportedAssignmentStrategy(String),
    #[error("unrecognized partitioner: {0}")]
    UnsupportedPartitioner(String),
    #[error("unrecognized offset reset policy: {0}")]
    UnsupportedOffsetReset(String),
    #[error("SASL mechanism {0} requires a username and password")]
    MissingSaslCredentials(String),
    #[error("OAUTHBEARER requires a token endpoint url")]
    MissingTokenEndpoint,
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Errors surfaced by the tracked consumer to its caller.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create kafka consumer: {0}")]
    Create(KafkaError),
    #[error("failed to subscribe to topic {topic}: {error}")]
    Subscribe { topic: String, error: KafkaError },
    #[error("offset commit failed: {0}")]
    Commit(KafkaError),
    #[error("coordinator did not take offset {requested} for {topic}/{partition}")]
    CommitRejected {
        topic: String,
        partition: i32,
        requested: i64,
    },
    #[error("failed to rewind to committed offsets: {0}")]
    Rewind(KafkaError),
    #[error("failed to fetch committed offsets: {0}")]
    Snapshot(KafkaError),
    #[error("failed to store offset: {0}")]
    Store(KafkaError),
    #[error("blocking kafka call panicked or was cancelled")]
    Task(#[from] tokio::task::JoinError),
}

impl ConsumerError {
    /// The underlying client error, if there is one
    pub fn kafka_error(&self) -> Option<&KafkaError> {
        match self {
            ConsumerError::Create(e)
            | ConsumerError::Subscribe { error: e, .. }
            | ConsumerError::Commit(e)
            | ConsumerError::Rewind(e)
            | ConsumerError::Snapshot(e)
            | ConsumerError::Store(e) => Some(e),
            ConsumerError::Config(_)
            | ConsumerError::CommitRejected { .. }
            | ConsumerError::Task(_) => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create kafka producer: {0}")]
    Create(KafkaError),
    #[error("failed to serialize: {error}")]
    Serialization { error: serde_json::Error },
    #[error("failed to produce to kafka: {error}")]
    Produce { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
    #[error("producer is stopped")]
    Closed,
}
