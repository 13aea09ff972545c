pub mod client_config;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod delivery;
pub mod error;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod metrics_consts;
pub mod offset_committer;
pub mod offset_tracker;
pub mod options;
pub mod types;

pub use error::{ConfigError, ConsumerError, ProduceError};
pub use kafka_consumer::{SingleTopicConsumer, TrackedConsumer};
pub use kafka_producer::KafkaProducer;
pub use types::{EpochOffset, KafkaRecord, TopicOffsets};
