use common_kafka::config::{ConsumerConfig, EnvMsDuration, KafkaConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    // Committing is skipped while less than this has passed since the last commit
    #[envconfig(default = "1000")]
    pub commit_interval_ms: EnvMsDuration,

    // Stop after this many records, tail forever when unset
    pub max_records: Option<u64>,

    // Copy every record to KAFKA_PRODUCER_TOPIC before marking it processed
    #[envconfig(default = "false")]
    pub forward: bool,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        // Tail with explicit commits unless told otherwise
        ConsumerConfig::set_defaults("kafka-tail", "clickhouse_events_json", false);
        Self::init_from_env()
    }
}
