use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // comma separated seed brokers

    pub kafka_client_id: Option<String>,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Only turn off against brokers with self-signed certificates
    #[envconfig(default = "true")]
    pub kafka_verify_ssl_certificate: bool,

    // PLAIN, SCRAM-SHA-256, SCRAM-SHA-512, OAUTHBEARER (alias MSK_IAM_PLAIN)
    pub kafka_sasl_mechanism: Option<String>,
    pub kafka_sasl_username: Option<String>,
    pub kafka_sasl_password: Option<String>,

    // Only used by OAUTHBEARER, where username/password are the OIDC client id/secret
    pub kafka_sasl_oauthbearer_token_endpoint_url: Option<String>,

    #[envconfig(default = "snappy")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_verbose: bool, // turn on librdkafka debug contexts
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    // earliest, latest, none, or a unix timestamp in milliseconds
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    // When enabled, the client commits on its own schedule and Commit(false) is a no-op.
    #[envconfig(default = "true")]
    pub kafka_consumer_auto_commit: bool,

    // Restrict autocommit to offsets explicitly marked as processed
    #[envconfig(default = "false")]
    pub kafka_consumer_auto_commit_only_marked: bool,

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    // range, roundrobin, cooperative-sticky
    #[envconfig(default = "cooperative-sticky")]
    pub kafka_consumer_assignment_strategy: String,

    #[envconfig(default = "60000")]
    pub kafka_consumer_session_timeout_ms: u32,

    // Only read records written as part of committed transactions
    #[envconfig(default = "true")]
    pub kafka_consumer_read_committed: bool,

    // How long stop() waits for the application to take a record that was
    // already fetched when shutdown was requested
    #[envconfig(default = "5000")]
    pub kafka_consumer_drain_timeout_ms: EnvMsDuration,
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we
    /// can't set good defaults in the derive macro, so we expose a way
    /// for users to set them here before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str, auto_commit: bool) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        };

        if std::env::var("KAFKA_CONSUMER_AUTO_COMMIT").is_err() {
            std::env::set_var("KAFKA_CONSUMER_AUTO_COMMIT", auto_commit.to_string());
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ProducerConfig {
    pub kafka_producer_topic: String,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    // random, consistent, consistent_random, murmur2, murmur2_random, fnv1a, fnv1a_random
    #[envconfig(default = "consistent_random")]
    pub kafka_producer_partitioner: String,

    // Wait for the broker ack on every send instead of queueing to a background task
    #[envconfig(default = "false")]
    pub kafka_producer_sync: bool,

    #[envconfig(default = "1000")]
    pub kafka_producer_channel_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn consumer_config_defaults() {
        let env = HashMap::from([
            ("KAFKA_CONSUMER_GROUP".to_string(), "group".to_string()),
            ("KAFKA_CONSUMER_TOPIC".to_string(), "topic".to_string()),
        ]);
        let config = ConsumerConfig::init_from_hashmap(&env).unwrap();

        assert_eq!(config.kafka_consumer_offset_reset, "latest");
        assert!(config.kafka_consumer_auto_commit);
        assert!(!config.kafka_consumer_auto_commit_only_marked);
        assert_eq!(
            config.kafka_consumer_assignment_strategy,
            "cooperative-sticky"
        );
        assert_eq!(
            config.kafka_consumer_drain_timeout_ms,
            EnvMsDuration(time::Duration::from_secs(5))
        );
    }

    #[test]
    fn kafka_config_defaults() {
        let config = KafkaConfig::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.kafka_hosts, "localhost:9092");
        assert_eq!(config.kafka_compression_codec, "snappy");
        assert!(config.kafka_sasl_mechanism.is_none());
        assert!(!config.kafka_tls);
    }

    #[test]
    fn missing_consumer_group_is_an_error() {
        let env = HashMap::from([("KAFKA_CONSUMER_TOPIC".to_string(), "topic".to_string())]);
        assert!(ConsumerConfig::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn env_ms_duration_parses_millis() {
        assert_eq!(
            "250".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(time::Duration::from_millis(250)))
        );
        assert_eq!(
            "soon".parse::<EnvMsDuration>(),
            Err(ParseEnvMsDurationError)
        );
    }
}
