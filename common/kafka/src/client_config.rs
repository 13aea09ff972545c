use std::time::Duration;

use rdkafka::config::RDKafkaLogLevel;
use rdkafka::ClientConfig;
use tracing::debug;

use crate::config::{ConsumerConfig, KafkaConfig, ProducerConfig};
use crate::error::ConfigError;
use crate::options::{AssignmentStrategy, Compression, OffsetReset, Partitioner, SaslMechanism};

/// Consumer settings after every string option has been validated.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group: String,
    pub topic: String,
    pub auto_commit: bool,
    pub auto_commit_only_marked: bool,
    pub auto_commit_interval_ms: u32,
    pub assignment_strategy: AssignmentStrategy,
    pub offset_reset: OffsetReset,
    pub session_timeout_ms: u32,
    pub read_committed: bool,
    pub drain_timeout: Duration,
}

impl TryFrom<&ConsumerConfig> for ConsumerSettings {
    type Error = ConfigError;

    fn try_from(config: &ConsumerConfig) -> Result<Self, Self::Error> {
        if config.kafka_consumer_group.trim().is_empty() {
            return Err(ConfigError::Empty("KAFKA_CONSUMER_GROUP"));
        }
        if config.kafka_consumer_topic.trim().is_empty() {
            return Err(ConfigError::Empty("KAFKA_CONSUMER_TOPIC"));
        }

        Ok(ConsumerSettings {
            group: config.kafka_consumer_group.clone(),
            topic: config.kafka_consumer_topic.clone(),
            auto_commit: config.kafka_consumer_auto_commit,
            auto_commit_only_marked: config.kafka_consumer_auto_commit_only_marked,
            auto_commit_interval_ms: config.kafka_consumer_auto_commit_interval_ms,
            assignment_strategy: config.kafka_consumer_assignment_strategy.parse()?,
            offset_reset: config.kafka_consumer_offset_reset.parse()?,
            session_timeout_ms: config.kafka_consumer_session_timeout_ms,
            read_committed: config.kafka_consumer_read_committed,
            drain_timeout: config.kafka_consumer_drain_timeout_ms.0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub topic: String,
    pub linger_ms: u32,
    pub queue_mib: u32,
    pub queue_messages: u32,
    pub message_timeout_ms: u32,
    pub partitioner: Partitioner,
    pub sync: bool,
    pub channel_capacity: usize,
}

impl TryFrom<&ProducerConfig> for ProducerSettings {
    type Error = ConfigError;

    fn try_from(config: &ProducerConfig) -> Result<Self, Self::Error> {
        if config.kafka_producer_topic.trim().is_empty() {
            return Err(ConfigError::Empty("KAFKA_PRODUCER_TOPIC"));
        }

        Ok(ProducerSettings {
            topic: config.kafka_producer_topic.clone(),
            linger_ms: config.kafka_producer_linger_ms,
            queue_mib: config.kafka_producer_queue_mib,
            queue_messages: config.kafka_producer_queue_messages,
            message_timeout_ms: config.kafka_message_timeout_ms,
            partitioner: config.kafka_producer_partitioner.parse()?,
            sync: config.kafka_producer_sync,
            channel_capacity: config.kafka_producer_channel_capacity.max(1),
        })
    }
}

/// Settings shared by consumers and producers: brokers, identity, security.
fn common_client_config(config: &KafkaConfig) -> Result<ClientConfig, ConfigError> {
    if config.kafka_hosts.trim().is_empty() {
        return Err(ConfigError::Empty("KAFKA_HOSTS"));
    }

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    if let Some(client_id) = config.kafka_client_id.as_deref().filter(|id| !id.is_empty()) {
        client_config.set("client.id", client_id);
    }

    let sasl = match config.kafka_sasl_mechanism.as_deref() {
        Some(mechanism) if !mechanism.trim().is_empty() => {
            Some(mechanism.parse::<SaslMechanism>()?)
        }
        _ => None,
    };

    let protocol = match (sasl.is_some(), config.kafka_tls) {
        (true, true) => Some("sasl_ssl"),
        (true, false) => Some("sasl_plaintext"),
        (false, true) => Some("ssl"),
        (false, false) => None,
    };
    if let Some(protocol) = protocol {
        client_config.set("security.protocol", protocol);
    }

    if config.kafka_tls && !config.kafka_verify_ssl_certificate {
        client_config.set("enable.ssl.certificate.verification", "false");
    }

    if let Some(mechanism) = sasl {
        apply_sasl(&mut client_config, mechanism, config)?;
    }

    if config.kafka_verbose {
        client_config
            .set("debug", "broker,cgrp,topic,fetch")
            .set_log_level(RDKafkaLogLevel::Debug);
    }

    Ok(client_config)
}

fn apply_sasl(
    client_config: &mut ClientConfig,
    mechanism: SaslMechanism,
    config: &KafkaConfig,
) -> Result<(), ConfigError> {
    let (Some(user), Some(password)) = (
        config.kafka_sasl_username.as_deref(),
        config.kafka_sasl_password.as_deref(),
    ) else {
        return Err(ConfigError::MissingSaslCredentials(mechanism.to_string()));
    };

    client_config.set("sasl.mechanism", mechanism.as_str());

    match mechanism {
        SaslMechanism::Plain | SaslMechanism::ScramSha256 | SaslMechanism::ScramSha512 => {
            client_config
                .set("sasl.username", user)
                .set("sasl.password", password);
        }
        SaslMechanism::OAuthBearer => {
            let endpoint = config
                .kafka_sasl_oauthbearer_token_endpoint_url
                .as_deref()
                .filter(|url| !url.is_empty())
                .ok_or(ConfigError::MissingTokenEndpoint)?;
            client_config
                .set("sasl.oauthbearer.method", "oidc")
                .set("sasl.oauthbearer.client.id", user)
                .set("sasl.oauthbearer.client.secret", password)
                .set("sasl.oauthbearer.token.endpoint.url", endpoint);
        }
    }

    Ok(())
}

/// Build the librdkafka configuration for a group consumer.
///
/// The compression codec is a producer-side property, but it is still validated
/// here so a consumer and producer sharing one `KafkaConfig` fail the same way.
pub fn consumer_client_config(
    config: &KafkaConfig,
    settings: &ConsumerSettings,
) -> Result<ClientConfig, ConfigError> {
    config.kafka_compression_codec.parse::<Compression>()?;

    let mut client_config = common_client_config(config)?;
    client_config
        .set("group.id", &settings.group)
        .set("enable.auto.commit", settings.auto_commit.to_string())
        .set(
            "auto.commit.interval.ms",
            settings.auto_commit_interval_ms.to_string(),
        )
        .set("auto.offset.reset", settings.offset_reset.auto_offset_reset())
        .set(
            "partition.assignment.strategy",
            settings.assignment_strategy.as_str(),
        )
        .set(
            "session.timeout.ms",
            settings.session_timeout_ms.to_string(),
        )
        .set("enable.partition.eof", "false");

    // Offsets are only stored by the client itself when autocommit should cover
    // every delivered record. Otherwise they are stored on mark, or not at all.
    let auto_store = settings.auto_commit && !settings.auto_commit_only_marked;
    client_config.set("enable.auto.offset.store", auto_store.to_string());

    if settings.read_committed {
        client_config.set("isolation.level", "read_committed");
    } else {
        client_config.set("isolation.level", "read_uncommitted");
    }

    debug!("rdkafka consumer configuration: {:?}", client_config);
    Ok(client_config)
}

pub fn producer_client_config(
    config: &KafkaConfig,
    settings: &ProducerSettings,
) -> Result<ClientConfig, ConfigError> {
    let compression = config.kafka_compression_codec.parse::<Compression>()?;

    let mut client_config = common_client_config(config)?;
    client_config
        .set("linger.ms", settings.linger_ms.to_string())
        .set(
            "message.timeout.ms",
            settings.message_timeout_ms.to_string(),
        )
        .set("compression.codec", compression.as_str())
        .set("partitioner", settings.partitioner.as_str())
        .set(
            "queue.buffering.max.kbytes",
            (settings.queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            settings.queue_messages.to_string(),
        );

    debug!("rdkafka producer configuration: {:?}", client_config);
    Ok(client_config)
}
