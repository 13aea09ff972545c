use std::sync::Arc;

use common_kafka::config::ProducerConfig;
use common_kafka::{KafkaProducer, KafkaRecord, SingleTopicConsumer, TrackedConsumer};
use envconfig::Envconfig;
use eyre::{eyre, Result, WrapErr};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::Config;

mod config;

#[derive(Serialize)]
struct TailLine<'a> {
    partition: i32,
    offset: i64,
    key: Option<String>,
    value: Option<&'a str>,
    timestamp: Option<String>,
}

impl<'a> From<&'a KafkaRecord> for TailLine<'a> {
    fn from(record: &'a KafkaRecord) -> Self {
        TailLine {
            partition: record.partition,
            offset: record.offset,
            key: record
                .key
                .as_deref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            value: record.value_str(),
            timestamp: record.timestamp.and_then(|ts| ts.format(&Rfc3339).ok()),
        }
    }
}

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

/// How the tail task ended
#[derive(Debug)]
enum TailExit {
    Finished(Result<()>),
    /// Marks made before the panic cannot be trusted, so nothing is committed
    Panicked,
}

impl From<Result<Result<()>, JoinError>> for TailExit {
    fn from(joined: Result<Result<()>, JoinError>) -> Self {
        match joined {
            Ok(result) => TailExit::Finished(result),
            Err(e) if e.is_panic() => TailExit::Panicked,
            Err(e) => TailExit::Finished(Err(eyre::Report::new(e))),
        }
    }
}

async fn tail(
    config: Config,
    consumer: TrackedConsumer,
    mut records: mpsc::Receiver<KafkaRecord>,
    producer: Option<Arc<KafkaProducer>>,
) -> Result<()> {
    let mut seen: u64 = 0;

    loop {
        let record = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
            record = records.recv() => record,
        };
        let Some(record) = record else {
            warn!("Delivery channel closed");
            return Ok(());
        };

        println!("{}", serde_json::to_string(&TailLine::from(&record))?);

        if let Some(producer) = &producer {
            let value = record.value.as_deref().unwrap_or_default();
            if let Err(e) = producer.send(record.key.as_deref(), value).await {
                // Redeliver everything after the last commit rather than skip it
                error!("Failed to forward record, rolling back: {e}");
                consumer.rollback().await?;
                continue;
            }
        }

        consumer.mark_processed(&record);
        if let Err(e) = consumer.commit_after(config.commit_interval_ms.0).await {
            // Kept for the next attempt
            warn!("Periodic commit failed: {e}");
        }

        seen += 1;
        if config.max_records.is_some_and(|max| seen >= max) {
            info!(records = seen, "Reached record limit");
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_with_defaults().wrap_err("failed to load configuration from env")?;

    let producer = if config.forward {
        let producer_config =
            ProducerConfig::init_from_env().wrap_err("failed to load producer configuration")?;
        Some(Arc::new(
            KafkaProducer::create(&config.kafka, &producer_config)
                .await
                .wrap_err("failed to create kafka producer")?,
        ))
    } else {
        None
    };

    let (consumer, records) = SingleTopicConsumer::new(&config.kafka, &config.consumer)
        .wrap_err("invalid consumer configuration")?
        .on_revoked(|partitions| info!(?partitions, "Handing over partitions"))
        .start()
        .await
        .wrap_err("failed to start kafka consumer")?;

    let task = tokio::spawn(tail(config, consumer.clone(), records, producer.clone()));
    let exit = TailExit::from(task.await);

    if let Some(producer) = &producer {
        if let Err(e) = producer.stop().await {
            error!("Failed to flush forwarded records: {e}");
        }
    }

    match exit {
        TailExit::Panicked => {
            error!("Tail task panicked, stopping without committing");
            consumer.stop().await;
            Err(eyre!("tail task panicked"))
        }
        TailExit::Finished(result) => {
            if let Err(e) = consumer.commit(true).await {
                error!("Final commit failed: {e}");
            }
            consumer.stop().await;
            result
        }
    }
}
