use std::collections::HashMap;

use rdkafka::message::{BorrowedMessage, Message};
use time::OffsetDateTime;

/// Leader epoch used when the client does not report one.
pub const UNKNOWN_EPOCH: i32 = -1;

/// Position of a record in a partition, as sent in an offset commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpochOffset {
    pub offset: i64,
    pub epoch: i32,
}

impl EpochOffset {
    pub fn new(offset: i64, epoch: i32) -> Self {
        Self { offset, epoch }
    }

    pub fn at(offset: i64) -> Self {
        Self::new(offset, UNKNOWN_EPOCH)
    }
}

/// topic -> partition -> offset, the shape of a commit request and of the
/// committed snapshot
pub type TopicOffsets = HashMap<String, HashMap<i32, EpochOffset>>;

/// A record handed from the delivery loop to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaRecord {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub epoch: i32,
    pub timestamp: Option<OffsetDateTime>,
}

impl KafkaRecord {
    pub fn epoch_offset(&self) -> EpochOffset {
        EpochOffset::new(self.offset, self.epoch)
    }

    /// The record value interpreted as UTF-8, if there is one and it is valid
    pub fn value_str(&self) -> Option<&str> {
        self.value
            .as_deref()
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

impl From<&BorrowedMessage<'_>> for KafkaRecord {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        let timestamp = message
            .timestamp()
            .to_millis()
            .and_then(|ms| {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
            });

        KafkaRecord {
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().map(<[u8]>::to_vec),
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            epoch: UNKNOWN_EPOCH,
            timestamp,
        }
    }
}
