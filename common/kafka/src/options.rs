//! Closed option sets for the string-keyed client settings.
//!
//! Every option is parsed eagerly when a consumer or producer is built, so an
//! unknown value fails construction instead of surfacing on first use.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

// Compression  ratio    CPU       Speed     Network bandwidth usage
// Gzip         Highest  Highest   Slowest   Lowest
// Snappy       Medium   Moderate  Moderate  Medium
// Lz4          Low      Lowest    Fastest   Highest
// Zstd         Medium   Moderate  Moderate  Medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    Gzip,
    #[default]
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    /// Value of librdkafka's `compression.codec`
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(ConfigError::UnsupportedCompression(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
    /// Cloud-managed IAM through librdkafka's OIDC token flow
    OAuthBearer,
}

impl SaslMechanism {
    /// Value of librdkafka's `sasl.mechanism`
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
            SaslMechanism::OAuthBearer => "OAUTHBEARER",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(SaslMechanism::Plain),
            "SCRAM-SHA-256" => Ok(SaslMechanism::ScramSha256),
            "SCRAM-SHA-512" => Ok(SaslMechanism::ScramSha512),
            "OAUTHBEARER" | "MSK_IAM_PLAIN" | "MSK_IAM" => Ok(SaslMechanism::OAuthBearer),
            _ => Err(ConfigError::UnsupportedSaslMechanism(s.to_owned())),
        }
    }
}

impl fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group balancer used when partitions are assigned to group members.
///
/// librdkafka has no eager "sticky" assignor, so `sticky` is rejected rather
/// than quietly swapped for another protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentStrategy {
    Range,
    RoundRobin,
    #[default]
    CooperativeSticky,
}

impl AssignmentStrategy {
    /// Value of librdkafka's `partition.assignment.strategy`
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStrategy::Range => "range",
            AssignmentStrategy::RoundRobin => "roundrobin",
            AssignmentStrategy::CooperativeSticky => "cooperative-sticky",
        }
    }
}

impl FromStr for AssignmentStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "range" => Ok(AssignmentStrategy::Range),
            "roundrobin" | "round-robin" => Ok(AssignmentStrategy::RoundRobin),
            "cooperative-sticky" => Ok(AssignmentStrategy::CooperativeSticky),
            _ => Err(ConfigError::UnsupportedAssignmentStrategy(s.to_owned())),
        }
    }
}

/// Where a partition with no committed offset starts consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
    /// Fail the fetch instead of resetting
    NoReset,
    /// First record at or after this unix timestamp (milliseconds)
    AtTimestamp(i64),
}

impl OffsetReset {
    /// Value of librdkafka's `auto.offset.reset`.
    ///
    /// Timestamp resets start from the earliest offset and are moved forward by
    /// a seek once the timestamp has been resolved for the partition.
    pub fn auto_offset_reset(&self) -> &'static str {
        match self {
            OffsetReset::Earliest | OffsetReset::AtTimestamp(_) => "earliest",
            OffsetReset::Latest => "latest",
            OffsetReset::NoReset => "error",
        }
    }

    pub fn timestamp_ms(&self) -> Option<i64> {
        match self {
            OffsetReset::AtTimestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl FromStr for OffsetReset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        match value.as_str() {
            "earliest" | "start" => Ok(OffsetReset::Earliest),
            "latest" | "end" => Ok(OffsetReset::Latest),
            "none" | "no-reset" | "error" => Ok(OffsetReset::NoReset),
            other => match other.parse::<i64>() {
                Ok(ts) if ts > 0 => Ok(OffsetReset::AtTimestamp(ts)),
                _ => Err(ConfigError::UnsupportedOffsetReset(s.to_owned())),
            },
        }
    }
}

/// Producer partitioner for keyed records, by librdkafka name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Partitioner {
    Random,
    Consistent,
    #[default]
    ConsistentRandom,
    Murmur2,
    Murmur2Random,
    Fnv1a,
    Fnv1aRandom,
}

impl Partitioner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partitioner::Random => "random",
            Partitioner::Consistent => "consistent",
            Partitioner::ConsistentRandom => "consistent_random",
            Partitioner::Murmur2 => "murmur2",
            Partitioner::Murmur2Random => "murmur2_random",
            Partitioner::Fnv1a => "fnv1a",
            Partitioner::Fnv1aRandom => "fnv1a_random",
        }
    }
}

impl FromStr for Partitioner {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "random" => Ok(Partitioner::Random),
            "consistent" => Ok(Partitioner::Consistent),
            "" | "consistent_random" => Ok(Partitioner::ConsistentRandom),
            "murmur2" => Ok(Partitioner::Murmur2),
            "murmur2_random" => Ok(Partitioner::Murmur2Random),
            "fnv1a" => Ok(Partitioner::Fnv1a),
            "fnv1a_random" => Ok(Partitioner::Fnv1aRandom),
            _ => Err(ConfigError::UnsupportedPartitioner(s.to_owned())),
        }
    }
}
