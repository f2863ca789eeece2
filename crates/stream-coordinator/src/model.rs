//! The shared document schema and the version token it's built on.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A scoped, 4-digit zero-padded compare-and-swap token.
///
/// Stored and compared as a string, not an integer: other-language clients
/// sharing the same table compare it for equality, never for order, so
/// wraparound at `10000` is safe as long as no reader holds a stale snapshot
/// across that many updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u16);

impl Version {
    pub const INITIAL: Version = Version(0);

    /// First version assigned to a freshly-inserted entry (`registerEnhancedConsumer`,
    /// `ensureShardStateExists`), which start at `"0001"` rather than `"0000"`.
    pub const FIRST_ENTRY: Version = Version(1);

    pub fn bump(self) -> Version {
        Version((self.0 + 1) % 10_000)
    }

    pub fn as_str(&self) -> String {
        format!("{:04}", self.0)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl std::str::FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseVersionError(s.to_string()));
        }
        let n: u16 = s.parse().map_err(|_| ParseVersionError(s.to_string()))?;
        Ok(Version(n))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("'{0}' is not a 4-digit version string")]
pub struct ParseVersionError(String);

impl serde::Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The single document stored per `(consumerGroup, streamName)` pair.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamState {
    pub consumer_group: String,
    pub stream_name: String,
    pub stream_created_on: DateTime<Utc>,
    pub version: Version,
    pub consumers: BTreeMap<String, ConsumerEntry>,
    pub enhanced_consumers: BTreeMap<String, EnhancedEntry>,
    pub shards: BTreeMap<String, ShardEntry>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerEntry {
    pub app_name: String,
    pub host: String,
    pub pid: u32,
    pub started_on: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
    pub is_active: bool,
    pub is_standalone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<BTreeMap<String, ShardEntry>>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedEntry {
    pub arn: String,
    pub is_used_by: Option<String>,
    pub is_standalone: bool,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<BTreeMap<String, ShardEntry>>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardEntry {
    pub checkpoint: Option<String>,
    pub depleted: bool,
    pub lease_expiration: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub version: Version,
}

impl ShardEntry {
    /// A freshly-created entry, as inserted by `ensureShardStateExists`.
    pub fn fresh(parent: Option<String>) -> ShardEntry {
        ShardEntry {
            checkpoint: None,
            depleted: false,
            lease_expiration: None,
            lease_owner: None,
            parent,
            version: Version::FIRST_ENTRY,
        }
    }
}

/// Identifies a child shard produced when a parent is marked depleted via `markShardAsDepleted`.
/// Populated by the caller from whatever stream-service SDK it uses; this crate only needs the
/// identifier, the parent topology, and the starting sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildShard {
    pub shard_id: String,
    pub starting_sequence_number: String,
}

/// Identifies a shard for `getShardAndStreamState`; again just the identifiers the core needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub shard_id: String,
    pub parent: Option<String>,
}
