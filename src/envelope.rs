//! Topic classification and envelope encoding.
//!
//! Inbound topic names are mapped to a [`TopicCategory`] by a [`TopicMapper`]
//! and the raw payload is wrapped as `{"topic": <category>, "payload": <json>}`.
//! Everything in this module is pure: no state is retained between calls.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Category a relayed message is tagged with on the stream.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicCategory {
    Sensor,
    Gps,
    Load,
}

impl TopicCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Gps => "gps",
            Self::Load => "load",
        }
    }
}

impl fmt::Display for TopicCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopicCategory {
    type Err = UnknownCategory;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sensor" => Ok(Self::Sensor),
            "gps" => Ok(Self::Gps),
            "load" => Ok(Self::Load),
            _ => Err(UnknownCategory(value.to_string())),
        }
    }
}

/// A category name outside `sensor`, `gps` and `load`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown topic category `{0}` (expected sensor, gps or load)")]
pub struct UnknownCategory(pub String);

/// How topic names are compared against the mapping table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// The topic name must equal a table key.
    #[default]
    Exact,
    /// The topic name must start with a table key; the longest key wins.
    Prefix,
}

/// Kafka topic names relayed by default under [`MatchPolicy::Exact`].
pub const DEFAULT_EXACT_TOPICS: [(&str, TopicCategory); 3] = [
    ("topic-sensor-218", TopicCategory::Sensor),
    ("topic-gps-218", TopicCategory::Gps),
    ("topic-load-218", TopicCategory::Load),
];

/// Topic prefixes relayed by default under [`MatchPolicy::Prefix`].
pub const DEFAULT_TOPIC_PREFIXES: [(&str, TopicCategory); 3] = [
    ("topic-gps", TopicCategory::Gps),
    ("topic-sensor", TopicCategory::Sensor),
    ("topic-load", TopicCategory::Load),
];

/// Maps inbound topic names to categories under a single policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicMapper {
    policy: MatchPolicy,
    table: BTreeMap<String, TopicCategory>,
}

impl TopicMapper {
    /// Builds a mapper from an explicit table.
    pub fn new<I, K>(policy: MatchPolicy, table: I) -> Self
    where
        I: IntoIterator<Item = (K, TopicCategory)>,
        K: Into<String>,
    {
        Self {
            policy,
            table: table
                .into_iter()
                .map(|(topic, category)| (topic.into(), category))
                .collect(),
        }
    }

    /// Default table for the given policy.
    pub fn with_defaults(policy: MatchPolicy) -> Self {
        match policy {
            MatchPolicy::Exact => Self::new(policy, DEFAULT_EXACT_TOPICS),
            MatchPolicy::Prefix => Self::new(policy, DEFAULT_TOPIC_PREFIXES),
        }
    }

    /// Replaces the match policy, keeping the table.
    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Table keys, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Adds or replaces one table entry.
    pub fn insert(&mut self, topic: impl Into<String>, category: TopicCategory) {
        self.table.insert(topic.into(), category);
    }

    /// Returns the category for `topic`, or `None` when it must not be relayed.
    pub fn classify(&self, topic: &str) -> Option<TopicCategory> {
        match self.policy {
            MatchPolicy::Exact => self.table.get(topic).copied(),
            MatchPolicy::Prefix => self
                .table
                .iter()
                .filter(|(prefix, _)| topic.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, category)| *category),
        }
    }
}

impl Default for TopicMapper {
    fn default() -> Self {
        Self::with_defaults(MatchPolicy::default())
    }
}

/// Message wrapper sent over the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub topic: TopicCategory,
    pub payload: Value,
}

impl Envelope {
    /// Parses `raw` as JSON and wraps it under `category`.
    pub fn wrap(category: TopicCategory, raw: &[u8]) -> Result<Self, EnvelopeError> {
        let payload = serde_json::from_slice(raw).map_err(EnvelopeError::Payload)?;
        Ok(Self {
            topic: category,
            payload,
        })
    }

    /// Serializes the envelope to its JSON text frame.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// One-shot codec: parse `raw`, wrap it under `category`, serialize.
pub fn encode(category: TopicCategory, raw: &[u8]) -> Result<String, EnvelopeError> {
    Envelope::wrap(category, raw)?.encode()
}

/// Errors produced while building an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Raw payload is not a JSON document.
    #[error("payload is not valid json: {0}")]
    Payload(#[source] serde_json::Error),

    /// Envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}
