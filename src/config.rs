//! Relay configuration: defaults, topic table files and value parsing.
//!
//! A topic file is TOML:
//!
//! ```toml
//! policy = "prefix"
//!
//! [topics]
//! "topic-gps" = "gps"
//! "topic-sensor" = "sensor"
//! ```
//!
//! Every error here is a startup error; nothing is reloaded at runtime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::envelope::{MatchPolicy, TopicCategory, TopicMapper};
use crate::http::HttpForwarderDefaults;
use crate::stream::link::StreamDefaults;

/// Defaults for the bundled relay process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RelayDefaults;

impl RelayDefaults {
    pub const STREAM_ENDPOINT: &'static str = StreamDefaults::ENDPOINT;
    pub const KEEPALIVE_SECS: u64 = StreamDefaults::KEEPALIVE_INTERVAL.as_secs();
    pub const RECONNECT_SECS: u64 = StreamDefaults::RECONNECT_DELAY.as_secs();
    pub const CONNECT_TIMEOUT_SECS: u64 = StreamDefaults::CONNECT_TIMEOUT.as_secs();
    pub const HTTP_URL: &'static str = HttpForwarderDefaults::URL;
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read topic file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse topic file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown category `{category}` for topic `{topic}`")]
    UnknownCategory { topic: String, category: String },

    #[error("invalid topic mapping `{0}`, expected `topic=category`")]
    InvalidPair(String),

    #[error("topic table is empty")]
    EmptyTable,

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TopicFile {
    #[serde(default)]
    policy: MatchPolicy,
    #[serde(default)]
    topics: BTreeMap<String, String>,
}

/// Loads a [`TopicMapper`] from a TOML topic file.
///
/// `policy_override` replaces the file's `policy` when set.
pub fn load_topic_file(
    path: impl AsRef<Path>,
    policy_override: Option<MatchPolicy>,
) -> Result<TopicMapper, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_topic_table(&text, policy_override).map_err(|err| match err {
        TableError::Toml(source) => ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        },
        TableError::Config(err) => err,
    })
}

enum TableError {
    Toml(toml::de::Error),
    Config(ConfigError),
}

fn parse_topic_table(
    text: &str,
    policy_override: Option<MatchPolicy>,
) -> Result<TopicMapper, TableError> {
    let file: TopicFile = toml::from_str(text).map_err(TableError::Toml)?;
    let policy = policy_override.unwrap_or(file.policy);
    let table = file
        .topics
        .into_iter()
        .map(|(topic, category)| resolve(topic, &category))
        .collect::<Result<Vec<_>, _>>()
        .map_err(TableError::Config)?;
    if table.is_empty() {
        return Err(TableError::Config(ConfigError::EmptyTable));
    }
    Ok(TopicMapper::new(policy, table))
}

/// Parses one `topic=category` mapping, as given on the command line.
pub fn parse_topic_pair(raw: &str) -> Result<(String, TopicCategory), ConfigError> {
    let Some((topic, category)) = raw.split_once('=') else {
        return Err(ConfigError::InvalidPair(raw.to_string()));
    };
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(ConfigError::InvalidPair(raw.to_string()));
    }
    resolve(topic.to_string(), category.trim())
}

fn resolve(topic: String, category: &str) -> Result<(String, TopicCategory), ConfigError> {
    match category.parse::<TopicCategory>() {
        Ok(category) => Ok((topic, category)),
        Err(_) => Err(ConfigError::UnknownCategory {
            topic,
            category: category.to_string(),
        }),
    }
}

/// Converts a whole-seconds setting, rejecting zero.
pub fn duration_from_secs(name: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::ZeroDuration { name });
    }
    Ok(Duration::from_secs(secs))
}
