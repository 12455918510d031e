//! topic-relay
//!
//! Reads queue records as NDJSON from stdin and relays them as tagged
//! envelopes to a persistent websocket, or to an HTTP endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use topic_relay::config::{self, RelayDefaults};
use topic_relay::envelope::{MatchPolicy, TopicMapper};
use topic_relay::http::HttpForwarder;
use topic_relay::intake;
use topic_relay::relay::{Delivery, Relay};
use topic_relay::stream::link::{StreamConfig, StreamLink};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum SinkKind {
    /// Persistent websocket.
    Stream,
    /// HTTP POST per message.
    Http,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum PolicyArg {
    Exact,
    Prefix,
}

impl From<PolicyArg> for MatchPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Exact => MatchPolicy::Exact,
            PolicyArg::Prefix => MatchPolicy::Prefix,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "topic-relay")]
#[command(version, about = "Relay queue topics to a websocket as tagged JSON envelopes")]
struct Args {
    /// Websocket endpoint (ws:// or wss://).
    #[arg(long, env = "RELAY_ENDPOINT", default_value = RelayDefaults::STREAM_ENDPOINT)]
    endpoint: String,

    /// Keepalive probe interval in seconds.
    #[arg(long, env = "RELAY_KEEPALIVE_SECS", default_value_t = RelayDefaults::KEEPALIVE_SECS)]
    keepalive_secs: u64,

    /// Delay before each reconnect attempt in seconds.
    #[arg(long, env = "RELAY_RECONNECT_SECS", default_value_t = RelayDefaults::RECONNECT_SECS)]
    reconnect_secs: u64,

    /// Seconds a websocket handshake may take before the attempt fails.
    #[arg(
        long,
        env = "RELAY_CONNECT_TIMEOUT_SECS",
        default_value_t = RelayDefaults::CONNECT_TIMEOUT_SECS
    )]
    connect_timeout_secs: u64,

    /// TOML topic table. Defaults to the built-in table for the policy.
    #[arg(long, env = "RELAY_TOPICS_FILE")]
    topics_file: Option<PathBuf>,

    /// Extra `topic=category` mappings, added to the table.
    #[arg(long = "topic", value_name = "TOPIC=CATEGORY")]
    topics: Vec<String>,

    /// Topic match policy. Overrides the topic file's policy.
    #[arg(long, env = "RELAY_MATCH_POLICY", value_enum)]
    match_policy: Option<PolicyArg>,

    /// Where envelopes are delivered.
    #[arg(long, env = "RELAY_SINK", value_enum, default_value_t = SinkKind::Stream)]
    sink: SinkKind,

    /// Target URL for the http sink.
    #[arg(long, env = "RELAY_HTTP_URL", default_value = RelayDefaults::HTTP_URL)]
    http_url: String,

    /// Output logs as JSON.
    #[arg(long, env = "RELAY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("topic_relay=info", args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sink = ?args.sink,
        "Starting topic-relay"
    );

    let mapper = build_mapper(&args)?;
    info!(
        policy = ?mapper.policy(),
        topics = ?mapper.keys().collect::<Vec<_>>(),
        "Topic table loaded"
    );

    let mut link = None;
    let sink: Arc<dyn Delivery> = match args.sink {
        SinkKind::Stream => {
            let stream_config = StreamConfig::new(args.endpoint.as_str())
                .with_keepalive_interval(config::duration_from_secs(
                    "keepalive interval",
                    args.keepalive_secs,
                )?)
                .with_reconnect_delay(config::duration_from_secs(
                    "reconnect delay",
                    args.reconnect_secs,
                )?)
                .with_connect_timeout(config::duration_from_secs(
                    "connect timeout",
                    args.connect_timeout_secs,
                )?);
            let stream =
                Arc::new(StreamLink::start(stream_config).context("invalid stream settings")?);
            link = Some(Arc::clone(&stream));
            stream
        }
        SinkKind::Http => {
            Arc::new(HttpForwarder::new(&args.http_url).context("invalid http forward url")?)
        }
    };

    let relay = Relay::new(mapper, sink);
    let stdin = BufReader::new(tokio::io::stdin());

    tokio::select! {
        result = intake::run_ndjson(stdin, &relay) => {
            let summary = result.context("failed reading intake")?;
            info!(
                records = summary.records,
                relayed = summary.relayed,
                skipped_lines = summary.skipped_lines,
                "Intake finished"
            );
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
        }
    }

    if let Some(link) = link {
        link.shutdown().await;
    }

    let stats = relay.stats();
    info!(
        relayed = stats.relayed,
        unmapped = stats.unmapped,
        malformed = stats.malformed,
        undelivered = stats.undelivered,
        "topic-relay stopped"
    );
    Ok(())
}

fn build_mapper(args: &Args) -> anyhow::Result<TopicMapper> {
    let policy = args.match_policy.map(MatchPolicy::from);
    let mut mapper = match &args.topics_file {
        Some(path) => config::load_topic_file(path, policy)?,
        None => TopicMapper::with_defaults(policy.unwrap_or_default()),
    };
    for raw in &args.topics {
        let (topic, category) = config::parse_topic_pair(raw)?;
        mapper.insert(topic, category);
    }
    Ok(mapper)
}

fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
