//! Relay of topic-partitioned queue messages to a single persistent websocket.
//!
//! The crate is organized by stage:
//! - `envelope`: topic classification and the `{"topic","payload"}` codec.
//! - `relay`: the intake entry point and the pluggable delivery seam.
//! - `stream`: the long-lived websocket link with keepalive and reconnect.
//! - `http`: alternate delivery by HTTP POST.
//! - `intake`: NDJSON record reader used by the bundled binary.
//! - `config`: defaults and topic table loading.

/// Defaults, topic table files and setting validation.
pub mod config;
/// Topic mapping and envelope encoding.
pub mod envelope;
/// HTTP forwarding sink.
pub mod http;
/// NDJSON intake reader.
pub mod intake;
/// Relay entry point, delivery trait and counters.
pub mod relay;
/// Persistent websocket link.
pub mod stream;
