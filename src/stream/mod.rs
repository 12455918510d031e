//! Persistent websocket link.
//!
//! - `client`: one connection attempt, its send handle and close reporting.
//! - `keepalive`: fixed-cadence ping frames while open.
//! - `link`: the long-lived service that owns the connection lifecycle.
//! - `proto`: control frames and close details.
//! - `reconnect`: retry timer and delay strategies.
//! - `state`: the connection lifecycle state machine.

/// Websocket connection attempt and send handle.
pub mod client;
/// Liveness probes.
pub mod keepalive;
/// Stream link service.
pub mod link;
/// Control frames exchanged on the stream.
pub mod proto;
/// Reconnect scheduling.
pub mod reconnect;
/// Connection state machine.
pub mod state;
