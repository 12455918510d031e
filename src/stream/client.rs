//! Single websocket connection attempt and its send handle.
//!
//! [`open`] spawns a task that connects, reports [`ConnectionEvent::Opened`]
//! with a [`ConnectionHandle`], pumps outbound frames until the connection
//! ends, then reports [`ConnectionEvent::Closed`] or
//! [`ConnectionEvent::Failed`]. Exactly one terminal event is reported per
//! attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

use crate::stream::proto::CloseInfo;

/// Lifecycle callbacks of one connection attempt.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Handshake completed; frames may be sent through `handle`.
    Opened { handle: ConnectionHandle },
    /// Connection ended with (or without) a close handshake.
    Closed(CloseInfo),
    /// Connect failed or the transport errored.
    Failed { error: String },
}

/// Send side of one live connection.
///
/// Cloning is cheap; all clones observe the same open flag.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<String>,
    open: Arc<AtomicBool>,
    close: Arc<watch::Sender<Option<bool>>>,
}

impl ConnectionHandle {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<String>, watch::Receiver<Option<bool>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close, close_rx) = watch::channel(None);
        let handle = Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
            close: Arc::new(close),
        };
        (handle, rx, close_rx)
    }

    /// Hands `text` to the connection task.
    ///
    /// Returns `false` without side effects when the connection is not open
    /// or its hand-off queue is full. Never blocks.
    pub fn send(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(event = "outbound_queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Requests a normal close. `intentional` is echoed in the resulting
    /// [`CloseInfo`] and suppresses reconnection.
    pub fn close(&self, intentional: bool) {
        self.open.store(false, Ordering::Release);
        self.close.send_replace(Some(intentional));
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Handle with no connection behind it, for exercising senders in tests.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (handle, rx, _close_rx) = Self::new(capacity);
        (handle, rx)
    }
}

/// Errors produced while connecting or talking to the stream endpoint.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Endpoint is not a usable `ws://` or `wss://` URI.
    #[error("invalid stream endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Upgrade handshake did not finish in time.
    #[error("websocket handshake timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Link settings are out of range.
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),
}

/// Checks that `endpoint` parses as a websocket URI with a host.
pub fn validate_endpoint(endpoint: &str) -> Result<(), StreamError> {
    let invalid = |reason: String| StreamError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };

    let request = endpoint
        .into_client_request()
        .map_err(|err| invalid(err.to_string()))?;
    let uri = request.uri();
    match uri.scheme_str() {
        Some("ws") | Some("wss") => {}
        Some(other) => return Err(invalid(format!("unsupported scheme `{other}`"))),
        None => return Err(invalid("missing scheme".to_string())),
    }
    match uri.host() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid("missing host".to_string())),
    }
}

/// Per-attempt connection settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectOptions {
    /// Frames that may wait for the socket writer.
    pub capacity: usize,
    /// Upper bound for TCP connect plus the upgrade handshake.
    pub connect_timeout: Duration,
}

/// Spawns one connection attempt to `endpoint`.
///
/// `report` is invoked with `Opened` at most once, then with exactly one of
/// `Closed` or `Failed`. A handshake that outlasts `connect_timeout` is
/// reported as `Failed`. Aborting the returned task drops the socket without
/// reporting.
pub fn open<F>(endpoint: String, options: ConnectOptions, report: F) -> JoinHandle<()>
where
    F: Fn(ConnectionEvent) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        match run_connection(&endpoint, options, &report).await {
            Ok(info) => report(ConnectionEvent::Closed(info)),
            Err(err) => report(ConnectionEvent::Failed {
                error: err.to_string(),
            }),
        }
    })
}

async fn run_connection<F>(
    endpoint: &str,
    options: ConnectOptions,
    report: &F,
) -> Result<CloseInfo, StreamError>
where
    F: Fn(ConnectionEvent),
{
    let request = endpoint.into_client_request()?;
    let (mut socket, response) =
        match tokio::time::timeout(options.connect_timeout, connect_async(request)).await {
            Ok(connected) => connected?,
            Err(_) => return Err(StreamError::ConnectTimeout(options.connect_timeout)),
        };
    info!(
        event = "stream_connected",
        endpoint,
        status = %response.status()
    );

    let (handle, mut outbound_rx, mut close_rx) = ConnectionHandle::new(options.capacity);
    report(ConnectionEvent::Opened {
        handle: handle.clone(),
    });

    let outcome = pump(&mut socket, &mut outbound_rx, &mut close_rx).await;
    handle.mark_closed();
    outcome
}

async fn pump<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    outbound_rx: &mut mpsc::Receiver<String>,
    close_rx: &mut watch::Receiver<Option<bool>>,
) -> Result<CloseInfo, StreamError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                let requested = match changed {
                    Ok(()) => *close_rx.borrow(),
                    Err(_) => None,
                };
                let intentional = requested.unwrap_or(true);
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "relay closing".into(),
                };
                if let Err(err) = socket.close(Some(frame)).await {
                    debug!(event = "close_handshake_failed", error = %err);
                }
                return Ok(CloseInfo {
                    code: CloseInfo::NORMAL,
                    reason: "closed by relay".to_string(),
                    remote: false,
                    intentional,
                });
            }
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => socket.send(Message::Text(text.into())).await?,
                    None => {
                        let _ = socket.close(None).await;
                        return Ok(CloseInfo {
                            code: CloseInfo::NORMAL,
                            reason: "all senders dropped".to_string(),
                            remote: false,
                            intentional: true,
                        });
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        debug!(event = "stream_message_received", text = %text.as_str());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        socket.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let info = match frame {
                            Some(frame) => CloseInfo {
                                code: u16::from(frame.code),
                                reason: frame.reason.as_str().to_string(),
                                remote: true,
                                intentional: false,
                            },
                            None => CloseInfo {
                                code: 1005,
                                reason: String::new(),
                                remote: true,
                                intentional: false,
                            },
                        };
                        // Flush the queued close reply.
                        if let Err(err) = socket.close(None).await {
                            debug!(event = "close_reply_failed", error = %err);
                        }
                        return Ok(info);
                    }
                    Some(Ok(other)) => {
                        debug!(event = "stream_frame_ignored", len = other.len());
                    }
                    Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                        return Ok(CloseInfo::abnormal("connection already closed"));
                    }
                    Some(Err(WsError::Protocol(err))) => {
                        return Ok(CloseInfo::abnormal(err.to_string()));
                    }
                    Some(Err(err)) => return Err(StreamError::WebSocket(err)),
                    None => return Ok(CloseInfo::abnormal("connection ended without close frame")),
                }
            }
        }
    }
}
