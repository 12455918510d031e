use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use topic_relay::envelope::{MatchPolicy, TopicMapper};
use topic_relay::http::{ForwardError, HttpForwarder};
use topic_relay::relay::{Relay, RelayOutcome};
use topic_relay::stream::link::{StreamConfig, StreamLink};
use topic_relay::stream::state::ConnectionState;

const PING: &str = r#"{"type":"ping"}"#;
const GPS_RAW: &[u8] = br#"{"lat":1.5,"lon":2.5}"#;
const GPS_FRAME: &str = r#"{"topic":"gps","payload":{"lat":1.5,"lon":2.5}}"#;
const SPACED_RAW: &str = r#"{"lon": 2, "lat": 1.10}"#;
const GOING_AWAY: u16 = 1001;

#[derive(Debug)]
enum Observed {
    Connected { id: usize },
    Text { id: usize, text: String },
    Closed { id: usize, code: Option<u16>, at: Instant },
    CloseAcked { id: usize },
}

/// How the mock server treats connection 0.
#[derive(Clone, Copy, Debug)]
enum FirstConnection {
    Serve,
    /// Sends a 1001 close frame and waits for the reply.
    CloseFrame,
    /// Drops the socket right after the upgrade, no close frame.
    Drop,
}

#[derive(Clone)]
struct WsState {
    observed: mpsc::UnboundedSender<Observed>,
    connections: Arc<AtomicUsize>,
    first: FirstConnection,
}

#[derive(Clone)]
struct HttpState {
    status: StatusCode,
    response: Value,
    observed: mpsc::UnboundedSender<Value>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_link_relays_gps_envelope_and_keeps_alive() {
    let (observed_tx, mut observed_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let app = ws_app(WsState {
        observed: observed_tx,
        connections: Arc::clone(&connections),
        first: FirstConnection::Serve,
    });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let link = Arc::new(
        StreamLink::start(
            StreamConfig::new(format!("ws://{addr}/ws/relay"))
                .with_keepalive_interval(Duration::from_millis(100))
                .with_reconnect_delay(Duration::from_millis(50)),
        )
        .expect("start stream link"),
    );
    wait_for_state(&link, ConnectionState::Open).await;

    let relay = Relay::new(TopicMapper::with_defaults(MatchPolicy::Exact), link.clone());
    assert_eq!(relay.relay("unknown-topic", 0, GPS_RAW), RelayOutcome::Unmapped);
    assert_eq!(relay.relay("topic-gps-218", 0, GPS_RAW), RelayOutcome::Relayed);

    let frames = texts(&collect_for(&mut observed_rx, Duration::from_millis(350)).await);
    let envelopes: Vec<_> = frames.iter().filter(|text| *text != PING).collect();
    assert_eq!(envelopes, vec![GPS_FRAME], "only the mapped message is relayed");
    let pings = frames.iter().filter(|text| *text == PING).count();
    assert!(pings >= 2, "expected at least two keepalive probes, saw {pings}");

    link.shutdown().await;
    assert_eq!(link.state(), ConnectionState::Closing);
    assert!(!link.send(GPS_FRAME.to_string()));

    let after = collect_for(&mut observed_rx, Duration::from_millis(300)).await;
    assert!(
        after
            .iter()
            .any(|seen| matches!(seen, Observed::Closed { code: Some(1000), .. })),
        "expected a normal close frame, got {after:?}"
    );
    assert!(
        !after.iter().any(|seen| matches!(seen, Observed::Connected { .. })),
        "no reconnect after shutdown"
    );
    assert!(
        texts(&after).iter().all(|text| text.as_str() != PING),
        "no probe after shutdown"
    );
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_link_reconnects_after_remote_close() {
    let reconnect_delay = Duration::from_millis(300);
    let (observed_tx, mut observed_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let app = ws_app(WsState {
        observed: observed_tx,
        connections: Arc::clone(&connections),
        first: FirstConnection::CloseFrame,
    });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let link = StreamLink::start(
        StreamConfig::new(format!("ws://{addr}/ws/relay"))
            .with_keepalive_interval(Duration::from_secs(25))
            .with_reconnect_delay(reconnect_delay),
    )
    .expect("start stream link");

    let closed_at = loop {
        match next_observed(&mut observed_rx).await {
            Observed::Closed { id: 0, code, at } => {
                assert_eq!(code, Some(GOING_AWAY));
                break at;
            }
            _ => continue,
        }
    };

    wait_for_state(&link, ConnectionState::Disconnected).await;
    assert!(!link.send(GPS_FRAME.to_string()), "send while down is dropped");

    let mut acked = false;
    loop {
        match next_observed(&mut observed_rx).await {
            Observed::CloseAcked { id: 0 } => acked = true,
            Observed::Connected { id: 1 } => break,
            _ => {}
        }
    }
    assert!(acked, "the remote close was answered with a close frame");
    let gap = closed_at.elapsed();
    assert!(
        gap >= reconnect_delay,
        "reconnected after {gap:?}, before the {reconnect_delay:?} delay"
    );

    wait_for_state(&link, ConnectionState::Open).await;
    assert!(link.send(GPS_FRAME.to_string()));
    loop {
        if let Observed::Text { id, text } = next_observed(&mut observed_rx).await {
            assert_eq!(id, 1);
            assert_eq!(text, GPS_FRAME);
            break;
        }
    }
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    link.shutdown().await;
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_link_reconnects_after_abrupt_drop() {
    let reconnect_delay = Duration::from_millis(300);
    let (observed_tx, mut observed_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let app = ws_app(WsState {
        observed: observed_tx,
        connections: Arc::clone(&connections),
        first: FirstConnection::Drop,
    });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let link = StreamLink::start(
        StreamConfig::new(format!("ws://{addr}/ws/relay"))
            .with_keepalive_interval(Duration::from_secs(25))
            .with_reconnect_delay(reconnect_delay),
    )
    .expect("start stream link");

    let dropped_at = loop {
        if let Observed::Closed { id: 0, code, at } = next_observed(&mut observed_rx).await {
            assert_eq!(code, None);
            break at;
        }
    };

    wait_for_state(&link, ConnectionState::Disconnected).await;
    assert!(!link.send(GPS_FRAME.to_string()), "send while down is dropped");

    loop {
        if let Observed::Connected { id: 1 } = next_observed(&mut observed_rx).await {
            break;
        }
    }
    let gap = dropped_at.elapsed();
    assert!(
        gap >= reconnect_delay,
        "reconnected after {gap:?}, before the {reconnect_delay:?} delay"
    );

    wait_for_state(&link, ConnectionState::Open).await;
    assert!(link.send(GPS_FRAME.to_string()));
    loop {
        if let Observed::Text { id, text } = next_observed(&mut observed_rx).await {
            assert_eq!(id, 1);
            assert_eq!(text, GPS_FRAME);
            break;
        }
    }
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    link.shutdown().await;
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_handshake_times_out_and_retries() {
    // Accepts TCP connections but never answers the upgrade request.
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind silent listener");
    let addr = listener.local_addr().expect("read silent listener address");
    let accepted = Arc::new(AtomicUsize::new(0));
    let silent_accepted = Arc::clone(&accepted);
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            silent_accepted.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });

    let link = StreamLink::start(
        StreamConfig::new(format!("ws://{addr}/ws/relay"))
            .with_connect_timeout(Duration::from_millis(200))
            .with_reconnect_delay(Duration::from_millis(300)),
    )
    .expect("start stream link");
    wait_for_state(&link, ConnectionState::Connecting).await;

    for _ in 0..3 {
        assert!(!link.send(GPS_FRAME.to_string()));
        assert!(!link.is_open());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    wait_for_state(&link, ConnectionState::Disconnected).await;
    timeout(Duration::from_secs(3), async {
        while accepted.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("a second handshake attempt after the timeout");
    assert!(!link.send(GPS_FRAME.to_string()));

    timeout(Duration::from_secs(2), link.shutdown())
        .await
        .expect("shutdown aborts a pending handshake");
    silent.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_forwarder_posts_raw_value_as_message() {
    let (observed_tx, mut observed_rx) = mpsc::unbounded_channel();
    let app = http_app(HttpState {
        status: StatusCode::OK,
        response: json!({"status": "stored"}),
        observed: observed_tx,
    });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let url = format!("http://{addr}/api/messages");
    let forwarder = Arc::new(HttpForwarder::new(&url).expect("build forwarder"));
    let relay = Relay::new(TopicMapper::with_defaults(MatchPolicy::Exact), forwarder);
    let mut sent = Vec::new();
    for raw in [SPACED_RAW, "plain text value"] {
        assert_eq!(
            relay.relay("topic-gps-218", 0, raw.as_bytes()),
            RelayOutcome::Relayed
        );
        sent.push(raw);
    }

    let mut posted = Vec::new();
    while posted.len() < sent.len() {
        let observed = timeout(Duration::from_secs(2), observed_rx.recv())
            .await
            .expect("timed out waiting for http observation")
            .expect("http observation channel closed");
        let message = observed
            .get("message")
            .and_then(Value::as_str)
            .expect("message must be a string");
        posted.push(message.to_string());
    }
    // Requests race on separate tasks.
    posted.sort();
    sent.sort();
    assert_eq!(posted, sent, "values are posted byte for byte");

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock http server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_forwarder_surfaces_rejections() {
    let app = http_app(HttpState {
        status: StatusCode::UNPROCESSABLE_ENTITY,
        response: json!({"detail": "message rejected"}),
        observed: mpsc::unbounded_channel().0,
    });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let forwarder =
        HttpForwarder::new(&format!("http://{addr}/api/messages")).expect("build forwarder");
    let err = forwarder
        .forward(r#"{"temp":21}"#.to_string())
        .await
        .expect_err("non-2xx must be an error");
    match err {
        ForwardError::HttpStatus { status, body } => {
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
            assert_eq!(body, "message rejected");
        }
        other => panic!("unexpected error variant: {other:?}"),
    }

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock http server task should join");
}

fn ws_app(state: WsState) -> Router {
    Router::new()
        .route("/ws/relay", get(ws_handler))
        .with_state(state)
}

fn http_app(state: HttpState) -> Router {
    Router::new()
        .route("/api/messages", post(messages_handler))
        .with_state(state)
}

async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let id = state.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| serve_socket(socket, id, state))
}

async fn serve_socket(mut socket: WebSocket, id: usize, state: WsState) {
    let _ = state.observed.send(Observed::Connected { id });

    match (state.first, id) {
        (FirstConnection::CloseFrame, 0) => {
            let frame = CloseFrame {
                code: GOING_AWAY,
                reason: "going away".into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            let _ = state.observed.send(Observed::Closed {
                id,
                code: Some(GOING_AWAY),
                at: Instant::now(),
            });
            if let Ok(Some(Ok(Message::Close(_)))) =
                timeout(Duration::from_secs(1), socket.next()).await
            {
                let _ = state.observed.send(Observed::CloseAcked { id });
            }
            return;
        }
        (FirstConnection::Drop, 0) => {
            drop(socket);
            let _ = state.observed.send(Observed::Closed {
                id,
                code: None,
                at: Instant::now(),
            });
            return;
        }
        _ => {}
    }

    while let Some(message) = socket.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let _ = state.observed.send(Observed::Text {
                    id,
                    text: text.as_str().to_string(),
                });
            }
            Ok(Message::Close(frame)) => {
                let _ = state.observed.send(Observed::Closed {
                    id,
                    code: frame.map(|frame| frame.code),
                    at: Instant::now(),
                });
                return;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    let _ = state.observed.send(Observed::Closed {
        id,
        code: None,
        at: Instant::now(),
    });
}

async fn messages_handler(
    State(state): State<HttpState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let _ = state.observed.send(payload);
    (state.status, Json(state.response))
}

async fn wait_for_state(link: &StreamLink, expected: ConnectionState) {
    let mut states = link.subscribe();
    timeout(Duration::from_secs(5), states.wait_for(|state| *state == expected))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {expected}"))
        .expect("link state channel closed");
}

async fn next_observed(rx: &mut mpsc::UnboundedReceiver<Observed>) -> Observed {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for mock server observation")
        .expect("mock server observation channel closed")
}

async fn collect_for(
    rx: &mut mpsc::UnboundedReceiver<Observed>,
    window: Duration,
) -> Vec<Observed> {
    let deadline = tokio::time::Instant::now() + window;
    let mut seen = Vec::new();
    while let Ok(Some(observed)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        seen.push(observed);
    }
    seen
}

fn texts(observed: &[Observed]) -> Vec<String> {
    observed
        .iter()
        .filter_map(|seen| match seen {
            Observed::Text { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
