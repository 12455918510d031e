//! The relay's single outbound stream connection.
//!
//! [`StreamLink`] spawns a worker task that owns the [`LinkMachine`], the
//! [`LivenessProber`] and the [`Reconnector`]. Transport callbacks, timer
//! firings and shutdown all reach the worker as messages on one channel, so
//! every state transition is serialized. Callers only touch the current
//! [`ConnectionHandle`] through a read lock, which keeps [`StreamLink::send`]
//! non-blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::envelope::EnvelopeError;
use crate::relay::{Delivery, DeliveryOutcome, Outbound};
use crate::stream::client::{
    self, validate_endpoint, ConnectOptions, ConnectionEvent, ConnectionHandle, StreamError,
};
use crate::stream::keepalive::LivenessProber;
use crate::stream::reconnect::{FixedDelay, ReconnectStrategy, Reconnector};
use crate::stream::state::{ConnectionState, LinkAction, LinkEvent, LinkMachine};

/// How long shutdown waits for the close handshake before dropping the socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default values for [`StreamConfig`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const ENDPOINT: &'static str = "ws://localhost:8080/ws/relay";
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const OUTBOUND_CAPACITY: usize = 256;
}

/// Settings for a [`StreamLink`].
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// `ws://` or `wss://` endpoint.
    pub endpoint: String,
    /// Cadence of `{"type":"ping"}` probes while open.
    pub keepalive_interval: Duration,
    /// Delay policy between reconnect attempts.
    pub reconnect: Arc<dyn ReconnectStrategy>,
    /// An attempt still handshaking after this long fails and is retried.
    pub connect_timeout: Duration,
    /// Frames that may wait for the socket writer before `send` starts
    /// returning `false`.
    pub outbound_capacity: usize,
}

impl StreamConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            keepalive_interval: StreamDefaults::KEEPALIVE_INTERVAL,
            reconnect: Arc::new(FixedDelay::new(StreamDefaults::RECONNECT_DELAY)),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            outbound_capacity: StreamDefaults::OUTBOUND_CAPACITY,
        }
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Uses a fixed, unlimited reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect = Arc::new(FixedDelay::new(delay));
        self
    }

    pub fn with_reconnect_strategy(mut self, strategy: Arc<dyn ReconnectStrategy>) -> Self {
        self.reconnect = strategy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        validate_endpoint(&self.endpoint)?;
        if self.keepalive_interval.is_zero() {
            return Err(StreamError::InvalidConfig(
                "keepalive interval must be > 0".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(StreamError::InvalidConfig(
                "connect timeout must be > 0".to_string(),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "outbound capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new(StreamDefaults::ENDPOINT)
    }
}

/// Process-lifetime owner of the outbound stream connection.
#[derive(Debug)]
pub struct StreamLink {
    current: Arc<RwLock<Option<ConnectionHandle>>>,
    commands: mpsc::UnboundedSender<WorkerMessage>,
    state: watch::Receiver<ConnectionState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl StreamLink {
    /// Validates `config` and starts connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: StreamConfig) -> Result<Self, StreamError> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let current = Arc::new(RwLock::new(None));

        info!(
            event = "stream_link_starting",
            endpoint = %config.endpoint,
            keepalive_ms = config.keepalive_interval.as_millis() as u64
        );

        let worker = LinkWorker {
            prober: LivenessProber::new(config.keepalive_interval),
            reconnector: Reconnector::new(Arc::clone(&config.reconnect)),
            config,
            machine: LinkMachine::new(),
            current: Arc::clone(&current),
            state: state_tx,
            commands: commands_tx.clone(),
            active: None,
            generation: 0,
        };
        let task = tokio::spawn(worker.run(commands_rx));

        Ok(Self {
            current,
            commands: commands_tx,
            state: state_rx,
            worker: Mutex::new(Some(task)),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Best-effort send of one text frame.
    ///
    /// Returns `true` only when the connection is open and accepted the frame.
    /// Nothing is buffered for later; never blocks on I/O.
    pub fn send(&self, text: String) -> bool {
        let current = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match current.as_ref() {
            Some(handle) => handle.send(text),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        let current = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        current.as_ref().is_some_and(ConnectionHandle::is_open)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Intentional shutdown: stops both timers, closes the connection once
    /// and waits for the worker to exit. Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(WorkerMessage::Shutdown);
        if let Some(task) = self.worker.lock().await.take() {
            if let Err(err) = task.await {
                error!(event = "stream_link_worker_failed", error = %err);
            }
        }
    }
}

impl Drop for StreamLink {
    fn drop(&mut self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(WorkerMessage::Shutdown);
        }
    }
}

impl Delivery for StreamLink {
    /// Wraps the raw value as `{"topic","payload"}` and sends it as one frame.
    fn deliver(&self, message: &Outbound<'_>) -> DeliveryOutcome {
        let text = match message.envelope().and_then(|envelope| envelope.encode()) {
            Ok(text) => text,
            Err(err @ EnvelopeError::Payload(_)) => {
                debug!(
                    event = "envelope_payload_invalid",
                    topic = message.topic,
                    error = %err
                );
                return DeliveryOutcome::Malformed;
            }
            Err(err) => {
                warn!(event = "envelope_encode_failed", error = %err);
                return DeliveryOutcome::Dropped;
            }
        };
        if self.send(text) {
            DeliveryOutcome::Accepted
        } else {
            DeliveryOutcome::Dropped
        }
    }
}

#[derive(Debug)]
enum WorkerMessage {
    Connection {
        generation: u64,
        event: ConnectionEvent,
    },
    RetryDue,
    Shutdown,
}

#[derive(Debug)]
struct ActiveConnection {
    generation: u64,
    task: JoinHandle<()>,
    handle: Option<ConnectionHandle>,
}

struct LinkWorker {
    config: StreamConfig,
    machine: LinkMachine,
    prober: LivenessProber,
    reconnector: Reconnector,
    current: Arc<RwLock<Option<ConnectionHandle>>>,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedSender<WorkerMessage>,
    active: Option<ActiveConnection>,
    generation: u64,
}

impl LinkWorker {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<WorkerMessage>) {
        self.apply(LinkEvent::Start);

        while let Some(message) = inbox.recv().await {
            match message {
                WorkerMessage::Connection { generation, event } => {
                    self.on_connection_event(generation, event);
                }
                WorkerMessage::RetryDue => {
                    self.reconnector.fired();
                    self.apply(LinkEvent::RetryDue);
                }
                WorkerMessage::Shutdown => {
                    self.apply(LinkEvent::ShutdownRequested);
                    break;
                }
            }
        }

        self.finish().await;
    }

    fn apply(&mut self, event: LinkEvent) {
        let previous = self.machine.state();
        let actions = self.machine.handle(&event);
        let next = self.machine.state();
        if previous != next {
            debug!(event = "link_state_changed", from = %previous, to = %next);
            self.state.send_replace(next);
        }
        for action in actions {
            self.perform(action);
        }
    }

    fn perform(&mut self, action: LinkAction) {
        match action {
            LinkAction::Connect => self.connect(),
            LinkAction::StartProber => {
                if let Some(handle) = self.active.as_ref().and_then(|a| a.handle.clone()) {
                    self.prober.start(handle);
                }
            }
            LinkAction::StopProber => self.prober.stop(),
            LinkAction::ScheduleReconnect => {
                let commands = self.commands.clone();
                self.reconnector.schedule(self.machine.state(), move || {
                    let _ = commands.send(WorkerMessage::RetryDue);
                });
            }
            LinkAction::CancelReconnect => self.reconnector.cancel(),
            LinkAction::CloseConnection => self.close_active(),
        }
    }

    fn connect(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        info!(
            event = "stream_connecting",
            endpoint = %self.config.endpoint,
            generation
        );

        let commands = self.commands.clone();
        let task = client::open(
            self.config.endpoint.clone(),
            ConnectOptions {
                capacity: self.config.outbound_capacity,
                connect_timeout: self.config.connect_timeout,
            },
            move |event| {
                let _ = commands.send(WorkerMessage::Connection { generation, event });
            },
        );
        self.active = Some(ActiveConnection {
            generation,
            task,
            handle: None,
        });
    }

    fn on_connection_event(&mut self, generation: u64, event: ConnectionEvent) {
        let is_current = self
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation);
        if !is_current {
            debug!(event = "stale_connection_event", generation);
            if let ConnectionEvent::Opened { handle } = event {
                handle.close(true);
            }
            return;
        }

        match event {
            ConnectionEvent::Opened { handle } => {
                info!(event = "stream_open", generation);
                if let Some(active) = self.active.as_mut() {
                    active.handle = Some(handle.clone());
                }
                self.publish(Some(handle));
                self.reconnector.reset();
                self.apply(LinkEvent::Opened);
            }
            ConnectionEvent::Closed(info) => {
                warn!(
                    event = "stream_closed",
                    generation,
                    code = info.code,
                    reason = %info.reason,
                    remote = info.remote,
                    intentional = info.intentional
                );
                self.publish(None);
                self.active = None;
                self.apply(LinkEvent::Closed {
                    intentional: info.intentional,
                });
            }
            ConnectionEvent::Failed { error } => {
                error!(event = "stream_failed", generation, error = %error);
                self.publish(None);
                self.active = None;
                self.apply(LinkEvent::Failed);
            }
        }
    }

    fn close_active(&mut self) {
        self.publish(None);
        if let Some(active) = self.active.as_ref() {
            match active.handle.as_ref() {
                Some(handle) => handle.close(true),
                None => active.task.abort(),
            }
        }
    }

    fn publish(&self, handle: Option<ConnectionHandle>) {
        let mut current = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = handle;
    }

    async fn finish(mut self) {
        self.prober.stop();
        self.reconnector.cancel();
        self.publish(None);

        if let Some(mut active) = self.active.take() {
            match active.handle.as_ref() {
                Some(handle) => handle.close(true),
                None => active.task.abort(),
            }
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut active.task)
                .await
                .is_err()
            {
                warn!(event = "stream_close_timeout", generation = active.generation);
                active.task.abort();
            }
        }
        info!(event = "stream_link_stopped");
    }
}
