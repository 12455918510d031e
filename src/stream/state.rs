//! Connection lifecycle state machine.
//!
//! [`LinkMachine`] is pure: it consumes [`LinkEvent`]s and returns the
//! [`LinkAction`]s the owner must perform. The link worker feeds it transport
//! callbacks and timer firings; tests feed it synthetic events.

use std::fmt;

/// Lifecycle of the single outbound connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    /// Shutdown requested; terminal.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkEvent {
    /// Initial connect at service start.
    Start,
    /// Transport handshake completed.
    Opened,
    /// Connection closed, by either side.
    Closed { intentional: bool },
    /// Connect attempt or live connection failed.
    Failed,
    /// Reconnect timer fired.
    RetryDue,
    /// Process shutdown.
    ShutdownRequested,
}

/// Side effects requested by a transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkAction {
    Connect,
    StartProber,
    StopProber,
    ScheduleReconnect,
    CancelReconnect,
    CloseConnection,
}

#[derive(Debug, Default)]
pub struct LinkMachine {
    state: ConnectionState,
}

impl LinkMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Applies `event` and returns the actions to perform, in order.
    pub fn handle(&mut self, event: &LinkEvent) -> Vec<LinkAction> {
        use ConnectionState::*;

        match (self.state, event) {
            (Closing, LinkEvent::Closed { .. } | LinkEvent::Failed) => {
                vec![LinkAction::StopProber]
            }
            (Closing, _) => Vec::new(),
            (_, LinkEvent::ShutdownRequested) => {
                self.state = Closing;
                vec![
                    LinkAction::StopProber,
                    LinkAction::CancelReconnect,
                    LinkAction::CloseConnection,
                ]
            }
            (Disconnected, LinkEvent::Start | LinkEvent::RetryDue) => {
                self.state = Connecting;
                vec![LinkAction::Connect]
            }
            (Connecting, LinkEvent::Opened) => {
                self.state = Open;
                vec![LinkAction::StartProber]
            }
            (Connecting | Open, LinkEvent::Closed { intentional: true }) => {
                self.state = Disconnected;
                vec![LinkAction::StopProber]
            }
            (Connecting | Open, LinkEvent::Closed { intentional: false } | LinkEvent::Failed) => {
                self.state = Disconnected;
                vec![LinkAction::StopProber, LinkAction::ScheduleReconnect]
            }
            _ => Vec::new(),
        }
    }
}
