use serde::{Deserialize, Serialize};

/// Control frames the relay sends besides envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Keepalive probe, `{"type":"ping"}`.
    Ping,
}

impl ControlFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Close details reported when a connection ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Websocket close code; `1006` when the peer vanished without a close frame.
    pub code: u16,
    pub reason: String,
    /// Whether the peer initiated the close.
    pub remote: bool,
    /// Whether the close was requested locally as part of shutdown.
    pub intentional: bool,
}

impl CloseInfo {
    pub const NORMAL: u16 = 1000;
    pub const ABNORMAL: u16 = 1006;

    pub(crate) fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: Self::ABNORMAL,
            reason: reason.into(),
            remote: true,
            intentional: false,
        }
    }
}
