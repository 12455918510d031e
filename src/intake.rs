//! Newline-delimited JSON intake.
//!
//! Each line is one queue record:
//!
//! ```json
//! {"topic":"topic-gps-218","partition":0,"value":"{\"lat\":1.5}"}
//! ```
//!
//! `value` may be a JSON string holding the raw message text, or any other
//! JSON value, which is relayed as its serialized form.

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::relay::{Relay, RelayOutcome};

/// One inbound queue record.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct IntakeRecord {
    pub topic: String,
    #[serde(default)]
    pub partition: i32,
    pub value: Value,
}

impl IntakeRecord {
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Message bytes as they would arrive from the queue.
    pub fn raw_value(&self) -> Vec<u8> {
        match &self.value {
            Value::String(text) => text.as_bytes().to_vec(),
            other => other.to_string().into_bytes(),
        }
    }
}

/// Line counts from one intake run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IntakeSummary {
    pub records: u64,
    pub relayed: u64,
    pub skipped_lines: u64,
}

/// Feeds every record read from `reader` to `relay` until end of input.
pub async fn run_ndjson<R>(reader: R, relay: &Relay) -> std::io::Result<IntakeSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = IntakeSummary::default();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record = match IntakeRecord::from_line(line) {
            Ok(record) => record,
            Err(err) => {
                warn!(event = "intake_line_invalid", line = line_no, error = %err);
                summary.skipped_lines += 1;
                continue;
            }
        };

        debug!(
            event = "intake_record",
            topic = %record.topic,
            partition = record.partition
        );
        summary.records += 1;
        let outcome = relay.relay(&record.topic, record.partition, &record.raw_value());
        if outcome == RelayOutcome::Relayed {
            summary.relayed += 1;
        }
    }

    Ok(summary)
}
