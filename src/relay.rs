//! Intake entry point: classify messages and hand them to a delivery sink.
//!
//! The relay only decides whether a topic is relayed and under which
//! category. Sinks receive the record value exactly as it arrived and choose
//! their own wire shape: the stream wraps it in an [`Envelope`], the HTTP
//! forwarder posts it as text.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::envelope::{Envelope, EnvelopeError, TopicCategory, TopicMapper};

/// One classified message on its way to a sink.
#[derive(Clone, Copy, Debug)]
pub struct Outbound<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub category: TopicCategory,
    /// Record value, byte for byte as received.
    pub raw: &'a [u8],
}

impl Outbound<'_> {
    /// Parses the raw value and wraps it under the category.
    pub fn envelope(&self) -> Result<Envelope, EnvelopeError> {
        Envelope::wrap(self.category, self.raw)
    }
}

/// Result of handing one message to a sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryOutcome {
    /// The sink took the message. For the stream this means the frame was
    /// queued on an open connection; nothing is confirmed end to end.
    Accepted,
    /// The sink could not take the message and it is gone.
    Dropped,
    /// The sink needs a JSON value and the raw value is not one.
    Malformed,
}

/// Destination for relayed messages.
///
/// Implementations must not block the caller on I/O.
pub trait Delivery: Send + Sync {
    fn deliver(&self, message: &Outbound<'_>) -> DeliveryOutcome;
}

/// What happened to one inbound message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelayOutcome {
    Relayed,
    /// Topic has no category under the configured policy.
    Unmapped,
    /// Payload is not JSON.
    Malformed,
    /// Sink dropped the message.
    Undelivered,
}

/// Running counters of relay outcomes.
#[derive(Debug, Default)]
pub struct RelayStats {
    relayed: AtomicU64,
    unmapped: AtomicU64,
    malformed: AtomicU64,
    undelivered: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RelayStatsSnapshot {
    pub relayed: u64,
    pub unmapped: u64,
    pub malformed: u64,
    pub undelivered: u64,
}

impl RelayStatsSnapshot {
    pub fn total(&self) -> u64 {
        self.relayed + self.unmapped + self.malformed + self.undelivered
    }
}

impl RelayStats {
    fn record(&self, outcome: RelayOutcome) {
        let counter = match outcome {
            RelayOutcome::Relayed => &self.relayed,
            RelayOutcome::Unmapped => &self.unmapped,
            RelayOutcome::Malformed => &self.malformed,
            RelayOutcome::Undelivered => &self.undelivered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            relayed: self.relayed.load(Ordering::Relaxed),
            unmapped: self.unmapped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            undelivered: self.undelivered.load(Ordering::Relaxed),
        }
    }
}

/// Maps inbound topics to categories and forwards messages to one sink.
pub struct Relay {
    mapper: TopicMapper,
    sink: Arc<dyn Delivery>,
    stats: RelayStats,
}

impl Relay {
    pub fn new(mapper: TopicMapper, sink: Arc<dyn Delivery>) -> Self {
        Self {
            mapper,
            sink,
            stats: RelayStats::default(),
        }
    }

    pub fn mapper(&self) -> &TopicMapper {
        &self.mapper
    }

    /// Relays one message. Fire-and-forget: failures are logged and counted,
    /// never returned as errors.
    pub fn relay(&self, topic: &str, partition: i32, raw: &[u8]) -> RelayOutcome {
        let outcome = self.relay_inner(topic, partition, raw);
        self.stats.record(outcome);
        outcome
    }

    fn relay_inner(&self, topic: &str, partition: i32, raw: &[u8]) -> RelayOutcome {
        let Some(category) = self.mapper.classify(topic) else {
            warn!(event = "topic_unmapped", topic, partition);
            return RelayOutcome::Unmapped;
        };

        let message = Outbound {
            topic,
            partition,
            category,
            raw,
        };
        match self.sink.deliver(&message) {
            DeliveryOutcome::Accepted => {
                debug!(event = "message_relayed", topic, partition, %category);
                RelayOutcome::Relayed
            }
            DeliveryOutcome::Dropped => {
                warn!(event = "message_dropped", topic, partition, %category);
                RelayOutcome::Undelivered
            }
            DeliveryOutcome::Malformed => {
                warn!(event = "payload_malformed", topic, partition, %category);
                RelayOutcome::Malformed
            }
        }
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }
}
