//! ---
//! permdir_section: "02-messaging-replication"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Channel message envelopes, bus abstraction, and payload codecs."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use prometheus::{exponential_buckets, Histogram, HistogramOpts, IntCounterVec, Opts, Registry};
use tracing::debug;

use crate::types::ChannelMessage;

/// Which way a message crossed the bus boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Handed to a bus by this node.
    Outbound,
    /// Taken off a bus by this node.
    Inbound,
}

impl MessageDirection {
    /// Label value used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

/// Trace one channel message at debug level.
pub fn log_message(direction: MessageDirection, message: &ChannelMessage) {
    debug!(
        direction = direction.as_str(),
        id = %message.id,
        sender = %message.sender,
        channel = %message.channel,
        target = ?message.target,
        kind = %message.message,
        payload_bytes = message.payload.len(),
        "bus message"
    );
}

/// Prometheus view of bus traffic, shared by every publisher that is given a clone.
#[derive(Clone)]
pub struct BusMetrics {
    messages: IntCounterVec,
    payload_bytes: Histogram,
}

impl BusMetrics {
    /// Create the bus families and register them with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let messages = IntCounterVec::new(
            Opts::new(
                "permdir_bus_messages_total",
                "Channel messages seen at the bus boundary",
            ),
            &["direction", "outcome"],
        )?;
        let payload_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "permdir_bus_payload_bytes",
                "Encoded payload size of delivered channel messages",
            )
            .buckets(exponential_buckets(64.0, 4.0, 8)?),
        )?;
        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(payload_bytes.clone()))?;
        Ok(Self {
            messages,
            payload_bytes,
        })
    }

    /// Count a message that a bus accepted or produced.
    pub fn observe_delivered(&self, direction: MessageDirection, message: &ChannelMessage) {
        self.messages
            .with_label_values(&[direction.as_str(), "delivered"])
            .inc();
        self.payload_bytes.observe(message.payload.len() as f64);
    }

    /// Count an outbound message that no bus took.
    pub fn observe_dropped(&self) {
        self.messages
            .with_label_values(&[MessageDirection::Outbound.as_str(), "dropped"])
            .inc();
    }
}
