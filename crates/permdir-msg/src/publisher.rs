//! ---
//! permdir_section: "02-messaging-replication"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Channel message envelopes, bus abstraction, and payload codecs."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::logging::{log_message, MessageDirection};
use crate::{BusMetrics, ChannelMessage, MessageBus, MessagingError, Result};

/// Snapshot of publisher counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublisherMetrics {
    /// Messages successfully handed to buses.
    pub sent: u64,
    /// Messages received from buses.
    pub received: u64,
    /// Messages dropped due to bus errors.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PublisherMetrics {
        PublisherMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Fans channel messages out to every registered bus and keeps delivery counters.
#[derive(Default)]
pub struct BusPublisher {
    buses: Vec<Arc<dyn MessageBus>>,
    counters: Counters,
    exporter: Option<BusMetrics>,
}

impl BusPublisher {
    /// Construct a publisher without any buses attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bus for publish/receive operations.
    pub fn register_bus<B>(&mut self, bus: Arc<B>)
    where
        B: MessageBus + 'static,
    {
        self.buses.push(bus as Arc<dyn MessageBus>);
    }

    /// Mirror counters into Prometheus.
    pub fn with_metrics(mut self, exporter: BusMetrics) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Publish a message to all registered buses.
    ///
    /// Every bus is attempted even if an earlier one fails; the first failure
    /// is returned so callers can log it.
    pub fn publish(&self, msg: ChannelMessage) -> Result<()> {
        if self.buses.is_empty() {
            self.record_dropped();
            return Err(MessagingError::Unavailable("no bus registered".into()));
        }

        log_message(MessageDirection::Outbound, &msg);
        let mut first_error = None;
        for bus in &self.buses {
            match bus.send(msg.clone()) {
                Ok(()) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    if let Some(exporter) = &self.exporter {
                        exporter.observe_delivered(MessageDirection::Outbound, &msg);
                    }
                }
                Err(err) => {
                    tracing::warn!(bus = bus.name(), channel = %msg.channel, message = %msg.message, error = %err, "bus send failed");
                    self.record_dropped();
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Poll buses for any available messages.
    pub fn poll(&self) -> Vec<ChannelMessage> {
        let mut collected = Vec::new();
        for bus in &self.buses {
            while let Some(msg) = bus.recv() {
                log_message(MessageDirection::Inbound, &msg);
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                if let Some(exporter) = &self.exporter {
                    exporter.observe_delivered(MessageDirection::Inbound, &msg);
                }
                collected.push(msg);
            }
        }
        collected
    }

    /// Return the current counter snapshot.
    pub fn metrics(&self) -> PublisherMetrics {
        self.counters.snapshot()
    }

    fn record_dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.observe_dropped();
        }
    }
}
