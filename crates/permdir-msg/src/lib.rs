//! ---
//! permdir_section: "02-messaging-replication"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Channel message envelopes, bus abstraction, and payload codecs."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
//! Cluster bus plumbing: the [`ChannelMessage`] envelope, the [`MessageBus`]
//! seam with its in-process [`InMemoryCluster`], and the [`BusPublisher`] that
//! fans messages out and counts what happened to them.
#![warn(missing_docs)]

pub mod codec;
pub mod logging;
pub mod publisher;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by buses and codecs.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The bus cannot accept messages (disconnected, shut down, unknown node).
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for CBOR serialization or deserialization problems.
    #[error("cbor serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

pub use codec::PayloadCodec;
pub use logging::{log_message, BusMetrics, MessageDirection};
pub use publisher::{BusPublisher, PublisherMetrics};
pub use transport::{InMemoryBus, InMemoryCluster, MessageBus};
pub use types::{ChannelMessage, Target};
