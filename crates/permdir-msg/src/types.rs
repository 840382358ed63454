//! ---
//! permdir_section: "02-messaging-replication"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Channel message envelopes, bus abstraction, and payload codecs."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version broadcast alongside every channel message.
pub const SCHEMA_VERSION: u16 = 1;

/// Which nodes a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "node", rename_all = "snake_case")]
pub enum Target {
    /// Every node of the cluster except the sender.
    AllOtherNodes,
    /// A single named node.
    Node(String),
}

/// Envelope delivered by the cluster bus to a named channel.
///
/// The payload is opaque to the bus; producers and consumers agree on a
/// [`crate::PayloadCodec`] out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Unique identifier for deduplication and tracing.
    pub id: Uuid,
    /// Version of the envelope schema.
    pub schema_version: u16,
    /// Timestamp when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Node that produced the message.
    pub sender: String,
    /// Addressing for the bus.
    pub target: Target,
    /// Channel the message is published on.
    pub channel: String,
    /// Message kind understood by the channel's consumers.
    pub message: String,
    /// Encoded payload bytes.
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    /// Construct a message addressed to all other nodes.
    pub fn broadcast(
        sender: impl Into<String>,
        channel: impl Into<String>,
        message: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            sender: sender.into(),
            target: Target::AllOtherNodes,
            channel: channel.into(),
            message: message.into(),
            payload,
        }
    }

    /// Readdress the message to a single node.
    pub fn to_node(mut self, node: impl Into<String>) -> Self {
        self.target = Target::Node(node.into());
        self
    }

    /// Whether the message should be delivered to `node`.
    pub fn is_addressed_to(&self, node: &str) -> bool {
        match &self.target {
            Target::AllOtherNodes => self.sender != node,
            Target::Node(target) => target == node,
        }
    }
}
