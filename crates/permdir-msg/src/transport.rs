//! ---
//! permdir_section: "02-messaging-replication"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Channel message envelopes, bus abstraction, and payload codecs."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{ChannelMessage, MessagingError, Result};

/// Cluster bus abstraction.
///
/// Delivery is at-most-once and fire-and-forget: `send` returns once the
/// message has been handed over, without waiting for any acknowledgement.
pub trait MessageBus: Send + Sync {
    /// Hand a message to the bus.
    fn send(&self, msg: ChannelMessage) -> Result<()>;
    /// Receive the next message addressed to this endpoint, if available.
    fn recv(&self) -> Option<ChannelMessage>;
    /// Human-readable bus name for logging/metrics.
    fn name(&self) -> &'static str;
}

type Inbox = Arc<Mutex<VecDeque<ChannelMessage>>>;

/// In-process cluster fabric routing messages between [`InMemoryBus`] endpoints.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    inboxes: Arc<Mutex<HashMap<String, Inbox>>>,
}

impl InMemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node and return its bus endpoint. Re-attaching returns the
    /// existing inbox.
    pub fn join(&self, node: impl Into<String>) -> InMemoryBus {
        let node = node.into();
        let inbox = self
            .inboxes
            .lock()
            .entry(node.clone())
            .or_default()
            .clone();
        InMemoryBus {
            node,
            inbox,
            cluster: self.clone(),
        }
    }

    /// Detach a node; messages sent to it afterwards are dropped.
    pub fn leave(&self, node: &str) {
        self.inboxes.lock().remove(node);
    }

    /// Names of attached nodes.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.inboxes.lock().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    fn route(&self, msg: ChannelMessage) -> Result<()> {
        let inboxes = self.inboxes.lock();
        if !inboxes.contains_key(&msg.sender) {
            return Err(MessagingError::Unavailable(format!(
                "node {} is not attached to the cluster",
                msg.sender
            )));
        }
        for (node, inbox) in inboxes.iter() {
            if msg.is_addressed_to(node) {
                inbox.lock().push_back(msg.clone());
            }
        }
        Ok(())
    }
}

/// One node's endpoint on an [`InMemoryCluster`].
#[derive(Clone)]
pub struct InMemoryBus {
    node: String,
    inbox: Inbox,
    cluster: InMemoryCluster,
}

impl InMemoryBus {
    /// Node name this endpoint belongs to.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Number of messages waiting in this node's inbox.
    pub fn pending(&self) -> usize {
        self.inbox.lock().len()
    }
}

impl MessageBus for InMemoryBus {
    fn send(&self, msg: ChannelMessage) -> Result<()> {
        self.cluster.route(msg)
    }

    fn recv(&self) -> Option<ChannelMessage> {
        self.inbox.lock().pop_front()
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
