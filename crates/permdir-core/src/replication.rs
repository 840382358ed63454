//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
//! Cluster replication of committed mutations.
//!
//! The local path is: commit, notify observers, encode, enqueue. A dedicated
//! [`ReplicationSender`] drains the queue onto the bus so mutating calls never
//! wait for delivery. The receive path mirrors other nodes' messages as
//! idempotent upserts, deletes, or a full group replace, and never
//! re-broadcasts them.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use permdir_common::ReplicationConfig;
use permdir_msg::{BusPublisher, ChannelMessage, PayloadCodec};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::commit::{CommitGuard, CommitLocks};
use crate::entity::{PermissionGroup, PermissionUser};
use crate::error::{DirectoryError, Result};
use crate::metrics::DirectoryMetrics;
use crate::observer::{EventKind, EventOrigin, ObserverSet, PermissionEvent};
use crate::store::{DirectoryStore, Upserted};

/// Prefix of every replication message kind on the wire.
pub const MESSAGE_PREFIX: &str = "permissions_";

/// Receiving half of the outbound queue, consumed by [`ReplicationSender`].
pub type OutboundQueue = mpsc::UnboundedReceiver<ChannelMessage>;

/// Replicated message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Payload: the created user.
    AddUser,
    /// Payload: the replaced user.
    UpdateUser,
    /// Payload: the removed user.
    DeleteUser,
    /// Payload: the created group.
    AddGroup,
    /// Payload: the replaced group.
    UpdateGroup,
    /// Payload: the removed group.
    DeleteGroup,
    /// Payload: the full group collection.
    SetGroups,
}

impl MessageKind {
    /// Every kind, in wire order.
    pub const ALL: [MessageKind; 7] = [
        MessageKind::AddUser,
        MessageKind::UpdateUser,
        MessageKind::DeleteUser,
        MessageKind::AddGroup,
        MessageKind::UpdateGroup,
        MessageKind::DeleteGroup,
        MessageKind::SetGroups,
    ];

    /// Kind without the wire prefix.
    pub fn as_str(&self) -> &'static str {
        self.event_kind().as_str()
    }

    /// Full wire name, e.g. `permissions_add_user`.
    pub fn wire_name(&self) -> String {
        format!("{MESSAGE_PREFIX}{}", self.as_str())
    }

    /// Parse a wire name. Unknown or unprefixed names yield `None`.
    pub fn parse(wire: &str) -> Option<Self> {
        let kind = wire.strip_prefix(MESSAGE_PREFIX)?;
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// Kind to broadcast for an event; `None` for local-only events.
    pub fn from_event(event: &PermissionEvent) -> Option<Self> {
        Some(match event.kind() {
            EventKind::AddUser => MessageKind::AddUser,
            EventKind::UpdateUser => MessageKind::UpdateUser,
            EventKind::DeleteUser => MessageKind::DeleteUser,
            EventKind::AddGroup => MessageKind::AddGroup,
            EventKind::UpdateGroup => MessageKind::UpdateGroup,
            EventKind::DeleteGroup => MessageKind::DeleteGroup,
            EventKind::SetGroups => MessageKind::SetGroups,
            EventKind::SetUsers => return None,
        })
    }

    /// Matching observer event kind.
    pub fn event_kind(&self) -> EventKind {
        match self {
            MessageKind::AddUser => EventKind::AddUser,
            MessageKind::UpdateUser => EventKind::UpdateUser,
            MessageKind::DeleteUser => EventKind::DeleteUser,
            MessageKind::AddGroup => EventKind::AddGroup,
            MessageKind::UpdateGroup => EventKind::UpdateGroup,
            MessageKind::DeleteGroup => EventKind::DeleteGroup,
            MessageKind::SetGroups => EventKind::SetGroups,
        }
    }
}

/// Snapshot of handler counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationStats {
    /// Messages placed on the outbound queue.
    pub enqueued: u64,
    /// Messages that could not be encoded or queued.
    pub failed: u64,
}

/// Local side of replication: notifies observers then queues the broadcast.
pub struct ReplicationHandler {
    node_id: String,
    enabled: bool,
    channel: String,
    codec: PayloadCodec,
    observers: ObserverSet,
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    enqueued: AtomicU64,
    failed: AtomicU64,
    metrics: Option<DirectoryMetrics>,
}

impl ReplicationHandler {
    /// Create a handler and the queue its broadcasts land on.
    pub fn new(config: &ReplicationConfig, node_id: impl Into<String>) -> (Self, OutboundQueue) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let handler = Self {
            node_id: node_id.into(),
            enabled: config.enabled,
            channel: config.channel.clone(),
            codec: config.codec,
            observers: ObserverSet::new(),
            outbound,
            enqueued: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            metrics: None,
        };
        (handler, queue)
    }

    /// Mirror counters into Prometheus.
    pub fn with_metrics(mut self, metrics: DirectoryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Observers notified of local mutations.
    pub fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    /// This node's id, stamped as sender on every broadcast.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Report a committed local mutation.
    ///
    /// Never fails: delivery problems are logged and counted, and the local
    /// commit stands.
    pub fn handle(&self, event: &PermissionEvent) {
        self.observers.notify(&EventOrigin::Local, event);
        if let Some(metrics) = &self.metrics {
            metrics.observe_mutation(event.kind());
        }
        self.broadcast(event);
    }

    /// Queue `event` for the cluster without notifying local observers.
    /// Used to resync other nodes after a reload or reconnect.
    pub fn broadcast(&self, event: &PermissionEvent) {
        let Some(kind) = MessageKind::from_event(event) else {
            return;
        };
        if !self.enabled {
            return;
        }

        match self.enqueue(kind, event) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.observe_enqueued();
                }
            }
            Err(err) => {
                warn!(
                    node = %self.node_id,
                    kind = kind.as_str(),
                    key = event.key().as_deref().unwrap_or("*"),
                    error = %err,
                    "replication broadcast dropped"
                );
                self.failed.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.observe_failed();
                }
            }
        }
    }

    fn enqueue(&self, kind: MessageKind, event: &PermissionEvent) -> Result<()> {
        let payload = self.encode(event)?;
        let message =
            ChannelMessage::broadcast(&self.node_id, &self.channel, kind.wire_name(), payload);
        debug!(
            node = %self.node_id,
            kind = kind.as_str(),
            message_id = %message.id,
            "replication message queued"
        );
        self.outbound
            .send(message)
            .map_err(|_| DirectoryError::ReplicationDelivery("outbound queue closed".into()))
    }

    fn encode(&self, event: &PermissionEvent) -> Result<Vec<u8>> {
        let bytes = match event {
            PermissionEvent::AddUser { user } | PermissionEvent::DeleteUser { user } => {
                self.codec.encode::<PermissionUser>(user)?
            }
            PermissionEvent::UpdateUser { after, .. } => {
                self.codec.encode::<PermissionUser>(after)?
            }
            PermissionEvent::AddGroup { group } | PermissionEvent::DeleteGroup { group } => {
                self.codec.encode::<PermissionGroup>(group)?
            }
            PermissionEvent::UpdateGroup { after, .. } => {
                self.codec.encode::<PermissionGroup>(after)?
            }
            PermissionEvent::SetGroups { groups } => {
                let groups: Vec<&PermissionGroup> = groups.iter().map(Arc::as_ref).collect();
                self.codec.encode(&groups)?
            }
            PermissionEvent::SetUsers { .. } => {
                return Err(DirectoryError::ReplicationDelivery(
                    "user collections are not replicated".into(),
                ))
            }
        };
        Ok(bytes)
    }
}

impl std::fmt::Debug for ReplicationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandler")
            .field("node_id", &self.node_id)
            .field("enabled", &self.enabled)
            .field("channel", &self.channel)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

/// Drains the outbound queue onto the bus.
pub struct ReplicationSender {
    queue: OutboundQueue,
    publisher: Arc<BusPublisher>,
    metrics: Option<DirectoryMetrics>,
}

impl ReplicationSender {
    /// Create a sender over `queue` publishing through `publisher`.
    pub fn new(queue: OutboundQueue, publisher: Arc<BusPublisher>) -> Self {
        Self {
            queue,
            publisher,
            metrics: None,
        }
    }

    /// Count failed sends in Prometheus.
    pub fn with_metrics(mut self, metrics: DirectoryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish everything currently queued without waiting. Returns the
    /// number of messages taken off the queue.
    pub fn pump(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(message) = self.queue.try_recv() {
            self.deliver(message);
            drained += 1;
        }
        drained
    }

    /// Publish messages as they arrive until every handler is dropped.
    pub async fn run(mut self) {
        while let Some(message) = self.queue.recv().await {
            self.deliver(message);
        }
        debug!("replication sender stopped");
    }

    /// Run the sender on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn deliver(&self, message: ChannelMessage) {
        let id = message.id;
        let kind = message.message.clone();
        if let Err(err) = self.publisher.publish(message) {
            warn!(message_id = %id, kind = %kind, error = %err, "replication send failed");
            if let Some(metrics) = &self.metrics {
                metrics.observe_failed();
            }
        }
    }
}

/// Applies other nodes' replication messages to the local store.
#[derive(Clone)]
pub struct ReplicationReceiver {
    node_id: String,
    channel: String,
    codec: PayloadCodec,
    store: Arc<DirectoryStore>,
    observers: ObserverSet,
    commits: Arc<CommitLocks>,
    metrics: Option<DirectoryMetrics>,
}

impl ReplicationReceiver {
    /// Create a receiver writing into `store` and notifying `observers`.
    pub fn new(
        config: &ReplicationConfig,
        node_id: impl Into<String>,
        store: Arc<DirectoryStore>,
        observers: ObserverSet,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            channel: config.channel.clone(),
            codec: config.codec,
            store,
            observers,
            commits: Arc::new(CommitLocks::new()),
            metrics: None,
        }
    }

    /// Share commit ordering with the local directory writing the same store.
    pub fn with_commit_locks(mut self, commits: Arc<CommitLocks>) -> Self {
        self.commits = commits;
        self
    }

    /// Count applied and rejected messages in Prometheus.
    pub fn with_metrics(mut self, metrics: DirectoryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply one message.
    ///
    /// Returns the kind of change applied, or `None` when the message was
    /// ignored (foreign channel, own node, unknown kind, not addressed here)
    /// or was a delete of something already absent. Groups are stored as the
    /// sender committed them even if they look cyclic against this node's
    /// state. Decode failures and duplicate names in `set_groups` are logged,
    /// counted, and returned; the store is unchanged.
    pub fn apply(&self, message: &ChannelMessage) -> Result<Option<EventKind>> {
        if message.channel != self.channel
            || message.sender == self.node_id
            || !message.is_addressed_to(&self.node_id)
        {
            return Ok(None);
        }
        let Some(kind) = MessageKind::parse(&message.message) else {
            debug!(kind = %message.message, sender = %message.sender, "ignoring unknown message kind");
            return Ok(None);
        };

        match self.apply_kind(kind, &message.payload) {
            Ok(Some((_commit, event))) => {
                let origin = EventOrigin::Remote {
                    node: message.sender.clone(),
                };
                debug!(
                    node = %self.node_id,
                    sender = %message.sender,
                    kind = kind.as_str(),
                    key = event.key().as_deref().unwrap_or("*"),
                    "replication message applied"
                );
                self.observers.notify(&origin, &event);
                if let Some(metrics) = &self.metrics {
                    metrics.observe_applied(event.kind());
                }
                Ok(Some(event.kind()))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!(
                    node = %self.node_id,
                    sender = %message.sender,
                    kind = kind.as_str(),
                    error = %err,
                    "replication message rejected"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.observe_rejected();
                }
                Err(err)
            }
        }
    }

    fn apply_kind(
        &self,
        kind: MessageKind,
        payload: &[u8],
    ) -> Result<Option<(CommitGuard<'_>, PermissionEvent)>> {
        let applied = match kind {
            MessageKind::AddUser | MessageKind::UpdateUser => {
                let user: PermissionUser = self.codec.decode(payload)?;
                let commit = self.commits.user(&user.id);
                let event = match (kind, self.store.mirror_user(user)) {
                    (MessageKind::AddUser, Upserted::Added(user)) => {
                        PermissionEvent::AddUser { user }
                    }
                    (_, Upserted::Added(after)) => PermissionEvent::UpdateUser {
                        before: None,
                        after,
                    },
                    (_, Upserted::Updated { before, after }) => PermissionEvent::UpdateUser {
                        before: Some(before),
                        after,
                    },
                };
                (commit, event)
            }
            MessageKind::DeleteUser => {
                let user: PermissionUser = self.codec.decode(payload)?;
                let commit = self.commits.user(&user.id);
                match self.store.remove_user(&user.id) {
                    Some(user) => (commit, PermissionEvent::DeleteUser { user }),
                    None => return Ok(None),
                }
            }
            MessageKind::AddGroup | MessageKind::UpdateGroup => {
                let group: PermissionGroup = self.codec.decode(payload)?;
                let commit = self.commits.group(group.name());
                let event = match (kind, self.store.mirror_group(group)) {
                    (MessageKind::AddGroup, Upserted::Added(group)) => {
                        PermissionEvent::AddGroup { group }
                    }
                    (_, Upserted::Added(after)) => PermissionEvent::UpdateGroup {
                        before: None,
                        after,
                    },
                    (_, Upserted::Updated { before, after }) => PermissionEvent::UpdateGroup {
                        before: Some(before),
                        after,
                    },
                };
                (commit, event)
            }
            MessageKind::DeleteGroup => {
                let group: PermissionGroup = self.codec.decode(payload)?;
                let commit = self.commits.group(group.name());
                match self.store.remove_group(group.name()) {
                    Some(group) => (commit, PermissionEvent::DeleteGroup { group }),
                    None => return Ok(None),
                }
            }
            MessageKind::SetGroups => {
                let groups: Vec<PermissionGroup> = self.codec.decode(payload)?;
                let commit = self.commits.all_groups();
                let groups = self.store.mirror_all_groups(groups)?;
                (commit, PermissionEvent::SetGroups { groups })
            }
        };
        Ok(Some(applied))
    }

    /// Poll `publisher` and apply everything received. Returns how many
    /// messages changed the store.
    pub fn drain(&self, publisher: &BusPublisher) -> usize {
        publisher
            .poll()
            .iter()
            .filter(|message| matches!(self.apply(message), Ok(Some(_))))
            .count()
    }
}

impl std::fmt::Debug for ReplicationReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationReceiver")
            .field("node_id", &self.node_id)
            .field("channel", &self.channel)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}
