//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::entity::{PermissionGroup, PermissionUser};

/// Mutation kinds surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A user was created.
    AddUser,
    /// A user was replaced.
    UpdateUser,
    /// A user was removed.
    DeleteUser,
    /// A group was created.
    AddGroup,
    /// A group was replaced.
    UpdateGroup,
    /// A group was removed.
    DeleteGroup,
    /// The group collection was replaced.
    SetGroups,
    /// The user collection was replaced (local reload only).
    SetUsers,
}

impl EventKind {
    /// snake_case label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AddUser => "add_user",
            EventKind::UpdateUser => "update_user",
            EventKind::DeleteUser => "delete_user",
            EventKind::AddGroup => "add_group",
            EventKind::UpdateGroup => "update_group",
            EventKind::DeleteGroup => "delete_group",
            EventKind::SetGroups => "set_groups",
            EventKind::SetUsers => "set_users",
        }
    }
}

/// Where a committed change came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOrigin {
    /// Mutated through this node's API.
    Local,
    /// Applied from a replication message.
    Remote {
        /// Sending node id.
        node: String,
    },
}

impl EventOrigin {
    /// Whether the change originated on this node.
    pub fn is_local(&self) -> bool {
        matches!(self, EventOrigin::Local)
    }
}

/// A committed directory mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionEvent {
    /// A user was created.
    AddUser {
        /// The stored user.
        user: Arc<PermissionUser>,
    },
    /// A user was replaced. `before` is `None` when a remote update created it.
    UpdateUser {
        /// Previous value.
        before: Option<Arc<PermissionUser>>,
        /// Current value.
        after: Arc<PermissionUser>,
    },
    /// A user was removed.
    DeleteUser {
        /// The removed user.
        user: Arc<PermissionUser>,
    },
    /// A group was created.
    AddGroup {
        /// The stored group.
        group: Arc<PermissionGroup>,
    },
    /// A group was replaced.
    UpdateGroup {
        /// Previous value.
        before: Option<Arc<PermissionGroup>>,
        /// Current value.
        after: Arc<PermissionGroup>,
    },
    /// A group was removed.
    DeleteGroup {
        /// The removed group.
        group: Arc<PermissionGroup>,
    },
    /// The full group collection after a replace.
    SetGroups {
        /// Every stored group.
        groups: Vec<Arc<PermissionGroup>>,
    },
    /// The full user collection after a local reload.
    SetUsers {
        /// Every stored user.
        users: Vec<Arc<PermissionUser>>,
    },
}

impl PermissionEvent {
    /// Kind of the mutation.
    pub fn kind(&self) -> EventKind {
        match self {
            PermissionEvent::AddUser { .. } => EventKind::AddUser,
            PermissionEvent::UpdateUser { .. } => EventKind::UpdateUser,
            PermissionEvent::DeleteUser { .. } => EventKind::DeleteUser,
            PermissionEvent::AddGroup { .. } => EventKind::AddGroup,
            PermissionEvent::UpdateGroup { .. } => EventKind::UpdateGroup,
            PermissionEvent::DeleteGroup { .. } => EventKind::DeleteGroup,
            PermissionEvent::SetGroups { .. } => EventKind::SetGroups,
            PermissionEvent::SetUsers { .. } => EventKind::SetUsers,
        }
    }

    /// User id or group name the event is about; `None` for collection events.
    pub fn key(&self) -> Option<String> {
        match self {
            PermissionEvent::AddUser { user } | PermissionEvent::DeleteUser { user } => {
                Some(user.id.to_string())
            }
            PermissionEvent::UpdateUser { after, .. } => Some(after.id.to_string()),
            PermissionEvent::AddGroup { group } | PermissionEvent::DeleteGroup { group } => {
                Some(group.name().to_owned())
            }
            PermissionEvent::UpdateGroup { after, .. } => Some(after.name().to_owned()),
            PermissionEvent::SetGroups { .. } | PermissionEvent::SetUsers { .. } => None,
        }
    }
}

/// Local listener for committed mutations. Called synchronously on the
/// mutating thread, so implementations must not block.
pub trait PermissionObserver: Send + Sync {
    /// React to a committed mutation.
    fn notify(&self, origin: &EventOrigin, event: &PermissionEvent);
}

/// Shared, clonable list of observers.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Arc<RwLock<Vec<Arc<dyn PermissionObserver>>>>,
}

impl ObserverSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer; it sees every later event.
    pub fn register(&self, observer: Arc<dyn PermissionObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every observer in registration order.
    pub fn notify(&self, origin: &EventOrigin, event: &PermissionEvent) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.notify(origin, event);
        }
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.len())
            .finish()
    }
}

/// Observer that keeps every event it receives. Handy for tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(EventOrigin, PermissionEvent)>>,
}

impl RecordingObserver {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<(EventOrigin, PermissionEvent)> {
        self.events.lock().clone()
    }

    /// Recorded kinds in arrival order.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|(_, e)| e.kind()).collect()
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl PermissionObserver for RecordingObserver {
    fn notify(&self, origin: &EventOrigin, event: &PermissionEvent) {
        self.events.lock().push((origin.clone(), event.clone()));
    }
}
