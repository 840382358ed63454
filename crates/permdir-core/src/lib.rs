//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
//! Permission directory for a cluster of nodes.
//!
//! Users and groups carry grant/deny records; groups inherit from other
//! groups; [`PermissionDirectory::resolve`] picks the single record that
//! decides a query. Every local mutation is replicated to the other nodes
//! over a [`permdir_msg::MessageBus`].
#![warn(missing_docs)]

pub mod commit;
pub mod directory;
pub mod entity;
pub mod error;
pub mod hierarchy;
pub mod metrics;
pub mod observer;
pub mod permission;
pub mod replication;
pub mod resolve;
pub mod snapshot;
pub mod store;

pub use commit::{CommitGuard, CommitLocks};
pub use directory::PermissionDirectory;
pub use entity::{GroupMembership, Permissible, PermissionGroup, PermissionUser};
pub use error::{DirectoryError, EntityKind, Result};
pub use hierarchy::GroupMap;
pub use metrics::DirectoryMetrics;
pub use observer::{
    EventKind, EventOrigin, ObserverSet, PermissionEvent, PermissionObserver, RecordingObserver,
};
pub use permission::{Permission, PermissionName, Specificity};
pub use replication::{
    MessageKind, OutboundQueue, ReplicationHandler, ReplicationReceiver, ReplicationSender,
    ReplicationStats, MESSAGE_PREFIX,
};
pub use resolve::{Decision, RecordSource, Resolution, Resolver, Winner};
pub use snapshot::{DirectorySnapshot, SNAPSHOT_VERSION};
pub use store::{DirectoryStore, PruneOutcome, ResolutionView, Upserted};
