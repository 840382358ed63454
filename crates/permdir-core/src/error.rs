//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::fmt;

use thiserror::Error;

/// Result alias used throughout the directory crate.
pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Entity kinds held by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A principal.
    User,
    /// A role.
    Group,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::User => f.write_str("user"),
            EntityKind::Group => f.write_str("group"),
        }
    }
}

/// Errors raised by directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Malformed permission name or duplicate entity on create.
    #[error("validation failed: {0}")]
    Validation(String),
    /// A group mutation would make a group its own ancestor.
    #[error("group {group} would inherit from itself via {}", .path.join(" -> "))]
    Cycle {
        /// Group whose mutation was rejected.
        group: String,
        /// Inheritance chain that leads back to the group.
        path: Vec<String>,
    },
    /// Update or delete targeted an entity the store does not hold.
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Entity kind that was looked up.
        kind: EntityKind,
        /// User id or group name.
        key: String,
    },
    /// Broadcast could not be enqueued or encoded. Only ever logged.
    #[error("replication delivery failed: {0}")]
    ReplicationDelivery(String),
    /// Bus or codec failure on the receive path.
    #[error("messaging error: {0}")]
    Messaging(#[from] permdir_msg::MessagingError),
    /// Wrapper for IO errors while reading or writing snapshots.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON snapshot problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DirectoryError {
    pub(crate) fn user_not_found(key: impl ToString) -> Self {
        DirectoryError::NotFound {
            kind: EntityKind::User,
            key: key.to_string(),
        }
    }

    pub(crate) fn group_not_found(key: impl ToString) -> Self {
        DirectoryError::NotFound {
            kind: EntityKind::Group,
            key: key.to_string(),
        }
    }
}
