//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use permdir_msg::PayloadCodec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entity::{PermissionGroup, PermissionUser};
use crate::error::{DirectoryError, Result};
use crate::store::DirectoryStore;

/// Current snapshot envelope version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Full directory contents, used to seed or reload a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    /// Every user.
    #[serde(default)]
    pub users: Vec<PermissionUser>,
    /// Every group.
    #[serde(default)]
    pub groups: Vec<PermissionGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    #[serde(default = "current_version")]
    version: u16,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    directory: DirectorySnapshot,
}

fn current_version() -> u16 {
    SNAPSHOT_VERSION
}

impl DirectorySnapshot {
    /// Persist to `path`. A `.cbor` extension writes CBOR, anything else JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let envelope = SnapshotEnvelope {
            version: SNAPSHOT_VERSION,
            created_at: Utc::now(),
            directory: self.clone(),
        };
        let bytes = match codec_for(path) {
            PayloadCodec::Json => serde_json::to_vec_pretty(&envelope)?,
            codec => codec.encode(&envelope)?,
        };

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&bytes)?;
        writer.flush()?;
        debug!(
            path = %path.display(),
            users = self.users.len(),
            groups = self.groups.len(),
            "directory snapshot saved"
        );
        Ok(())
    }

    /// Load a snapshot written by [`Self::save`] or edited by hand.
    pub fn load(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        let envelope: SnapshotEnvelope = codec_for(path).decode(&bytes)?;
        if envelope.version > SNAPSHOT_VERSION {
            return Err(DirectoryError::Validation(format!(
                "snapshot {} has version {}, newest supported is {SNAPSHOT_VERSION}",
                path.display(),
                envelope.version
            )));
        }
        Ok(envelope.directory)
    }
}

fn codec_for(path: &Path) -> PayloadCodec {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("cbor") => PayloadCodec::Cbor,
        _ => PayloadCodec::Json,
    }
}

impl DirectoryStore {
    /// Copy the current contents into a snapshot, users by name and groups
    /// by sort order.
    pub fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            users: self
                .list_users()
                .iter()
                .map(|u| PermissionUser::clone(u))
                .collect(),
            groups: self
                .list_groups()
                .iter()
                .map(|g| PermissionGroup::clone(g))
                .collect(),
        }
    }

    /// Build a store from a snapshot, rejecting duplicate keys, duplicate
    /// user names, and cyclic groups.
    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Result<Arc<Self>> {
        let store = Self::new();
        store.replace_all_groups(snapshot.groups)?;
        for user in snapshot.users {
            store.insert_user(user)?;
        }
        Ok(Arc::new(store))
    }
}
