//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
//! Per-key ordering between a commit and the event it produces.
//!
//! A [`CommitGuard`] is held from the store write until observers have been
//! notified and the broadcast queued, so two mutations of one key leave the
//! node in the order they were committed. Keys hash onto a fixed set of
//! stripes per entity kind. Locks are always taken users before groups, each
//! kind in ascending stripe order.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

const STRIPES: usize = 64;

/// Striped commit locks for users and groups.
#[derive(Debug)]
pub struct CommitLocks {
    users: Vec<Mutex<()>>,
    groups: Vec<Mutex<()>>,
}

/// Held stripes; released on drop.
#[must_use = "the commit order is only kept while the guard is alive"]
pub struct CommitGuard<'a> {
    held: Vec<MutexGuard<'a, ()>>,
}

impl CommitLocks {
    /// Unlocked stripes.
    pub fn new() -> Self {
        Self {
            users: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            groups: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Order commits of one user.
    pub fn user(&self, id: &Uuid) -> CommitGuard<'_> {
        CommitGuard {
            held: vec![self.users[stripe(id)].lock()],
        }
    }

    /// Order commits of one group.
    pub fn group(&self, name: &str) -> CommitGuard<'_> {
        CommitGuard {
            held: vec![self.groups[stripe(name)].lock()],
        }
    }

    /// Order a commit touching two groups, e.g. a rename.
    pub fn group_pair(&self, first: &str, second: &str) -> CommitGuard<'_> {
        let (mut low, mut high) = (stripe(first), stripe(second));
        if low > high {
            std::mem::swap(&mut low, &mut high);
        }
        let mut held = vec![self.groups[low].lock()];
        if high != low {
            held.push(self.groups[high].lock());
        }
        CommitGuard { held }
    }

    /// Order a commit replacing the whole group collection.
    pub fn all_groups(&self) -> CommitGuard<'_> {
        CommitGuard {
            held: self.groups.iter().map(|slot| slot.lock()).collect(),
        }
    }

    /// Order a commit that may touch any user or group.
    pub fn everything(&self) -> CommitGuard<'_> {
        CommitGuard {
            held: self
                .users
                .iter()
                .chain(self.groups.iter())
                .map(|slot| slot.lock())
                .collect(),
        }
    }
}

impl Default for CommitLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommitGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitGuard")
            .field("stripes", &self.held.len())
            .finish()
    }
}

fn stripe<K: Hash + ?Sized>(key: &K) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % STRIPES as u64) as usize
}
