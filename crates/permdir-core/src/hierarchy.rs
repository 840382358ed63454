//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
//! Group inheritance: cycle validation before commit and the breadth-first
//! closure used by resolution.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::entity::{PermissionGroup, PermissionUser};
use crate::error::{DirectoryError, Result};

/// Group collection keyed by name.
pub type GroupMap = HashMap<String, Arc<PermissionGroup>>;

/// Reject `candidate` if, once stored under its name, it would be its own ancestor.
///
/// `groups` is the state the candidate is about to be committed into; any
/// stored entry under the candidate's name is ignored. Unknown parents are
/// accepted.
pub fn validate_parents(groups: &GroupMap, candidate: &PermissionGroup) -> Result<()> {
    let target = candidate.name();
    let mut visited = HashSet::new();
    let mut path = vec![target.to_owned()];
    for parent in &candidate.parents {
        if walk_back_to(groups, target, parent, &mut visited, &mut path) {
            return Err(DirectoryError::Cycle {
                group: target.to_owned(),
                path,
            });
        }
    }
    Ok(())
}

fn walk_back_to(
    groups: &GroupMap,
    target: &str,
    current: &str,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    path.push(current.to_owned());
    if current == target {
        return true;
    }
    if visited.insert(current.to_owned()) {
        if let Some(group) = groups.get(current) {
            for parent in &group.parents {
                if walk_back_to(groups, target, parent, visited, path) {
                    return true;
                }
            }
        }
    }
    path.pop();
    false
}

/// Validate every group of a full collection.
pub fn validate_collection(groups: &GroupMap) -> Result<()> {
    let mut names: Vec<&String> = groups.keys().collect();
    names.sort();
    for name in names {
        validate_parents(groups, &groups[name])?;
    }
    Ok(())
}

/// Breadth-first closure over `parents` starting at `roots`.
///
/// Each reachable stored group appears exactly once, in discovery order.
/// Dangling names contribute nothing.
pub fn closure<'a, I>(groups: &GroupMap, roots: I) -> Vec<Arc<PermissionGroup>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = roots.into_iter().collect();
    let mut result = Vec::new();

    while let Some(name) = queue.pop_front() {
        let Some((key, group)) = groups.get_key_value(name) else {
            continue;
        };
        if !visited.insert(key.as_str()) {
            continue;
        }
        result.push(Arc::clone(group));
        for parent in &group.parents {
            if !visited.contains(parent.as_str()) {
                queue.push_back(parent.as_str());
            }
        }
    }
    result
}

/// Names of all default groups, ascending.
pub fn default_group_names(groups: &GroupMap) -> Vec<&str> {
    let mut names: Vec<&str> = groups
        .values()
        .filter(|g| g.default_group)
        .map(|g| g.name())
        .collect();
    names.sort_unstable();
    names
}

/// The groups applying to `user` at `now`: live memberships, or every default
/// group when there are none, closed over inheritance.
pub fn applicable_groups(
    groups: &GroupMap,
    user: &PermissionUser,
    now: DateTime<Utc>,
) -> Vec<Arc<PermissionGroup>> {
    let live: Vec<&str> = user
        .live_memberships(now)
        .map(|m| m.group.as_str())
        .collect();
    if live.is_empty() {
        closure(groups, default_group_names(groups))
    } else {
        closure(groups, live)
    }
}
