//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::permission::Permission;

fn empty_properties() -> JsonValue {
    JsonValue::Object(Default::default())
}

fn default_color() -> String {
    "&7".to_owned()
}

fn default_suffix() -> String {
    "&f".to_owned()
}

/// Attributes shared by users and groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permissible {
    /// Unique name within the entity kind.
    pub name: String,
    /// Rank of the entity when records from several entities compete.
    #[serde(default)]
    pub potency: i32,
    /// Creation timestamp.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Records owned directly by the entity.
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Records that only apply while the keyed group is applicable.
    #[serde(default)]
    pub scoped_permissions: BTreeMap<String, Vec<Permission>>,
    /// Opaque metadata, never interpreted by the directory.
    #[serde(default = "empty_properties")]
    pub properties: JsonValue,
}

impl Permissible {
    /// Create an entity base without any records.
    pub fn new(name: impl Into<String>, potency: i32) -> Self {
        Self {
            name: name.into(),
            potency,
            created_at: Utc::now(),
            permissions: Vec::new(),
            scoped_permissions: BTreeMap::new(),
            properties: empty_properties(),
        }
    }

    /// Add a record, replacing any existing record with the same name.
    pub fn add_permission(&mut self, permission: Permission) {
        upsert_record(&mut self.permissions, permission);
    }

    /// Add a record scoped to `group`, replacing one with the same name.
    pub fn add_scoped_permission(&mut self, group: impl Into<String>, permission: Permission) {
        upsert_record(
            self.scoped_permissions.entry(group.into()).or_default(),
            permission,
        );
    }

    /// Remove the record with the given name. Returns whether one existed.
    pub fn remove_permission(&mut self, name: &str) -> bool {
        let before = self.permissions.len();
        self.permissions.retain(|p| p.name.as_str() != name);
        before != self.permissions.len()
    }

    /// Drop expired records (own and scoped). Returns how many were removed.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = retain_live(&mut self.permissions, now);
        for records in self.scoped_permissions.values_mut() {
            removed += retain_live(records, now);
        }
        self.scoped_permissions.retain(|_, records| !records.is_empty());
        removed
    }
}

fn upsert_record(records: &mut Vec<Permission>, permission: Permission) {
    match records.iter_mut().find(|p| p.name == permission.name) {
        Some(existing) => *existing = permission,
        None => records.push(permission),
    }
}

fn retain_live(records: &mut Vec<Permission>, now: DateTime<Utc>) -> usize {
    let before = records.len();
    records.retain(|p| !p.is_expired(now));
    before - records.len()
}

/// Membership of a user in a group, optionally time limited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    /// Referenced group name; may dangle.
    pub group: String,
    /// Expiry; `None` is permanent.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl GroupMembership {
    /// Whether the membership still applies at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// A principal of the directory, keyed by its immutable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionUser {
    /// Globally unique identifier, fixed for the entity's lifetime.
    pub id: Uuid,
    /// Shared attributes.
    #[serde(flatten)]
    pub base: Permissible,
    /// Group memberships, at most one per group name.
    #[serde(default)]
    pub memberships: Vec<GroupMembership>,
}

impl PermissionUser {
    /// Create a user with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create a user with a known id.
    pub fn with_id(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            base: Permissible::new(name, 0),
            memberships: Vec::new(),
        }
    }

    /// User name.
    pub fn name(&self) -> &str {
        &self.base.name
    }

    /// Join `group`, replacing an existing membership of the same group.
    pub fn add_membership(&mut self, group: impl Into<String>, expires_at: Option<DateTime<Utc>>) {
        let group = group.into();
        match self.memberships.iter_mut().find(|m| m.group == group) {
            Some(existing) => existing.expires_at = expires_at,
            None => self.memberships.push(GroupMembership { group, expires_at }),
        }
    }

    /// Leave `group`. Returns whether a membership existed.
    pub fn remove_membership(&mut self, group: &str) -> bool {
        let before = self.memberships.len();
        self.memberships.retain(|m| m.group != group);
        before != self.memberships.len()
    }

    /// Memberships that have not expired at `now`.
    pub fn live_memberships(&self, now: DateTime<Utc>) -> impl Iterator<Item = &GroupMembership> {
        self.memberships.iter().filter(move |m| m.is_live(now))
    }

    /// Drop expired records and memberships. Returns how many entries were removed.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.memberships.len();
        self.memberships.retain(|m| m.is_live(now));
        self.base.prune_expired(now) + (before - self.memberships.len())
    }
}

/// A role of the directory, keyed by its name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionGroup {
    /// Shared attributes.
    #[serde(flatten)]
    pub base: Permissible,
    /// Groups this group inherits from; may dangle.
    #[serde(default)]
    pub parents: BTreeSet<String>,
    /// Secondary tie-break, lower wins.
    #[serde(default)]
    pub sort_id: i32,
    /// Applied to users without live memberships.
    #[serde(default)]
    pub default_group: bool,
    /// Chat color code.
    #[serde(default = "default_color")]
    pub color: String,
    /// Chat prefix.
    #[serde(default = "default_color")]
    pub prefix: String,
    /// Chat suffix.
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// Display name formatting.
    #[serde(default = "default_color")]
    pub display: String,
}

impl PermissionGroup {
    /// Create a non-default group without parents.
    pub fn new(name: impl Into<String>, potency: i32) -> Self {
        Self {
            base: Permissible::new(name, potency),
            parents: BTreeSet::new(),
            sort_id: 0,
            default_group: false,
            color: default_color(),
            prefix: default_color(),
            suffix: default_suffix(),
            display: default_color(),
        }
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.base.name
    }

    /// Inherit from `parent`. Returns whether it was newly added.
    pub fn add_parent(&mut self, parent: impl Into<String>) -> bool {
        self.parents.insert(parent.into())
    }

    /// Builder-style parent addition.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.add_parent(parent);
        self
    }

    /// Builder-style sort id.
    pub fn with_sort_id(mut self, sort_id: i32) -> Self {
        self.sort_id = sort_id;
        self
    }

    /// Builder-style default marker.
    pub fn as_default(mut self) -> Self {
        self.default_group = true;
        self
    }

    /// Builder-style record addition.
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.base.add_permission(permission);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn add_permission_replaces_same_name() {
        let mut base = Permissible::new("admin", 10);
        base.add_permission(Permission::grant("server.stop").unwrap());
        base.add_permission(Permission::deny("server.stop").unwrap());
        assert_eq!(base.permissions.len(), 1);
        assert_eq!(base.permissions[0].potency, -1);
        assert!(base.remove_permission("server.stop"));
        assert!(!base.remove_permission("server.stop"));
    }

    #[test]
    fn memberships_are_a_set_by_group_name() {
        let now = Utc::now();
        let mut user = PermissionUser::new("alice");
        user.add_membership("vip", None);
        user.add_membership("vip", Some(now - Duration::seconds(1)));
        user.add_membership("default", None);
        assert_eq!(user.memberships.len(), 2);
        let live: Vec<_> = user.live_memberships(now).map(|m| m.group.as_str()).collect();
        assert_eq!(live, vec!["default"]);
    }

    #[test]
    fn prune_removes_only_expired_entries() {
        let now = Utc::now();
        let past = now - Duration::minutes(1);
        let future = now + Duration::minutes(1);
        let mut user = PermissionUser::new("bob");
        user.base
            .add_permission(Permission::grant("a").unwrap().expiring_at(past));
        user.base
            .add_permission(Permission::grant("b").unwrap().expiring_at(future));
        user.base
            .add_scoped_permission("vip", Permission::grant("c").unwrap().expiring_at(past));
        user.add_membership("vip", Some(past));
        user.add_membership("default", None);

        assert_eq!(user.prune_expired(now), 3);
        assert_eq!(user.base.permissions.len(), 1);
        assert!(user.base.scoped_permissions.is_empty());
        assert_eq!(user.memberships.len(), 1);
        assert_eq!(user.prune_expired(now), 0);
    }

    #[test]
    fn group_json_fills_display_defaults() {
        let group: PermissionGroup = serde_json::from_str(
            r#"{"name":"vip","potency":5,"permissions":[{"name":"help.kick","potency":-1}],"parents":["default"]}"#,
        )
        .expect("valid group");
        assert_eq!(group.name(), "vip");
        assert_eq!(group.base.potency, 5);
        assert_eq!(group.color, "&7");
        assert_eq!(group.suffix, "&f");
        assert!(group.parents.contains("default"));
        assert!(!group.default_group);
        assert!(group.base.properties.is_object());
    }

    #[test]
    fn user_json_keeps_id_and_flattened_base() {
        let user = PermissionUser::new("carol");
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["name"], "carol");
        assert_eq!(json["id"], user.id.to_string());
        let back: PermissionUser = serde_json::from_value(json).unwrap();
        assert_eq!(back, user);
    }
}
