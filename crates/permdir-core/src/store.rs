//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entity::{PermissionGroup, PermissionUser};
use crate::error::{DirectoryError, Result};
use crate::hierarchy::{validate_collection, validate_parents, GroupMap};

/// Result of an upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum Upserted<T> {
    /// The key was not present before.
    Added(Arc<T>),
    /// The key was present and its value replaced.
    Updated {
        /// Value before the replacement.
        before: Arc<T>,
        /// Value after the replacement.
        after: Arc<T>,
    },
}

impl<T> Upserted<T> {
    /// The value now stored.
    pub fn current(&self) -> &Arc<T> {
        match self {
            Upserted::Added(value) => value,
            Upserted::Updated { after, .. } => after,
        }
    }
}

/// Entities changed by [`DirectoryStore::prune_expired`], as (before, after) pairs.
#[derive(Debug, Default, Clone)]
pub struct PruneOutcome {
    /// Users that lost expired records or memberships.
    pub users: Vec<(Arc<PermissionUser>, Arc<PermissionUser>)>,
    /// Groups that lost expired records.
    pub groups: Vec<(Arc<PermissionGroup>, Arc<PermissionGroup>)>,
    /// Total number of entries removed.
    pub removed: usize,
}

/// Consistent read view used by one resolution.
#[derive(Debug, Clone)]
pub struct ResolutionView {
    /// The user being resolved.
    pub user: Arc<PermissionUser>,
    /// Group collection as of the same instant.
    pub groups: Arc<GroupMap>,
}

/// In-memory user and group collections.
///
/// Values are held behind `Arc` and replaced whole, never patched in place.
/// The group map itself is copy-on-write so a full replace is one swap and
/// readers holding an older map are unaffected.
#[derive(Debug, Default)]
pub struct DirectoryStore {
    users: RwLock<HashMap<Uuid, Arc<PermissionUser>>>,
    groups: RwLock<Arc<GroupMap>>,
}

impl DirectoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // ---- users ----------------------------------------------------------

    /// Create a user. Fails if the id or the name is already taken.
    pub fn insert_user(&self, user: PermissionUser) -> Result<Arc<PermissionUser>> {
        let mut users = self.users.write();
        if users.contains_key(&user.id) {
            return Err(DirectoryError::Validation(format!(
                "user {} already exists",
                user.id
            )));
        }
        ensure_unique_user_name(&users, &user)?;
        let user = Arc::new(user);
        users.insert(user.id, Arc::clone(&user));
        debug!(user_id = %user.id, user = user.name(), "user added");
        Ok(user)
    }

    /// Replace an existing user. Fails if the id is unknown or the new name
    /// belongs to another user.
    pub fn update_user(
        &self,
        user: PermissionUser,
    ) -> Result<(Arc<PermissionUser>, Arc<PermissionUser>)> {
        let mut users = self.users.write();
        if !users.contains_key(&user.id) {
            return Err(DirectoryError::user_not_found(user.id));
        }
        ensure_unique_user_name(&users, &user)?;
        let after = Arc::new(user);
        let before = users
            .insert(after.id, Arc::clone(&after))
            .ok_or_else(|| DirectoryError::user_not_found(after.id))?;
        debug!(user_id = %after.id, user = after.name(), "user updated");
        Ok((before, after))
    }

    /// Insert or replace a user by id. Fails if the name belongs to another
    /// user; the add-or-update decision and the write share one lock.
    pub fn upsert_user(&self, user: PermissionUser) -> Result<Upserted<PermissionUser>> {
        let mut users = self.users.write();
        ensure_unique_user_name(&users, &user)?;
        let after = Arc::new(user);
        let upserted = match users.insert(after.id, Arc::clone(&after)) {
            Some(before) => Upserted::Updated { before, after },
            None => Upserted::Added(after),
        };
        debug!(user_id = %upserted.current().id, user = upserted.current().name(), "user upserted");
        Ok(upserted)
    }

    /// Insert or replace a user by id exactly as another node committed it.
    pub fn mirror_user(&self, user: PermissionUser) -> Upserted<PermissionUser> {
        let after = Arc::new(user);
        let previous = self.users.write().insert(after.id, Arc::clone(&after));
        match previous {
            Some(before) => Upserted::Updated { before, after },
            None => Upserted::Added(after),
        }
    }

    /// Remove a user by id.
    pub fn remove_user(&self, id: &Uuid) -> Option<Arc<PermissionUser>> {
        let removed = self.users.write().remove(id);
        if let Some(user) = &removed {
            debug!(user_id = %user.id, user = user.name(), "user removed");
        }
        removed
    }

    /// Replace the whole user collection.
    pub fn replace_all_users(&self, users: Vec<PermissionUser>) -> Vec<Arc<PermissionUser>> {
        let next: HashMap<Uuid, Arc<PermissionUser>> = users
            .into_iter()
            .map(|user| (user.id, Arc::new(user)))
            .collect();
        let current: Vec<Arc<PermissionUser>> = next.values().cloned().collect();
        *self.users.write() = next;
        current
    }

    /// Lookup a user by id.
    pub fn user(&self, id: &Uuid) -> Option<Arc<PermissionUser>> {
        self.users.read().get(id).cloned()
    }

    /// Lookup a user by name.
    pub fn user_by_name(&self, name: &str) -> Option<Arc<PermissionUser>> {
        self.users
            .read()
            .values()
            .find(|user| user.name() == name)
            .cloned()
    }

    /// All users, ordered by name.
    pub fn list_users(&self) -> Vec<Arc<PermissionUser>> {
        let mut users: Vec<_> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| a.name().cmp(b.name()).then(a.id.cmp(&b.id)));
        users
    }

    // ---- groups ---------------------------------------------------------

    /// Create a group. Fails on a duplicate name or a parent cycle.
    pub fn insert_group(&self, group: PermissionGroup) -> Result<Arc<PermissionGroup>> {
        let mut guard = self.groups.write();
        if guard.contains_key(group.name()) {
            return Err(DirectoryError::Validation(format!(
                "group {} already exists",
                group.name()
            )));
        }
        validate_parents(&guard, &group)?;
        let group = Arc::new(group);
        Arc::make_mut(&mut guard).insert(group.name().to_owned(), Arc::clone(&group));
        debug!(group = group.name(), "group added");
        Ok(group)
    }

    /// Replace an existing group. Fails if the name is unknown or on a parent cycle.
    pub fn update_group(
        &self,
        group: PermissionGroup,
    ) -> Result<(Arc<PermissionGroup>, Arc<PermissionGroup>)> {
        let mut guard = self.groups.write();
        if !guard.contains_key(group.name()) {
            return Err(DirectoryError::group_not_found(group.name()));
        }
        validate_parents(&guard, &group)?;
        let after = Arc::new(group);
        let before = Arc::make_mut(&mut guard)
            .insert(after.name().to_owned(), Arc::clone(&after))
            .ok_or_else(|| DirectoryError::group_not_found(after.name()))?;
        debug!(group = after.name(), "group updated");
        Ok((before, after))
    }

    /// Insert or replace a group by name. Parent cycles are still rejected.
    pub fn upsert_group(&self, group: PermissionGroup) -> Result<Upserted<PermissionGroup>> {
        let mut guard = self.groups.write();
        validate_parents(&guard, &group)?;
        let after = Arc::new(group);
        let previous = Arc::make_mut(&mut guard).insert(after.name().to_owned(), Arc::clone(&after));
        Ok(match previous {
            Some(before) => Upserted::Updated { before, after },
            None => Upserted::Added(after),
        })
    }

    /// Insert or replace a group exactly as another node committed it.
    ///
    /// The origin validated the hierarchy against its own state, which this
    /// node may only partly hold after a lost message. A group that looks
    /// cyclic here is logged and stored anyway; closure walks terminate on
    /// stored cycles and a later update or `set_groups` repairs the view.
    pub fn mirror_group(&self, group: PermissionGroup) -> Upserted<PermissionGroup> {
        let mut guard = self.groups.write();
        if let Err(err) = validate_parents(&guard, &group) {
            warn!(group = group.name(), error = %err, "mirrored group closes a local cycle");
        }
        let after = Arc::new(group);
        let previous = Arc::make_mut(&mut guard).insert(after.name().to_owned(), Arc::clone(&after));
        match previous {
            Some(before) => Upserted::Updated { before, after },
            None => Upserted::Added(after),
        }
    }

    /// Remove a group by name. References to it elsewhere are left dangling.
    pub fn remove_group(&self, name: &str) -> Option<Arc<PermissionGroup>> {
        let mut guard = self.groups.write();
        if !guard.contains_key(name) {
            return None;
        }
        let removed = Arc::make_mut(&mut guard).remove(name);
        debug!(group = name, "group removed");
        removed
    }

    /// Rename a group atomically. References to the old name are not rewritten.
    pub fn rename_group(
        &self,
        from: &str,
        to: &str,
    ) -> Result<(Arc<PermissionGroup>, Arc<PermissionGroup>)> {
        let mut guard = self.groups.write();
        let Some(before) = guard.get(from).cloned() else {
            return Err(DirectoryError::group_not_found(from));
        };
        if guard.contains_key(to) {
            return Err(DirectoryError::Validation(format!(
                "group {to} already exists"
            )));
        }

        let mut renamed = (*before).clone();
        renamed.base.name = to.to_owned();

        let mut next = (**guard).clone();
        next.remove(from);
        validate_parents(&next, &renamed)?;
        let after = Arc::new(renamed);
        next.insert(to.to_owned(), Arc::clone(&after));
        *guard = Arc::new(next);
        debug!(from, to, "group renamed");
        Ok((before, after))
    }

    /// Atomically replace the whole group collection.
    ///
    /// Groups absent from `groups` disappear. Duplicate names or a cyclic
    /// collection reject the swap and leave the store untouched.
    pub fn replace_all_groups(
        &self,
        groups: Vec<PermissionGroup>,
    ) -> Result<Vec<Arc<PermissionGroup>>> {
        let next = unique_groups(groups)?;
        validate_collection(&next)?;
        Ok(self.swap_groups(next))
    }

    /// Replace the whole group collection with another node's.
    ///
    /// Duplicate names still reject the swap. A collection that fails cycle
    /// validation is logged and installed, like [`Self::mirror_group`].
    pub fn mirror_all_groups(
        &self,
        groups: Vec<PermissionGroup>,
    ) -> Result<Vec<Arc<PermissionGroup>>> {
        let next = unique_groups(groups)?;
        if let Err(err) = validate_collection(&next) {
            warn!(groups = next.len(), error = %err, "mirrored group collection is cyclic");
        }
        Ok(self.swap_groups(next))
    }

    fn swap_groups(&self, next: GroupMap) -> Vec<Arc<PermissionGroup>> {
        let next = Arc::new(next);
        *self.groups.write() = Arc::clone(&next);
        debug!(groups = next.len(), "group collection replaced");
        sorted_groups(&next)
    }

    /// Lookup a group by name.
    pub fn group(&self, name: &str) -> Option<Arc<PermissionGroup>> {
        self.groups.read().get(name).cloned()
    }

    /// All groups ordered by sort id, then name.
    pub fn list_groups(&self) -> Vec<Arc<PermissionGroup>> {
        sorted_groups(&self.groups_snapshot())
    }

    /// Groups flagged as default, ordered like [`Self::list_groups`].
    pub fn default_groups(&self) -> Vec<Arc<PermissionGroup>> {
        self.list_groups()
            .into_iter()
            .filter(|g| g.default_group)
            .collect()
    }

    /// The current group map; later mutations do not affect the returned value.
    pub fn groups_snapshot(&self) -> Arc<GroupMap> {
        Arc::clone(&*self.groups.read())
    }

    // ---- shared ---------------------------------------------------------

    /// Point-in-time view of one user and the group collection.
    pub fn resolution_view(&self, user_id: &Uuid) -> Option<ResolutionView> {
        let users = self.users.read();
        let user = users.get(user_id).cloned()?;
        let groups = Arc::clone(&*self.groups.read());
        drop(users);
        Some(ResolutionView { user, groups })
    }

    /// Drop expired records and memberships from every entity.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> PruneOutcome {
        let mut outcome = PruneOutcome::default();

        {
            let mut users = self.users.write();
            for slot in users.values_mut() {
                let mut pruned = (**slot).clone();
                let removed = pruned.prune_expired(now);
                if removed > 0 {
                    let after = Arc::new(pruned);
                    let before = std::mem::replace(slot, Arc::clone(&after));
                    outcome.users.push((before, after));
                    outcome.removed += removed;
                }
            }
        }

        {
            let mut guard = self.groups.write();
            let mut changed = Vec::new();
            for (name, group) in guard.iter() {
                let mut pruned = (**group).clone();
                let removed = pruned.base.prune_expired(now);
                if removed > 0 {
                    changed.push((name.clone(), Arc::clone(group), Arc::new(pruned)));
                    outcome.removed += removed;
                }
            }
            if !changed.is_empty() {
                let map = Arc::make_mut(&mut guard);
                for (name, before, after) in changed {
                    map.insert(name, Arc::clone(&after));
                    outcome.groups.push((before, after));
                }
            }
        }

        if outcome.removed > 0 {
            debug!(
                removed = outcome.removed,
                users = outcome.users.len(),
                groups = outcome.groups.len(),
                "expired entries pruned"
            );
        }
        outcome
    }

    /// Number of users and groups held.
    pub fn len(&self) -> (usize, usize) {
        (self.users.read().len(), self.groups.read().len())
    }

    /// Whether the store holds neither users nor groups.
    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0)
    }
}

fn ensure_unique_user_name(
    users: &HashMap<Uuid, Arc<PermissionUser>>,
    user: &PermissionUser,
) -> Result<()> {
    let taken = users
        .values()
        .any(|other| other.id != user.id && other.name() == user.name());
    if taken {
        return Err(DirectoryError::Validation(format!(
            "user name {} is already taken",
            user.name()
        )));
    }
    Ok(())
}

fn unique_groups(groups: Vec<PermissionGroup>) -> Result<GroupMap> {
    let mut next = GroupMap::with_capacity(groups.len());
    for group in groups {
        let name = group.name().to_owned();
        if next.insert(name.clone(), Arc::new(group)).is_some() {
            return Err(DirectoryError::Validation(format!(
                "group {name} appears more than once"
            )));
        }
    }
    Ok(next)
}

fn sorted_groups(groups: &GroupMap) -> Vec<Arc<PermissionGroup>> {
    let mut list: Vec<_> = groups.values().cloned().collect();
    list.sort_by(|a, b| a.sort_id.cmp(&b.sort_id).then_with(|| a.name().cmp(b.name())));
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Permission;
    use chrono::Duration;

    fn names(groups: &[Arc<PermissionGroup>]) -> Vec<String> {
        let mut names: Vec<String> = groups.iter().map(|g| g.name().to_owned()).collect();
        names.sort();
        names
    }

    #[test]
    fn duplicate_names_are_rejected_on_create() {
        let store = DirectoryStore::new();
        store.insert_user(PermissionUser::new("alice")).unwrap();
        let err = store.insert_user(PermissionUser::new("alice")).unwrap_err();
        assert!(matches!(err, DirectoryError::Validation(_)));

        store.insert_group(PermissionGroup::new("admin", 100)).unwrap();
        let err = store
            .insert_group(PermissionGroup::new("admin", 1))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Validation(_)));
    }

    #[test]
    fn updates_of_unknown_entities_are_not_found() {
        let store = DirectoryStore::new();
        assert!(matches!(
            store.update_user(PermissionUser::new("ghost")),
            Err(DirectoryError::NotFound { .. })
        ));
        assert!(matches!(
            store.update_group(PermissionGroup::new("ghost", 0)),
            Err(DirectoryError::NotFound { .. })
        ));
    }

    #[test]
    fn cyclic_update_leaves_hierarchy_unchanged() {
        let store = DirectoryStore::new();
        store.insert_group(PermissionGroup::new("A", 0)).unwrap();
        store
            .insert_group(PermissionGroup::new("B", 0).with_parent("A"))
            .unwrap();

        let err = store
            .update_group(PermissionGroup::new("A", 0).with_parent("B"))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Cycle { .. }));
        assert!(store.group("A").unwrap().parents.is_empty());

        let err = store
            .upsert_group(PermissionGroup::new("A", 0).with_parent("A"))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Cycle { .. }));
        assert!(store.group("A").unwrap().parents.is_empty());
    }

    #[test]
    fn upsert_user_checks_names_under_one_lock() {
        let store = DirectoryStore::new();
        let alice = PermissionUser::new("alice");
        assert!(matches!(
            store.upsert_user(alice.clone()).unwrap(),
            Upserted::Added(_)
        ));
        assert!(matches!(
            store.upsert_user(alice.clone()).unwrap(),
            Upserted::Updated { .. }
        ));

        let err = store.upsert_user(PermissionUser::new("alice")).unwrap_err();
        assert!(matches!(err, DirectoryError::Validation(_)));
        assert_eq!(store.len(), (1, 0));
    }

    #[test]
    fn upserts_racing_deletes_never_fail() {
        let store = Arc::new(DirectoryStore::new());
        let user = PermissionUser::new("racer");
        let id = user.id;

        let writers: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                let user = user.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        store.upsert_user(user.clone()).unwrap();
                    }
                })
            })
            .collect();
        let deleter = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    store.remove_user(&id);
                }
            })
        };
        for handle in writers {
            handle.join().unwrap();
        }
        deleter.join().unwrap();

        store.upsert_user(user).unwrap();
        assert_eq!(store.user(&id).unwrap().name(), "racer");
    }

    #[test]
    fn mirrored_groups_commit_even_when_locally_cyclic() {
        let store = DirectoryStore::new();
        store
            .insert_group(PermissionGroup::new("A", 0).with_parent("B"))
            .unwrap();
        store.insert_group(PermissionGroup::new("B", 0)).unwrap();

        let upserted = store.mirror_group(PermissionGroup::new("B", 0).with_parent("A"));
        assert!(matches!(upserted, Upserted::Updated { .. }));
        assert!(store.group("B").unwrap().parents.contains("A"));

        let installed = store
            .mirror_all_groups(vec![
                PermissionGroup::new("X", 0).with_parent("Y"),
                PermissionGroup::new("Y", 0).with_parent("X"),
            ])
            .unwrap();
        assert_eq!(installed.len(), 2);
        assert_eq!(names(&store.list_groups()), vec!["X", "Y"]);

        let duplicated = vec![PermissionGroup::new("Z", 0), PermissionGroup::new("Z", 1)];
        assert!(store.mirror_all_groups(duplicated).is_err());
        assert_eq!(names(&store.list_groups()), vec!["X", "Y"]);
    }

    #[test]
    fn replace_all_groups_is_a_full_swap() {
        let store = DirectoryStore::new();
        for name in ["A", "B", "C"] {
            store.insert_group(PermissionGroup::new(name, 0)).unwrap();
        }
        let before = store.groups_snapshot();

        store
            .replace_all_groups(vec![PermissionGroup::new("A", 0), PermissionGroup::new("D", 0)])
            .unwrap();

        assert_eq!(names(&store.list_groups()), vec!["A", "D"]);
        assert_eq!(before.len(), 3, "earlier snapshots are not mutated");
    }

    #[test]
    fn rejected_replacement_keeps_old_collection() {
        let store = DirectoryStore::new();
        store.insert_group(PermissionGroup::new("keep", 0)).unwrap();

        let cyclic = vec![
            PermissionGroup::new("X", 0).with_parent("Y"),
            PermissionGroup::new("Y", 0).with_parent("X"),
        ];
        assert!(store.replace_all_groups(cyclic).is_err());

        let duplicated = vec![PermissionGroup::new("Z", 0), PermissionGroup::new("Z", 1)];
        assert!(store.replace_all_groups(duplicated).is_err());

        assert_eq!(names(&store.list_groups()), vec!["keep"]);
    }

    #[test]
    fn rename_checks_target_and_cycles() {
        let store = DirectoryStore::new();
        store
            .insert_group(PermissionGroup::new("old", 0).with_parent("base"))
            .unwrap();
        store
            .insert_group(PermissionGroup::new("base", 0).with_parent("new"))
            .unwrap();
        store.insert_group(PermissionGroup::new("taken", 0)).unwrap();

        assert!(matches!(
            store.rename_group("old", "taken"),
            Err(DirectoryError::Validation(_))
        ));
        assert!(matches!(
            store.rename_group("missing", "x"),
            Err(DirectoryError::NotFound { .. })
        ));
        // "base" already inherits from "new", so old -> new would close a loop
        assert!(matches!(
            store.rename_group("old", "new"),
            Err(DirectoryError::Cycle { .. })
        ));

        let (before, after) = store.rename_group("old", "renamed").unwrap();
        assert_eq!(before.name(), "old");
        assert_eq!(after.name(), "renamed");
        assert!(store.group("old").is_none());
        assert!(store.group("renamed").unwrap().parents.contains("base"));
    }

    #[test]
    fn resolution_view_is_stable_across_later_writes() {
        let store = DirectoryStore::new();
        let user = store.insert_user(PermissionUser::new("bob")).unwrap();
        store.insert_group(PermissionGroup::new("A", 0)).unwrap();

        let view = store.resolution_view(&user.id).unwrap();
        store.remove_group("A");
        store.remove_user(&user.id);

        assert!(view.groups.contains_key("A"));
        assert_eq!(view.user.name(), "bob");
        assert!(store.resolution_view(&user.id).is_none());
    }

    #[test]
    fn prune_replaces_only_changed_entities() {
        let store = DirectoryStore::new();
        let now = Utc::now();
        let past = now - Duration::minutes(5);

        let mut expiring = PermissionUser::new("carl");
        expiring.add_membership("vip", Some(past));
        let expiring = store.insert_user(expiring).unwrap();
        let untouched = store.insert_user(PermissionUser::new("dana")).unwrap();
        store
            .insert_group(
                PermissionGroup::new("event", 0)
                    .with_permission(Permission::grant("event.join").unwrap().expiring_at(past)),
            )
            .unwrap();

        let outcome = store.prune_expired(now);
        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.users.len(), 1);
        assert_eq!(outcome.users[0].0.id, expiring.id);
        assert_eq!(outcome.groups.len(), 1);
        assert!(store.user(&expiring.id).unwrap().memberships.is_empty());
        assert!(Arc::ptr_eq(&store.user(&untouched.id).unwrap(), &untouched));
        assert!(store.group("event").unwrap().base.permissions.is_empty());
    }

    #[test]
    fn concurrent_writers_on_distinct_keys_all_land() {
        let store = Arc::new(DirectoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for n in 0..25 {
                        store
                            .insert_group(PermissionGroup::new(format!("g{worker}-{n}"), n))
                            .unwrap();
                        store
                            .insert_user(PermissionUser::new(format!("u{worker}-{n}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), (200, 200));
    }
}
