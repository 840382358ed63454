//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
//! Public entry point tying the store, resolver, and replication together.
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use permdir_common::{AbsentPolicy, AppConfig, ReplicationConfig};
use tracing::{info, trace};
use uuid::Uuid;

use crate::commit::CommitLocks;
use crate::entity::{PermissionGroup, PermissionUser};
use crate::error::{DirectoryError, Result};
use crate::metrics::DirectoryMetrics;
use crate::observer::{ObserverSet, PermissionEvent};
use crate::replication::{OutboundQueue, ReplicationHandler, ReplicationReceiver, ReplicationStats};
use crate::resolve::{Resolution, Resolver};
use crate::snapshot::DirectorySnapshot;
use crate::store::{DirectoryStore, Upserted};

/// A node's permission directory.
///
/// Every successful mutation notifies local observers and queues a broadcast
/// for the rest of the cluster; the queue returned by the constructors must
/// be handed to a [`crate::ReplicationSender`]. Events for one key are
/// emitted in commit order, so observers must not mutate the key they are
/// being notified about.
#[derive(Debug)]
pub struct PermissionDirectory {
    store: Arc<DirectoryStore>,
    commits: Arc<CommitLocks>,
    handler: ReplicationHandler,
    replication: ReplicationConfig,
    resolver: Resolver,
    absent_policy: AbsentPolicy,
    metrics: Option<DirectoryMetrics>,
}

impl PermissionDirectory {
    /// Empty directory configured from `config`.
    pub fn new(config: &AppConfig) -> (Self, OutboundQueue) {
        Self::with_store(config, Arc::new(DirectoryStore::new()))
    }

    /// Directory over an existing store.
    pub fn with_store(config: &AppConfig, store: Arc<DirectoryStore>) -> (Self, OutboundQueue) {
        let (handler, queue) = ReplicationHandler::new(&config.replication, &config.node.id);
        let directory = Self {
            store,
            commits: Arc::new(CommitLocks::new()),
            handler,
            replication: config.replication.clone(),
            resolver: Resolver::from_config(&config.resolution),
            absent_policy: config.resolution.absent_policy,
            metrics: None,
        };
        (directory, queue)
    }

    /// Directory seeded from `config.directory.snapshot` when one is configured.
    pub fn open(config: &AppConfig) -> Result<(Self, OutboundQueue)> {
        let store = match &config.directory.snapshot {
            Some(path) => {
                let snapshot = DirectorySnapshot::load(path)?;
                info!(
                    node = %config.node.id,
                    path = %path.display(),
                    users = snapshot.users.len(),
                    groups = snapshot.groups.len(),
                    "directory seeded from snapshot"
                );
                DirectoryStore::from_snapshot(snapshot)?
            }
            None => Arc::new(DirectoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Mirror directory activity into Prometheus.
    pub fn with_metrics(mut self, metrics: DirectoryMetrics) -> Self {
        self.handler = self.handler.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Receiver applying other nodes' messages to this directory.
    pub fn receiver(&self) -> ReplicationReceiver {
        let receiver = ReplicationReceiver::new(
            &self.replication,
            self.handler.node_id(),
            Arc::clone(&self.store),
            self.handler.observers().clone(),
        )
        .with_commit_locks(Arc::clone(&self.commits));
        match &self.metrics {
            Some(metrics) => receiver.with_metrics(metrics.clone()),
            None => receiver,
        }
    }

    /// Local observers, notified for local and remote changes alike.
    pub fn observers(&self) -> &ObserverSet {
        self.handler.observers()
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<DirectoryStore> {
        &self.store
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        self.handler.node_id()
    }

    /// Outbound replication counters.
    pub fn replication_stats(&self) -> ReplicationStats {
        self.handler.stats()
    }

    // ---- users ----------------------------------------------------------

    /// Create a user.
    pub fn add_user(&self, user: PermissionUser) -> Result<Arc<PermissionUser>> {
        let _commit = self.commits.user(&user.id);
        let user = self.store.insert_user(user)?;
        self.handler.handle(&PermissionEvent::AddUser {
            user: Arc::clone(&user),
        });
        Ok(user)
    }

    /// Replace an existing user.
    pub fn update_user(&self, user: PermissionUser) -> Result<Arc<PermissionUser>> {
        let _commit = self.commits.user(&user.id);
        let (before, after) = self.store.update_user(user)?;
        self.handler.handle(&PermissionEvent::UpdateUser {
            before: Some(before),
            after: Arc::clone(&after),
        });
        Ok(after)
    }

    /// Create or replace a user.
    pub fn upsert_user(&self, user: PermissionUser) -> Result<Arc<PermissionUser>> {
        let _commit = self.commits.user(&user.id);
        let upserted = self.store.upsert_user(user)?;
        let user = Arc::clone(upserted.current());
        self.handler.handle(&match upserted {
            Upserted::Added(user) => PermissionEvent::AddUser { user },
            Upserted::Updated { before, after } => PermissionEvent::UpdateUser {
                before: Some(before),
                after,
            },
        });
        Ok(user)
    }

    /// Remove a user.
    pub fn delete_user(&self, id: &Uuid) -> Result<Arc<PermissionUser>> {
        let _commit = self.commits.user(id);
        let user = self
            .store
            .remove_user(id)
            .ok_or_else(|| DirectoryError::user_not_found(id))?;
        self.handler.handle(&PermissionEvent::DeleteUser {
            user: Arc::clone(&user),
        });
        Ok(user)
    }

    // ---- groups ---------------------------------------------------------

    /// Create a group.
    pub fn add_group(&self, group: PermissionGroup) -> Result<Arc<PermissionGroup>> {
        let _commit = self.commits.group(group.name());
        let group = self.store.insert_group(group)?;
        self.handler.handle(&PermissionEvent::AddGroup {
            group: Arc::clone(&group),
        });
        Ok(group)
    }

    /// Replace an existing group.
    pub fn update_group(&self, group: PermissionGroup) -> Result<Arc<PermissionGroup>> {
        let _commit = self.commits.group(group.name());
        let (before, after) = self.store.update_group(group)?;
        self.handler.handle(&PermissionEvent::UpdateGroup {
            before: Some(before),
            after: Arc::clone(&after),
        });
        Ok(after)
    }

    /// Create or replace a group.
    pub fn upsert_group(&self, group: PermissionGroup) -> Result<Arc<PermissionGroup>> {
        let _commit = self.commits.group(group.name());
        let upserted = self.store.upsert_group(group)?;
        let group = Arc::clone(upserted.current());
        self.handler.handle(&match upserted {
            Upserted::Added(group) => PermissionEvent::AddGroup { group },
            Upserted::Updated { before, after } => PermissionEvent::UpdateGroup {
                before: Some(before),
                after,
            },
        });
        Ok(group)
    }

    /// Remove a group. Parents and memberships naming it are left dangling.
    pub fn delete_group(&self, name: &str) -> Result<Arc<PermissionGroup>> {
        let _commit = self.commits.group(name);
        let group = self
            .store
            .remove_group(name)
            .ok_or_else(|| DirectoryError::group_not_found(name))?;
        self.handler.handle(&PermissionEvent::DeleteGroup {
            group: Arc::clone(&group),
        });
        Ok(group)
    }

    /// Rename a group; replicated as a delete of the old name and an add of
    /// the new one.
    pub fn rename_group(&self, from: &str, to: &str) -> Result<Arc<PermissionGroup>> {
        let _commit = self.commits.group_pair(from, to);
        let (before, after) = self.store.rename_group(from, to)?;
        self.handler
            .handle(&PermissionEvent::DeleteGroup { group: before });
        self.handler.handle(&PermissionEvent::AddGroup {
            group: Arc::clone(&after),
        });
        Ok(after)
    }

    /// Replace the whole group collection.
    pub fn replace_all_groups(
        &self,
        groups: Vec<PermissionGroup>,
    ) -> Result<Vec<Arc<PermissionGroup>>> {
        let _commit = self.commits.all_groups();
        self.commit_groups(groups)
    }

    fn commit_groups(&self, groups: Vec<PermissionGroup>) -> Result<Vec<Arc<PermissionGroup>>> {
        let groups = self.store.replace_all_groups(groups)?;
        self.handler.handle(&PermissionEvent::SetGroups {
            groups: groups.clone(),
        });
        Ok(groups)
    }

    /// Resync the cluster after a reload or reconnect by broadcasting the
    /// full group collection. Local observers are not notified.
    pub fn handle_reloaded(&self) {
        let _commit = self.commits.all_groups();
        let groups = self.store.list_groups();
        info!(node = %self.node_id(), groups = groups.len(), "broadcasting group resync");
        self.handler.broadcast(&PermissionEvent::SetGroups { groups });
    }

    /// Replace users and groups from a snapshot.
    ///
    /// Groups are replicated as a full resync. Users are only replaced
    /// locally; other nodes reload their own user sets.
    pub fn reload_from_snapshot(&self, snapshot: DirectorySnapshot) -> Result<()> {
        ensure_unique_users(&snapshot.users)?;
        let _commit = self.commits.everything();
        let user_count = snapshot.users.len();
        let groups = self.commit_groups(snapshot.groups)?;
        let users = self.store.replace_all_users(snapshot.users);
        self.handler.handle(&PermissionEvent::SetUsers { users });
        info!(
            node = %self.node_id(),
            users = user_count,
            groups = groups.len(),
            "directory reloaded from snapshot"
        );
        Ok(())
    }

    /// Drop expired records and memberships now. Returns how many entries
    /// were removed.
    pub fn prune_expired(&self) -> usize {
        self.prune_expired_at(Utc::now())
    }

    /// Drop entries expired at `now`; each changed entity is replicated as an update.
    pub fn prune_expired_at(&self, now: DateTime<Utc>) -> usize {
        let _commit = self.commits.everything();
        let outcome = self.store.prune_expired(now);
        for (before, after) in outcome.users {
            self.handler.handle(&PermissionEvent::UpdateUser {
                before: Some(before),
                after,
            });
        }
        for (before, after) in outcome.groups {
            self.handler.handle(&PermissionEvent::UpdateGroup {
                before: Some(before),
                after,
            });
        }
        outcome.removed
    }

    // ---- queries --------------------------------------------------------

    /// Resolve `query` for a user at the current time.
    pub fn resolve(&self, user_id: &Uuid, query: &str) -> Resolution {
        self.resolve_at(user_id, query, Utc::now())
    }

    /// Resolve `query` for a user at `now`. An unknown user resolves to `Absent`.
    pub fn resolve_at(&self, user_id: &Uuid, query: &str, now: DateTime<Utc>) -> Resolution {
        let resolution = match self.store.resolution_view(user_id) {
            Some(view) => {
                let resolution = self.resolver.resolve(&view.user, &view.groups, query, now);
                trace!(
                    user = view.user.name(),
                    permission = query,
                    decision = resolution.decision.as_str(),
                    "permission resolved"
                );
                resolution
            }
            None => {
                trace!(user_id = %user_id, permission = query, "unknown user resolved as absent");
                Resolution::absent()
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_resolution(resolution.decision);
        }
        resolution
    }

    /// Allow/deny answer, with `Absent` mapped through the configured policy.
    pub fn has_permission(&self, user_id: &Uuid, query: &str) -> bool {
        self.resolve(user_id, query).decision.allows(self.absent_policy)
    }

    /// All groups ordered by sort id, then name.
    pub fn list_groups(&self) -> Vec<Arc<PermissionGroup>> {
        self.store.list_groups()
    }

    /// All users ordered by name.
    pub fn list_users(&self) -> Vec<Arc<PermissionUser>> {
        self.store.list_users()
    }

    /// Lookup a user by id.
    pub fn user(&self, id: &Uuid) -> Option<Arc<PermissionUser>> {
        self.store.user(id)
    }

    /// Lookup a user by name.
    pub fn user_by_name(&self, name: &str) -> Option<Arc<PermissionUser>> {
        self.store.user_by_name(name)
    }

    /// Lookup a group by name.
    pub fn group(&self, name: &str) -> Option<Arc<PermissionGroup>> {
        self.store.group(name)
    }

    /// Current contents as a snapshot.
    pub fn snapshot(&self) -> DirectorySnapshot {
        self.store.snapshot()
    }
}

fn ensure_unique_users(users: &[PermissionUser]) -> Result<()> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for user in users {
        if !ids.insert(user.id) {
            return Err(DirectoryError::Validation(format!(
                "user {} appears more than once",
                user.id
            )));
        }
        if !names.insert(user.name()) {
            return Err(DirectoryError::Validation(format!(
                "user name {} appears more than once",
                user.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{EventKind, RecordingObserver};
    use crate::permission::Permission;
    use crate::replication::MessageKind;
    use crate::resolve::Decision;
    use chrono::Duration;

    fn directory() -> (PermissionDirectory, OutboundQueue, Arc<RecordingObserver>) {
        let (directory, queue) = PermissionDirectory::new(&AppConfig::default());
        let recorder = Arc::new(RecordingObserver::new());
        directory.observers().register(recorder.clone());
        (directory, queue, recorder)
    }

    fn wire_kinds(queue: &mut OutboundQueue) -> Vec<MessageKind> {
        let mut kinds = Vec::new();
        while let Ok(message) = queue.try_recv() {
            kinds.extend(MessageKind::parse(&message.message));
        }
        kinds
    }

    #[test]
    fn every_mutation_notifies_and_queues_in_order() {
        let (directory, mut queue, recorder) = directory();
        let user = directory.add_user(PermissionUser::new("alice")).unwrap();
        directory.add_group(PermissionGroup::new("vip", 5)).unwrap();
        directory
            .update_group(PermissionGroup::new("vip", 6))
            .unwrap();
        directory.delete_group("vip").unwrap();
        directory.delete_user(&user.id).unwrap();

        assert_eq!(
            recorder.kinds(),
            vec![
                EventKind::AddUser,
                EventKind::AddGroup,
                EventKind::UpdateGroup,
                EventKind::DeleteGroup,
                EventKind::DeleteUser,
            ]
        );
        assert_eq!(
            wire_kinds(&mut queue),
            vec![
                MessageKind::AddUser,
                MessageKind::AddGroup,
                MessageKind::UpdateGroup,
                MessageKind::DeleteGroup,
                MessageKind::DeleteUser,
            ]
        );
    }

    #[test]
    fn failed_mutations_emit_nothing() {
        let (directory, mut queue, recorder) = directory();
        directory.add_group(PermissionGroup::new("A", 0)).unwrap();
        recorder.clear();
        wire_kinds(&mut queue);

        assert!(directory
            .update_group(PermissionGroup::new("A", 0).with_parent("A"))
            .is_err());
        assert!(directory.delete_group("ghost").is_err());
        assert!(directory.delete_user(&Uuid::new_v4()).is_err());

        assert!(recorder.events().is_empty());
        assert!(wire_kinds(&mut queue).is_empty());
    }

    #[test]
    fn upsert_picks_add_or_update() {
        let (directory, mut queue, _) = directory();
        let mut user = PermissionUser::new("bob");
        directory.upsert_user(user.clone()).unwrap();
        user.add_membership("vip", None);
        directory.upsert_user(user.clone()).unwrap();
        directory.upsert_group(PermissionGroup::new("vip", 0)).unwrap();
        directory.upsert_group(PermissionGroup::new("vip", 1)).unwrap();

        assert_eq!(
            wire_kinds(&mut queue),
            vec![
                MessageKind::AddUser,
                MessageKind::UpdateUser,
                MessageKind::AddGroup,
                MessageKind::UpdateGroup,
            ]
        );
        assert_eq!(directory.user(&user.id).unwrap().memberships.len(), 1);
    }

    #[test]
    fn upsert_with_a_taken_name_changes_nothing() {
        let (directory, mut queue, recorder) = directory();
        directory.upsert_user(PermissionUser::new("bob")).unwrap();
        recorder.clear();
        wire_kinds(&mut queue);

        let err = directory
            .upsert_user(PermissionUser::new("bob"))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Validation(_)));
        assert!(directory
            .upsert_group(PermissionGroup::new("loop", 0).with_parent("loop"))
            .is_err());

        assert_eq!(directory.list_users().len(), 1);
        assert!(recorder.events().is_empty());
        assert!(wire_kinds(&mut queue).is_empty());
    }

    #[test]
    fn same_user_updates_are_emitted_in_commit_order() {
        let (directory, mut queue, recorder) = directory();
        let user = directory.add_user(PermissionUser::new("frank")).unwrap();
        recorder.clear();
        wire_kinds(&mut queue);

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let directory = &directory;
                let base = PermissionUser::clone(&user);
                scope.spawn(move || {
                    for n in 0..50 {
                        let mut next = base.clone();
                        next.base.potency = worker * 100 + n;
                        directory.update_user(next).unwrap();
                    }
                });
            }
        });

        let stored = directory.user(&user.id).unwrap();
        let events = recorder.events();
        assert_eq!(events.len(), 200);
        let mut previous = Arc::clone(&user);
        for (_, event) in &events {
            match event {
                PermissionEvent::UpdateUser {
                    before: Some(before),
                    after,
                } => {
                    assert!(Arc::ptr_eq(before, &previous), "event out of commit order");
                    previous = Arc::clone(after);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(Arc::ptr_eq(&previous, &stored));

        let mut last = None;
        while let Ok(message) = queue.try_recv() {
            last = Some(message);
        }
        let last = last.expect("updates were queued");
        let wired: PermissionUser = permdir_msg::PayloadCodec::Json
            .decode(&last.payload)
            .unwrap();
        assert_eq!(wired, *stored);
    }

    #[test]
    fn rename_is_replicated_as_delete_then_add() {
        let (directory, mut queue, _) = directory();
        directory.add_group(PermissionGroup::new("mod", 3)).unwrap();
        wire_kinds(&mut queue);

        let renamed = directory.rename_group("mod", "moderator").unwrap();
        assert_eq!(renamed.base.potency, 3);
        assert_eq!(
            wire_kinds(&mut queue),
            vec![MessageKind::DeleteGroup, MessageKind::AddGroup]
        );
    }

    #[test]
    fn reload_broadcasts_groups_but_not_users() {
        let (directory, mut queue, recorder) = directory();
        directory.add_group(PermissionGroup::new("old", 0)).unwrap();
        recorder.clear();
        wire_kinds(&mut queue);

        directory
            .reload_from_snapshot(DirectorySnapshot {
                users: vec![PermissionUser::new("carol")],
                groups: vec![PermissionGroup::new("new", 0).as_default()],
            })
            .unwrap();

        assert_eq!(wire_kinds(&mut queue), vec![MessageKind::SetGroups]);
        assert_eq!(
            recorder.kinds(),
            vec![EventKind::SetGroups, EventKind::SetUsers]
        );
        assert!(directory.group("old").is_none());
        assert!(directory.user_by_name("carol").is_some());

        directory.handle_reloaded();
        assert_eq!(wire_kinds(&mut queue), vec![MessageKind::SetGroups]);
        assert_eq!(recorder.kinds().len(), 2);
    }

    #[test]
    fn reload_with_duplicate_users_changes_nothing() {
        let (directory, _queue, _) = directory();
        directory.add_group(PermissionGroup::new("keep", 0)).unwrap();
        let result = directory.reload_from_snapshot(DirectorySnapshot {
            users: vec![PermissionUser::new("dup"), PermissionUser::new("dup")],
            groups: Vec::new(),
        });
        assert!(matches!(result, Err(DirectoryError::Validation(_))));
        assert!(directory.group("keep").is_some());
    }

    #[test]
    fn has_permission_applies_absent_policy() {
        let (directory, _queue, _) = directory();
        directory
            .add_group(
                PermissionGroup::new("default", 0)
                    .as_default()
                    .with_permission(Permission::grant("lobby.join").unwrap()),
            )
            .unwrap();
        let user = directory.add_user(PermissionUser::new("dave")).unwrap();

        assert!(directory.has_permission(&user.id, "lobby.join"));
        assert!(!directory.has_permission(&user.id, "lobby.leave"));

        let mut config = AppConfig::default();
        config.resolution.absent_policy = AbsentPolicy::Allow;
        let (lenient, _queue) = PermissionDirectory::with_store(&config, directory.store().clone());
        assert!(lenient.has_permission(&user.id, "lobby.leave"));

        let stranger = Uuid::new_v4();
        assert_eq!(
            directory.resolve(&stranger, "lobby.join").decision,
            Decision::Absent
        );
        assert!(!directory.has_permission(&stranger, "lobby.join"));
    }

    #[test]
    fn prune_replicates_changed_entities_and_resolution_falls_through() {
        let (directory, mut queue, _) = directory();
        let now = Utc::now();
        let soon = now + Duration::minutes(1);
        directory
            .add_group(
                PermissionGroup::new("default", 0)
                    .as_default()
                    .with_permission(Permission::deny("fly").unwrap()),
            )
            .unwrap();
        let mut user = PermissionUser::new("erin");
        user.base.potency = 1;
        user.base
            .add_permission(Permission::grant("fly").unwrap().expiring_at(soon));
        let user = directory.add_user(user).unwrap();
        wire_kinds(&mut queue);

        let later = soon + Duration::seconds(1);
        assert_eq!(
            directory.resolve_at(&user.id, "fly", now).decision,
            Decision::Granted
        );
        assert_eq!(
            directory.resolve_at(&user.id, "fly", later).decision,
            Decision::Denied
        );

        assert_eq!(directory.prune_expired_at(later), 1);
        assert_eq!(wire_kinds(&mut queue), vec![MessageKind::UpdateUser]);
        assert!(directory.user(&user.id).unwrap().base.permissions.is_empty());
        assert_eq!(directory.prune_expired_at(later), 0);
    }
}
