//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::str::FromStr;

use chrono::{Duration, Utc};
use permdir_common::AppConfig;
use permdir_core::{
    Decision, DirectoryError, DirectoryMetrics, DirectorySnapshot, Permission,
    PermissionDirectory, PermissionGroup, PermissionUser, RecordSource,
};
use prometheus::Registry;
use tempfile::tempdir;

fn counter(registry: &Registry, name: &str, label: Option<(&str, &str)>) -> u64 {
    registry
        .gather()
        .iter()
        .find(|family| family.get_name() == name)
        .map(|family| {
            family
                .get_metric()
                .iter()
                .filter(|metric| match label {
                    Some((key, value)) => metric
                        .get_label()
                        .iter()
                        .any(|pair| pair.get_name() == key && pair.get_value() == value),
                    None => true,
                })
                .map(|metric| metric.get_counter().get_value() as u64)
                .sum()
        })
        .unwrap_or(0)
}

#[test]
fn literal_deny_beats_wildcard_grant_across_groups() -> anyhow::Result<()> {
    let (directory, _queue) = PermissionDirectory::new(&AppConfig::default());
    directory.add_group(
        PermissionGroup::new("Default", 1)
            .as_default()
            .with_permission(Permission::grant("help.*")?),
    )?;
    directory.add_group(PermissionGroup::new("VIP", 5).with_permission(Permission::deny("help.kick")?))?;

    let mut user = PermissionUser::new("frank");
    user.add_membership("Default", None);
    user.add_membership("VIP", None);
    let user = directory.add_user(user)?;

    let kick = directory.resolve(&user.id, "help.kick");
    assert_eq!(kick.decision, Decision::Denied);
    assert_eq!(
        kick.winner.map(|w| w.source),
        Some(RecordSource::Group { name: "VIP".into() })
    );
    assert_eq!(directory.resolve(&user.id, "help.say").decision, Decision::Granted);
    Ok(())
}

#[test]
fn lower_sort_id_wins_between_equal_default_groups() -> anyhow::Result<()> {
    let (directory, _queue) = PermissionDirectory::new(&AppConfig::default());
    directory.add_group(
        PermissionGroup::new("first", 0)
            .as_default()
            .with_sort_id(1)
            .with_permission(Permission::grant("lobby.join")?),
    )?;
    directory.add_group(
        PermissionGroup::new("second", 0)
            .as_default()
            .with_sort_id(2)
            .with_permission(Permission::deny("lobby.join")?),
    )?;
    let user = directory.add_user(PermissionUser::new("gina"))?;

    assert_eq!(directory.resolve(&user.id, "lobby.join").decision, Decision::Granted);
    Ok(())
}

#[test]
fn expiry_moves_decision_without_a_delete() -> anyhow::Result<()> {
    let (directory, _queue) = PermissionDirectory::new(&AppConfig::default());
    let now = Utc::now();
    let deadline = now + Duration::minutes(10);

    let mut user = PermissionUser::new("hank");
    user.base
        .add_permission(Permission::grant("arena.enter")?.expiring_at(deadline));
    let user = directory.add_user(user)?;

    assert_eq!(
        directory.resolve_at(&user.id, "arena.enter", now).decision,
        Decision::Granted
    );
    assert_eq!(
        directory.resolve_at(&user.id, "arena.enter", deadline).decision,
        Decision::Absent
    );
    assert_eq!(directory.user(&user.id).unwrap().base.permissions.len(), 1);
    Ok(())
}

#[test]
fn cycle_rejection_keeps_hierarchy() -> anyhow::Result<()> {
    let (directory, _queue) = PermissionDirectory::new(&AppConfig::default());
    directory.add_group(PermissionGroup::new("A", 0))?;
    directory.add_group(PermissionGroup::new("B", 0).with_parent("A"))?;
    directory.add_group(PermissionGroup::new("C", 0).with_parent("B"))?;

    let err = directory
        .update_group(PermissionGroup::new("A", 0).with_parent("C"))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "group A would inherit from itself via A -> C -> B -> A"
    );
    assert!(directory.group("A").unwrap().parents.is_empty());

    let err = directory
        .add_group(PermissionGroup::new("D", 0).with_parent("D"))
        .unwrap_err();
    assert!(matches!(err, DirectoryError::Cycle { .. }));
    assert!(directory.group("D").is_none());
    Ok(())
}

#[test]
fn metrics_track_mutations_and_decisions() -> anyhow::Result<()> {
    let registry = Registry::new();
    let metrics = DirectoryMetrics::register(&registry)?;
    let (directory, _queue) = PermissionDirectory::new(&AppConfig::default());
    let directory = directory.with_metrics(metrics);

    directory.add_group(
        PermissionGroup::new("default", 0)
            .as_default()
            .with_permission(Permission::deny("chat.shout")?),
    )?;
    let user = directory.add_user(PermissionUser::new("ivy"))?;
    directory.resolve(&user.id, "chat.shout");
    directory.resolve(&user.id, "chat.whisper");

    assert_eq!(
        counter(&registry, "permdir_mutations_total", Some(("kind", "add_group"))),
        1
    );
    assert_eq!(
        counter(&registry, "permdir_resolutions_total", Some(("decision", "denied"))),
        1
    );
    assert_eq!(
        counter(&registry, "permdir_resolutions_total", Some(("decision", "absent"))),
        1
    );
    assert_eq!(counter(&registry, "permdir_replication_enqueued_total", None), 2);
    Ok(())
}

#[test]
fn open_seeds_from_configured_snapshot() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("directory.json");
    let mut alice = PermissionUser::new("alice");
    alice.add_membership("staff", None);
    DirectorySnapshot {
        users: vec![alice.clone()],
        groups: vec![PermissionGroup::new("staff", 10).with_permission(Permission::grant("*")?)],
    }
    .save(&path)?;

    let config = AppConfig::from_str(&format!(
        "[node]\nid = \"seeded\"\n\n[directory]\nsnapshot = {:?}\n",
        path.display().to_string()
    ))?;
    let (directory, _queue) = PermissionDirectory::open(&config)?;

    assert_eq!(directory.node_id(), "seeded");
    assert_eq!(directory.list_users().len(), 1);
    assert!(directory.has_permission(&alice.id, "anything.at.all"));

    let snapshot = directory.snapshot();
    assert_eq!(snapshot.groups[0].name(), "staff");
    Ok(())
}
