//! ---
//! permdir_section: "05-external-interfaces"
//! permdir_subsection: "binary"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Control CLI for administrators working with PermDir snapshots."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use permdir_core::DirectorySnapshot;
use tracing::info;

use crate::Workspace;

#[derive(Debug, Args)]
pub struct ValidateCommand {
    /// Treat dangling group references as errors.
    #[arg(long)]
    strict: bool,
}

#[derive(Debug, Args)]
pub struct PruneCommand {
    /// Report what would be removed without writing the snapshot.
    #[arg(long)]
    dry_run: bool,

    /// Prune as of this RFC 3339 instant instead of now.
    #[arg(long, value_name = "TIME")]
    at: Option<DateTime<Utc>>,
}

pub fn validate(workspace: &Workspace, cmd: ValidateCommand) -> Result<()> {
    let snapshot = workspace.read()?;
    let dangling = dangling_references(&snapshot);
    let directory = workspace.open()?;

    for reference in &dangling {
        eprintln!("warning: {reference}");
    }
    if directory.store().default_groups().is_empty() {
        eprintln!("warning: no default group; users without memberships resolve nothing");
    }
    if cmd.strict && !dangling.is_empty() {
        return Err(anyhow!(
            "{} dangling group reference(s) in {}",
            dangling.len(),
            workspace.snapshot_path().display()
        ));
    }

    let (users, groups) = directory.store().len();
    println!(
        "{}: ok ({users} users, {groups} groups)",
        workspace.snapshot_path().display()
    );
    Ok(())
}

pub fn prune(workspace: &Workspace, cmd: PruneCommand) -> Result<()> {
    let directory = workspace.open()?;
    let at = cmd.at.unwrap_or_else(Utc::now);
    let removed = directory.prune_expired_at(at);

    if removed == 0 {
        println!("nothing expired");
        return Ok(());
    }
    if cmd.dry_run {
        println!("{removed} expired entries would be removed");
        return Ok(());
    }

    let path = workspace.snapshot_path();
    directory
        .snapshot()
        .save(path)
        .with_context(|| format!("unable to write snapshot {}", path.display()))?;
    info!(path = %path.display(), removed, "snapshot pruned");
    println!("{removed} expired entries removed");
    Ok(())
}

/// Parents, memberships, and scoped keys naming groups the snapshot lacks.
fn dangling_references(snapshot: &DirectorySnapshot) -> Vec<String> {
    let known: BTreeSet<&str> = snapshot.groups.iter().map(|g| g.name()).collect();
    let mut dangling = Vec::new();

    for group in &snapshot.groups {
        for parent in &group.parents {
            if !known.contains(parent.as_str()) {
                dangling.push(format!(
                    "group {} inherits from unknown group {parent}",
                    group.name()
                ));
            }
        }
        for scope in group.base.scoped_permissions.keys() {
            if !known.contains(scope.as_str()) {
                dangling.push(format!(
                    "group {} scopes records to unknown group {scope}",
                    group.name()
                ));
            }
        }
    }
    for user in &snapshot.users {
        for membership in &user.memberships {
            if !known.contains(membership.group.as_str()) {
                dangling.push(format!(
                    "user {} is a member of unknown group {}",
                    user.name(),
                    membership.group
                ));
            }
        }
        for scope in user.base.scoped_permissions.keys() {
            if !known.contains(scope.as_str()) {
                dangling.push(format!(
                    "user {} scopes records to unknown group {scope}",
                    user.name()
                ));
            }
        }
    }
    dangling
}
