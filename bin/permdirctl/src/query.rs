//! ---
//! permdir_section: "05-external-interfaces"
//! permdir_subsection: "binary"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Control CLI for administrators working with PermDir snapshots."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use permdir_core::{PermissionDirectory, PermissionUser, RecordSource, Resolution};
use serde::Serialize;
use uuid::Uuid;

use crate::Workspace;

#[derive(Debug, Args)]
pub struct ResolveCommand {
    /// User name or id.
    #[arg(long, short = 'u', value_name = "USER")]
    user: String,

    /// Permissions to resolve.
    #[arg(value_name = "PERMISSION", required = true, num_args = 1..)]
    permissions: Vec<String>,

    /// Evaluate at this RFC 3339 instant instead of now.
    #[arg(long, value_name = "TIME")]
    at: Option<DateTime<Utc>>,

    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ListCommand {
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ResolveRow<'a> {
    permission: &'a str,
    #[serde(flatten)]
    resolution: Resolution,
}

pub fn resolve(workspace: &Workspace, cmd: ResolveCommand) -> Result<()> {
    let directory = workspace.open()?;
    let user = find_user(&directory, &cmd.user)?;
    let at = cmd.at.unwrap_or_else(Utc::now);

    let rows: Vec<ResolveRow<'_>> = cmd
        .permissions
        .iter()
        .map(|permission| ResolveRow {
            permission,
            resolution: directory.resolve_at(&user.id, permission, at),
        })
        .collect();

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in rows {
        let source = row
            .resolution
            .winner
            .as_ref()
            .map(|winner| {
                format!(
                    "{} ({})",
                    winner.permission.name,
                    describe_source(&winner.source)
                )
            })
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "{:<32} {:<8} {}",
            row.permission,
            row.resolution.decision.as_str(),
            source
        );
    }
    Ok(())
}

pub fn groups(workspace: &Workspace, cmd: ListCommand) -> Result<()> {
    let directory = workspace.open()?;
    let groups = directory.list_groups();
    if cmd.json {
        let groups: Vec<_> = groups.iter().map(Arc::as_ref).collect();
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }
    for group in groups {
        let parents: Vec<&str> = group.parents.iter().map(String::as_str).collect();
        println!(
            "{:<24} potency={:<5} sort={:<5} default={:<5} records={:<4} parents=[{}]",
            group.name(),
            group.base.potency,
            group.sort_id,
            group.default_group,
            group.base.permissions.len(),
            parents.join(", ")
        );
    }
    Ok(())
}

pub fn users(workspace: &Workspace, cmd: ListCommand) -> Result<()> {
    let directory = workspace.open()?;
    let users = directory.list_users();
    if cmd.json {
        let users: Vec<_> = users.iter().map(Arc::as_ref).collect();
        println!("{}", serde_json::to_string_pretty(&users)?);
        return Ok(());
    }
    let now = Utc::now();
    for user in users {
        let groups: Vec<&str> = user
            .live_memberships(now)
            .map(|m| m.group.as_str())
            .collect();
        println!(
            "{:<24} {} records={:<4} groups=[{}]",
            user.name(),
            user.id,
            user.base.permissions.len(),
            groups.join(", ")
        );
    }
    Ok(())
}

fn find_user(directory: &PermissionDirectory, key: &str) -> Result<Arc<PermissionUser>> {
    let found = match Uuid::parse_str(key) {
        Ok(id) => directory.user(&id),
        Err(_) => directory.user_by_name(key),
    };
    found.ok_or_else(|| anyhow!("user {key} not found"))
}

fn describe_source(source: &RecordSource) -> String {
    match source {
        RecordSource::User { name } => format!("user {name}"),
        RecordSource::Group { name } => format!("group {name}"),
        RecordSource::Scoped { owner, group } => format!("{owner} scoped to {group}"),
    }
}
