//! ---
//! permdir_section: "05-external-interfaces"
//! permdir_subsection: "binary"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Control CLI for administrators working with PermDir snapshots."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use permdir_common::{init_cli, AppConfig};
use permdir_core::{DirectorySnapshot, PermissionDirectory};

mod maintenance;
mod query;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "PermDir administrative control utility",
    long_about = None
)]
struct Cli {
    /// Configuration file; defaults are used when omitted.
    #[arg(long, value_name = "FILE", env = "PERMDIR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory snapshot to operate on (overrides `directory.snapshot`).
    #[arg(long, value_name = "FILE", global = true)]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve permissions for a user.
    Resolve(query::ResolveCommand),
    /// List groups in sort order.
    Groups(query::ListCommand),
    /// List users by name.
    Users(query::ListCommand),
    /// Check a snapshot for cycles, duplicates, and dangling references.
    Validate(maintenance::ValidateCommand),
    /// Drop expired records and memberships and write the snapshot back.
    Prune(maintenance::PruneCommand),
}

/// Snapshot location and configuration shared by every subcommand.
pub struct Workspace {
    config: AppConfig,
    snapshot: PathBuf,
}

impl Workspace {
    fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => AppConfig::from_path(path)?,
            None => AppConfig::default(),
        };
        // no bus is attached; mutations stay local to the file
        config.replication.enabled = false;

        let snapshot = cli
            .snapshot
            .clone()
            .or_else(|| config.directory.snapshot.clone())
            .ok_or_else(|| anyhow!("no snapshot given; pass --snapshot or set directory.snapshot"))?;
        Ok(Self { config, snapshot })
    }

    /// Snapshot path in use.
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot
    }

    /// Read the raw snapshot without validating it.
    pub fn read(&self) -> Result<DirectorySnapshot> {
        DirectorySnapshot::load(&self.snapshot)
            .with_context(|| format!("unable to load snapshot {}", self.snapshot.display()))
    }

    /// Load the snapshot into a directory, validating it on the way in.
    pub fn open(&self) -> Result<PermissionDirectory> {
        let mut config = self.config.clone();
        config.directory.snapshot = Some(self.snapshot.clone());
        let (directory, _queue) = PermissionDirectory::open(&config)
            .with_context(|| format!("unable to open snapshot {}", self.snapshot.display()))?;
        Ok(directory)
    }
}

fn main() -> Result<()> {
    init_cli();
    let cli = Cli::parse();
    let workspace = Workspace::from_cli(&cli)?;
    match cli.command {
        Commands::Resolve(cmd) => query::resolve(&workspace, cmd),
        Commands::Groups(cmd) => query::groups(&workspace, cmd),
        Commands::Users(cmd) => query::users(&workspace, cmd),
        Commands::Validate(cmd) => maintenance::validate(&workspace, cmd),
        Commands::Prune(cmd) => maintenance::prune(&workspace, cmd),
    }
}
