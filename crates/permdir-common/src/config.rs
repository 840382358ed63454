//! ---
//! permdir_section: "01-core-functionality"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Shared configuration and logging primitives."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use permdir_msg::PayloadCodec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogFormat;

/// Primary configuration object for a directory node.
///
/// Every section may be omitted; an empty document is a valid single-node
/// setup with replication on and JSON payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Cluster identity.
    pub node: NodeConfig,
    /// Tracing sinks.
    pub logging: LoggingConfig,
    /// Mutation broadcast.
    pub replication: ReplicationConfig,
    /// Resolution ordering and absent handling.
    pub resolution: ResolutionConfig,
    /// Startup seeding.
    pub directory: DirectoryConfig,
}

/// An [`AppConfig`] together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    /// Parsed and validated configuration.
    pub config: AppConfig,
    /// File that was read.
    pub source: PathBuf,
}

impl AppConfig {
    /// Variable naming a config file that takes precedence over any candidate.
    pub const ENV_CONFIG_PATH: &str = "PERMDIR_CONFIG";

    /// Load configuration from disk, respecting the `PERMDIR_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Like [`AppConfig::load`] but also reports which file was used.
    ///
    /// A non-blank `PERMDIR_CONFIG` is read unconditionally; otherwise the
    /// first candidate that exists wins.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        let source = std::env::var(Self::ENV_CONFIG_PATH)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                candidates
                    .iter()
                    .map(|candidate| candidate.as_ref())
                    .find(|candidate| candidate.exists())
                    .map(Path::to_path_buf)
            });

        let Some(source) = source else {
            let inspected: Vec<String> = candidates
                .iter()
                .map(|candidate| candidate.as_ref().display().to_string())
                .collect();
            bail!("no configuration file found (looked at: {})", inspected.join(", "));
        };
        let config = Self::from_path(&source)?;
        Ok(LoadedAppConfig { config, source })
    }

    /// Read, parse, and validate one TOML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "reading configuration");
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        text.parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Reject values that parse but cannot drive a node.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.node.id.trim().is_empty(), "node.id must not be empty");
        self.replication.validate()?;
        self.resolution.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text).context("malformed configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity of this node inside the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name stamped on outgoing messages; must be unique per cluster.
    pub id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node-1".to_owned(),
        }
    }
}

/// Where and how tracing output is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write a daily rolling JSON file.
    pub file: bool,
    /// Directory for the rolling file.
    pub directory: PathBuf,
    /// File name prefix; `permdir` when unset.
    pub file_prefix: Option<String>,
    /// Console format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: false,
            directory: PathBuf::from("target/logs"),
            file_prefix: None,
            format: LogFormat::default(),
        }
    }
}

/// Settings for broadcasting directory mutations to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Whether local mutations are queued for the bus at all.
    pub enabled: bool,
    /// Bus channel carrying `permissions_*` messages.
    pub channel: String,
    /// Payload encoding shared by every node on the channel.
    pub codec: PayloadCodec,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: "permdir_internal".to_owned(),
            codec: PayloadCodec::default(),
        }
    }
}

impl ReplicationConfig {
    /// The channel name must be non-blank.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.channel.trim().is_empty(),
            "replication.channel must not be empty"
        );
        Ok(())
    }
}

/// Tie-break applied after specificity when two matching records compete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Higher potency of the owning user/group wins.
    SourcePotency,
    /// Between two group-sourced records, the lower sort id wins.
    SortId,
    /// The record whose owner was created most recently wins.
    CreatedAt,
}

/// How callers interpret a query that no record matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsentPolicy {
    /// Nothing matched, so the permission is not held.
    #[default]
    Deny,
    /// Nothing matched, so the permission is held.
    Allow,
}

impl AbsentPolicy {
    /// Whether an absent decision counts as granted.
    pub fn allows(&self) -> bool {
        matches!(self, AbsentPolicy::Allow)
    }
}

/// Ordering applied once specificity ties, and the meaning of no match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Consulted in order; an empty list leaves ties to discovery order.
    pub tie_breaks: Vec<TieBreak>,
    /// How [`AbsentPolicy::allows`] answers boolean checks.
    pub absent_policy: AbsentPolicy,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            tie_breaks: vec![TieBreak::SourcePotency, TieBreak::SortId, TieBreak::CreatedAt],
            absent_policy: AbsentPolicy::default(),
        }
    }
}

impl ResolutionConfig {
    /// Each tie-break may appear once.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        if let Some(repeated) = self.tie_breaks.iter().find(|t| !seen.insert(**t)) {
            bail!("resolution.tie_breaks lists {repeated:?} more than once");
        }
        Ok(())
    }
}

/// Where the directory is seeded from at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// JSON or `.cbor` snapshot loaded by `PermissionDirectory::open`.
    pub snapshot: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn empty_document_uses_defaults() {
        let config = AppConfig::from_str("").expect("defaults are valid");
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.replication.channel, "permdir_internal");
        assert_eq!(config.replication.codec, PayloadCodec::Json);
        assert_eq!(
            config.resolution.tie_breaks,
            ResolutionConfig::default().tie_breaks
        );
        assert!(!config.logging.file);
        assert_eq!(config.resolution.absent_policy, AbsentPolicy::Deny);
        assert!(config.directory.snapshot.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config = AppConfig::from_str(
            r#"
            [node]
            id = "lobby-2"

            [logging]
            format = "pretty"
            file = true

            [replication]
            channel = "perms"
            codec = "cbor"

            [resolution]
            tie_breaks = ["sort_id", "source_potency"]
            absent_policy = "allow"

            [directory]
            snapshot = "data/directory.json"
            "#,
        )
        .expect("valid config");
        assert_eq!(config.node.id, "lobby-2");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.logging.file);
        assert_eq!(config.replication.codec, PayloadCodec::Cbor);
        assert_eq!(
            config.resolution.tie_breaks,
            vec![TieBreak::SortId, TieBreak::SourcePotency]
        );
        assert!(config.resolution.absent_policy.allows());
        assert_eq!(
            config.directory.snapshot.as_deref(),
            Some(Path::new("data/directory.json"))
        );
    }

    #[test]
    fn duplicate_tie_breaks_are_rejected() {
        let err = AppConfig::from_str(
            r#"
            [resolution]
            tie_breaks = ["sort_id", "sort_id"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn empty_channel_is_rejected() {
        assert!(AppConfig::from_str("[replication]\nchannel = \" \"\n").is_err());
        assert!(AppConfig::from_str("[node]\nid = \"\"\n").is_err());
    }

    #[test]
    fn load_picks_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("node.toml");
        fs::write(&present, "[node]\nid = \"edge\"\n").unwrap();

        let loaded = AppConfig::load_with_source(&[missing, present.clone()]).unwrap();
        assert_eq!(loaded.source, present);
        assert_eq!(loaded.config.node.id, "edge");
    }
}
