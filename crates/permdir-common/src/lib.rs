//! ---
//! permdir_section: "01-core-functionality"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Shared configuration and logging primitives."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
//! Shared primitives for the PermDir workspace: configuration loading and
//! tracing initialisation consumed by the directory core and binaries.

pub mod config;
pub mod logging;

pub use config::{
    AbsentPolicy, AppConfig, DirectoryConfig, LoadedAppConfig, LoggingConfig, NodeConfig,
    ReplicationConfig, ResolutionConfig, TieBreak,
};
pub use logging::{init_cli, init_tracing, LogFormat};
