//! ---
//! permdir_section: "01-core-functionality"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Shared configuration and logging primitives."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter directive variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "PERMDIR_LOG";

// Dropping a guard stops its writer thread, so both live for the process.
static GUARDS: OnceCell<(WorkerGuard, Option<WorkerGuard>)> = OnceCell::new();

/// Console output style.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    StructuredJson,
    /// Human-oriented multi-field lines.
    Pretty,
}

/// `PERMDIR_LOG`, then `RUST_LOG`, then `fallback`.
fn env_filter(fallback: &str) -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("ignoring {LOG_ENV}={directive:?}: {err}");
            EnvFilter::new(fallback)
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
    }
}

/// Install the process-wide subscriber for a long-running directory node.
///
/// Console events go to stdout in the configured [`LogFormat`]. When
/// `config.file` is set a daily rolling JSON log named
/// `<prefix>-<service>.log` is also written under `config.directory`.
/// A subscriber that is already installed is left alone.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let (stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let console = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .with_current_span(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout)
            .boxed(),
    };

    let mut file_guard = None;
    let file = if config.file {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!("unable to create log directory {}", config.directory.display())
        })?;
        let prefix = config.file_prefix.as_deref().unwrap_or("permdir");
        let appender = rolling::daily(&config.directory, format!("{prefix}-{service_name}.log"));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        Some(
            fmt::layer()
                .json()
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_writer(writer)
                .boxed(),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(console)
        .with(file)
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set((stdout_guard, file_guard));
        tracing::info!(
            service = service_name,
            format = ?config.format,
            log_file = config.file,
            "tracing ready"
        );
    }
    Ok(())
}

/// Quiet stderr subscriber for one-shot tools; warnings and above by default.
pub fn init_cli() {
    let _ = tracing_subscriber::registry()
        .with(env_filter("warn"))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();
}
