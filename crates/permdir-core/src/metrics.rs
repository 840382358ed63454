//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::observer::EventKind;
use crate::resolve::Decision;

/// Prometheus handles for directory activity.
#[derive(Clone)]
pub struct DirectoryMetrics {
    resolutions: IntCounterVec,
    mutations: IntCounterVec,
    applied: IntCounterVec,
    enqueued: IntCounter,
    failed: IntCounter,
    rejected: IntCounter,
}

impl DirectoryMetrics {
    /// Register directory metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let resolutions = IntCounterVec::new(
            Opts::new(
                "permdir_resolutions_total",
                "Permission queries answered, by decision",
            ),
            &["decision"],
        )?;
        let mutations = IntCounterVec::new(
            Opts::new(
                "permdir_mutations_total",
                "Committed directory mutations, by kind",
            ),
            &["kind"],
        )?;
        let applied = IntCounterVec::new(
            Opts::new(
                "permdir_replication_applied_total",
                "Replication messages applied from other nodes, by kind",
            ),
            &["kind"],
        )?;
        let enqueued = IntCounter::with_opts(Opts::new(
            "permdir_replication_enqueued_total",
            "Replication messages queued for broadcast",
        ))?;
        let failed = IntCounter::with_opts(Opts::new(
            "permdir_replication_failed_total",
            "Replication messages that could not be encoded, queued, or sent",
        ))?;
        let rejected = IntCounter::with_opts(Opts::new(
            "permdir_replication_rejected_total",
            "Incoming replication messages that failed to decode or validate",
        ))?;

        registry.register(Box::new(resolutions.clone()))?;
        registry.register(Box::new(mutations.clone()))?;
        registry.register(Box::new(applied.clone()))?;
        registry.register(Box::new(enqueued.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(rejected.clone()))?;

        Ok(Self {
            resolutions,
            mutations,
            applied,
            enqueued,
            failed,
            rejected,
        })
    }

    pub(crate) fn observe_resolution(&self, decision: Decision) {
        self.resolutions
            .with_label_values(&[decision.as_str()])
            .inc();
    }

    pub(crate) fn observe_mutation(&self, kind: EventKind) {
        self.mutations.with_label_values(&[kind.as_str()]).inc();
    }

    pub(crate) fn observe_applied(&self, kind: EventKind) {
        self.applied.with_label_values(&[kind.as_str()]).inc();
    }

    pub(crate) fn observe_enqueued(&self) {
        self.enqueued.inc();
    }

    pub(crate) fn observe_failed(&self) {
        self.failed.inc();
    }

    pub(crate) fn observe_rejected(&self) {
        self.rejected.inc();
    }
}

impl std::fmt::Debug for DirectoryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exported_under_their_names() {
        let registry = Registry::new();
        let metrics = DirectoryMetrics::register(&registry).unwrap();
        metrics.observe_resolution(Decision::Denied);
        metrics.observe_mutation(EventKind::AddGroup);
        metrics.observe_enqueued();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"permdir_resolutions_total".to_owned()));
        assert!(names.contains(&"permdir_mutations_total".to_owned()));
        assert!(names.contains(&"permdir_replication_enqueued_total".to_owned()));
        assert!(DirectoryMetrics::register(&registry).is_err());
    }
}
