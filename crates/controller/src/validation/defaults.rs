//! Spec defaulting, applied before rendering and before validation of
//! downstream invariants.

use crate::crds::{ComponentKind, ObservabilityPlatformSpec};

/// Fill omitted fields with operator defaults. Idempotent.
pub fn apply_defaults(spec: &mut ObservabilityPlatformSpec) {
    for kind in ComponentKind::ALL {
        if let Some(component) = spec.components.get_mut(kind) {
            if component.replicas.is_none() {
                component.replicas = Some(1);
            }
            if component.retention.is_none() {
                component.retention = Some("30d".to_string());
            }
            if component.interval.is_none() {
                component.interval = Some("1m".to_string());
            }
        }
    }

    if let Some(gitops) = &mut spec.gitops {
        let repository = &mut gitops.repository;
        if repository.branch.is_none() && repository.tag.is_none() {
            repository.branch = Some("main".to_string());
        }
        if repository.polling_interval.is_none() {
            repository.polling_interval = Some("1m".to_string());
        }
        if let Some(drift) = &mut gitops.drift_detection {
            if drift.interval.is_none() {
                drift.interval = Some("5m".to_string());
            }
        }
        if let Some(rollback) = &mut gitops.rollback {
            if rollback.max_history.is_none() {
                rollback.max_history = Some(10);
            }
            if rollback.failure_threshold.is_none() {
                rollback.failure_threshold = Some(3);
            }
            if rollback.window.is_none() {
                rollback.window = Some("10m".to_string());
            }
        }
        // Promotion strategy defaults to manual through the schema default.
    }
}
