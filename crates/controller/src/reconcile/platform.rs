//! The per-platform reconcile pass.
//!
//! Load, validate and default the spec, render the desired graph, apply it
//! with server-side apply, fold in the GitOps coordinator's outcome, probe
//! readiness and write status through the dedicated status path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::phase;
use super::status::{managed_resource, set_condition};
use super::Context;
use crate::config::parse_duration;
use crate::crds::{
    ComponentKind, ComponentPhase, ComponentStatus, ConditionType, ObservabilityPlatform,
    ObservabilityPlatformStatus, OperationDescriptor, PlatformPhase,
};
use crate::error::{Error, Result};
use crate::store::api_version_for_kind;
use crate::validation;

/// Create-or-update half of the finalizer split.
#[instrument(skip(ctx), fields(platform = %platform.name_any()))]
pub async fn apply_platform(
    platform: Arc<ObservabilityPlatform>,
    ctx: &Context,
) -> Result<Action> {
    let mut platform = (*platform).clone();
    let original_status = platform.status.clone().unwrap_or_default();
    validation::apply_defaults(&mut platform.spec);

    let mut status = original_status.clone();
    status.observed_generation = platform.metadata.generation;

    // Validation failures are terminal until the spec changes; the prior
    // good state is kept where the phase table forbids a drop to Failed.
    if let Err(validation_error) = validation::validate_platform(&platform) {
        warn!(error = %validation_error, "spec rejected");
        set_condition(
            &mut status,
            ConditionType::InvalidSpec,
            true,
            validation_error.reason(),
            &validation_error.to_string(),
        );
        set_condition(
            &mut status,
            ConditionType::Ready,
            false,
            validation_error.reason(),
            "spec validation failed",
        );
        status.phase = phase::transition(original_status.phase, PlatformPhase::Failed);
        status.message = Some(validation_error.to_string());

        let mut updated = platform.clone();
        updated.status = Some(status);
        ctx.store.update_platform_status(&updated).await?;
        ctx.store
            .record_event(
                &platform,
                true,
                validation_error.reason(),
                &validation_error.to_string(),
            )
            .await;
        return Ok(Action::await_change());
    }
    set_condition(
        &mut status,
        ConditionType::InvalidSpec,
        false,
        "Validated",
        "spec validated",
    );

    // Render the desired object graph and converge toward it.
    let desired = ctx.registry.render_platform(&platform)?;
    let mut resources = Vec::new();
    for object in &desired {
        let existed = ctx
            .store
            .get(&object.api_version, &object.kind, &object.name, &object.namespace)
            .await?
            .is_some();
        let applied = ctx.store.apply(&object.manifest).await?;
        resources.push(managed_resource(object, applied.metadata.uid.clone()));
        if !existed {
            ctx.store
                .record_event(&platform, false, "Created", &format!("created {}", object.key()))
                .await;
        }
    }

    // Children recorded earlier but no longer desired are removed, in
    // reverse dependency order.
    let desired_keys: BTreeSet<String> = desired.iter().map(|o| o.key()).collect();
    for stale in original_status
        .resources
        .iter()
        .rev()
        .filter(|r| !desired_keys.contains(&format!("{}/{}/{}", r.kind, r.namespace, r.name)))
    {
        info!(kind = %stale.kind, name = %stale.name, "deleting resource no longer in desired graph");
        ctx.store
            .delete(api_version_for_kind(&stale.kind), &stale.kind, &stale.name, &stale.namespace)
            .await?;
        ctx.store
            .record_event(
                &platform,
                false,
                "Deleted",
                &format!("deleted {}/{}", stale.kind, stale.name),
            )
            .await;
    }
    status.resources = resources;

    // GitOps coupling: delivery objects, drift, rollback.
    let mut rollback_failed = false;
    if let Some(outcome) = ctx.gitops.reconcile(&platform, &desired).await? {
        set_condition(
            &mut status,
            ConditionType::GitOpsSynced,
            outcome.status.sync_status.as_deref() == Some("Synced"),
            "SyncObserved",
            outcome
                .status
                .sync_status
                .as_deref()
                .unwrap_or("unknown"),
        );
        let drifted = outcome.status.drift.as_ref().is_some_and(|d| d.has_drift);
        set_condition(
            &mut status,
            ConditionType::DriftDetected,
            drifted,
            if drifted { "DriftFound" } else { "NoDrift" },
            outcome
                .status
                .drift
                .as_ref()
                .and_then(|d| d.summary.as_deref())
                .unwrap_or("no drift detected"),
        );
        let rolling_back = outcome
            .status
            .rollback
            .as_ref()
            .is_some_and(|r| r.in_progress);
        set_condition(
            &mut status,
            ConditionType::RollbackInProgress,
            rolling_back,
            if rolling_back { "RollingBack" } else { "Idle" },
            outcome
                .status
                .rollback
                .as_ref()
                .and_then(|r| r.reason.as_deref())
                .unwrap_or("no rollback in progress"),
        );
        rollback_failed = outcome.rollback_failed;
        status.gitops = Some(outcome.status);
    }

    // Probe readiness and settle the phase.
    status.component_statuses = probe_components(&platform, ctx).await?;
    let aggregate = phase::aggregate(&status.component_statuses);
    let upgrade_pending = upgrade_in_flight(&platform, &original_status);

    let desired_phase = if rollback_failed {
        PlatformPhase::Failed
    } else if aggregate == PlatformPhase::Ready {
        PlatformPhase::Ready
    } else if upgrade_pending {
        PlatformPhase::Upgrading
    } else {
        aggregate
    };
    let next_phase = phase::transition(original_status.phase, desired_phase);

    if next_phase == PlatformPhase::Upgrading && original_status.phase != PlatformPhase::Upgrading {
        status.current_operation = Some(OperationDescriptor {
            operation: "Upgrade".to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            description: Some("component version change rolling out".to_string()),
        });
    }

    set_condition(
        &mut status,
        ConditionType::Ready,
        next_phase == PlatformPhase::Ready,
        &next_phase.to_string(),
        &format!("platform is {next_phase}"),
    );
    set_condition(
        &mut status,
        ConditionType::Progressing,
        matches!(
            next_phase,
            PlatformPhase::Pending | PlatformPhase::Installing | PlatformPhase::Upgrading
        ),
        &next_phase.to_string(),
        "reconciliation progressing",
    );

    if next_phase == PlatformPhase::Ready {
        status.current_operation = None;
    }
    status.phase = next_phase;
    status.message = Some(format!("platform is {next_phase}"));

    let mut updated = platform.clone();
    updated.status = Some(status);
    ctx.store.update_platform_status(&updated).await?;

    if next_phase == PlatformPhase::Ready {
        // The now-synced revision becomes a rollback target.
        if let Err(e) = ctx.gitops.note_platform_ready(&updated).await {
            warn!(error = %e, "failed to mark revision known-good");
        }
    }

    debug!(phase = %next_phase, "reconcile pass finished");
    Ok(requeue_decision(&platform))
}

/// Per-component readiness from the workload's observed replica counts.
async fn probe_components(
    platform: &ObservabilityPlatform,
    ctx: &Context,
) -> Result<BTreeMap<String, ComponentStatus>> {
    let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
    let mut statuses = BTreeMap::new();

    for (kind, component) in platform.spec.components.iter() {
        if !component.enabled {
            continue;
        }
        let workload_kind = workload_kind_for(kind);
        let name = format!("{}-{}", platform.name_any(), kind);
        let desired_replicas = component.replicas.unwrap_or(1);

        let actual = ctx
            .store
            .get("apps/v1", workload_kind, &name, &namespace)
            .await?;

        let mut component_status = ComponentStatus {
            desired_replicas,
            ..ComponentStatus::default()
        };

        match actual {
            None => {
                component_status.phase = ComponentPhase::Installing;
                component_status.message = Some("workload not yet created".to_string());
            }
            Some(workload) => {
                let value = serde_json::to_value(&workload)?;
                let ready = value["status"]["readyReplicas"].as_i64().unwrap_or(0);
                component_status.ready_replicas = i32::try_from(ready).unwrap_or(0);

                let replica_failure = value["status"]["conditions"]
                    .as_array()
                    .map(|conditions| {
                        conditions.iter().any(|c| {
                            c["type"].as_str() == Some("ReplicaFailure")
                                && c["status"].as_str() == Some("True")
                        })
                    })
                    .unwrap_or(false);

                if replica_failure {
                    component_status.phase = ComponentPhase::Failed;
                    component_status.message = Some("workload reports replica failure".to_string());
                } else if component_status.ready_replicas >= desired_replicas {
                    component_status.phase = ComponentPhase::Ready;
                    component_status.version = Some(component.version.clone());
                } else if component_status.ready_replicas > 0 {
                    component_status.phase = ComponentPhase::Degraded;
                    component_status.message = Some(format!(
                        "{}/{desired_replicas} replicas ready",
                        component_status.ready_replicas
                    ));
                } else {
                    component_status.phase = ComponentPhase::Installing;
                }
            }
        }

        statuses.insert(kind.to_string(), component_status);
    }

    Ok(statuses)
}

fn workload_kind_for(kind: ComponentKind) -> &'static str {
    match kind {
        ComponentKind::Metrics | ComponentKind::Logs => "StatefulSet",
        ComponentKind::Dashboards | ComponentKind::Traces => "Deployment",
    }
}

/// A version change against the last observed Ready versions.
fn upgrade_in_flight(
    platform: &ObservabilityPlatform,
    original: &ObservabilityPlatformStatus,
) -> bool {
    if original.phase != PlatformPhase::Ready && original.phase != PlatformPhase::Upgrading {
        return false;
    }
    platform.spec.components.iter().any(|(kind, component)| {
        component.enabled
            && original
                .component_statuses
                .get(kind.as_str())
                .and_then(|s| s.version.as_deref())
                .is_some_and(|observed| observed != component.version)
    })
}

/// Requeue policy: drift interval when drift detection is on, else the
/// slowest declared component poll interval, else watch-driven only.
pub(super) fn requeue_decision(platform: &ObservabilityPlatform) -> Action {
    if let Some(interval) = platform
        .spec
        .gitops
        .as_ref()
        .filter(|g| g.enabled)
        .and_then(|g| g.drift_detection.as_ref())
        .filter(|d| d.enabled)
        .and_then(|d| d.interval.as_deref())
        .and_then(parse_duration)
    {
        return Action::requeue(interval);
    }

    let slowest: Option<Duration> = platform
        .spec
        .components
        .iter()
        .filter(|(_, c)| c.enabled)
        .filter_map(|(_, c)| c.interval.as_deref().and_then(parse_duration))
        .max();
    match slowest {
        Some(interval) => Action::requeue(interval),
        None => Action::await_change(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ComponentSpec, ComponentsSpec, DriftDetectionSpec, GitOpsSpec, GitRepositorySpec, ObservabilityPlatformSpec};

    fn platform(drift_interval: Option<&str>, component_interval: Option<&str>) -> ObservabilityPlatform {
        ObservabilityPlatform::new(
            "demo",
            ObservabilityPlatformSpec {
                components: ComponentsSpec {
                    metrics: Some(ComponentSpec {
                        enabled: true,
                        version: "v2.48.0".to_string(),
                        interval: component_interval.map(ToString::to_string),
                        ..ComponentSpec::default()
                    }),
                    ..ComponentsSpec::default()
                },
                gitops: drift_interval.map(|interval| GitOpsSpec {
                    enabled: true,
                    repository: GitRepositorySpec {
                        url: "https://github.com/acme/config".to_string(),
                        ..GitRepositorySpec::default()
                    },
                    drift_detection: Some(DriftDetectionSpec {
                        enabled: true,
                        interval: Some(interval.to_string()),
                        ..DriftDetectionSpec::default()
                    }),
                    ..GitOpsSpec::default()
                }),
                ..ObservabilityPlatformSpec::default()
            },
        )
    }

    #[test]
    fn drift_interval_wins_the_requeue_decision() {
        let action = requeue_decision(&platform(Some("5m"), Some("1m")));
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    }

    #[test]
    fn slowest_component_interval_is_used_without_drift() {
        let mut p = platform(None, Some("2m"));
        p.spec.components.dashboards = Some(ComponentSpec {
            enabled: true,
            version: "10.2.0".to_string(),
            interval: Some("30s".to_string()),
            ..ComponentSpec::default()
        });
        assert_eq!(requeue_decision(&p), Action::requeue(Duration::from_secs(120)));
    }

    #[test]
    fn no_intervals_means_watch_driven() {
        assert_eq!(requeue_decision(&platform(None, None)), Action::await_change());
    }

    #[test]
    fn upgrade_detection_compares_observed_versions() {
        let p = platform(None, None);
        let mut original = ObservabilityPlatformStatus {
            phase: PlatformPhase::Ready,
            ..ObservabilityPlatformStatus::default()
        };
        original.component_statuses.insert(
            "metrics".to_string(),
            ComponentStatus {
                phase: ComponentPhase::Ready,
                version: Some("v2.47.0".to_string()),
                ..ComponentStatus::default()
            },
        );
        assert!(upgrade_in_flight(&p, &original));

        original
            .component_statuses
            .get_mut("metrics")
            .unwrap()
            .version = Some("v2.48.0".to_string());
        assert!(!upgrade_in_flight(&p, &original));

        // Never from a non-Ready phase.
        original.phase = PlatformPhase::Installing;
        original
            .component_statuses
            .get_mut("metrics")
            .unwrap()
            .version = Some("v2.47.0".to_string());
        assert!(!upgrade_in_flight(&p, &original));
    }
}
