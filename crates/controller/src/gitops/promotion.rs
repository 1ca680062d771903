//! Promotion planner.
//!
//! Moves the effective revision of a platform from one environment to the
//! next in the declared ordering. Test status, gates and approvals are
//! pluggable interfaces; the planner itself never knows where they come
//! from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::delivery::{DeliveryAdapter, DeliveryHandle};
use super::rollback::RollbackManager;
use super::syncstate::PLATFORM_LABEL;
use crate::crds::{
    EnvironmentSpec, GateSpec, ObservabilityPlatform, PlatformPhase, PromotionSpec,
    PromotionStrategy,
};
use crate::error::{Error, Result};
use crate::store::StateStore;

pub const PROMOTION_RECORD_LABEL: &str = "observability.platform.io/promotion-record";

/// Annotation listing approving actors on the target platform.
pub const APPROVALS_ANNOTATION: &str = "observability.platform.io/approved-by";

/// How long a gated promotion waits for the target sync to complete.
const GATED_SYNC_TIMEOUT: Duration = Duration::from_secs(300);
const GATED_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Immutable audit entry for one promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionRecord {
    pub source_platform: String,
    pub target_environment: String,
    pub source_revision: String,
    pub target_revision: Option<String>,
    pub actor: String,
    pub timestamp: String,
    pub requirements_satisfied: bool,
    pub approvals: Vec<String>,
}

/// Pluggable test-status source for automatic promotion requirements.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TestStatusProvider: Send + Sync {
    async fn is_passing(&self, platform: &str, namespace: &str, test_name: &str) -> Result<bool>;
}

/// Pluggable post-sync gate evaluation for gated promotion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GateEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        platform: &str,
        namespace: &str,
        environment: &str,
        gate: &GateSpec,
    ) -> Result<bool>;
}

/// Pluggable approval source; shape intentionally abstract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApprovalSource: Send + Sync {
    async fn approvals(
        &self,
        platform: &str,
        namespace: &str,
        environment: &str,
    ) -> Result<Vec<String>>;
}

/// Approval source reading the annotation-backed list from the target
/// platform.
pub struct AnnotationApprovals {
    store: Arc<dyn StateStore>,
}

impl AnnotationApprovals {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ApprovalSource for AnnotationApprovals {
    async fn approvals(
        &self,
        platform: &str,
        namespace: &str,
        _environment: &str,
    ) -> Result<Vec<String>> {
        let Some(platform) = self.store.get_platform(platform, namespace).await? else {
            return Ok(Vec::new());
        };
        Ok(platform
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(APPROVALS_ANNOTATION))
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Resolve the platform an environment maps to. Default: same platform
/// name, environment name as namespace; `platformRef` overrides.
#[must_use]
pub fn environment_target_for(source_name: &str, env: &EnvironmentSpec) -> (String, String) {
    match &env.platform_ref {
        Some(reference) => (
            reference.name.clone(),
            reference
                .namespace
                .clone()
                .unwrap_or_else(|| env.name.clone()),
        ),
        None => (source_name.to_string(), env.name.clone()),
    }
}

pub struct PromotionPlanner {
    store: Arc<dyn StateStore>,
    tests: Arc<dyn TestStatusProvider>,
    gates: Arc<dyn GateEvaluator>,
    approvals: Arc<dyn ApprovalSource>,
}

impl PromotionPlanner {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        tests: Arc<dyn TestStatusProvider>,
        gates: Arc<dyn GateEvaluator>,
        approvals: Arc<dyn ApprovalSource>,
    ) -> Self {
        Self {
            store,
            tests,
            gates,
            approvals,
        }
    }

    /// Promote the source platform's current revision to the named
    /// environment.
    pub async fn promote(
        &self,
        source: &ObservabilityPlatform,
        environment: &str,
        actor: &str,
        adapter: &Arc<dyn DeliveryAdapter>,
        rollback: &RollbackManager,
    ) -> Result<PromotionRecord> {
        let promotion = source
            .spec
            .gitops
            .as_ref()
            .and_then(|g| g.promotion.as_ref())
            .ok_or_else(|| {
                Error::InvalidSpec("promotion requested but no promotion spec declared".to_string())
            })?;

        let index = promotion
            .environments
            .iter()
            .position(|e| e.name == environment)
            .ok_or_else(|| {
                Error::InvalidSpec(format!("'{environment}' is not a declared environment"))
            })?;
        let env = &promotion.environments[index];

        self.check_ordering(source, promotion, index).await?;

        let source_revision = self.source_revision(source, adapter).await?;
        let (target_name, target_namespace) = environment_target_for(&source.name_any(), env);
        let target_handle = DeliveryHandle {
            provider: adapter.provider(),
            name: target_name.clone(),
            namespace: target_namespace.clone(),
        };

        match promotion.strategy {
            PromotionStrategy::Manual => {
                // The adapter performs the sync; the planner never waits.
                adapter
                    .update_target_revision(&target_handle, &source_revision)
                    .await?;
                adapter.trigger(&target_handle).await?;
            }
            PromotionStrategy::Automatic => {
                self.check_requirements(&target_name, &target_namespace, env)
                    .await?;
                adapter
                    .update_target_revision(&target_handle, &source_revision)
                    .await?;
                adapter.trigger(&target_handle).await?;
            }
            PromotionStrategy::Gated => {
                self.check_requirements(&target_name, &target_namespace, env)
                    .await?;
                adapter
                    .update_target_revision(&target_handle, &source_revision)
                    .await?;
                adapter.trigger(&target_handle).await?;

                self.wait_for_sync(adapter, &target_handle, &source_revision)
                    .await?;

                if let Err(gate_error) = self
                    .check_gates(&target_name, &target_namespace, env)
                    .await
                {
                    warn!(
                        environment,
                        error = %gate_error,
                        "post-promotion gate failed, rolling back target"
                    );
                    if let Some(target) = self
                        .store
                        .get_platform(&target_name, &target_namespace)
                        .await?
                    {
                        rollback
                            .execute(&target, adapter, "post-promotion gate failure")
                            .await?;
                    }
                    let record = self
                        .build_record(source, env, &source_revision, actor, false)
                        .await;
                    self.persist_record(&target_namespace, &record).await?;
                    return Err(gate_error);
                }
            }
        }

        let record = self
            .build_record(source, env, &source_revision, actor, true)
            .await;
        self.persist_record(&target_namespace, &record).await?;
        info!(
            source = %record.source_platform,
            environment = %record.target_environment,
            revision = %record.source_revision,
            "promotion completed"
        );
        Ok(record)
    }

    /// Promotion must respect the declared environment order: every
    /// earlier environment, and every dependsOn target, must be Ready.
    async fn check_ordering(
        &self,
        source: &ObservabilityPlatform,
        promotion: &PromotionSpec,
        index: usize,
    ) -> Result<()> {
        let mut prerequisites: Vec<&EnvironmentSpec> =
            promotion.environments[..index].iter().collect();
        for dep in &promotion.environments[index].depends_on {
            if let Some(env) = promotion.environments.iter().find(|e| &e.name == dep) {
                prerequisites.push(env);
            }
        }

        for env in prerequisites {
            let (name, namespace) = environment_target_for(&source.name_any(), env);
            let ready = self
                .store
                .get_platform(&name, &namespace)
                .await?
                .and_then(|p| p.status)
                .is_some_and(|s| s.phase == PlatformPhase::Ready);
            if !ready {
                return Err(Error::RequirementsNotMet(format!(
                    "environment '{}' is not Ready",
                    env.name
                )));
            }
        }
        Ok(())
    }

    async fn check_requirements(
        &self,
        target: &str,
        namespace: &str,
        env: &EnvironmentSpec,
    ) -> Result<()> {
        for test_name in &env.requirements {
            if !self.tests.is_passing(target, namespace, test_name).await? {
                return Err(Error::RequirementsNotMet(format!(
                    "required test '{test_name}' is failing for environment '{}'",
                    env.name
                )));
            }
        }
        Ok(())
    }

    async fn check_gates(
        &self,
        target: &str,
        namespace: &str,
        env: &EnvironmentSpec,
    ) -> Result<()> {
        for gate in &env.gates {
            if !self
                .gates
                .evaluate(target, namespace, &env.name, gate)
                .await?
            {
                return Err(Error::RequirementsNotMet(format!(
                    "gate '{}' failed for environment '{}'",
                    gate.name, env.name
                )));
            }
        }
        Ok(())
    }

    async fn source_revision(
        &self,
        source: &ObservabilityPlatform,
        adapter: &Arc<dyn DeliveryAdapter>,
    ) -> Result<String> {
        if let Some(revision) = source
            .status
            .as_ref()
            .and_then(|s| s.gitops.as_ref())
            .and_then(|g| g.revision.clone())
        {
            return Ok(revision);
        }
        let handle = DeliveryHandle::for_platform(adapter.provider(), source);
        let state = adapter.status(&handle).await?;
        state.last_applied_revision.ok_or_else(|| {
            Error::RequirementsNotMet("source platform has no synced revision".to_string())
        })
    }

    async fn wait_for_sync(
        &self,
        adapter: &Arc<dyn DeliveryAdapter>,
        handle: &DeliveryHandle,
        revision: &str,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + GATED_SYNC_TIMEOUT;
        loop {
            let state = adapter.status(handle).await?;
            if state.ready && state.last_applied_revision.as_deref() == Some(revision) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Transient(format!(
                    "sync of revision {revision} did not complete within {}s",
                    GATED_SYNC_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(GATED_POLL_INTERVAL).await;
        }
    }

    async fn build_record(
        &self,
        source: &ObservabilityPlatform,
        env: &EnvironmentSpec,
        source_revision: &str,
        actor: &str,
        requirements_satisfied: bool,
    ) -> PromotionRecord {
        let (target_name, target_namespace) = environment_target_for(&source.name_any(), env);
        let approvals = self
            .approvals
            .approvals(&target_name, &target_namespace, &env.name)
            .await
            .unwrap_or_default();
        PromotionRecord {
            source_platform: source.name_any(),
            target_environment: env.name.clone(),
            source_revision: source_revision.to_string(),
            target_revision: Some(source_revision.to_string()),
            actor: actor.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            requirements_satisfied,
            approvals,
        }
    }

    async fn persist_record(&self, namespace: &str, record: &PromotionRecord) -> Result<()> {
        let name = format!(
            "promo-{}-{}",
            record.target_environment,
            Utc::now().timestamp()
        );
        let manifest = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": {
                    PROMOTION_RECORD_LABEL: "true",
                    PLATFORM_LABEL: record.source_platform,
                },
            },
            "data": { "record.json": serde_json::to_string(record)? },
        }))?;
        self.store.upsert_configmap(&manifest).await
    }
}
