//! Promotion planner and rollback manager tests over scripted doubles.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{InMemoryStore, StubAdapter};
use controller::crds::{
    EnvironmentSpec, GateSpec, GitOpsProvider, GitOpsSpec, GitOpsStatus, GitRepositorySpec,
    ObservabilityPlatform, ObservabilityPlatformSpec, ObservabilityPlatformStatus, PlatformPhase,
    PromotionSpec, PromotionStrategy,
};
use controller::error::{Error, Result};
use controller::gitops::delivery::{DeliveryAdapter, DeliveryState};
use controller::gitops::promotion::{
    ApprovalSource, GateEvaluator, PromotionPlanner, TestStatusProvider,
};
use controller::gitops::rollback::RollbackManager;
use controller::gitops::syncstate::{SyncRecord, SyncStateStore, SyncStatus};
use controller::store::StateStore;

struct StaticTests(HashMap<String, bool>);

#[async_trait]
impl TestStatusProvider for StaticTests {
    async fn is_passing(&self, _platform: &str, _namespace: &str, test_name: &str) -> Result<bool> {
        Ok(*self.0.get(test_name).unwrap_or(&false))
    }
}

struct StaticGates(bool);

#[async_trait]
impl GateEvaluator for StaticGates {
    async fn evaluate(
        &self,
        _platform: &str,
        _namespace: &str,
        _environment: &str,
        _gate: &GateSpec,
    ) -> Result<bool> {
        Ok(self.0)
    }
}

struct StaticApprovals(Vec<String>);

#[async_trait]
impl ApprovalSource for StaticApprovals {
    async fn approvals(
        &self,
        _platform: &str,
        _namespace: &str,
        _environment: &str,
    ) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

fn source_platform(
    strategy: PromotionStrategy,
    environments: Vec<EnvironmentSpec>,
) -> ObservabilityPlatform {
    let mut platform = ObservabilityPlatform::new(
        "demo",
        ObservabilityPlatformSpec {
            gitops: Some(GitOpsSpec {
                enabled: true,
                provider: GitOpsProvider::Argocd,
                repository: GitRepositorySpec {
                    url: "https://github.com/acme/config".to_string(),
                    branch: Some("main".to_string()),
                    ..GitRepositorySpec::default()
                },
                promotion: Some(PromotionSpec {
                    strategy,
                    environments,
                    tag_pattern: None,
                }),
                ..GitOpsSpec::default()
            }),
            ..ObservabilityPlatformSpec::default()
        },
    );
    platform.metadata.namespace = Some("dev".to_string());
    platform.status = Some(ObservabilityPlatformStatus {
        phase: PlatformPhase::Ready,
        gitops: Some(GitOpsStatus {
            revision: Some("newrev".to_string()),
            ..GitOpsStatus::default()
        }),
        ..ObservabilityPlatformStatus::default()
    });
    platform
}

fn env(name: &str) -> EnvironmentSpec {
    EnvironmentSpec {
        name: name.to_string(),
        ..EnvironmentSpec::default()
    }
}

fn ready_platform(name: &str, namespace: &str) -> ObservabilityPlatform {
    let mut platform =
        ObservabilityPlatform::new(name, ObservabilityPlatformSpec::default());
    platform.metadata.namespace = Some(namespace.to_string());
    platform.status = Some(ObservabilityPlatformStatus {
        phase: PlatformPhase::Ready,
        ..ObservabilityPlatformStatus::default()
    });
    platform
}

fn planner(
    store: Arc<InMemoryStore>,
    tests: StaticTests,
    gates: StaticGates,
) -> (PromotionPlanner, RollbackManager) {
    let planner = PromotionPlanner::new(
        store.clone(),
        Arc::new(tests),
        Arc::new(gates),
        Arc::new(StaticApprovals(vec!["jan".to_string()])),
    );
    let rollback = RollbackManager::new(Arc::new(SyncStateStore::new(store)));
    (planner, rollback)
}

fn adapter(ready: bool) -> Arc<StubAdapter> {
    Arc::new(StubAdapter::new(
        GitOpsProvider::Argocd,
        DeliveryState {
            ready,
            last_applied_revision: ready.then(|| "newrev".to_string()),
            last_attempted_revision: None,
            message: None,
        },
    ))
}

#[tokio::test]
async fn manual_promotion_updates_the_target_and_never_waits() {
    let store = Arc::new(InMemoryStore::default());
    let (planner, rollback) = planner(
        store.clone(),
        StaticTests(HashMap::new()),
        StaticGates(true),
    );
    let source = source_platform(PromotionStrategy::Manual, vec![env("staging")]);
    let stub = adapter(true);
    let dyn_adapter: Arc<dyn DeliveryAdapter> = stub.clone();

    let record = planner
        .promote(&source, "staging", "jan", &dyn_adapter, &rollback)
        .await
        .unwrap();

    assert_eq!(stub.last_revision_for("demo").as_deref(), Some("newrev"));
    assert!(record.requirements_satisfied);
    assert_eq!(record.source_revision, "newrev");
    assert_eq!(record.approvals, vec!["jan".to_string()]);

    // The audit record is persisted in the target environment.
    let records = store
        .list_configmaps("staging", "observability.platform.io/promotion-record=true")
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn promotion_never_skips_declared_environments() {
    let store = Arc::new(InMemoryStore::default());
    let (planner, rollback) = planner(
        store.clone(),
        StaticTests(HashMap::new()),
        StaticGates(true),
    );
    let source = source_platform(
        PromotionStrategy::Manual,
        vec![env("staging"), env("prod")],
    );
    let stub = adapter(true);
    let dyn_adapter: Arc<dyn DeliveryAdapter> = stub.clone();

    // staging's platform is absent, so prod is unreachable.
    let err = planner
        .promote(&source, "prod", "jan", &dyn_adapter, &rollback)
        .await
        .expect_err("prod must be rejected");
    assert!(matches!(err, Error::RequirementsNotMet(_)));
    assert!(stub.last_revision_for("demo").is_none());

    // Once staging is Ready, prod is reachable.
    store.seed_platform(ready_platform("demo", "staging"));
    planner
        .promote(&source, "prod", "jan", &dyn_adapter, &rollback)
        .await
        .expect("prod promotes after staging is Ready");
}

#[tokio::test]
async fn automatic_promotion_aborts_on_failing_requirements() {
    let store = Arc::new(InMemoryStore::default());
    let mut tests = HashMap::new();
    tests.insert("smoke-suite".to_string(), false);
    let (planner, rollback) = planner(store, StaticTests(tests), StaticGates(true));

    let mut staging = env("staging");
    staging.requirements = vec!["smoke-suite".to_string()];
    let source = source_platform(PromotionStrategy::Automatic, vec![staging]);
    let stub = adapter(true);
    let dyn_adapter: Arc<dyn DeliveryAdapter> = stub.clone();

    let err = planner
        .promote(&source, "staging", "jan", &dyn_adapter, &rollback)
        .await
        .expect_err("failing requirement aborts");
    assert!(matches!(err, Error::RequirementsNotMet(_)));
    assert!(stub.last_revision_for("demo").is_none(), "no revision change on abort");
}

#[tokio::test]
async fn gated_promotion_rolls_back_on_gate_failure() {
    let store = Arc::new(InMemoryStore::default());

    // History for the staging environment: "goodrev" reached Ready.
    let syncstate = SyncStateStore::new(store.clone());
    let mut good = SyncRecord::started("demo", 1, "goodrev");
    good.status = SyncStatus::Completed;
    good.reached_ready = true;
    syncstate.record("staging", &good, 10).await.unwrap();

    // The staging platform exists and is Ready before the bad promotion.
    store.seed_platform(ready_platform("demo", "staging"));

    let (planner, rollback) = planner(
        store.clone(),
        StaticTests(HashMap::new()),
        StaticGates(false),
    );
    let mut staging = env("staging");
    staging.gates = vec![GateSpec {
        name: "smoke".to_string(),
        window: Some("5m".to_string()),
    }];
    let source = source_platform(PromotionStrategy::Gated, vec![staging]);
    let stub = adapter(true);
    let dyn_adapter: Arc<dyn DeliveryAdapter> = stub.clone();

    let err = planner
        .promote(&source, "staging", "jan", &dyn_adapter, &rollback)
        .await
        .expect_err("gate failure surfaces");
    assert!(matches!(err, Error::RequirementsNotMet(_)));

    // The bad revision went out first; the rollback pinned the last
    // known-good revision afterwards.
    let revisions = stub.target_revisions.lock().unwrap().clone();
    assert_eq!(
        revisions,
        vec![
            ("demo".to_string(), "newrev".to_string()),
            ("demo".to_string(), "goodrev".to_string()),
        ]
    );

    // The audit record marks the failed requirements.
    let records = store
        .list_configmaps("staging", "observability.platform.io/promotion-record=true")
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let payload = records[0].data.as_ref().unwrap().get("record.json").unwrap();
    assert!(payload.contains("\"requirementsSatisfied\":false"));
}

#[tokio::test]
async fn rollback_targets_the_newest_ready_revision() {
    let store = Arc::new(InMemoryStore::default());
    let syncstate = Arc::new(SyncStateStore::new(store.clone()));

    for (sequence, revision, ready) in
        [(1, "r1", true), (2, "r2", true), (3, "r3", false)]
    {
        let mut record = SyncRecord::started("demo", sequence, revision);
        record.status = if ready {
            SyncStatus::Completed
        } else {
            SyncStatus::Failed
        };
        record.reached_ready = ready;
        syncstate.record("staging", &record, 10).await.unwrap();
    }

    let rollback = RollbackManager::new(syncstate);
    let target = ready_platform("demo", "staging");
    let stub = adapter(false);
    let dyn_adapter: Arc<dyn DeliveryAdapter> = stub.clone();

    let outcome = rollback
        .execute(&target, &dyn_adapter, "sync failures over threshold")
        .await
        .unwrap();
    assert_eq!(outcome.target_revision, "r2");
    assert_eq!(stub.last_revision_for("demo").as_deref(), Some("r2"));
    assert_eq!(stub.triggers.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rollback_without_known_good_revision_fails() {
    let store = Arc::new(InMemoryStore::default());
    let rollback = RollbackManager::new(Arc::new(SyncStateStore::new(store)));
    let target = ready_platform("demo", "staging");
    let stub = adapter(false);
    let dyn_adapter: Arc<dyn DeliveryAdapter> = stub.clone();

    let err = rollback
        .execute(&target, &dyn_adapter, "nothing to go back to")
        .await
        .expect_err("no known-good revision");
    assert!(matches!(err, Error::ConfigError(_)));
    assert!(stub.last_revision_for("demo").is_none());
}
