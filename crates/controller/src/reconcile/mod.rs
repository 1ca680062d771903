//! Reconciliation controller: the event-driven convergence loop.

pub mod phase;
pub mod platform;
pub mod status;
pub mod teardown;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::crds::ObservabilityPlatform;
use crate::error::{Error, Result};
use crate::gitops::webhook::server::EngineMetrics;
use crate::gitops::{platform_key, GitOpsCoordinator};
use crate::render::RendererRegistry;
use crate::store::StateStore;

pub use platform::apply_platform;
pub use teardown::cleanup_platform;

pub const PLATFORM_FINALIZER: &str =
    "observabilityplatforms.observability.platform.io/finalizer";

/// Per-key backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(600);
const BASE_BACKOFF_SECS: u64 = 5;

// Context shared across controller operations
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub store: Arc<dyn StateStore>,
    pub registry: Arc<RendererRegistry>,
    pub config: Arc<EngineConfig>,
    pub gitops: Arc<GitOpsCoordinator>,
    pub metrics: Arc<EngineMetrics>,
    pub backoff: Arc<DashMap<String, u32>>,
}

/// Reconcile one platform key.
#[instrument(skip(ctx), fields(platform = %platform.name_any(), namespace = %platform.namespace().unwrap_or_default()))]
pub async fn reconcile(
    platform: Arc<ObservabilityPlatform>,
    ctx: Arc<Context>,
) -> Result<Action> {
    ctx.metrics.reconciles.fetch_add(1, Ordering::Relaxed);
    let key = platform_key(&platform);

    let namespace = platform.namespace().ok_or(Error::MissingObjectKey)?;
    let platforms: Api<ObservabilityPlatform> = Api::namespaced(ctx.client.clone(), &namespace);

    // The soft deadline releases the worker; the key requeues.
    let deadline = ctx.config.reconcile_deadline();
    let pass = finalizer(&platforms, PLATFORM_FINALIZER, platform, |event| {
        let ctx = ctx.clone();
        async move {
            match event {
                FinalizerEvent::Apply(p) => apply_platform(p, &ctx).await,
                FinalizerEvent::Cleanup(p) => cleanup_platform(p, &ctx).await,
            }
        }
    });

    let result = match tokio::time::timeout(deadline, pass).await {
        Ok(result) => result.map_err(|e| match e {
            kube::runtime::finalizer::Error::ApplyFailed(err)
            | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
            kube::runtime::finalizer::Error::AddFinalizer(e)
            | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
            kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
            kube::runtime::finalizer::Error::InvalidFinalizer => {
                Error::ConfigError("invalid finalizer name".to_string())
            }
        }),
        Err(_) => Err(Error::Transient(format!(
            "reconcile exceeded the {}s soft deadline",
            deadline.as_secs()
        ))),
    };

    if result.is_ok() {
        ctx.backoff.remove(&key);
    }
    result
}

/// Error policy: terminal errors wait for a spec change; everything else
/// requeues with per-key exponential backoff capped at ten minutes.
#[instrument(skip(ctx), fields(platform = %platform.name_any()))]
pub fn error_policy(
    platform: Arc<ObservabilityPlatform>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    ctx.metrics.reconcile_errors.fetch_add(1, Ordering::Relaxed);

    if error.is_terminal() {
        error!(error = %error, "terminal reconcile error, waiting for spec change");
        return Action::await_change();
    }

    let key = platform_key(&platform);
    let attempt = {
        let mut entry = ctx.backoff.entry(key).or_insert(0);
        *entry += 1;
        *entry
    };
    let delay = backoff_delay(attempt);
    warn!(error = %error, attempt, delay_secs = delay.as_secs(), "requeueing after error");
    Action::requeue(delay)
}

#[must_use]
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(7);
    let delay = Duration::from_secs(BASE_BACKOFF_SECS.saturating_mul(1 << exponent));
    delay.min(MAX_BACKOFF)
}

/// Run the platform controller until the watch streams end.
#[instrument(skip(ctx))]
pub async fn run(ctx: Arc<Context>) -> Result<()> {
    info!("starting platform controller");

    let platforms: Api<ObservabilityPlatform> = Api::all(ctx.client.clone());
    let deployments: Api<Deployment> = Api::all(ctx.client.clone());
    let statefulsets: Api<StatefulSet> = Api::all(ctx.client.clone());
    let services: Api<Service> = Api::all(ctx.client.clone());
    let configmaps: Api<ConfigMap> = Api::all(ctx.client.clone());
    let budgets: Api<PodDisruptionBudget> = Api::all(ctx.client.clone());
    let watcher_config = WatcherConfig::default().any_semantic();

    let concurrency = u16::try_from(ctx.config.worker_concurrency).unwrap_or(4);

    Controller::new(platforms, watcher_config.clone())
        .owns(deployments, watcher_config.clone())
        .owns(statefulsets, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(configmaps, watcher_config.clone())
        .owns(budgets, watcher_config)
        .with_config(kube::runtime::controller::Config::default().concurrency(concurrency))
        .run(reconcile, error_policy, ctx)
        .for_each(|reconciliation_result| async move {
            match reconciliation_result {
                Ok(object) => {
                    debug!(object = ?object, "reconciliation successful");
                }
                Err(e) => {
                    debug!(error = ?e, "reconciliation error");
                }
            }
        })
        .await;

    info!("platform controller shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_to_the_cap() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(20));
        assert_eq!(backoff_delay(8), Duration::from_secs(600).min(Duration::from_secs(640)));
        assert!(backoff_delay(30) <= MAX_BACKOFF);
    }
}
