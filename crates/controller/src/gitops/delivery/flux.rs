//! Flux delivery adapter: a `GitRepository` source plus a `Kustomization`
//! per platform.
//!
//! Sync cancellation is not part of the Flux API surface; the coordinator
//! marks the sync record `Cancelled` and `cancel` re-requests
//! reconciliation on the Kustomization as a best-effort nudge.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::debug;

use super::{DeliveryAdapter, DeliveryHandle, DeliveryState};
use crate::crds::{GitOpsProvider, ObservabilityPlatform, SyncPolicySpec};
use crate::error::{Error, Result};
use crate::store::StateStore;

const SOURCE_API_VERSION: &str = "source.toolkit.fluxcd.io/v1";
const SOURCE_KIND: &str = "GitRepository";
const KUSTOMIZE_API_VERSION: &str = "kustomize.toolkit.fluxcd.io/v1";
const KUSTOMIZE_KIND: &str = "Kustomization";
const RECONCILE_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

pub struct FluxAdapter {
    store: Arc<dyn StateStore>,
}

impl FluxAdapter {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn source_manifest(platform: &ObservabilityPlatform) -> Result<Value> {
        let gitops = platform
            .spec
            .gitops
            .as_ref()
            .ok_or_else(|| Error::ConfigError("gitops spec missing".to_string()))?;
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        let repository = &gitops.repository;

        let reference = if let Some(tag) = &repository.tag {
            json!({ "tag": tag })
        } else {
            json!({ "branch": repository.reference() })
        };

        let mut spec = json!({
            "url": repository.url,
            "interval": repository.polling_interval.clone().unwrap_or_else(|| "1m".to_string()),
            "ref": reference,
        });
        if let Some(secret) = &repository.credentials_secret {
            spec["secretRef"] = json!({ "name": secret });
        }

        Ok(json!({
            "apiVersion": SOURCE_API_VERSION,
            "kind": SOURCE_KIND,
            "metadata": {
                "name": platform.name_any(),
                "namespace": namespace,
                "labels": {
                    "app.kubernetes.io/managed-by": "platform-controller",
                    "observability.platform.io/platform": platform.name_any(),
                },
            },
            "spec": spec,
        }))
    }

    fn kustomization_manifest(platform: &ObservabilityPlatform) -> Result<Value> {
        let gitops = platform
            .spec
            .gitops
            .as_ref()
            .ok_or_else(|| Error::ConfigError("gitops spec missing".to_string()))?;
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        let policy = gitops.sync_policy.clone().unwrap_or_default();

        Ok(json!({
            "apiVersion": KUSTOMIZE_API_VERSION,
            "kind": KUSTOMIZE_KIND,
            "metadata": {
                "name": platform.name_any(),
                "namespace": namespace,
                "labels": {
                    "app.kubernetes.io/managed-by": "platform-controller",
                    "observability.platform.io/platform": platform.name_any(),
                },
            },
            "spec": {
                "interval": gitops.repository.polling_interval.clone().unwrap_or_else(|| "1m".to_string()),
                "path": gitops.repository.path.clone().unwrap_or_else(|| "./".to_string()),
                "prune": policy.prune,
                "suspend": false,
                "sourceRef": {
                    "kind": SOURCE_KIND,
                    "name": platform.name_any(),
                },
                "targetNamespace": namespace,
                "retries": policy.retry_limit.unwrap_or(3),
            },
        }))
    }

    async fn patch_object(
        &self,
        api_version: &str,
        kind: &str,
        handle: &DeliveryHandle,
        mutate: impl FnOnce(&mut Value),
    ) -> Result<()> {
        let Some(current) = self
            .store
            .get(api_version, kind, &handle.name, &handle.namespace)
            .await?
        else {
            return Err(Error::NotFound(format!("{kind} {}", handle.name)));
        };
        let mut manifest = serde_json::to_value(&current)?;
        strip_server_metadata(&mut manifest);
        mutate(&mut manifest);
        self.store.apply(&manifest).await?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryAdapter for FluxAdapter {
    fn provider(&self) -> GitOpsProvider {
        GitOpsProvider::Flux
    }

    async fn install(&self, platform: &ObservabilityPlatform) -> Result<DeliveryHandle> {
        self.store.apply(&Self::source_manifest(platform)?).await?;
        self.store
            .apply(&Self::kustomization_manifest(platform)?)
            .await?;
        debug!(platform = %platform.name_any(), "flux source and kustomization applied");
        Ok(DeliveryHandle::for_platform(GitOpsProvider::Flux, platform))
    }

    async fn configure_sync_policy(
        &self,
        handle: &DeliveryHandle,
        policy: &SyncPolicySpec,
    ) -> Result<()> {
        let prune = policy.prune;
        let retries = policy.retry_limit.unwrap_or(3);
        self.patch_object(KUSTOMIZE_API_VERSION, KUSTOMIZE_KIND, handle, |manifest| {
            manifest["spec"]["prune"] = json!(prune);
            manifest["spec"]["retries"] = json!(retries);
        })
        .await
    }

    async fn trigger(&self, handle: &DeliveryHandle) -> Result<()> {
        let stamp = Utc::now().to_rfc3339();
        self.patch_object(KUSTOMIZE_API_VERSION, KUSTOMIZE_KIND, handle, |manifest| {
            manifest["metadata"]["annotations"][RECONCILE_ANNOTATION] = json!(stamp);
        })
        .await
    }

    async fn update_target_revision(&self, handle: &DeliveryHandle, revision: &str) -> Result<()> {
        let revision = revision.to_string();
        self.patch_object(SOURCE_API_VERSION, SOURCE_KIND, handle, move |manifest| {
            // Pinning a commit overrides branch/tag tracking until cleared.
            manifest["spec"]["ref"] = json!({ "commit": revision });
        })
        .await?;
        self.trigger(handle).await
    }

    async fn status(&self, handle: &DeliveryHandle) -> Result<DeliveryState> {
        let Some(current) = self
            .store
            .get(KUSTOMIZE_API_VERSION, KUSTOMIZE_KIND, &handle.name, &handle.namespace)
            .await?
        else {
            return Ok(DeliveryState::default());
        };

        let value = serde_json::to_value(&current)?;
        let conditions = value["status"]["conditions"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let ready_condition = conditions
            .iter()
            .find(|c| c["type"].as_str() == Some("Ready"));
        Ok(DeliveryState {
            ready: ready_condition.is_some_and(|c| c["status"].as_str() == Some("True")),
            last_applied_revision: value["status"]["lastAppliedRevision"]
                .as_str()
                .map(ToString::to_string),
            last_attempted_revision: value["status"]["lastAttemptedRevision"]
                .as_str()
                .map(ToString::to_string),
            message: ready_condition
                .and_then(|c| c["message"].as_str())
                .map(ToString::to_string),
        })
    }

    async fn cancel(&self, handle: &DeliveryHandle) -> Result<()> {
        let stamp = Utc::now().to_rfc3339();
        match self
            .patch_object(KUSTOMIZE_API_VERSION, KUSTOMIZE_KIND, handle, |manifest| {
                manifest["metadata"]["annotations"][RECONCILE_ANNOTATION] = json!(stamp);
            })
            .await
        {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn suspend(&self, handle: &DeliveryHandle) -> Result<()> {
        match self
            .patch_object(KUSTOMIZE_API_VERSION, KUSTOMIZE_KIND, handle, |manifest| {
                manifest["spec"]["suspend"] = json!(true);
            })
            .await
        {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn uninstall(&self, platform: &ObservabilityPlatform) -> Result<()> {
        let name = platform.name_any();
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        self.store
            .delete(KUSTOMIZE_API_VERSION, KUSTOMIZE_KIND, &name, &namespace)
            .await?;
        self.store
            .delete(SOURCE_API_VERSION, SOURCE_KIND, &name, &namespace)
            .await
    }
}

fn strip_server_metadata(manifest: &mut Value) {
    if let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("resourceVersion");
        metadata.remove("uid");
        metadata.remove("generation");
        metadata.remove("creationTimestamp");
        metadata.remove("managedFields");
    }
    if let Some(obj) = manifest.as_object_mut() {
        obj.remove("status");
    }
}
