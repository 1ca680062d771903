//! Argo CD delivery adapter: one `Application` per platform.

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

const API_VERSION: &str = "argoproj.io/v1alpha1";
const KIND: &str = "Application";
const REFRESH_ANNOTATION: &str = "argocd.argoproj.io/refresh";

pub struct ArgoAdapter {
    store: Arc<dyn StateStore>,
}

impl ArgoAdapter {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn application_manifest(platform: &ObservabilityPlatform) -> Result<Value> {
        let gitops = platform
            .spec
            .gitops
            .as_ref()
            .ok_or_else(|| Error::ConfigError("gitops spec missing".to_string()))?;
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        let policy = gitops.sync_policy.clone().unwrap_or_default();

        Ok(json!({
            "apiVersion": API_VERSION,
            "kind": KIND,
            "metadata": {
                "name": platform.name_any(),
                "namespace": namespace,
                "labels": {
                    "app.kubernetes.io/managed-by": "platform-controller",
                    "observability.platform.io/platform": platform.name_any(),
                },
            },
            "spec": {
                "project": "default",
                "source": {
                    "repoURL": gitops.repository.url,
                    "path": gitops.repository.path.clone().unwrap_or_else(|| ".".to_string()),
                    "targetRevision": gitops.repository.reference(),
                },
                "destination": {
                    "server": "https://kubernetes.default.svc",
                    "namespace": namespace,
                },
                "syncPolicy": sync_policy_value(&policy),
            },
        }))
    }
}

fn sync_policy_value(policy: &SyncPolicySpec) -> Value {
    let mut out = json!({});
    if policy.automated {
        out["automated"] = json!({
            "prune": policy.prune,
            "selfHeal": policy.self_heal,
        });
    }
    if let Some(limit) = policy.retry_limit {
        out["retry"] = json!({ "limit": limit });
    }
    out
}

#[async_trait]
impl DeliveryAdapter for ArgoAdapter {
    fn provider(&self) -> GitOpsProvider {
        GitOpsProvider::Argocd
    }

    async fn install(&self, platform: &ObservabilityPlatform) -> Result<DeliveryHandle> {
        let manifest = Self::application_manifest(platform)?;
        self.store.apply(&manifest).await?;
        debug!(platform = %platform.name_any(), "argocd application applied");
        Ok(DeliveryHandle::for_platform(GitOpsProvider::Argocd, platform))
    }

    async fn configure_sync_policy(
        &self,
        handle: &DeliveryHandle,
        policy: &SyncPolicySpec,
    ) -> Result<()> {
        let Some(current) = self
            .store
            .get(API_VERSION, KIND, &handle.name, &handle.namespace)
            .await?
        else {
            return Err(Error::NotFound(format!("application {}", handle.name)));
        };

        let mut manifest = serde_json::to_value(&current)?;
        strip_server_metadata(&mut manifest);
        manifest["spec"]["syncPolicy"] = sync_policy_value(policy);
        self.store.apply(&manifest).await?;
        Ok(())
    }

    async fn trigger(&self, handle: &DeliveryHandle) -> Result<()> {
        let Some(current) = self
            .store
            .get(API_VERSION, KIND, &handle.name, &handle.namespace)
            .await?
        else {
            return Err(Error::NotFound(format!("application {}", handle.name)));
        };

        let mut manifest = serde_json::to_value(&current)?;
        strip_server_metadata(&mut manifest);
        manifest["metadata"]["annotations"][REFRESH_ANNOTATION] =
            json!(Utc::now().to_rfc3339());
        self.store.apply(&manifest).await?;
        Ok(())
    }

    async fn update_target_revision(&self, handle: &DeliveryHandle, revision: &str) -> Result<()> {
        let Some(current) = self
            .store
            .get(API_VERSION, KIND, &handle.name, &handle.namespace)
            .await?
        else {
            return Err(Error::NotFound(format!("application {}", handle.name)));
        };

        let mut manifest = serde_json::to_value(&current)?;
        strip_server_metadata(&mut manifest);
        manifest["spec"]["source"]["targetRevision"] = json!(revision);
        self.store.apply(&manifest).await?;
        Ok(())
    }

    async fn status(&self, handle: &DeliveryHandle) -> Result<DeliveryState> {
        let Some(current) = self
            .store
            .get(API_VERSION, KIND, &handle.name, &handle.namespace)
            .await?
        else {
            return Ok(DeliveryState::default());
        };

        let value = serde_json::to_value(&current)?;
        let synced = value["status"]["sync"]["status"].as_str() == Some("Synced");
        let healthy = value["status"]["health"]["status"].as_str() == Some("Healthy");
        Ok(DeliveryState {
            ready: synced && healthy,
            last_applied_revision: value["status"]["sync"]["revision"]
                .as_str()
                .map(ToString::to_string),
            last_attempted_revision: value["status"]["operationState"]["operation"]["sync"]
                ["revision"]
                .as_str()
                .map(ToString::to_string),
            message: value["status"]["conditions"][0]["message"]
                .as_str()
                .map(ToString::to_string),
        })
    }

    async fn cancel(&self, handle: &DeliveryHandle) -> Result<()> {
        let Some(current) = self
            .store
            .get(API_VERSION, KIND, &handle.name, &handle.namespace)
            .await?
        else {
            return Ok(());
        };

        let mut manifest = serde_json::to_value(&current)?;
        strip_server_metadata(&mut manifest);
        // Removing the operation field terminates an in-flight sync.
        if let Some(obj) = manifest.as_object_mut() {
            obj.remove("operation");
        }
        self.store.apply(&manifest).await?;
        Ok(())
    }

    async fn suspend(&self, handle: &DeliveryHandle) -> Result<()> {
        let Some(current) = self
            .store
            .get(API_VERSION, KIND, &handle.name, &handle.namespace)
            .await?
        else {
            // Nothing installed; nothing to suspend.
            return Ok(());
        };

        let mut manifest = serde_json::to_value(&current)?;
        strip_server_metadata(&mut manifest);
        // Dropping the automated block stops self-driven syncs.
        manifest["spec"]["syncPolicy"] = json!({});
        self.store.apply(&manifest).await?;
        Ok(())
    }

    async fn uninstall(&self, platform: &ObservabilityPlatform) -> Result<()> {
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        self.store
            .delete(API_VERSION, KIND, &platform.name_any(), &namespace)
            .await
    }
}

/// Remove server-populated fields before re-applying a fetched object.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{GitOpsSpec, GitRepositorySpec, ObservabilityPlatformSpec};

    fn platform() -> ObservabilityPlatform {
        let mut p = ObservabilityPlatform::new(
            "demo",
            ObservabilityPlatformSpec {
                gitops: Some(GitOpsSpec {
                    enabled: true,
                    provider: GitOpsProvider::Argocd,
                    repository: GitRepositorySpec {
                        url: "https://github.com/acme/config".to_string(),
                        branch: Some("main".to_string()),
                        path: Some("clusters/prod".to_string()),
                        ..GitRepositorySpec::default()
                    },
                    sync_policy: Some(SyncPolicySpec {
                        automated: true,
                        prune: true,
                        self_heal: true,
                        retry_limit: Some(5),
                    }),
                    ..GitOpsSpec::default()
                }),
                ..ObservabilityPlatformSpec::default()
            },
        );
        p.metadata.namespace = Some("monitoring".to_string());
        p
    }

    #[test]
    fn application_manifest_points_at_declared_source() {
        let manifest = ArgoAdapter::application_manifest(&platform()).unwrap();
        assert_eq!(manifest["kind"], "Application");
        assert_eq!(
            manifest["spec"]["source"]["repoURL"],
            "https://github.com/acme/config"
        );
        assert_eq!(manifest["spec"]["source"]["path"], "clusters/prod");
        assert_eq!(manifest["spec"]["source"]["targetRevision"], "main");
        assert_eq!(manifest["spec"]["destination"]["namespace"], "monitoring");
        assert_eq!(manifest["spec"]["syncPolicy"]["automated"]["prune"], true);
        assert_eq!(manifest["spec"]["syncPolicy"]["retry"]["limit"], 5);
    }

    #[test]
    fn manual_policy_renders_no_automated_block() {
        let value = sync_policy_value(&SyncPolicySpec::default());
        assert!(value.get("automated").is_none());
    }

    #[test]
    fn strip_server_metadata_removes_ignored_fields() {
        let mut manifest = json!({
            "metadata": {
                "name": "demo",
                "resourceVersion": "42",
                "uid": "u-1",
                "managedFields": [{}],
            },
            "status": { "sync": { "status": "Synced" } },
        });
        strip_server_metadata(&mut manifest);
        assert_eq!(manifest["metadata"]["name"], "demo");
        assert!(manifest["metadata"].get("resourceVersion").is_none());
        assert!(manifest.get("status").is_none());
    }
}
