//! State store adapter over the cluster API.
//!
//! All spec-touching writes go through the typed platform methods; status
//! writes go through `update_platform_status` and never touch spec. Every
//! cluster error is classified here (`NotFound` / `ConflictRetryable` /
//! `Transient` / terminal) so callers never see raw API errors.
//!
//! Watches are not part of the trait: the reconciliation controller gets
//! its restartable event streams from `kube::runtime` directly.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::events::{Event as ClusterEvent, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::crds::ObservabilityPlatform;
use crate::error::{Error, Result};

/// Field manager tag for server-side apply.
pub const FIELD_MANAGER: &str = "platform-controller";

/// Child kinds a platform may own, in apply order.
pub const CHILD_KINDS: [(&str, &str); 6] = [
    ("v1", "ConfigMap"),
    ("v1", "Service"),
    ("apps/v1", "StatefulSet"),
    ("apps/v1", "Deployment"),
    ("policy/v1", "PodDisruptionBudget"),
    ("networking.k8s.io/v1", "NetworkPolicy"),
];

/// Cluster state access used by the reconciler and the GitOps coordinator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch an arbitrary object; absence is `Ok(None)`.
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List objects of every child kind matching a label selector.
    async fn list_owned(&self, namespace: &str, selector: &str) -> Result<Vec<DynamicObject>>;

    /// Server-side apply with the controller's field manager.
    async fn apply(&self, manifest: &Value) -> Result<DynamicObject>;

    /// Delete an arbitrary object; absence is idempotent success.
    async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<()>;

    async fn get_platform(&self, name: &str, namespace: &str)
        -> Result<Option<ObservabilityPlatform>>;

    async fn list_platforms(&self) -> Result<Vec<ObservabilityPlatform>>;

    async fn create_platform(&self, platform: &ObservabilityPlatform) -> Result<()>;

    async fn delete_platform(&self, name: &str, namespace: &str) -> Result<()>;

    /// Merge-patch a platform (metadata/spec path; never used for status).
    async fn patch_platform(&self, name: &str, namespace: &str, patch: &Value) -> Result<()>;

    /// Status-subresource write with optimistic concurrency: the patch
    /// carries the observed resource version and conflicts surface as
    /// `ConflictRetryable`.
    async fn update_platform_status(&self, platform: &ObservabilityPlatform) -> Result<()>;

    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Decoded data of a secret, or `None` when it does not exist.
    async fn get_secret_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>>;

    async fn list_configmaps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>>;

    async fn upsert_configmap(&self, configmap: &ConfigMap) -> Result<()>;

    async fn delete_configmap(&self, name: &str, namespace: &str) -> Result<()>;

    /// Append an audit event. Best-effort: failures are logged, never
    /// returned.
    async fn record_event(
        &self,
        platform: &ObservabilityPlatform,
        warning: bool,
        reason: &str,
        message: &str,
    );
}

/// Production implementation over `kube::Client`.
#[derive(Clone)]
pub struct KubeStateStore {
    client: Client,
    reporter: Reporter,
}

impl KubeStateStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("HOSTNAME").ok(),
            },
        }
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn dynamic_api(&self, api_version: &str, kind: &str, namespace: &str) -> Api<DynamicObject> {
        let ar = api_resource(api_version, kind);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }

    fn platforms(&self, namespace: &str) -> Api<ObservabilityPlatform> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// API version a child kind lives under.
#[must_use]
pub fn api_version_for_kind(kind: &str) -> &'static str {
    CHILD_KINDS
        .iter()
        .find(|(_, k)| *k == kind)
        .map_or("v1", |(api_version, _)| api_version)
}

/// Resolve an `ApiResource` for a known group/version/kind pair.
#[must_use]
pub fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    let gvk = GroupVersionKind::gvk(group, version, kind);
    ApiResource::from_gvk_with_plural(&gvk, &pluralize(kind))
}

/// Lowercased English plural of a kind name, matching cluster conventions.
#[must_use]
pub fn pluralize(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if let Some(stem) = lower.strip_suffix('y') {
        format!("{stem}ies")
    } else if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") {
        format!("{lower}es")
    } else {
        format!("{lower}s")
    }
}

#[async_trait]
impl StateStore for KubeStateStore {
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>> {
        let api = self.dynamic_api(api_version, kind, namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Error::classify(e, &format!("{kind}/{namespace}/{name}"))),
        }
    }

    async fn list_owned(&self, namespace: &str, selector: &str) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(selector);
        let mut found = Vec::new();
        for (api_version, kind) in CHILD_KINDS {
            let api = self.dynamic_api(api_version, kind, namespace);
            let list = api
                .list(&params)
                .await
                .map_err(|e| Error::classify(e, &format!("list {kind} in {namespace}")))?;
            for mut obj in list.items {
                // DynamicObject lists come back without type metadata.
                if obj.types.is_none() {
                    obj.types = Some(kube::core::TypeMeta {
                        api_version: api_version.to_string(),
                        kind: kind.to_string(),
                    });
                }
                found.push(obj);
            }
        }
        Ok(found)
    }

    async fn apply(&self, manifest: &Value) -> Result<DynamicObject> {
        let api_version = manifest["apiVersion"]
            .as_str()
            .ok_or(Error::MissingObjectKey)?;
        let kind = manifest["kind"].as_str().ok_or(Error::MissingObjectKey)?;
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or(Error::MissingObjectKey)?;
        let namespace = manifest["metadata"]["namespace"]
            .as_str()
            .ok_or(Error::MissingObjectKey)?;

        let api = self.dynamic_api(api_version, kind, namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(manifest))
            .await
            .map_err(|e| Error::classify(e, &format!("apply {kind}/{namespace}/{name}")))
    }

    async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        let api = self.dynamic_api(api_version, kind, namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::classify(e, &format!("{kind}/{namespace}/{name}"))),
        }
    }

    async fn get_platform(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ObservabilityPlatform>> {
        self.platforms(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::classify(e, &format!("platform {namespace}/{name}")))
    }

    async fn list_platforms(&self) -> Result<Vec<ObservabilityPlatform>> {
        let api: Api<ObservabilityPlatform> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::classify(e, "list platforms"))?;
        Ok(list.items)
    }

    async fn create_platform(&self, platform: &ObservabilityPlatform) -> Result<()> {
        let namespace = platform.namespace().ok_or(Error::MissingObjectKey)?;
        match self
            .platforms(&namespace)
            .create(&PostParams::default(), platform)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(name = %platform.name_any(), "platform already exists");
                Ok(())
            }
            Err(e) => Err(Error::classify(
                e,
                &format!("create platform {}", platform.name_any()),
            )),
        }
    }

    async fn delete_platform(&self, name: &str, namespace: &str) -> Result<()> {
        match self
            .platforms(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::classify(e, &format!("platform {namespace}/{name}"))),
        }
    }

    async fn patch_platform(&self, name: &str, namespace: &str, patch: &Value) -> Result<()> {
        self.platforms(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| Error::classify(e, &format!("patch platform {namespace}/{name}")))?;
        Ok(())
    }

    async fn update_platform_status(&self, platform: &ObservabilityPlatform) -> Result<()> {
        let name = platform.name_any();
        let namespace = platform.namespace().ok_or(Error::MissingObjectKey)?;

        // Carrying the resource version makes the write conditional; a
        // concurrent writer turns this into ConflictRetryable and the
        // caller requeues instead of retrying in place.
        let patch = json!({
            "metadata": { "resourceVersion": platform.resource_version() },
            "status": platform.status,
        });

        self.platforms(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::classify(e, &format!("status {namespace}/{name}")))?;
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let manifest: Namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name }
        }))?;
        match api.create(&PostParams::default(), &manifest).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(Error::classify(e, &format!("namespace {name}"))),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::classify(e, &format!("namespace {name}"))),
        }
    }

    async fn get_secret_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(
                secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.0))
                    .collect(),
            )),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Error::classify(e, &format!("secret {namespace}/{name}"))),
        }
    }

    async fn list_configmaps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| Error::classify(e, &format!("list configmaps in {namespace}")))?;
        Ok(list.items)
    }

    async fn upsert_configmap(&self, configmap: &ConfigMap) -> Result<()> {
        let name = configmap.name_any();
        let namespace = configmap.namespace().ok_or(Error::MissingObjectKey)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), configmap).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                api.replace(&name, &PostParams::default(), configmap)
                    .await
                    .map_err(|e| Error::classify(e, &format!("configmap {namespace}/{name}")))?;
                Ok(())
            }
            Err(e) => Err(Error::classify(e, &format!("configmap {namespace}/{name}"))),
        }
    }

    async fn delete_configmap(&self, name: &str, namespace: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::classify(e, &format!("configmap {namespace}/{name}"))),
        }
    }

    async fn record_event(
        &self,
        platform: &ObservabilityPlatform,
        warning: bool,
        reason: &str,
        message: &str,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let event = ClusterEvent {
            type_: if warning {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, &platform.object_ref(&())).await {
            warn!(reason, error = %e, "failed to record event");
        }
    }
}
