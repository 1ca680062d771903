//! Shared in-memory doubles for integration tests: a `StateStore` backed
//! by maps and a scripted delivery adapter.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use controller::crds::{GitOpsProvider, ObservabilityPlatform, SyncPolicySpec};
use controller::error::{Error, Result};
use controller::gitops::delivery::{DeliveryAdapter, DeliveryHandle, DeliveryState};
use controller::store::StateStore;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;

fn object_key(api_version: &str, kind: &str, namespace: &str, name: &str) -> String {
    format!("{api_version}|{kind}|{namespace}|{name}")
}

fn ns_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Label-selector match over `k=v,k2=v2` selectors.
fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    let Some(labels) = labels else {
        return selector.is_empty();
    };
    selector
        .split(',')
        .filter(|clause| !clause.is_empty())
        .all(|clause| match clause.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => false,
        })
}

#[derive(Default)]
pub struct InMemoryStore {
    pub objects: DashMap<String, Value>,
    pub platforms: DashMap<String, ObservabilityPlatform>,
    pub configmaps: DashMap<String, ConfigMap>,
    pub secrets: DashMap<String, BTreeMap<String, Vec<u8>>>,
    pub namespaces: DashMap<String, ()>,
    pub events: Mutex<Vec<(bool, String, String)>>,
}

impl InMemoryStore {
    pub fn seed_platform(&self, platform: ObservabilityPlatform) {
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        self.platforms
            .insert(ns_key(&namespace, &platform.name_any()), platform);
    }

    pub fn seed_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        self.secrets.insert(
            ns_key(namespace, name),
            data.iter()
                .map(|(k, v)| ((*k).to_string(), v.as_bytes().to_vec()))
                .collect(),
        );
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self
            .objects
            .get(&object_key(api_version, kind, namespace, name))
            .map(|manifest| serde_json::from_value(manifest.clone()).expect("stored manifest")))
    }

    async fn list_owned(&self, namespace: &str, selector: &str) -> Result<Vec<DynamicObject>> {
        let mut found = Vec::new();
        for entry in self.objects.iter() {
            let manifest = entry.value();
            if manifest["metadata"]["namespace"].as_str() != Some(namespace) {
                continue;
            }
            let labels: Option<BTreeMap<String, String>> =
                serde_json::from_value(manifest["metadata"]["labels"].clone()).ok();
            if selector_matches(selector, labels.as_ref()) {
                found.push(serde_json::from_value(manifest.clone()).expect("stored manifest"));
            }
        }
        Ok(found)
    }

    async fn apply(&self, manifest: &Value) -> Result<DynamicObject> {
        let api_version = manifest["apiVersion"].as_str().ok_or(Error::MissingObjectKey)?;
        let kind = manifest["kind"].as_str().ok_or(Error::MissingObjectKey)?;
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or(Error::MissingObjectKey)?;
        let namespace = manifest["metadata"]["namespace"]
            .as_str()
            .ok_or(Error::MissingObjectKey)?;

        let mut stored = manifest.clone();
        if stored["metadata"].get("uid").is_none() {
            stored["metadata"]["uid"] = Value::String(format!("uid-{kind}-{name}"));
        }
        self.objects
            .insert(object_key(api_version, kind, namespace, name), stored.clone());
        Ok(serde_json::from_value(stored)?)
    }

    async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        self.objects
            .remove(&object_key(api_version, kind, namespace, name));
        Ok(())
    }

    async fn get_platform(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ObservabilityPlatform>> {
        Ok(self
            .platforms
            .get(&ns_key(namespace, name))
            .map(|p| p.clone()))
    }

    async fn list_platforms(&self) -> Result<Vec<ObservabilityPlatform>> {
        Ok(self.platforms.iter().map(|p| p.value().clone()).collect())
    }

    async fn create_platform(&self, platform: &ObservabilityPlatform) -> Result<()> {
        self.seed_platform(platform.clone());
        Ok(())
    }

    async fn delete_platform(&self, name: &str, namespace: &str) -> Result<()> {
        self.platforms.remove(&ns_key(namespace, name));
        Ok(())
    }

    async fn patch_platform(&self, _name: &str, _namespace: &str, _patch: &Value) -> Result<()> {
        Ok(())
    }

    async fn update_platform_status(&self, platform: &ObservabilityPlatform) -> Result<()> {
        self.seed_platform(platform.clone());
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        self.namespaces.insert(name.to_string(), ());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.namespaces.remove(name);
        Ok(())
    }

    async fn get_secret_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        Ok(self.secrets.get(&ns_key(namespace, name)).map(|s| s.clone()))
    }

    async fn list_configmaps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>> {
        Ok(self
            .configmaps
            .iter()
            .filter(|entry| entry.key().starts_with(&format!("{namespace}/")))
            .filter(|entry| selector_matches(selector, entry.value().metadata.labels.as_ref()))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn upsert_configmap(&self, configmap: &ConfigMap) -> Result<()> {
        let namespace = configmap.namespace().unwrap_or_else(|| "default".to_string());
        self.configmaps
            .insert(ns_key(&namespace, &configmap.name_any()), configmap.clone());
        Ok(())
    }

    async fn delete_configmap(&self, name: &str, namespace: &str) -> Result<()> {
        self.configmaps.remove(&ns_key(namespace, name));
        Ok(())
    }

    async fn record_event(
        &self,
        _platform: &ObservabilityPlatform,
        warning: bool,
        reason: &str,
        message: &str,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((warning, reason.to_string(), message.to_string()));
    }
}

/// Scripted delivery adapter recording every call.
pub struct StubAdapter {
    pub provider: GitOpsProvider,
    pub state: Mutex<DeliveryState>,
    pub target_revisions: Mutex<Vec<(String, String)>>,
    pub triggers: AtomicUsize,
    pub suspends: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl StubAdapter {
    pub fn new(provider: GitOpsProvider, state: DeliveryState) -> Self {
        Self {
            provider,
            state: Mutex::new(state),
            target_revisions: Mutex::new(Vec::new()),
            triggers: AtomicUsize::new(0),
            suspends: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    pub fn last_revision_for(&self, handle_name: &str) -> Option<String> {
        self.target_revisions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(name, _)| name == handle_name)
            .map(|(_, revision)| revision.clone())
    }
}

#[async_trait]
impl DeliveryAdapter for StubAdapter {
    fn provider(&self) -> GitOpsProvider {
        self.provider
    }

    async fn install(&self, platform: &ObservabilityPlatform) -> Result<DeliveryHandle> {
        Ok(DeliveryHandle::for_platform(self.provider, platform))
    }

    async fn configure_sync_policy(
        &self,
        _handle: &DeliveryHandle,
        _policy: &SyncPolicySpec,
    ) -> Result<()> {
        Ok(())
    }

    async fn trigger(&self, _handle: &DeliveryHandle) -> Result<()> {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_target_revision(&self, handle: &DeliveryHandle, revision: &str) -> Result<()> {
        self.target_revisions
            .lock()
            .unwrap()
            .push((handle.name.clone(), revision.to_string()));
        // The scripted state follows the request immediately.
        let mut state = self.state.lock().unwrap();
        state.last_applied_revision = Some(revision.to_string());
        state.ready = true;
        Ok(())
    }

    async fn status(&self, _handle: &DeliveryHandle) -> Result<DeliveryState> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn cancel(&self, _handle: &DeliveryHandle) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn suspend(&self, _handle: &DeliveryHandle) -> Result<()> {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn uninstall(&self, _platform: &ObservabilityPlatform) -> Result<()> {
        Ok(())
    }
}
