//! Provider-agnostic delivery contract.
//!
//! The coordinator selects an adapter by `spec.gitops.provider`; no other
//! code path assumes a specific provider.

pub mod argocd;
pub mod flux;

use async_trait::async_trait;
use kube::ResourceExt;

use crate::crds::{GitOpsProvider, ObservabilityPlatform, SyncPolicySpec};
use crate::error::{Error, Result};

/// Opaque reference to the provider-native delivery objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub provider: GitOpsProvider,
    pub name: String,
    pub namespace: String,
}

impl DeliveryHandle {
    #[must_use]
    pub fn for_platform(provider: GitOpsProvider, platform: &ObservabilityPlatform) -> Self {
        Self {
            provider,
            name: platform.name_any(),
            namespace: platform.namespace().unwrap_or_else(|| "default".to_string()),
        }
    }
}

/// Observed delivery state, normalized across providers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryState {
    pub ready: bool,
    pub last_applied_revision: Option<String>,
    pub last_attempted_revision: Option<String>,
    pub message: Option<String>,
}

/// Uniform contract both adapters expose.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    fn provider(&self) -> GitOpsProvider;

    /// Create (or converge) the provider-native source and application
    /// objects pointed at the repo and path in the spec.
    async fn install(&self, platform: &ObservabilityPlatform) -> Result<DeliveryHandle>;

    async fn configure_sync_policy(
        &self,
        handle: &DeliveryHandle,
        policy: &SyncPolicySpec,
    ) -> Result<()>;

    /// Request an immediate sync.
    async fn trigger(&self, handle: &DeliveryHandle) -> Result<()>;

    async fn update_target_revision(&self, handle: &DeliveryHandle, revision: &str) -> Result<()>;

    async fn status(&self, handle: &DeliveryHandle) -> Result<DeliveryState>;

    /// Best-effort notification that an in-flight sync was cancelled.
    ///
    /// Neither provider exposes first-class cancellation; adapters nudge
    /// the provider object and missing objects are not an error.
    async fn cancel(&self, handle: &DeliveryHandle) -> Result<()>;

    /// Pause delivery without removing the objects (used during teardown).
    async fn suspend(&self, handle: &DeliveryHandle) -> Result<()>;

    async fn uninstall(&self, platform: &ObservabilityPlatform) -> Result<()>;
}

/// Pick the adapter for a provider.
pub fn select(
    adapters: &[std::sync::Arc<dyn DeliveryAdapter>],
    provider: GitOpsProvider,
) -> Result<std::sync::Arc<dyn DeliveryAdapter>> {
    adapters
        .iter()
        .find(|a| a.provider() == provider)
        .cloned()
        .ok_or_else(|| Error::ConfigError(format!("no delivery adapter registered for '{provider}'")))
}
