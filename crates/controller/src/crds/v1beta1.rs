//! `ObservabilityPlatform` v1beta1.
//!
//! Deprecated; sunset 2027-06-30. Adds the GitOps coupling over v1alpha1
//! but predates promotion pipelines and preview environments.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::v1;
use super::v1::ObservabilityPlatformStatus;

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "observability.platform.io",
    version = "v1beta1",
    kind = "ObservabilityPlatform",
    plural = "observabilityplatforms",
    shortname = "op",
    namespaced,
    status = "ObservabilityPlatformStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityPlatformSpec {
    #[serde(default)]
    pub components: v1::ComponentsSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<v1::GlobalSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitops: Option<GitOpsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<v1::SecuritySpec>,
}

/// GitOps coupling as it existed before promotion pipelines landed.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsSpec {
    pub enabled: bool,

    #[serde(default)]
    pub provider: v1::GitOpsProvider,

    pub repository: v1::GitRepositorySpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<v1::SyncPolicySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_detection: Option<v1::DriftDetectionSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<v1::RollbackSpec>,
}
