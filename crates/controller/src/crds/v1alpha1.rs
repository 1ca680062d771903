//! `ObservabilityPlatform` v1alpha1.
//!
//! The original API surface: component declarations and global settings
//! only. Deprecated; sunset 2026-12-31.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::v1;
use super::v1::ObservabilityPlatformStatus;

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "observability.platform.io",
    version = "v1alpha1",
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
}
