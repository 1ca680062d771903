//! Version conversion with `v1` as the hub.
//!
//! Upgrades are total; downgrades drop fields the older schema cannot
//! carry. Every field present in both versions round-trips unchanged.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::crd::merge_crds;
use kube::CustomResourceExt;

use super::{v1, v1alpha1, v1beta1};

impl From<v1alpha1::ObservabilityPlatformSpec> for v1::ObservabilityPlatformSpec {
    fn from(old: v1alpha1::ObservabilityPlatformSpec) -> Self {
        Self {
            components: old.components,
            global: old.global,
            gitops: None,
            security: None,
            high_availability: None,
            backup: None,
        }
    }
}

impl From<v1::ObservabilityPlatformSpec> for v1alpha1::ObservabilityPlatformSpec {
    fn from(hub: v1::ObservabilityPlatformSpec) -> Self {
        Self {
            components: hub.components,
            global: hub.global,
        }
    }
}

impl From<v1beta1::GitOpsSpec> for v1::GitOpsSpec {
    fn from(old: v1beta1::GitOpsSpec) -> Self {
        Self {
            enabled: old.enabled,
            provider: old.provider,
            repository: old.repository,
            sync_policy: old.sync_policy,
            drift_detection: old.drift_detection,
            rollback: old.rollback,
            promotion: None,
            preview_environments: None,
        }
    }
}

impl From<v1::GitOpsSpec> for v1beta1::GitOpsSpec {
    fn from(hub: v1::GitOpsSpec) -> Self {
        Self {
            enabled: hub.enabled,
            provider: hub.provider,
            repository: hub.repository,
            sync_policy: hub.sync_policy,
            drift_detection: hub.drift_detection,
            rollback: hub.rollback,
        }
    }
}

impl From<v1beta1::ObservabilityPlatformSpec> for v1::ObservabilityPlatformSpec {
    fn from(old: v1beta1::ObservabilityPlatformSpec) -> Self {
        Self {
            components: old.components,
            global: old.global,
            gitops: old.gitops.map(Into::into),
            security: old.security,
            high_availability: None,
            backup: None,
        }
    }
}

impl From<v1::ObservabilityPlatformSpec> for v1beta1::ObservabilityPlatformSpec {
    fn from(hub: v1::ObservabilityPlatformSpec) -> Self {
        Self {
            components: hub.components,
            global: hub.global,
            gitops: hub.gitops.map(Into::into),
            security: hub.security,
        }
    }
}

/// Sunset dates for the deprecated served versions.
const DEPRECATIONS: [(&str, &str); 2] = [
    (
        "v1alpha1",
        "observability.platform.io/v1alpha1 ObservabilityPlatform is deprecated; migrate to v1 before 2026-12-31",
    ),
    (
        "v1beta1",
        "observability.platform.io/v1beta1 ObservabilityPlatform is deprecated; migrate to v1 before 2027-06-30",
    ),
];

/// Build the multi-version CRD with `v1` as the storage version and the
/// older versions flagged deprecated.
pub fn merged_crd() -> anyhow::Result<CustomResourceDefinition> {
    let mut crd = merge_crds(
        vec![
            v1alpha1::ObservabilityPlatform::crd(),
            v1beta1::ObservabilityPlatform::crd(),
            v1::ObservabilityPlatform::crd(),
        ],
        "v1",
    )?;

    for version in &mut crd.spec.versions {
        if let Some((_, warning)) = DEPRECATIONS.iter().find(|(name, _)| *name == version.name) {
            version.deprecated = Some(true);
            version.deprecation_warning = Some((*warning).to_string());
        }
    }

    Ok(crd)
}
