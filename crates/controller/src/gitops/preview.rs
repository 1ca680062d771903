//! Preview environment lifecycle.
//!
//! A pull request against the tracked repository materializes a reduced
//! copy of the platform (`<name>-pr-<n>`) in `<namespace>-preview`; closing
//! the PR removes the platform and its namespace.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use tracing::info;

use crate::crds::{ComponentKind, ObservabilityPlatform, ResourceList};
use crate::error::Result;
use crate::store::StateStore;

pub const PREVIEW_LABEL: &str = "observability.platform.io/preview";
pub const PREVIEW_PR_LABEL: &str = "observability.platform.io/preview-pr";
pub const PREVIEW_SOURCE_LABEL: &str = "observability.platform.io/preview-source";

#[must_use]
pub fn preview_name(platform: &str, pr_number: u64) -> String {
    format!("{platform}-pr-{pr_number}")
}

#[must_use]
pub fn preview_namespace(namespace: &str) -> String {
    format!("{namespace}-preview")
}

pub struct PreviewManager {
    store: Arc<dyn StateStore>,
}

impl PreviewManager {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Create (or refresh) the preview platform for a pull request.
    pub async fn create(
        &self,
        source: &ObservabilityPlatform,
        pr_number: u64,
        source_branch: &str,
    ) -> Result<()> {
        let source_name = source.name_any();
        let source_namespace = source.namespace().unwrap_or_else(|| "default".to_string());
        let name = preview_name(&source_name, pr_number);
        let namespace = preview_namespace(&source_namespace);

        self.store.ensure_namespace(&namespace).await?;

        let mut preview = ObservabilityPlatform::new(&name, reduced_spec(source, source_branch));
        preview.metadata.namespace = Some(namespace.clone());
        let mut labels = BTreeMap::new();
        labels.insert(PREVIEW_LABEL.to_string(), "true".to_string());
        labels.insert(PREVIEW_PR_LABEL.to_string(), pr_number.to_string());
        labels.insert(PREVIEW_SOURCE_LABEL.to_string(), source_name.clone());
        preview.metadata.labels = Some(labels);

        self.store.create_platform(&preview).await?;
        info!(preview = %name, namespace = %namespace, pr = pr_number, "preview platform created");
        Ok(())
    }

    /// Remove the preview platform and its namespace.
    pub async fn delete(&self, source: &ObservabilityPlatform, pr_number: u64) -> Result<()> {
        let source_name = source.name_any();
        let source_namespace = source.namespace().unwrap_or_else(|| "default".to_string());
        let name = preview_name(&source_name, pr_number);
        let namespace = preview_namespace(&source_namespace);

        self.store.delete_platform(&name, &namespace).await?;
        self.store.delete_namespace(&namespace).await?;
        info!(preview = %name, namespace = %namespace, pr = pr_number, "preview platform deleted");
        Ok(())
    }
}

/// Copy the source spec with single replicas, quartered resources, the PR
/// branch tracked, and the recursive GitOps features switched off.
fn reduced_spec(
    source: &ObservabilityPlatform,
    source_branch: &str,
) -> crate::crds::ObservabilityPlatformSpec {
    let mut spec = source.spec.clone();

    for kind in ComponentKind::ALL {
        if let Some(component) = spec.components.get_mut(kind) {
            component.replicas = Some(1);
            if let Some(resources) = &mut component.resources {
                if let Some(requests) = &mut resources.requests {
                    reduce_list(requests);
                }
                if let Some(limits) = &mut resources.limits {
                    reduce_list(limits);
                }
            }
        }
    }

    if let Some(gitops) = &mut spec.gitops {
        gitops.repository.branch = Some(source_branch.to_string());
        gitops.repository.tag = None;
        gitops.promotion = None;
        gitops.preview_environments = None;
        gitops.rollback = None;
    }

    spec.high_availability = None;
    spec
}

fn reduce_list(list: &mut ResourceList) {
    if let Some(cpu) = &list.cpu {
        list.cpu = Some(quarter_quantity(cpu));
    }
    if let Some(memory) = &list.memory {
        list.memory = Some(quarter_quantity(memory));
    }
}

/// Quarter a resource quantity, stepping down a binary unit when the value
/// does not divide evenly.
#[must_use]
pub fn quarter_quantity(quantity: &str) -> String {
    let quantity = quantity.trim();

    if let Some(digits) = quantity.strip_suffix('m') {
        if let Ok(value) = digits.parse::<u64>() {
            return format!("{}m", (value / 4).max(1));
        }
    }

    const BINARY_UNITS: [(&str, Option<&str>); 4] =
        [("Ti", Some("Gi")), ("Gi", Some("Mi")), ("Mi", Some("Ki")), ("Ki", None)];
    for (unit, smaller) in BINARY_UNITS {
        if let Some(digits) = quantity.strip_suffix(unit) {
            if let Ok(value) = digits.parse::<u64>() {
                if value % 4 == 0 {
                    return format!("{}{unit}", value / 4);
                }
                if let Some(smaller) = smaller {
                    return format!("{}{smaller}", value * 256);
                }
                return format!("{}{unit}", (value / 4).max(1));
            }
        }
    }

    if let Ok(value) = quantity.parse::<u64>() {
        if value % 4 == 0 {
            return (value / 4).to_string();
        }
        return format!("{}m", value * 250);
    }

    quantity.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        ComponentSpec, ComponentsSpec, GitOpsSpec, GitRepositorySpec, ObservabilityPlatformSpec,
        PreviewEnvironmentsSpec, PromotionSpec, ResourcesSpec,
    };

    #[test]
    fn preview_naming_matches_convention() {
        assert_eq!(preview_name("demo", 42), "demo-pr-42");
        assert_eq!(preview_namespace("monitoring"), "monitoring-preview");
    }

    #[test]
    fn quarter_quantity_handles_common_shapes() {
        assert_eq!(quarter_quantity("500m"), "125m");
        assert_eq!(quarter_quantity("100m"), "25m");
        assert_eq!(quarter_quantity("2"), "500m");
        assert_eq!(quarter_quantity("4"), "1");
        assert_eq!(quarter_quantity("2Gi"), "512Mi");
        assert_eq!(quarter_quantity("4Gi"), "1Gi");
        assert_eq!(quarter_quantity("256Mi"), "64Mi");
        assert_eq!(quarter_quantity("weird"), "weird");
    }

    fn source() -> ObservabilityPlatform {
        let mut p = ObservabilityPlatform::new(
            "demo",
            ObservabilityPlatformSpec {
                components: ComponentsSpec {
                    metrics: Some(ComponentSpec {
                        enabled: true,
                        version: "v2.48.0".to_string(),
                        replicas: Some(3),
                        resources: Some(ResourcesSpec {
                            requests: Some(ResourceList {
                                cpu: Some("500m".to_string()),
                                memory: Some("2Gi".to_string()),
                            }),
                            limits: None,
                        }),
                        ..ComponentSpec::default()
                    }),
                    ..ComponentsSpec::default()
                },
                gitops: Some(GitOpsSpec {
                    enabled: true,
                    repository: GitRepositorySpec {
                        url: "https://github.com/acme/config".to_string(),
                        branch: Some("main".to_string()),
                        ..GitRepositorySpec::default()
                    },
                    promotion: Some(PromotionSpec::default()),
                    preview_environments: Some(PreviewEnvironmentsSpec { enabled: true }),
                    ..GitOpsSpec::default()
                }),
                ..ObservabilityPlatformSpec::default()
            },
        );
        p.metadata.namespace = Some("monitoring".to_string());
        p
    }

    #[test]
    fn reduced_spec_quarters_resources_and_tracks_the_pr_branch() {
        let spec = reduced_spec(&source(), "feature/new-alerts");
        let metrics = spec.components.metrics.as_ref().unwrap();
        assert_eq!(metrics.replicas, Some(1));
        let requests = metrics
            .resources
            .as_ref()
            .unwrap()
            .requests
            .as_ref()
            .unwrap();
        assert_eq!(requests.cpu.as_deref(), Some("125m"));
        assert_eq!(requests.memory.as_deref(), Some("512Mi"));

        let gitops = spec.gitops.as_ref().unwrap();
        assert_eq!(gitops.repository.branch.as_deref(), Some("feature/new-alerts"));
        assert!(gitops.promotion.is_none());
        assert!(gitops.preview_environments.is_none());
    }
}
