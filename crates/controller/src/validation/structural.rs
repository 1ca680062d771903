//! Structural validation: required fields, well-formed values, unique and
//! acyclic promotion environments.

use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use regex::Regex;

use super::ValidationError;
use crate::crds::{ObservabilityPlatform, PromotionSpec};

lazy_static! {
    static ref VERSION_RE: Regex = Regex::new(r"^v?\d+\.\d+(\.\d+)?([-+][0-9A-Za-z.-]+)?$")
        .expect("version regex compiles");
    static ref QUANTITY_RE: Regex =
        Regex::new(r"^\d+(\.\d+)?(Ki|Mi|Gi|Ti|Pi|m|k|M|G|T)?$").expect("quantity regex compiles");
    static ref DNS1123_RE: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("dns-1123 regex compiles");
}

#[must_use]
pub fn validate(platform: &ObservabilityPlatform) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let spec = &platform.spec;

    for (kind, component) in spec.components.iter() {
        if !component.enabled {
            continue;
        }
        let base = format!("spec.components.{kind}");

        if component.version.trim().is_empty() {
            errors.push(ValidationError::structural(
                format!("{base}.version"),
                "version is required for an enabled component",
            ));
        } else if !VERSION_RE.is_match(component.version.trim()) {
            errors.push(ValidationError::structural(
                format!("{base}.version"),
                format!("'{}' is not a well-formed version", component.version),
            ));
        }

        if let Some(replicas) = component.replicas {
            if replicas < 0 {
                errors.push(ValidationError::structural(
                    format!("{base}.replicas"),
                    "replicas must not be negative",
                ));
            }
        }

        if let Some(storage) = &component.storage {
            if !QUANTITY_RE.is_match(storage.size.trim()) {
                errors.push(ValidationError::structural(
                    format!("{base}.storage.size"),
                    format!("'{}' is not a valid quantity", storage.size),
                ));
            }
            if let Some(class) = &storage.storage_class {
                if !DNS1123_RE.is_match(class) {
                    errors.push(ValidationError::structural(
                        format!("{base}.storage.storageClass"),
                        format!("'{class}' is not a valid storage class name"),
                    ));
                }
            }
        }
    }

    if let Some(gitops) = &spec.gitops {
        if gitops.enabled {
            let url = gitops.repository.url.trim();
            if url.is_empty() {
                errors.push(ValidationError::structural(
                    "spec.gitops.repository.url",
                    "repository URL is required when GitOps is enabled",
                ));
            } else if !is_parseable_repo_url(url) {
                errors.push(ValidationError::structural(
                    "spec.gitops.repository.url",
                    format!("'{url}' is not a parseable repository URL"),
                ));
            }

            if let Some(promotion) = &gitops.promotion {
                errors.extend(validate_promotion(promotion));
            }
        }
    }

    errors
}

fn is_parseable_repo_url(url: &str) -> bool {
    url.starts_with("https://")
        || url.starts_with("http://")
        || url.starts_with("ssh://")
        || (url.starts_with("git@") && url.contains(':'))
}

fn validate_promotion(promotion: &PromotionSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut seen = BTreeSet::new();
    for env in &promotion.environments {
        if !seen.insert(env.name.as_str()) {
            errors.push(ValidationError::structural(
                "spec.gitops.promotion.environments",
                format!("environment name '{}' is declared more than once", env.name),
            ));
        }
    }

    for env in &promotion.environments {
        for dep in &env.depends_on {
            if !seen.contains(dep.as_str()) {
                errors.push(ValidationError::structural(
                    format!("spec.gitops.promotion.environments[{}].dependsOn", env.name),
                    format!("'{dep}' is not a declared environment"),
                ));
            }
        }
    }

    if let Some(cycle) = find_cycle(&promotion.environments) {
        errors.push(ValidationError::structural(
            "spec.gitops.promotion.environments",
            format!("dependsOn cycle detected through '{cycle}'"),
        ));
    }

    errors
}

/// Depth-first cycle detection over the dependsOn graph.
fn find_cycle(environments: &[crate::crds::EnvironmentSpec]) -> Option<String> {
    let graph: BTreeMap<&str, Vec<&str>> = environments
        .iter()
        .map(|env| {
            (
                env.name.as_str(),
                env.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        graph: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut BTreeMap<&'a str, Mark>,
    ) -> Option<&'a str> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(node),
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        for &dep in graph.get(node).into_iter().flatten() {
            if graph.contains_key(dep) {
                if let Some(cycle) = visit(dep, graph, marks) {
                    return Some(cycle);
                }
            }
        }
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    for node in graph.keys() {
        if let Some(cycle) = visit(node, &graph, &mut marks) {
            return Some(cycle.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        ComponentSpec, ComponentsSpec, EnvironmentSpec, GitOpsSpec, GitRepositorySpec,
        ObservabilityPlatformSpec, StorageSpec,
    };

    fn platform(spec: ObservabilityPlatformSpec) -> ObservabilityPlatform {
        ObservabilityPlatform::new("demo", spec)
    }

    fn enabled_metrics(version: &str) -> ComponentsSpec {
        ComponentsSpec {
            metrics: Some(ComponentSpec {
                enabled: true,
                version: version.to_string(),
                ..ComponentSpec::default()
            }),
            ..ComponentsSpec::default()
        }
    }

    #[test]
    fn valid_platform_passes() {
        let p = platform(ObservabilityPlatformSpec {
            components: enabled_metrics("v2.48.0"),
            ..ObservabilityPlatformSpec::default()
        });
        assert!(validate(&p).is_empty());
    }

    #[test]
    fn enabled_component_requires_version() {
        let p = platform(ObservabilityPlatformSpec {
            components: enabled_metrics(""),
            ..ObservabilityPlatformSpec::default()
        });
        let errors = validate(&p);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "spec.components.metrics.version");
    }

    #[test]
    fn disabled_component_skips_checks() {
        let mut components = enabled_metrics("");
        components.metrics.as_mut().unwrap().enabled = false;
        let p = platform(ObservabilityPlatformSpec {
            components,
            ..ObservabilityPlatformSpec::default()
        });
        assert!(validate(&p).is_empty());
    }

    #[test]
    fn malformed_version_is_rejected() {
        let p = platform(ObservabilityPlatformSpec {
            components: enabled_metrics("latest"),
            ..ObservabilityPlatformSpec::default()
        });
        assert!(!validate(&p).is_empty());
    }

    #[test]
    fn storage_size_must_be_a_quantity() {
        let mut components = enabled_metrics("v2.48.0");
        components.metrics.as_mut().unwrap().storage = Some(StorageSpec {
            size: "lots".to_string(),
            storage_class: None,
        });
        let p = platform(ObservabilityPlatformSpec {
            components,
            ..ObservabilityPlatformSpec::default()
        });
        let errors = validate(&p);
        assert!(errors.iter().any(|e| e.path.ends_with("storage.size")));
    }

    #[test]
    fn gitops_requires_parseable_url() {
        let p = platform(ObservabilityPlatformSpec {
            components: enabled_metrics("v2.48.0"),
            gitops: Some(GitOpsSpec {
                enabled: true,
                repository: GitRepositorySpec {
                    url: "not a url".to_string(),
                    ..GitRepositorySpec::default()
                },
                ..GitOpsSpec::default()
            }),
            ..ObservabilityPlatformSpec::default()
        });
        let errors = validate(&p);
        assert!(errors.iter().any(|e| e.path == "spec.gitops.repository.url"));
    }

    fn env(name: &str, deps: &[&str]) -> EnvironmentSpec {
        EnvironmentSpec {
            name: name.to_string(),
            depends_on: deps.iter().map(ToString::to_string).collect(),
            ..EnvironmentSpec::default()
        }
    }

    #[test]
    fn duplicate_environment_names_are_rejected() {
        let errors = validate_promotion(&PromotionSpec {
            environments: vec![env("dev", &[]), env("dev", &[])],
            ..PromotionSpec::default()
        });
        assert!(errors.iter().any(|e| e.message.contains("more than once")));
    }

    #[test]
    fn depends_on_cycles_are_rejected() {
        let errors = validate_promotion(&PromotionSpec {
            environments: vec![
                env("dev", &["prod"]),
                env("staging", &["dev"]),
                env("prod", &["staging"]),
            ],
            ..PromotionSpec::default()
        });
        assert!(errors.iter().any(|e| e.message.contains("cycle")));
    }

    #[test]
    fn linear_depends_on_chain_is_accepted() {
        let errors = validate_promotion(&PromotionSpec {
            environments: vec![
                env("dev", &[]),
                env("staging", &["dev"]),
                env("prod", &["staging"]),
            ],
            ..PromotionSpec::default()
        });
        assert!(errors.is_empty());
    }
}
