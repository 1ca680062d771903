//! Drift detection between the rendered desired graph and actual cluster
//! state.
//!
//! Comparison runs over normalized forms: server-populated metadata, the
//! status subtree and caller-tagged ignore paths are excluded on both
//! sides. Only fields the desired manifest declares are compared, so
//! server-side defaulting never reads as drift.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::crds::ObservabilityPlatform;
use crate::error::Result;
use crate::render::{DesiredObject, RendererRegistry};
use crate::store::StateStore;

/// Annotation holding a comma-separated list of additional ignore paths.
pub const IGNORE_ANNOTATION: &str = "observability.platform.io/ignore-drift";

/// Metadata fields excluded from every comparison.
const IGNORED_METADATA: [&str; 5] = [
    "resourceVersion",
    "generation",
    "uid",
    "creationTimestamp",
    "managedFields",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftType {
    Missing,
    Modified,
    Extra,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDrift {
    pub expected: Value,
    pub actual: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDrift {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub drift_type: DriftType,
    pub fields: BTreeMap<String, FieldDrift>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftReport {
    pub has_drift: bool,
    pub resources: Vec<ResourceDrift>,
    pub summary: String,
}

impl DriftReport {
    fn from_resources(resources: Vec<ResourceDrift>) -> Self {
        let missing = resources
            .iter()
            .filter(|r| r.drift_type == DriftType::Missing)
            .count();
        let modified = resources
            .iter()
            .filter(|r| r.drift_type == DriftType::Modified)
            .count();
        let extra = resources
            .iter()
            .filter(|r| r.drift_type == DriftType::Extra)
            .count();
        Self {
            has_drift: !resources.is_empty(),
            summary: format!("{missing} missing, {modified} modified, {extra} extra"),
            resources,
        }
    }
}

/// Strip ignored fields from a manifest, in place on a clone.
#[must_use]
pub fn normalize(manifest: &Value, extra_ignores: &[String]) -> Value {
    let mut out = manifest.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.remove("status");
    }
    if let Some(metadata) = out.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in IGNORED_METADATA {
            metadata.remove(field);
        }
        if let Some(annotations) = metadata
            .get_mut("annotations")
            .and_then(Value::as_object_mut)
        {
            annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
            annotations.remove(IGNORE_ANNOTATION);
        }
    }
    for path in extra_ignores {
        remove_path(&mut out, path);
    }
    out
}

fn remove_path(manifest: &mut Value, path: &str) {
    let mut segments = path.split('.').peekable();
    let mut current = manifest;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            if let Some(obj) = current.as_object_mut() {
                obj.remove(segment);
            }
            return;
        }
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
}

/// Ignore paths tagged on the actual object.
#[must_use]
pub fn tagged_ignores(actual: &Value) -> Vec<String> {
    actual["metadata"]["annotations"][IGNORE_ANNOTATION]
        .as_str()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Compare normalized desired and actual manifests.
///
/// The walk is desired-driven: a field absent from the desired manifest is
/// never drift. Arrays compare as whole values at their path, which keeps
/// the reported paths stable (`spec.ports`, not an index soup).
#[must_use]
pub fn compare(desired: &Value, actual: &Value) -> BTreeMap<String, FieldDrift> {
    let mut drifts = BTreeMap::new();
    walk(desired, actual, "", &mut drifts);
    drifts
}

fn walk(desired: &Value, actual: &Value, path: &str, drifts: &mut BTreeMap<String, FieldDrift>) {
    match desired {
        Value::Object(fields) => {
            for (key, desired_value) in fields {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match actual.get(key) {
                    Some(actual_value) => {
                        walk(desired_value, actual_value, &child_path, drifts);
                    }
                    None => {
                        drifts.insert(
                            child_path,
                            FieldDrift {
                                expected: desired_value.clone(),
                                actual: Value::Null,
                            },
                        );
                    }
                }
            }
        }
        _ => {
            if !values_equivalent(desired, actual) {
                drifts.insert(
                    path.to_string(),
                    FieldDrift {
                        expected: desired.clone(),
                        actual: actual.clone(),
                    },
                );
            }
        }
    }
}

/// Scalar equivalence tolerant of the server's number/string quantity
/// canonicalization (`1` vs `"1"`).
fn values_equivalent(desired: &Value, actual: &Value) -> bool {
    if desired == actual {
        return true;
    }
    match (desired, actual) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s == &n.to_string()
        }
        (Value::Array(d), Value::Array(a)) => {
            d.len() == a.len()
                && d.iter()
                    .zip(a.iter())
                    .all(|(dv, av)| compare(dv, av).is_empty() && values_equivalent_nested(dv, av))
        }
        _ => false,
    }
}

fn values_equivalent_nested(desired: &Value, actual: &Value) -> bool {
    match desired {
        Value::Object(_) => compare(desired, actual).is_empty(),
        _ => values_equivalent(desired, actual),
    }
}

/// Periodic per-platform drift scanner.
pub struct DriftDetector {
    store: Arc<dyn StateStore>,
    last_scan: DashMap<String, Instant>,
}

impl DriftDetector {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            last_scan: DashMap::new(),
        }
    }

    /// Whether a platform's scan interval has elapsed.
    #[must_use]
    pub fn due(&self, platform_key: &str, interval: Duration) -> bool {
        self.last_scan
            .get(platform_key)
            .is_none_or(|last| last.elapsed() >= interval)
    }

    pub fn mark_scanned(&self, platform_key: &str) {
        self.last_scan.insert(platform_key.to_string(), Instant::now());
    }

    /// Force the next `due` check to fire (webhook-scheduled scan).
    pub fn schedule_now(&self, platform_key: &str) {
        self.last_scan.remove(platform_key);
    }

    /// Compare every desired object against actual state and enumerate
    /// owned extras.
    pub async fn scan(
        &self,
        platform: &ObservabilityPlatform,
        desired: &[DesiredObject],
    ) -> Result<DriftReport> {
        let mut resources = Vec::new();
        let mut desired_keys = BTreeSet::new();

        for object in desired {
            desired_keys.insert(object.key());
            let actual = self
                .store
                .get(&object.api_version, &object.kind, &object.name, &object.namespace)
                .await?;

            match actual {
                None => resources.push(ResourceDrift {
                    kind: object.kind.clone(),
                    name: object.name.clone(),
                    namespace: object.namespace.clone(),
                    drift_type: DriftType::Missing,
                    fields: BTreeMap::new(),
                }),
                Some(actual) => {
                    let actual_value = serde_json::to_value(&actual)?;
                    let ignores = tagged_ignores(&actual_value);
                    let desired_norm = normalize(&object.manifest, &ignores);
                    let actual_norm = normalize(&actual_value, &ignores);
                    let fields = compare(&desired_norm, &actual_norm);
                    if !fields.is_empty() {
                        resources.push(ResourceDrift {
                            kind: object.kind.clone(),
                            name: object.name.clone(),
                            namespace: object.namespace.clone(),
                            drift_type: DriftType::Modified,
                            fields,
                        });
                    }
                }
            }
        }

        // Owned objects no longer in the desired graph are extras.
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        let selector = RendererRegistry::owned_selector(platform);
        for actual in self.store.list_owned(&namespace, &selector).await? {
            let kind = actual
                .types
                .as_ref()
                .map(|t| t.kind.clone())
                .unwrap_or_default();
            let key = format!("{}/{}/{}", kind, namespace, actual.name_any());
            if !desired_keys.contains(&key) {
                resources.push(ResourceDrift {
                    kind,
                    name: actual.name_any(),
                    namespace: namespace.clone(),
                    drift_type: DriftType::Extra,
                    fields: BTreeMap::new(),
                });
            }
        }

        let report = DriftReport::from_resources(resources);
        debug!(platform = %platform.name_any(), summary = %report.summary, "drift scan finished");
        Ok(report)
    }

    /// Converge drifted resources: apply missing/modified, delete extras.
    pub async fn remediate(
        &self,
        report: &DriftReport,
        desired: &[DesiredObject],
    ) -> Result<()> {
        for drift in &report.resources {
            match drift.drift_type {
                DriftType::Missing | DriftType::Modified => {
                    let Some(object) = desired.iter().find(|o| {
                        o.kind == drift.kind && o.name == drift.name && o.namespace == drift.namespace
                    }) else {
                        continue;
                    };
                    info!(kind = %drift.kind, name = %drift.name, "remediating drifted resource");
                    self.store.apply(&object.manifest).await?;
                }
                DriftType::Extra => {
                    info!(kind = %drift.kind, name = %drift.name, "deleting extra resource");
                    let api_version = match drift.kind.as_str() {
                        "Deployment" | "StatefulSet" => "apps/v1",
                        "PodDisruptionBudget" => "policy/v1",
                        "NetworkPolicy" => "networking.k8s.io/v1",
                        _ => "v1",
                    };
                    self.store
                        .delete(api_version, &drift.kind, &drift.name, &drift.namespace)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_strips_server_metadata_and_status() {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "svc",
                "namespace": "ns",
                "resourceVersion": "42",
                "uid": "u-1",
                "generation": 3,
                "creationTimestamp": "2025-01-01T00:00:00Z",
                "managedFields": [{}],
            },
            "status": { "loadBalancer": {} },
            "spec": { "ports": [{ "port": 9090 }] },
        });
        let normalized = normalize(&manifest, &[]);
        assert!(normalized.get("status").is_none());
        assert!(normalized["metadata"].get("resourceVersion").is_none());
        assert!(normalized["metadata"].get("uid").is_none());
        assert_eq!(normalized["metadata"]["name"], "svc");
        assert_eq!(normalized["spec"]["ports"][0]["port"], 9090);
    }

    #[test]
    fn identical_manifests_have_no_drift() {
        let manifest = json!({ "spec": { "replicas": 3, "ports": [{ "port": 80 }] } });
        assert!(compare(&manifest, &manifest).is_empty());
    }

    #[test]
    fn modified_scalar_reports_its_path() {
        let desired = json!({ "spec": { "replicas": 3 } });
        let actual = json!({ "spec": { "replicas": 5 } });
        let drifts = compare(&desired, &actual);
        let drift = drifts.get("spec.replicas").expect("path reported");
        assert_eq!(drift.expected, json!(3));
        assert_eq!(drift.actual, json!(5));
    }

    #[test]
    fn modified_port_reports_at_the_array_path() {
        let desired = json!({ "spec": { "ports": [{ "name": "http", "port": 9090 }] } });
        let actual = json!({ "spec": { "ports": [{ "name": "http", "port": 8080 }] } });
        let drifts = compare(&desired, &actual);
        assert!(drifts.contains_key("spec.ports"));
    }

    #[test]
    fn server_defaulted_extra_fields_are_not_drift() {
        let desired = json!({ "spec": { "type": "ClusterIP" } });
        let actual = json!({ "spec": { "type": "ClusterIP", "clusterIP": "10.0.0.1", "sessionAffinity": "None" } });
        assert!(compare(&desired, &actual).is_empty());
    }

    #[test]
    fn quantity_canonicalization_is_tolerated() {
        let desired = json!({ "spec": { "minAvailable": 1 } });
        let actual = json!({ "spec": { "minAvailable": "1" } });
        assert!(compare(&desired, &actual).is_empty());
    }

    #[test]
    fn tagged_ignore_paths_suppress_drift() {
        let desired = json!({
            "metadata": { "name": "x", "namespace": "ns" },
            "spec": { "replicas": 3 },
        });
        let actual = json!({
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "annotations": { IGNORE_ANNOTATION: "spec.replicas" },
            },
            "spec": { "replicas": 7 },
        });
        let ignores = tagged_ignores(&actual);
        assert_eq!(ignores, vec!["spec.replicas"]);
        let drifts = compare(&normalize(&desired, &ignores), &normalize(&actual, &ignores));
        assert!(drifts.is_empty());
    }

    #[test]
    fn ignored_metadata_never_appears_in_drift_paths() {
        let desired = json!({
            "metadata": { "name": "x" },
            "spec": { "replicas": 1 },
        });
        let actual = json!({
            "metadata": {
                "name": "x",
                "resourceVersion": "99",
                "uid": "u-2",
                "creationTimestamp": "2025-01-01T00:00:00Z",
            },
            "spec": { "replicas": 2 },
            "status": { "readyReplicas": 2 },
        });
        let drifts = compare(&normalize(&desired, &[]), &normalize(&actual, &[]));
        for path in drifts.keys() {
            assert!(!path.contains("resourceVersion"));
            assert!(!path.contains("uid"));
            assert!(!path.starts_with("status"));
        }
        assert!(drifts.contains_key("spec.replicas"));
    }

    #[test]
    fn missing_field_counts_as_drift() {
        let desired = json!({ "spec": { "selector": { "app": "x" } } });
        let actual = json!({ "spec": {} });
        let drifts = compare(&desired, &actual);
        assert!(drifts.contains_key("spec.selector"));
    }

    #[test]
    fn report_summary_counts_by_type() {
        let report = DriftReport::from_resources(vec![
            ResourceDrift {
                kind: "Service".into(),
                name: "a".into(),
                namespace: "ns".into(),
                drift_type: DriftType::Missing,
                fields: BTreeMap::new(),
            },
            ResourceDrift {
                kind: "Service".into(),
                name: "b".into(),
                namespace: "ns".into(),
                drift_type: DriftType::Extra,
                fields: BTreeMap::new(),
            },
        ]);
        assert!(report.has_drift);
        assert_eq!(report.summary, "1 missing, 0 modified, 1 extra");
    }
}
