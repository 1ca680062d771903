//! End-to-end render-graph tests: the fresh-install object graph and the
//! render → apply → drift-scan pipeline over an in-memory state store.

mod common;

use std::sync::Arc;

use common::InMemoryStore;
use controller::crds::{
    ComponentSpec, ComponentsSpec, DriftAction, ObservabilityPlatform, ObservabilityPlatformSpec,
    SecurityPosture, SecuritySpec,
};
use controller::gitops::drift::{DriftDetector, DriftType};
use controller::render::RendererRegistry;
use controller::store::StateStore;
use controller::validation::apply_defaults;
use serde_json::json;

fn fresh_install_platform() -> ObservabilityPlatform {
    let mut platform = ObservabilityPlatform::new(
        "demo",
        ObservabilityPlatformSpec {
            components: ComponentsSpec {
                metrics: Some(ComponentSpec {
                    enabled: true,
                    version: "v1.0.0".to_string(),
                    replicas: Some(3),
                    ..ComponentSpec::default()
                }),
                ..ComponentsSpec::default()
            },
            ..ObservabilityPlatformSpec::default()
        },
    );
    platform.metadata.namespace = Some("monitoring".to_string());
    platform.metadata.uid = Some("uid-demo".to_string());
    apply_defaults(&mut platform.spec);
    platform
}

#[test]
fn fresh_install_renders_four_objects_in_apply_order() {
    let registry = RendererRegistry::with_builtins().unwrap();
    let objects = registry.render_platform(&fresh_install_platform()).unwrap();

    let kinds: Vec<&str> = objects.iter().map(|o| o.kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec!["ConfigMap", "Service", "StatefulSet", "PodDisruptionBudget"]
    );

    // PDB: minAvailable = max(1, 3/2) = 1.
    assert_eq!(objects[3].manifest["spec"]["minAvailable"], 1);
}

#[test]
fn every_object_carries_the_standard_labels_and_owner_reference() {
    let registry = RendererRegistry::with_builtins().unwrap();
    let objects = registry.render_platform(&fresh_install_platform()).unwrap();

    for object in &objects {
        let labels = &object.manifest["metadata"]["labels"];
        assert_eq!(labels["app.kubernetes.io/instance"], "demo", "{}", object.key());
        assert_eq!(labels["app.kubernetes.io/managed-by"], "platform-controller");
        assert_eq!(labels["app.kubernetes.io/part-of"], "observability-platform");
        assert_eq!(labels["app.kubernetes.io/component"], "metrics");

        let owner = &object.manifest["metadata"]["ownerReferences"][0];
        assert_eq!(owner["kind"], "ObservabilityPlatform");
        assert_eq!(owner["name"], "demo");
        assert_eq!(owner["uid"], "uid-demo");
        assert_eq!(owner["controller"], true);
    }
}

#[test]
fn restricted_posture_hardens_the_workload() {
    let mut platform = fresh_install_platform();
    platform.spec.security = Some(SecuritySpec {
        posture: Some(SecurityPosture::Restricted),
        network_policy: None,
    });

    let registry = RendererRegistry::with_builtins().unwrap();
    let objects = registry.render_platform(&platform).unwrap();
    let workload = objects.iter().find(|o| o.kind == "StatefulSet").unwrap();

    let pod = &workload.manifest["spec"]["template"]["spec"];
    assert_eq!(pod["securityContext"]["runAsNonRoot"], true);
    assert_eq!(pod["securityContext"]["runAsUser"], 1000);
    assert_eq!(pod["securityContext"]["seccompProfile"]["type"], "RuntimeDefault");

    let container = &pod["containers"][0];
    assert_eq!(container["securityContext"]["readOnlyRootFilesystem"], true);
    assert_eq!(container["securityContext"]["allowPrivilegeEscalation"], false);
    assert_eq!(container["securityContext"]["capabilities"]["drop"][0], "ALL");
}

#[test]
fn declared_resources_pass_through_unmodified() {
    let mut platform = fresh_install_platform();
    platform.spec.components.metrics.as_mut().unwrap().resources =
        Some(serde_json::from_value(json!({
            "requests": { "cpu": "500m", "memory": "2Gi" },
            "limits": { "cpu": "1", "memory": "4Gi" },
        })).unwrap());

    let registry = RendererRegistry::with_builtins().unwrap();
    let objects = registry.render_platform(&platform).unwrap();
    let workload = objects.iter().find(|o| o.kind == "StatefulSet").unwrap();
    let resources = &workload.manifest["spec"]["template"]["spec"]["containers"][0]["resources"];
    assert_eq!(resources["requests"]["cpu"], "500m");
    assert_eq!(resources["requests"]["memory"], "2Gi");
    assert_eq!(resources["limits"]["cpu"], "1");
    assert_eq!(resources["limits"]["memory"], "4Gi");
}

#[tokio::test]
async fn render_apply_then_scan_reports_no_drift() {
    let store = Arc::new(InMemoryStore::default());
    let registry = RendererRegistry::with_builtins().unwrap();
    let platform = fresh_install_platform();
    let desired = registry.render_platform(&platform).unwrap();

    for object in &desired {
        store.apply(&object.manifest).await.unwrap();
    }

    let detector = DriftDetector::new(store.clone());
    let report = detector.scan(&platform, &desired).await.unwrap();
    assert!(!report.has_drift, "unexpected drift: {}", report.summary);
}

#[tokio::test]
async fn external_port_mutation_is_detected_and_remediated() {
    let store = Arc::new(InMemoryStore::default());
    let registry = RendererRegistry::with_builtins().unwrap();
    let platform = fresh_install_platform();
    let desired = registry.render_platform(&platform).unwrap();

    for object in &desired {
        store.apply(&object.manifest).await.unwrap();
    }

    // Mutate the service port out-of-band.
    let service = desired.iter().find(|o| o.kind == "Service").unwrap();
    let mut mutated = service.manifest.clone();
    mutated["spec"]["ports"][0]["port"] = json!(8080);
    store.apply(&mutated).await.unwrap();

    let detector = DriftDetector::new(store.clone());
    let report = detector.scan(&platform, &desired).await.unwrap();
    assert!(report.has_drift);
    let drifted = report
        .resources
        .iter()
        .find(|r| r.kind == "Service")
        .expect("service drift reported");
    assert_eq!(drifted.drift_type, DriftType::Modified);
    assert!(drifted.fields.keys().any(|path| path.starts_with("spec.ports")));

    // Remediation restores the declared port; the next scan is clean.
    detector.remediate(&report, &desired).await.unwrap();
    let after = detector.scan(&platform, &desired).await.unwrap();
    assert!(!after.has_drift, "drift after remediation: {}", after.summary);
}

#[tokio::test]
async fn missing_and_extra_objects_are_classified() {
    let store = Arc::new(InMemoryStore::default());
    let registry = RendererRegistry::with_builtins().unwrap();
    let platform = fresh_install_platform();
    let desired = registry.render_platform(&platform).unwrap();

    // Apply everything except the service, plus one unexpected owned
    // object.
    for object in desired.iter().filter(|o| o.kind != "Service") {
        store.apply(&object.manifest).await.unwrap();
    }
    let stray = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": "demo-orphan",
            "namespace": "monitoring",
            "labels": {
                "app.kubernetes.io/instance": "demo",
                "app.kubernetes.io/managed-by": "platform-controller",
            },
        },
        "data": {},
    });
    store.apply(&stray).await.unwrap();

    let detector = DriftDetector::new(store.clone());
    let report = detector.scan(&platform, &desired).await.unwrap();

    let missing: Vec<&str> = report
        .resources
        .iter()
        .filter(|r| r.drift_type == DriftType::Missing)
        .map(|r| r.kind.as_str())
        .collect();
    assert_eq!(missing, vec!["Service"]);

    let extras: Vec<&str> = report
        .resources
        .iter()
        .filter(|r| r.drift_type == DriftType::Extra)
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(extras, vec!["demo-orphan"]);
}
