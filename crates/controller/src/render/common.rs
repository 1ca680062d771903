//! Shared manifest builders used by every component renderer.
//!
//! Rendering is pure: the same platform and component spec always produce
//! byte-identical manifests. All maps are `BTreeMap`-backed so iteration
//! order is lexicographic.

use std::collections::BTreeMap;

use kube::ResourceExt;
use serde_json::{json, Map, Value};

use crate::crds::{
    CapabilitiesSpec, ComponentKind, ComponentSpec, ObservabilityPlatform, SecurityContextSpec,
    SecurityPosture, SeccompProfileSpec,
};
use crate::validation::effective_posture;

/// Immutable inputs a renderer needs beyond the component spec itself.
pub struct RenderInput<'a> {
    pub platform: &'a ObservabilityPlatform,
    pub component: &'a ComponentSpec,
    pub kind: ComponentKind,
}

impl<'a> RenderInput<'a> {
    #[must_use]
    pub fn platform_name(&self) -> String {
        self.platform.name_any()
    }

    #[must_use]
    pub fn namespace(&self) -> String {
        self.platform.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Deterministic object name: `{platform}-{component}`.
    #[must_use]
    pub fn object_name(&self) -> String {
        format!("{}-{}", self.platform_name(), self.kind)
    }

    #[must_use]
    pub fn replicas(&self) -> i32 {
        self.component.replicas.unwrap_or(1).max(0)
    }

    #[must_use]
    pub fn posture(&self) -> SecurityPosture {
        effective_posture(self.platform)
    }
}

/// Full label set stamped on every rendered object.
#[must_use]
pub fn labels(input: &RenderInput<'_>) -> BTreeMap<String, String> {
    let mut labels = selector_labels(input);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "platform-controller".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/part-of".to_string(),
        "observability-platform".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        input.kind.to_string(),
    );
    labels
}

/// The stable subset used for workload selectors and service routing.
#[must_use]
pub fn selector_labels(input: &RenderInput<'_>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        input.object_name(),
    );
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        input.platform_name(),
    );
    labels
}

/// Controller owner reference pointing at the platform.
#[must_use]
pub fn owner_reference(platform: &ObservabilityPlatform) -> Value {
    json!([{
        "apiVersion": "observability.platform.io/v1",
        "kind": "ObservabilityPlatform",
        "name": platform.name_any(),
        "uid": platform.metadata.uid.clone().unwrap_or_default(),
        "controller": true,
        "blockOwnerDeletion": true,
    }])
}

/// Resource requirements exactly as declared; no implicit multipliers.
#[must_use]
pub fn resources(component: &ComponentSpec) -> Value {
    let Some(resources) = &component.resources else {
        return json!({});
    };
    let mut out = Map::new();
    if let Some(requests) = &resources.requests {
        out.insert("requests".to_string(), resource_list(requests));
    }
    if let Some(limits) = &resources.limits {
        out.insert("limits".to_string(), resource_list(limits));
    }
    Value::Object(out)
}

fn resource_list(list: &crate::crds::ResourceList) -> Value {
    let mut out = Map::new();
    if let Some(cpu) = &list.cpu {
        out.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(memory) = &list.memory {
        out.insert("memory".to_string(), json!(memory));
    }
    Value::Object(out)
}

/// Environment variables: inline values or secret references.
#[must_use]
pub fn env_vars(component: &ComponentSpec) -> Value {
    let entries: Vec<Value> = component
        .env
        .iter()
        .map(|var| {
            if let Some(source) = var
                .value_from
                .as_ref()
                .and_then(|from| from.secret_key_ref.as_ref())
            {
                json!({
                    "name": var.name,
                    "valueFrom": {
                        "secretKeyRef": { "name": source.name, "key": source.key }
                    }
                })
            } else {
                json!({ "name": var.name, "value": var.value.clone().unwrap_or_default() })
            }
        })
        .collect();
    Value::Array(entries)
}

/// Pod-level security context for the effective posture.
#[must_use]
pub fn pod_security_context(input: &RenderInput<'_>) -> Value {
    let override_ctx = input.component.security_context.as_ref();
    match input.posture() {
        SecurityPosture::Restricted => {
            let user = override_ctx.and_then(|c| c.run_as_user).unwrap_or(1000);
            let group = override_ctx.and_then(|c| c.run_as_group).unwrap_or(1000);
            let fs_group = override_ctx.and_then(|c| c.fs_group).unwrap_or(1000);
            let seccomp = override_ctx
                .and_then(|c| c.seccomp_profile.clone())
                .unwrap_or(SeccompProfileSpec {
                    profile_type: "RuntimeDefault".to_string(),
                    localhost_profile: None,
                });
            let mut profile = Map::new();
            profile.insert("type".to_string(), json!(seccomp.profile_type));
            if let Some(localhost) = seccomp.localhost_profile {
                profile.insert("localhostProfile".to_string(), json!(localhost));
            }
            json!({
                "runAsNonRoot": true,
                "runAsUser": user,
                "runAsGroup": group,
                "fsGroup": fs_group,
                "seccompProfile": Value::Object(profile),
            })
        }
        SecurityPosture::Baseline | SecurityPosture::Privileged => {
            let mut out = Map::new();
            if let Some(ctx) = override_ctx {
                insert_opt(&mut out, "runAsUser", ctx.run_as_user.map(Value::from));
                insert_opt(&mut out, "runAsGroup", ctx.run_as_group.map(Value::from));
                insert_opt(&mut out, "fsGroup", ctx.fs_group.map(Value::from));
                insert_opt(&mut out, "runAsNonRoot", ctx.run_as_non_root.map(Value::from));
            }
            Value::Object(out)
        }
    }
}

/// Container-level security context for the effective posture.
#[must_use]
pub fn container_security_context(input: &RenderInput<'_>) -> Value {
    let override_ctx = input.component.security_context.as_ref();
    match input.posture() {
        SecurityPosture::Restricted => {
            // Only NET_BIND_SERVICE may survive from a declared add list.
            let add: Vec<String> = override_ctx
                .and_then(|c| c.capabilities.as_ref())
                .map(|caps| {
                    caps.add
                        .iter()
                        .filter(|c| c.as_str() == "NET_BIND_SERVICE")
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            let mut capabilities = Map::new();
            capabilities.insert("drop".to_string(), json!(["ALL"]));
            if !add.is_empty() {
                capabilities.insert("add".to_string(), json!(add));
            }
            json!({
                "allowPrivilegeEscalation": false,
                "readOnlyRootFilesystem": true,
                "capabilities": Value::Object(capabilities),
            })
        }
        SecurityPosture::Baseline => {
            let mut out = Map::new();
            out.insert("allowPrivilegeEscalation".to_string(), json!(false));
            if let Some(ctx) = override_ctx {
                insert_opt(
                    &mut out,
                    "readOnlyRootFilesystem",
                    ctx.read_only_root_filesystem.map(Value::from),
                );
                if let Some(caps) = &ctx.capabilities {
                    out.insert("capabilities".to_string(), capabilities_value(caps));
                }
            }
            Value::Object(out)
        }
        SecurityPosture::Privileged => {
            let mut out = Map::new();
            if let Some(ctx) = override_ctx {
                insert_opt(&mut out, "privileged", ctx.privileged.map(Value::from));
                insert_opt(
                    &mut out,
                    "readOnlyRootFilesystem",
                    ctx.read_only_root_filesystem.map(Value::from),
                );
                insert_opt(
                    &mut out,
                    "allowPrivilegeEscalation",
                    ctx.allow_privilege_escalation.map(Value::from),
                );
                if let Some(caps) = &ctx.capabilities {
                    out.insert("capabilities".to_string(), capabilities_value(caps));
                }
            }
            Value::Object(out)
        }
    }
}

fn capabilities_value(caps: &CapabilitiesSpec) -> Value {
    let mut out = Map::new();
    if !caps.add.is_empty() {
        out.insert("add".to_string(), json!(caps.add));
    }
    if !caps.drop.is_empty() {
        out.insert("drop".to_string(), json!(caps.drop));
    }
    Value::Object(out)
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        map.insert(key.to_string(), value);
    }
}

/// Placement hints shared by every workload pod template.
#[must_use]
pub fn placement(input: &RenderInput<'_>) -> (Value, Value, Value) {
    let global = input.platform.spec.global.as_ref();

    let node_selector = global
        .map(|g| json!(g.node_selector))
        .unwrap_or_else(|| json!({}));

    let tolerations = global
        .map(|g| {
            let entries: Vec<Value> = g
                .tolerations
                .iter()
                .map(|t| {
                    let mut out = Map::new();
                    insert_opt(&mut out, "key", t.key.clone().map(Value::from));
                    insert_opt(&mut out, "operator", t.operator.clone().map(Value::from));
                    insert_opt(&mut out, "value", t.value.clone().map(Value::from));
                    insert_opt(&mut out, "effect", t.effect.clone().map(Value::from));
                    Value::Object(out)
                })
                .collect();
            Value::Array(entries)
        })
        .unwrap_or_else(|| json!([]));

    let anti_affinity_wanted = input
        .platform
        .spec
        .high_availability
        .as_ref()
        .is_some_and(|ha| ha.enabled && ha.anti_affinity.unwrap_or(true));
    let affinity = if anti_affinity_wanted && input.replicas() > 1 {
        json!({
            "podAntiAffinity": {
                "preferredDuringSchedulingIgnoredDuringExecution": [{
                    "weight": 100,
                    "podAffinityTerm": {
                        "labelSelector": { "matchLabels": selector_labels(input) },
                        "topologyKey": "kubernetes.io/hostname",
                    }
                }]
            }
        })
    } else {
        json!({})
    };

    (node_selector, tolerations, affinity)
}

/// ConfigMap carrying the rendered component configuration file.
#[must_use]
pub fn config_map(input: &RenderInput<'_>, filename: &str, contents: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": format!("{}-config", input.object_name()),
            "namespace": input.namespace(),
            "labels": labels(input),
            "ownerReferences": owner_reference(input.platform),
        },
        "data": { filename: contents },
    })
}

/// ClusterIP service fronting the component.
#[must_use]
pub fn service(input: &RenderInput<'_>, port: i32, port_name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": input.object_name(),
            "namespace": input.namespace(),
            "labels": labels(input),
            "ownerReferences": owner_reference(input.platform),
        },
        "spec": {
            "type": "ClusterIP",
            "selector": selector_labels(input),
            "ports": [{
                "name": port_name,
                "port": port,
                "targetPort": port,
                "protocol": "TCP",
            }],
        },
    })
}

/// Parameters for the shared workload builder.
pub struct WorkloadParams {
    pub image: String,
    pub port: i32,
    pub port_name: &'static str,
    pub config_filename: &'static str,
    pub config_mount_path: &'static str,
    pub args: Vec<String>,
    pub stateful: bool,
    pub data_mount_path: &'static str,
}

/// StatefulSet or Deployment for the component.
#[must_use]
pub fn workload(input: &RenderInput<'_>, params: &WorkloadParams) -> Value {
    let name = input.object_name();
    let namespace = input.namespace();
    let (node_selector, tolerations, affinity) = placement(input);

    let mut volume_mounts = vec![json!({
        "name": "config",
        "mountPath": params.config_mount_path,
        "readOnly": true,
    })];
    let storage = params.stateful.then(|| input.component.storage.clone()).flatten();
    if storage.is_some() {
        volume_mounts.push(json!({
            "name": "data",
            "mountPath": params.data_mount_path,
        }));
    }

    let container = json!({
        "name": input.kind.to_string(),
        "image": params.image,
        "args": params.args,
        "ports": [{ "name": params.port_name, "containerPort": params.port, "protocol": "TCP" }],
        "env": env_vars(input.component),
        "resources": resources(input.component),
        "securityContext": container_security_context(input),
        "volumeMounts": volume_mounts,
    });

    let pod_template = json!({
        "metadata": { "labels": labels(input) },
        "spec": {
            "securityContext": pod_security_context(input),
            "nodeSelector": node_selector,
            "tolerations": tolerations,
            "affinity": affinity,
            "containers": [container],
            "volumes": [{
                "name": "config",
                "configMap": { "name": format!("{name}-config") },
            }],
        },
    });

    if params.stateful {
        let mut spec = json!({
            "serviceName": name,
            "replicas": input.replicas(),
            "selector": { "matchLabels": selector_labels(input) },
            "template": pod_template,
        });
        if let Some(storage) = storage {
            let mut claim_spec = json!({
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": storage.size } },
            });
            if let Some(class) = storage.storage_class {
                claim_spec["storageClassName"] = json!(class);
            }
            spec["volumeClaimTemplates"] = json!([{
                "metadata": { "name": "data" },
                "spec": claim_spec,
            }]);
        }
        json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": labels(input),
                "ownerReferences": owner_reference(input.platform),
            },
            "spec": spec,
        })
    } else {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": labels(input),
                "ownerReferences": owner_reference(input.platform),
            },
            "spec": {
                "replicas": input.replicas(),
                "selector": { "matchLabels": selector_labels(input) },
                "template": pod_template,
            },
        })
    }
}

/// PodDisruptionBudget, rendered only when replicas > 1.
#[must_use]
pub fn pod_disruption_budget(input: &RenderInput<'_>) -> Option<Value> {
    let replicas = input.replicas();
    if replicas <= 1 {
        return None;
    }
    let min_available = std::cmp::max(1, replicas / 2);
    Some(json!({
        "apiVersion": "policy/v1",
        "kind": "PodDisruptionBudget",
        "metadata": {
            "name": format!("{}-pdb", input.object_name()),
            "namespace": input.namespace(),
            "labels": labels(input),
            "ownerReferences": owner_reference(input.platform),
        },
        "spec": {
            "minAvailable": min_available,
            "selector": { "matchLabels": selector_labels(input) },
        },
    }))
}
