//! Security posture enforcement and the sensitive-environment-variable
//! policy.
//!
//! Posture precedence: annotation > spec > operator default (baseline).

use lazy_static::lazy_static;
use regex::Regex;

use super::ValidationError;
use crate::crds::{
    ComponentKind, ComponentSpec, ObservabilityPlatform, SecurityContextSpec, SecurityPosture,
};

/// Annotation overriding the declared posture.
pub const POSTURE_ANNOTATION: &str = "observability.platform.io/security-posture";

/// Capabilities a baseline posture refuses outright.
const BASELINE_DENIED_CAPABILITIES: [&str; 7] = [
    "SYS_ADMIN",
    "NET_ADMIN",
    "SYS_PTRACE",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_BOOT",
    "BPF",
];

lazy_static! {
    static ref SENSITIVE_ENV_RE: Regex = Regex::new(
        r"(?i)(PASSWORD|SECRET|TOKEN|API_KEY|ACCESS_KEY|KEY|CERT|CREDENTIAL|PRIVATE)"
    )
    .expect("sensitive-name regex compiles");
}

/// Resolve the effective posture for a platform.
#[must_use]
pub fn effective_posture(platform: &ObservabilityPlatform) -> SecurityPosture {
    if let Some(value) = platform
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(POSTURE_ANNOTATION))
    {
        if let Some(posture) = SecurityPosture::parse(value) {
            return posture;
        }
    }
    platform
        .spec
        .security
        .as_ref()
        .and_then(|s| s.posture)
        .unwrap_or_default()
}

#[must_use]
pub fn validate(platform: &ObservabilityPlatform) -> Vec<ValidationError> {
    let posture = effective_posture(platform);
    let mut errors = Vec::new();

    for (kind, component) in platform.spec.components.iter() {
        if !component.enabled {
            continue;
        }
        errors.extend(validate_env_vars(kind, component));
        match posture {
            SecurityPosture::Restricted => {
                errors.extend(validate_restricted(kind, component));
            }
            SecurityPosture::Baseline => {
                errors.extend(validate_baseline(kind, component));
            }
            SecurityPosture::Privileged => {}
        }
    }

    if posture == SecurityPosture::Restricted {
        errors.extend(validate_network_policy(platform));
    }

    errors
}

/// Sensitive names must reference a secret key, never carry an inline
/// literal. Applies under every posture.
fn validate_env_vars(kind: ComponentKind, component: &ComponentSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for (index, var) in component.env.iter().enumerate() {
        let inline = var.value.as_deref().is_some_and(|v| !v.is_empty());
        if inline && SENSITIVE_ENV_RE.is_match(&var.name) {
            errors.push(ValidationError::security(
                format!("spec.components.{kind}.env[{index}].value"),
                format!(
                    "environment variable '{}' matches a sensitive pattern and must reference a secret key",
                    var.name
                ),
            ));
        }
    }
    errors
}

fn validate_restricted(kind: ComponentKind, component: &ComponentSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let base = format!("spec.components.{kind}.securityContext");
    let Some(ctx) = &component.security_context else {
        // Renderer defaults satisfy the restricted posture.
        return errors;
    };

    let mut fail = |field: &str, message: String| {
        errors.push(ValidationError::security(format!("{base}.{field}"), message));
    };

    if ctx.run_as_non_root == Some(false) {
        fail("runAsNonRoot", "restricted posture requires non-root".into());
    }
    if let Some(user) = ctx.run_as_user {
        if user < 1000 {
            fail("runAsUser", format!("user {user} is below the restricted minimum of 1000"));
        }
    }
    if let Some(group) = ctx.run_as_group {
        if group < 1000 {
            fail("runAsGroup", format!("group {group} is below the restricted minimum of 1000"));
        }
    }
    if let Some(fs_group) = ctx.fs_group {
        if fs_group < 1000 {
            fail("fsGroup", format!("fsGroup {fs_group} is below the restricted minimum of 1000"));
        }
    }
    if let Some(profile) = &ctx.seccomp_profile {
        if !matches!(profile.profile_type.as_str(), "RuntimeDefault" | "Localhost") {
            fail(
                "seccompProfile.type",
                format!("'{}' is not an allowed seccomp profile", profile.profile_type),
            );
        }
    }
    if ctx.allow_privilege_escalation == Some(true) {
        fail("allowPrivilegeEscalation", "privilege escalation is forbidden".into());
    }
    if ctx.read_only_root_filesystem == Some(false) {
        fail("readOnlyRootFilesystem", "a writable root filesystem is forbidden".into());
    }
    if ctx.privileged == Some(true) {
        fail("privileged", "privileged containers are forbidden".into());
    }
    errors.extend(host_namespace_errors(&base, ctx));
    if let Some(caps) = &ctx.capabilities {
        for cap in &caps.add {
            if cap != "NET_BIND_SERVICE" {
                errors.push(ValidationError::security(
                    format!("{base}.capabilities.add"),
                    format!("capability '{cap}' may not be added under the restricted posture"),
                ));
            }
        }
    }
    errors
}

fn validate_baseline(kind: ComponentKind, component: &ComponentSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let base = format!("spec.components.{kind}.securityContext");
    let Some(ctx) = &component.security_context else {
        return errors;
    };

    if ctx.privileged == Some(true) {
        errors.push(ValidationError::security(
            format!("{base}.privileged"),
            "privileged containers are forbidden under the baseline posture",
        ));
    }
    errors.extend(host_namespace_errors(&base, ctx));
    if let Some(caps) = &ctx.capabilities {
        for cap in &caps.add {
            if BASELINE_DENIED_CAPABILITIES.contains(&cap.as_str()) {
                errors.push(ValidationError::security(
                    format!("{base}.capabilities.add"),
                    format!("capability '{cap}' is denied under the baseline posture"),
                ));
            }
        }
    }
    errors
}

fn host_namespace_errors(base: &str, ctx: &SecurityContextSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for (field, value) in [
        ("hostNetwork", ctx.host_network),
        ("hostPID", ctx.host_pid),
        ("hostIPC", ctx.host_ipc),
    ] {
        if value == Some(true) {
            errors.push(ValidationError::security(
                format!("{base}.{field}"),
                format!("{field} is forbidden"),
            ));
        }
    }
    errors
}

/// The restricted posture demands a network policy with at least one
/// ingress and one egress rule that are not fully open.
fn validate_network_policy(platform: &ObservabilityPlatform) -> Vec<ValidationError> {
    let policy = platform
        .spec
        .security
        .as_ref()
        .and_then(|s| s.network_policy.as_ref());

    let Some(policy) = policy else {
        return vec![ValidationError::security(
            "spec.security.networkPolicy",
            "restricted posture requires a network policy",
        )];
    };

    let mut errors = Vec::new();
    if !policy.ingress.iter().any(|rule| !rule.is_fully_open()) {
        errors.push(ValidationError::security(
            "spec.security.networkPolicy.ingress",
            "at least one ingress rule must not be fully open",
        ));
    }
    if !policy.egress.iter().any(|rule| !rule.is_fully_open()) {
        errors.push(ValidationError::security(
            "spec.security.networkPolicy.egress",
            "at least one egress rule must not be fully open",
        ));
    }
    errors
}

/// Posture-improvement suggestions; never blocking.
#[must_use]
pub fn recommend(platform: &ObservabilityPlatform) -> Vec<String> {
    let mut suggestions = Vec::new();
    let posture = effective_posture(platform);

    if posture != SecurityPosture::Restricted {
        suggestions.push("adopt the 'restricted' security posture".to_string());
    }

    for (kind, component) in platform.spec.components.iter() {
        if !component.enabled {
            continue;
        }
        let ctx = component.security_context.as_ref();
        if ctx.is_none_or(|c| c.read_only_root_filesystem != Some(true))
            && posture != SecurityPosture::Restricted
        {
            suggestions.push(format!("enable read-only root filesystem for '{kind}'"));
        }
        if ctx.is_some_and(|c| c.capabilities.as_ref().is_some_and(|caps| !caps.add.is_empty())) {
            suggestions.push(format!("drop added capabilities from '{kind}'"));
        }
    }

    if platform
        .spec
        .security
        .as_ref()
        .and_then(|s| s.network_policy.as_ref())
        .is_none()
    {
        suggestions.push("define a network policy restricting ingress and egress".to_string());
    }

    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        CapabilitiesSpec, ComponentsSpec, EnvVarSource, EnvVarSpec, NetworkPolicySpec,
        NetworkRuleSpec, ObservabilityPlatformSpec, SecretKeySelector, SecuritySpec,
    };
    use std::collections::BTreeMap;

    fn platform_with(component: ComponentSpec) -> ObservabilityPlatform {
        ObservabilityPlatform::new(
            "demo",
            ObservabilityPlatformSpec {
                components: ComponentsSpec {
                    metrics: Some(component),
                    ..ComponentsSpec::default()
                },
                ..ObservabilityPlatformSpec::default()
            },
        )
    }

    fn enabled() -> ComponentSpec {
        ComponentSpec {
            enabled: true,
            version: "v2.48.0".to_string(),
            ..ComponentSpec::default()
        }
    }

    #[test]
    fn annotation_overrides_spec_posture() {
        let mut platform = platform_with(enabled());
        platform.spec.security = Some(SecuritySpec {
            posture: Some(SecurityPosture::Privileged),
            network_policy: None,
        });
        let mut annotations = BTreeMap::new();
        annotations.insert(POSTURE_ANNOTATION.to_string(), "restricted".to_string());
        platform.metadata.annotations = Some(annotations);

        assert_eq!(effective_posture(&platform), SecurityPosture::Restricted);
    }

    #[test]
    fn default_posture_is_baseline() {
        assert_eq!(
            effective_posture(&platform_with(enabled())),
            SecurityPosture::Baseline
        );
    }

    #[test]
    fn inline_sensitive_env_var_is_rejected_with_exact_path() {
        let mut component = enabled();
        component.env.push(EnvVarSpec {
            name: "ADMIN_PASSWORD".to_string(),
            value: Some("hunter2".to_string()),
            value_from: None,
        });
        let errors = validate(&platform_with(component));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "spec.components.metrics.env[0].value");
    }

    #[test]
    fn secret_referenced_sensitive_env_var_is_accepted() {
        let mut component = enabled();
        component.env.push(EnvVarSpec {
            name: "ADMIN_PASSWORD".to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: "metrics-admin".to_string(),
                    key: "password".to_string(),
                }),
            }),
        });
        assert!(validate(&platform_with(component)).is_empty());
    }

    #[test]
    fn innocuous_env_var_is_accepted() {
        let mut component = enabled();
        component.env.push(EnvVarSpec {
            name: "HTTP_PROXY".to_string(),
            value: Some("http://proxy:3128".to_string()),
            value_from: None,
        });
        assert!(validate(&platform_with(component)).is_empty());
    }

    fn restricted_platform(component: ComponentSpec) -> ObservabilityPlatform {
        let mut platform = platform_with(component);
        platform.spec.security = Some(SecuritySpec {
            posture: Some(SecurityPosture::Restricted),
            network_policy: Some(NetworkPolicySpec {
                ingress: vec![NetworkRuleSpec {
                    cidr: Some("10.0.0.0/8".to_string()),
                    ..NetworkRuleSpec::default()
                }],
                egress: vec![NetworkRuleSpec {
                    cidr: Some("10.0.0.0/8".to_string()),
                    ..NetworkRuleSpec::default()
                }],
            }),
        });
        platform
    }

    #[test]
    fn restricted_rejects_low_uid() {
        let mut component = enabled();
        component.security_context = Some(SecurityContextSpec {
            run_as_user: Some(100),
            ..SecurityContextSpec::default()
        });
        let errors = validate(&restricted_platform(component));
        assert!(errors.iter().any(|e| e.path.ends_with("runAsUser")));
    }

    #[test]
    fn restricted_allows_net_bind_service_only() {
        let mut component = enabled();
        component.security_context = Some(SecurityContextSpec {
            capabilities: Some(CapabilitiesSpec {
                add: vec!["NET_BIND_SERVICE".to_string()],
                drop: vec!["ALL".to_string()],
            }),
            ..SecurityContextSpec::default()
        });
        assert!(validate(&restricted_platform(component)).is_empty());

        let mut component = enabled();
        component.security_context = Some(SecurityContextSpec {
            capabilities: Some(CapabilitiesSpec {
                add: vec!["SYS_ADMIN".to_string()],
                drop: vec![],
            }),
            ..SecurityContextSpec::default()
        });
        assert!(!validate(&restricted_platform(component)).is_empty());
    }

    #[test]
    fn restricted_requires_network_policy() {
        let mut platform = platform_with(enabled());
        platform.spec.security = Some(SecuritySpec {
            posture: Some(SecurityPosture::Restricted),
            network_policy: None,
        });
        let errors = validate(&platform);
        assert!(errors.iter().any(|e| e.path == "spec.security.networkPolicy"));
    }

    #[test]
    fn restricted_rejects_fully_open_rules() {
        let mut platform = restricted_platform(enabled());
        platform
            .spec
            .security
            .as_mut()
            .unwrap()
            .network_policy
            .as_mut()
            .unwrap()
            .ingress = vec![NetworkRuleSpec::default()];
        let errors = validate(&platform);
        assert!(errors
            .iter()
            .any(|e| e.path == "spec.security.networkPolicy.ingress"));
    }

    #[test]
    fn baseline_rejects_privileged_and_host_namespaces() {
        let mut component = enabled();
        component.security_context = Some(SecurityContextSpec {
            privileged: Some(true),
            host_network: Some(true),
            ..SecurityContextSpec::default()
        });
        let errors = validate(&platform_with(component));
        assert!(errors.iter().any(|e| e.path.ends_with("privileged")));
        assert!(errors.iter().any(|e| e.path.ends_with("hostNetwork")));
    }

    #[test]
    fn baseline_denies_high_risk_capabilities() {
        let mut component = enabled();
        component.security_context = Some(SecurityContextSpec {
            capabilities: Some(CapabilitiesSpec {
                add: vec!["SYS_PTRACE".to_string()],
                drop: vec![],
            }),
            ..SecurityContextSpec::default()
        });
        assert!(!validate(&platform_with(component)).is_empty());
    }

    #[test]
    fn privileged_posture_permits_everything() {
        let mut component = enabled();
        component.security_context = Some(SecurityContextSpec {
            privileged: Some(true),
            host_network: Some(true),
            capabilities: Some(CapabilitiesSpec {
                add: vec!["SYS_ADMIN".to_string()],
                drop: vec![],
            }),
            ..SecurityContextSpec::default()
        });
        let mut platform = platform_with(component);
        platform.spec.security = Some(SecuritySpec {
            posture: Some(SecurityPosture::Privileged),
            network_policy: None,
        });
        assert!(validate(&platform).is_empty());
    }

    #[test]
    fn recommend_suggests_posture_and_network_policy() {
        let suggestions = recommend(&platform_with(enabled()));
        assert!(suggestions.iter().any(|s| s.contains("restricted")));
        assert!(suggestions.iter().any(|s| s.contains("network policy")));
        assert!(suggestions
            .iter()
            .any(|s| s.contains("read-only root filesystem")));
    }
}
