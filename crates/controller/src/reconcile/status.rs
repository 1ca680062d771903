//! Status construction helpers: bounded typed conditions and the managed
//! resource registry.

use chrono::Utc;

use crate::crds::{
    ConditionType, ManagedResource, ObservabilityPlatformStatus, PlatformCondition,
};
use crate::render::DesiredObject;

/// Upper bound on the condition list; oldest entries fall off first.
pub const MAX_CONDITIONS: usize = 8;

/// Set a condition, preserving the transition timestamp when the value is
/// unchanged.
pub fn set_condition(
    status: &mut ObservabilityPlatformStatus,
    condition_type: ConditionType,
    value: bool,
    reason: &str,
    message: &str,
) {
    let value_str = if value { "True" } else { "False" };

    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        let transitioned = existing.status != value_str;
        existing.status = value_str.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
        if transitioned {
            existing.last_transition_time = Utc::now().to_rfc3339();
        }
        return;
    }

    status.conditions.push(PlatformCondition {
        condition_type,
        status: value_str.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time: Utc::now().to_rfc3339(),
    });

    while status.conditions.len() > MAX_CONDITIONS {
        status.conditions.remove(0);
    }
}

#[must_use]
pub fn condition_is_true(status: &ObservabilityPlatformStatus, condition_type: ConditionType) -> bool {
    status
        .conditions
        .iter()
        .any(|c| c.condition_type == condition_type && c.status == "True")
}

/// Build a registry entry for an applied object.
#[must_use]
pub fn managed_resource(object: &DesiredObject, uid: Option<String>) -> ManagedResource {
    ManagedResource {
        kind: object.kind.clone(),
        name: object.name.clone(),
        namespace: object.namespace.clone(),
        uid,
    }
}
