//! Spec validation, security-posture enforcement, version compatibility
//! and defaulting. Every rule runs on every spec mutation; the reconciler
//! turns failures into terminal `InvalidSpec` / `IncompatibleVersions`
//! conditions.

pub mod compatibility;
pub mod defaults;
pub mod security;
pub mod structural;

use std::fmt;

use crate::crds::ObservabilityPlatform;
use crate::error::Error;

pub use defaults::apply_defaults;
pub use security::{effective_posture, recommend};

/// Which validation class produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationClass {
    Structural,
    Security,
    Compatibility,
}

/// One validation failure, anchored to a spec field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub class: ValidationClass,
    pub path: String,
    pub message: String,
}

impl ValidationError {
    #[must_use]
    pub fn structural(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ValidationClass::Structural,
            path: path.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn security(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ValidationClass::Security,
            path: path.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn compatibility(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ValidationClass::Compatibility,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Run all three validation classes and collect every failure.
#[must_use]
pub fn collect_errors(platform: &ObservabilityPlatform) -> Vec<ValidationError> {
    let mut errors = structural::validate(platform);
    errors.extend(security::validate(platform));
    errors.extend(compatibility::validate(platform));
    errors
}

/// Validate a platform, mapping failures onto the engine error kinds.
///
/// A compatibility failure wins the error classification; anything else is
/// `InvalidSpec`. Both are terminal until the spec changes.
pub fn validate_platform(platform: &ObservabilityPlatform) -> Result<(), Error> {
    let errors = collect_errors(platform);
    if errors.is_empty() {
        return Ok(());
    }

    let joined = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");

    if errors
        .iter()
        .all(|e| e.class == ValidationClass::Compatibility)
    {
        Err(Error::IncompatibleVersions(joined))
    } else {
        Err(Error::InvalidSpec(joined))
    }
}
