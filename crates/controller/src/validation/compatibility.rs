//! Component version compatibility matrix.
//!
//! Two layers: each component version must fall inside a supported series,
//! and cross-component rules must hold between the declared versions.

use lazy_static::lazy_static;
use std::collections::BTreeMap;

use super::ValidationError;
use crate::crds::{ComponentKind, ObservabilityPlatform};

/// Inclusive (major, minor) range of a supported series.
#[derive(Debug, Clone, Copy)]
struct SeriesRange {
    min: (u32, u32),
    max: (u32, u32),
}

/// Rule: when `subject` runs at or above `subject_min`, `object` must run
/// at or above `object_min`.
struct CrossRule {
    subject: ComponentKind,
    subject_min: (u32, u32),
    object: ComponentKind,
    object_min: (u32, u32),
}

lazy_static! {
    static ref SUPPORTED: BTreeMap<ComponentKind, Vec<SeriesRange>> = {
        let mut m = BTreeMap::new();
        m.insert(
            ComponentKind::Metrics,
            vec![
                SeriesRange { min: (2, 45), max: (2, 53) },
                SeriesRange { min: (3, 0), max: (3, 4) },
            ],
        );
        m.insert(
            ComponentKind::Dashboards,
            vec![SeriesRange { min: (9, 0), max: (11, 4) }],
        );
        m.insert(
            ComponentKind::Logs,
            vec![
                SeriesRange { min: (2, 8), max: (2, 9) },
                SeriesRange { min: (3, 0), max: (3, 3) },
            ],
        );
        m.insert(
            ComponentKind::Traces,
            vec![SeriesRange { min: (1, 50), max: (1, 65) }],
        );
        m
    };
    static ref CROSS_RULES: Vec<CrossRule> = vec![
        // Metrics v3 changed the query API; older dashboards cannot read it.
        CrossRule {
            subject: ComponentKind::Metrics,
            subject_min: (3, 0),
            object: ComponentKind::Dashboards,
            object_min: (10, 0),
        },
        // Log store v3 requires a dashboard server that speaks its schema.
        CrossRule {
            subject: ComponentKind::Logs,
            subject_min: (3, 0),
            object: ComponentKind::Dashboards,
            object_min: (10, 2),
        },
    ];
}

/// Parse `v2.48.0`, `2.48`, `10.2.0` into (major, minor).
#[must_use]
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let trimmed = version.trim().trim_start_matches('v');
    let core = trimmed
        .split_once(['-', '+'])
        .map_or(trimmed, |(core, _)| core);
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

#[must_use]
pub fn validate(platform: &ObservabilityPlatform) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut versions: BTreeMap<ComponentKind, (u32, u32)> = BTreeMap::new();

    for (kind, component) in platform.spec.components.iter() {
        if !component.enabled || component.version.trim().is_empty() {
            continue;
        }
        let path = format!("spec.components.{kind}.version");
        let Some(parsed) = parse_version(&component.version) else {
            // Structural validation already rejected the malformed string.
            continue;
        };
        versions.insert(kind, parsed);

        let Some(ranges) = SUPPORTED.get(&kind) else {
            continue;
        };
        if !ranges
            .iter()
            .any(|range| parsed >= range.min && parsed <= range.max)
        {
            errors.push(ValidationError::compatibility(
                path,
                format!(
                    "version '{}' of '{kind}' is outside the supported matrix",
                    component.version
                ),
            ));
        }
    }

    for rule in CROSS_RULES.iter() {
        let (Some(&subject), Some(&object)) =
            (versions.get(&rule.subject), versions.get(&rule.object))
        else {
            continue;
        };
        if subject >= rule.subject_min && object < rule.object_min {
            errors.push(ValidationError::compatibility(
                format!("spec.components.{}.version", rule.object),
                format!(
                    "'{}' {}.{} requires '{}' at or above {}.{}",
                    rule.subject,
                    subject.0,
                    subject.1,
                    rule.object,
                    rule.object_min.0,
                    rule.object_min.1
                ),
            ));
        }
    }

    errors
}
