//! Rollback manager.
//!
//! Targets the newest revision for which the platform reached Ready in
//! this environment, consulting the persisted sync history. A rollback
//! failure escalates the platform to `Failed` at the caller and stops
//! further attempts.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use kube::ResourceExt;
use tracing::{info, warn};

use super::delivery::{DeliveryAdapter, DeliveryHandle};
use super::syncstate::SyncStateStore;
use crate::config::parse_duration;
use crate::crds::ObservabilityPlatform;
use crate::error::{Error, Result};

/// Annotation requesting an explicit rollback; any non-empty value is the
/// stated reason.
pub const ROLLBACK_REQUEST_ANNOTATION: &str = "observability.platform.io/rollback-requested";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub target_revision: String,
    pub reason: String,
    pub started_at: String,
}

pub struct RollbackManager {
    syncstate: Arc<SyncStateStore>,
}

impl RollbackManager {
    #[must_use]
    pub fn new(syncstate: Arc<SyncStateStore>) -> Self {
        Self { syncstate }
    }

    /// Automatic trigger: failed syncs within the configured window have
    /// reached the failure threshold.
    pub async fn should_rollback(
        &self,
        platform: &ObservabilityPlatform,
    ) -> Result<Option<String>> {
        let Some(rollback) = platform
            .spec
            .gitops
            .as_ref()
            .and_then(|g| g.rollback.as_ref())
            .filter(|r| r.enabled)
        else {
            return Ok(None);
        };

        // One rollback at a time.
        if platform
            .status
            .as_ref()
            .and_then(|s| s.gitops.as_ref())
            .and_then(|g| g.rollback.as_ref())
            .is_some_and(|r| r.in_progress)
        {
            return Ok(None);
        }

        if let Some(reason) = platform
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ROLLBACK_REQUEST_ANNOTATION))
            .filter(|reason| !reason.is_empty())
        {
            return Ok(Some(format!("requested by user: {reason}")));
        }

        let threshold = rollback.failure_threshold.unwrap_or(3).max(1) as usize;
        let window = rollback
            .window
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(std::time::Duration::from_secs(600));
        let cutoff = Utc::now()
            - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::seconds(600));

        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        let failures = self
            .syncstate
            .failures_since(&namespace, &platform.name_any(), cutoff)
            .await?;

        if failures >= threshold {
            Ok(Some(format!(
                "{failures} failed syncs within the rollback window (threshold {threshold})"
            )))
        } else {
            Ok(None)
        }
    }

    /// Point the delivery at the last known-good revision and trigger a
    /// sync. The caller records the rollback in status and escalates on
    /// error.
    pub async fn execute(
        &self,
        platform: &ObservabilityPlatform,
        adapter: &Arc<dyn DeliveryAdapter>,
        reason: &str,
    ) -> Result<RollbackOutcome> {
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        let name = platform.name_any();

        let Some(target_revision) = self
            .syncstate
            .last_ready_revision(&namespace, &name)
            .await?
        else {
            warn!(platform = %name, "rollback requested but no revision ever reached Ready");
            return Err(Error::ConfigError(format!(
                "platform '{name}' has no known-good revision to roll back to"
            )));
        };

        info!(platform = %name, revision = %target_revision, reason, "rolling back");

        let handle = DeliveryHandle::for_platform(adapter.provider(), platform);
        adapter
            .update_target_revision(&handle, &target_revision)
            .await?;
        adapter.trigger(&handle).await?;

        Ok(RollbackOutcome {
            target_revision,
            reason: reason.to_string(),
            started_at: Utc::now().to_rfc3339(),
        })
    }
}
