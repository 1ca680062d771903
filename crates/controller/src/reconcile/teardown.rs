//! Finalizer-managed teardown.
//!
//! Delivery objects are suspended first, then owned children are deleted
//! in reverse dependency order, then the GitOps objects and sync history
//! are removed. Only after everything is gone does the finalizer come off
//! and the record get erased. Idempotent throughout; any failure requeues.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::Context;
use crate::crds::ObservabilityPlatform;
use crate::error::Result;
use crate::store::api_version_for_kind;

/// Cleanup half of the finalizer split.
#[instrument(skip(ctx), fields(platform = %platform.name_any()))]
pub async fn cleanup_platform(
    platform: Arc<ObservabilityPlatform>,
    ctx: &Context,
) -> Result<Action> {
    info!("tearing down platform");

    // Stop delivery-driven mutations before deleting what they manage.
    if let Err(e) = ctx.gitops.suspend(&platform).await {
        warn!(error = %e, "failed to suspend delivery, continuing teardown");
    }

    let recorded = platform
        .status
        .as_ref()
        .map(|s| s.resources.clone())
        .unwrap_or_default();

    for resource in recorded.iter().rev() {
        ctx.store
            .delete(
                api_version_for_kind(&resource.kind),
                &resource.kind,
                &resource.name,
                &resource.namespace,
            )
            .await?;
        info!(kind = %resource.kind, name = %resource.name, "deleted child resource");
    }

    ctx.gitops.uninstall(&platform).await?;

    ctx.store
        .record_event(&platform, false, "Teardown", "platform resources removed")
        .await;
    Ok(Action::await_change())
}
