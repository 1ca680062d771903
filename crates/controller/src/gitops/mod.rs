//! GitOps coordinator: provider-agnostic orchestration of delivery
//! objects, webhook ingest, drift detection, promotion and rollback.

pub mod delivery;
pub mod drift;
pub mod preview;
pub mod promotion;
pub mod rollback;
pub mod syncstate;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use dashmap::DashMap;
use gitsync::{GitAuth, GitSync, RepoSpec};
use kube::ResourceExt;
use regex::Regex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::parse_duration;
use crate::crds::{
    DriftAction, DriftStatus, GateSpec, GitOpsSpec, GitOpsStatus, ObservabilityPlatform,
    PlatformPhase, RollbackStatus,
};
use crate::error::{Error, Result};
use crate::render::DesiredObject;
use crate::store::StateStore;

use delivery::{DeliveryAdapter, DeliveryHandle, DeliveryState};
use drift::{DriftDetector, DriftReport};
use preview::PreviewManager;
use promotion::{
    ApprovalSource, GateEvaluator, PromotionPlanner, PromotionRecord, TestStatusProvider,
};
use rollback::RollbackManager;
use syncstate::{SyncRecord, SyncStateStore, SyncStatus};
use webhook::server::{header_resolver, IngestOutcome, WebhookIngest};
use webhook::{providers, signature, WebhookEvent, WebhookEventType, WebhookProvider};

/// Annotation nudged to wake the reconciler after webhook activity.
pub const RESYNC_ANNOTATION: &str = "observability.platform.io/resync-ts";

/// Secret keys consulted for the per-repository webhook secret.
const WEBHOOK_SECRET_KEYS: [&str; 2] = ["webhookSecret", "token"];

const DEFAULT_DRIFT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

/// What one GitOps reconcile pass produced, folded into platform status by
/// the reconciler.
#[derive(Debug, Clone, Default)]
pub struct GitOpsOutcome {
    pub status: GitOpsStatus,
    pub drift_report: Option<DriftReport>,
    /// A rollback was attempted and failed; the platform escalates to
    /// `Failed` and stops retrying.
    pub rollback_failed: bool,
}

pub struct GitOpsCoordinator {
    store: Arc<dyn StateStore>,
    adapters: Vec<Arc<dyn DeliveryAdapter>>,
    pub syncstate: Arc<SyncStateStore>,
    pub drift: DriftDetector,
    pub rollback: RollbackManager,
    pub promotion: PromotionPlanner,
    pub preview: PreviewManager,
    gitsync: Option<Arc<GitSync>>,
    dispatch_queues: DashMap<String, mpsc::UnboundedSender<(ObservabilityPlatform, WebhookEvent)>>,
}

impl GitOpsCoordinator {
    /// Wire the coordinator with the default adapters and pluggable
    /// promotion interfaces.
    pub fn new(
        store: Arc<dyn StateStore>,
        gitsync: Option<Arc<GitSync>>,
        tests: Arc<dyn TestStatusProvider>,
        gates: Arc<dyn GateEvaluator>,
        approvals: Arc<dyn ApprovalSource>,
    ) -> Self {
        let adapters: Vec<Arc<dyn DeliveryAdapter>> = vec![
            Arc::new(delivery::argocd::ArgoAdapter::new(store.clone())),
            Arc::new(delivery::flux::FluxAdapter::new(store.clone())),
        ];
        let syncstate = Arc::new(SyncStateStore::new(store.clone()));
        Self {
            drift: DriftDetector::new(store.clone()),
            rollback: RollbackManager::new(syncstate.clone()),
            promotion: PromotionPlanner::new(store.clone(), tests, gates, approvals),
            preview: PreviewManager::new(store.clone()),
            syncstate,
            adapters,
            gitsync,
            store,
            dispatch_queues: DashMap::new(),
        }
    }

    fn adapter_for(&self, gitops: &GitOpsSpec) -> Result<Arc<dyn DeliveryAdapter>> {
        delivery::select(&self.adapters, gitops.provider)
    }

    /// One GitOps pass for a platform, called from the reconcile loop.
    pub async fn reconcile(
        &self,
        platform: &ObservabilityPlatform,
        desired: &[DesiredObject],
    ) -> Result<Option<GitOpsOutcome>> {
        let Some(gitops) = platform.spec.gitops.as_ref().filter(|g| g.enabled) else {
            return Ok(None);
        };

        let adapter = self.adapter_for(gitops)?;
        let handle = adapter.install(platform).await?;
        if let Some(policy) = &gitops.sync_policy {
            adapter.configure_sync_policy(&handle, policy).await?;
        }

        let state = adapter.status(&handle).await?;
        self.observe_sync(platform, gitops, &state).await?;

        let revision = match state.last_applied_revision.clone() {
            Some(revision) => Some(revision),
            None => self.resolve_revision(platform, gitops).await,
        };

        let prior = platform
            .status
            .as_ref()
            .and_then(|s| s.gitops.clone())
            .unwrap_or_default();

        let mut outcome = GitOpsOutcome {
            status: GitOpsStatus {
                provider: Some(gitops.provider.to_string()),
                revision,
                sync_status: Some(if state.ready { "Synced" } else { "OutOfSync" }.to_string()),
                last_synced_at: if state.ready {
                    Some(Utc::now().to_rfc3339())
                } else {
                    prior.last_synced_at.clone()
                },
                drift: prior.drift.clone(),
                rollback: prior.rollback.clone(),
            },
            drift_report: None,
            rollback_failed: false,
        };

        self.run_drift_pass(platform, gitops, desired, &mut outcome)
            .await?;
        self.run_rollback_pass(platform, &adapter, &state, &mut outcome)
            .await?;

        Ok(Some(outcome))
    }

    async fn run_drift_pass(
        &self,
        platform: &ObservabilityPlatform,
        gitops: &GitOpsSpec,
        desired: &[DesiredObject],
        outcome: &mut GitOpsOutcome,
    ) -> Result<()> {
        let Some(detection) = gitops.drift_detection.as_ref().filter(|d| d.enabled) else {
            return Ok(());
        };
        let interval = detection
            .interval
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_DRIFT_INTERVAL);
        let key = platform_key(platform);
        if !self.drift.due(&key, interval) {
            return Ok(());
        }

        let report = self.drift.scan(platform, desired).await?;
        self.drift.mark_scanned(&key);

        if report.has_drift {
            if detection.action == DriftAction::Remediate {
                info!(platform = %platform.name_any(), summary = %report.summary, "remediating drift");
                self.drift.remediate(&report, desired).await?;
                self.store
                    .record_event(
                        platform,
                        false,
                        "DriftRemediated",
                        &format!("configuration drift remediated: {}", report.summary),
                    )
                    .await;
            } else {
                self.store
                    .record_event(
                        platform,
                        true,
                        "DriftDetected",
                        &format!("configuration drift detected: {}", report.summary),
                    )
                    .await;
            }
        }

        outcome.status.drift = Some(DriftStatus {
            has_drift: report.has_drift,
            resource_count: i32::try_from(report.resources.len()).unwrap_or(i32::MAX),
            detected_at: Some(Utc::now().to_rfc3339()),
            summary: Some(report.summary.clone()),
        });
        outcome.drift_report = Some(report);
        Ok(())
    }

    async fn run_rollback_pass(
        &self,
        platform: &ObservabilityPlatform,
        adapter: &Arc<dyn DeliveryAdapter>,
        state: &DeliveryState,
        outcome: &mut GitOpsOutcome,
    ) -> Result<()> {
        // Close out a completed rollback first.
        if let Some(rollback) = outcome.status.rollback.clone() {
            if rollback.in_progress
                && state.ready
                && state.last_applied_revision == rollback.target_revision
            {
                outcome.status.rollback = Some(RollbackStatus {
                    in_progress: false,
                    ..rollback
                });
                self.store
                    .record_event(platform, false, "RollbackCompleted", "rollback completed")
                    .await;
            }
        }

        let Some(reason) = self.rollback.should_rollback(platform).await? else {
            return Ok(());
        };

        match self.rollback.execute(platform, adapter, &reason).await {
            Ok(done) => {
                self.store
                    .record_event(
                        platform,
                        true,
                        "RollbackStarted",
                        &format!("rolling back to {}: {}", done.target_revision, done.reason),
                    )
                    .await;
                outcome.status.rollback = Some(RollbackStatus {
                    in_progress: true,
                    target_revision: Some(done.target_revision),
                    reason: Some(done.reason),
                    started_at: Some(done.started_at),
                });
                // A user-requested rollback is consumed once started.
                let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
                let request_annotation = rollback::ROLLBACK_REQUEST_ANNOTATION;
                let clear = json!({
                    "metadata": {
                        "annotations": { request_annotation: serde_json::Value::Null }
                    }
                });
                if let Err(e) = self
                    .store
                    .patch_platform(&platform.name_any(), &namespace, &clear)
                    .await
                {
                    debug!(error = %e, "failed to clear rollback request annotation");
                }
            }
            Err(e) => {
                warn!(platform = %platform.name_any(), error = %e, "rollback failed");
                self.store
                    .record_event(platform, true, "RollbackFailed", &format!("rollback failed: {e}"))
                    .await;
                outcome.rollback_failed = true;
                outcome.status.rollback = Some(RollbackStatus {
                    in_progress: false,
                    target_revision: None,
                    reason: Some(format!("rollback failed: {e}")),
                    started_at: Some(Utc::now().to_rfc3339()),
                });
            }
        }
        Ok(())
    }

    /// Append or finalize sync records as the delivery state changes.
    ///
    /// A new attempt opens an `InProgress` record before its outcome is
    /// known; the same record is later finalized to `Completed`, `Failed`
    /// or (through `cancel_sync`) `Cancelled`.
    async fn observe_sync(
        &self,
        platform: &ObservabilityPlatform,
        gitops: &GitOpsSpec,
        state: &DeliveryState,
    ) -> Result<()> {
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        let name = platform.name_any();
        let max_history = max_history(gitops);

        let history = self.syncstate.history(&namespace, &name).await?;
        let last = history.last();

        if !state.ready {
            let Some(attempted) = &state.last_attempted_revision else {
                return Ok(());
            };
            if state.last_applied_revision.as_ref() == Some(attempted) {
                return Ok(());
            }
            match last {
                Some(record)
                    if record.revision == *attempted
                        && record.status == SyncStatus::InProgress =>
                {
                    // Finalize the open attempt once the provider reports
                    // an error.
                    if let Some(message) = &state.message {
                        let mut record = record.clone();
                        record.status = SyncStatus::Failed;
                        record.completed_at = Some(Utc::now().to_rfc3339());
                        record.message = Some(message.clone());
                        record.errors = vec![message.clone()];
                        self.syncstate.record(&namespace, &record, max_history).await?;
                    }
                }
                Some(record) if record.revision == *attempted => {
                    // Attempt already reached a terminal state.
                }
                _ => {
                    let sequence = self.syncstate.next_sequence(&namespace, &name).await?;
                    let record = SyncRecord::started(&name, sequence, attempted);
                    self.syncstate.record(&namespace, &record, max_history).await?;
                }
            }
            return Ok(());
        }

        if let Some(applied) = &state.last_applied_revision {
            match last {
                Some(record)
                    if record.revision == *applied && record.status == SyncStatus::Completed => {}
                Some(record)
                    if record.revision == *applied
                        && record.status == SyncStatus::InProgress =>
                {
                    let mut record = record.clone();
                    record.status = SyncStatus::Completed;
                    record.completed_at = Some(Utc::now().to_rfc3339());
                    self.syncstate.record(&namespace, &record, max_history).await?;
                }
                _ => {
                    let sequence = self.syncstate.next_sequence(&namespace, &name).await?;
                    let mut record = SyncRecord::started(&name, sequence, applied);
                    record.status = SyncStatus::Completed;
                    record.completed_at = Some(Utc::now().to_rfc3339());
                    self.syncstate.record(&namespace, &record, max_history).await?;
                }
            }
        }
        Ok(())
    }

    /// Cancel the in-flight sync, if one exists: the record is marked
    /// `Cancelled` and the delivery adapter gets a best-effort
    /// notification. Returns whether a sync was actually cancelled.
    pub async fn cancel_sync(
        &self,
        platform: &ObservabilityPlatform,
        reason: &str,
    ) -> Result<bool> {
        let Some(gitops) = platform.spec.gitops.as_ref().filter(|g| g.enabled) else {
            return Ok(false);
        };
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        let name = platform.name_any();

        let Some(mut record) = self.syncstate.in_flight(&namespace, &name).await? else {
            return Ok(false);
        };
        syncstate::cancel(&mut record, reason)?;
        self.syncstate
            .record(&namespace, &record, max_history(gitops))
            .await?;

        let adapter = self.adapter_for(gitops)?;
        let handle = DeliveryHandle::for_platform(gitops.provider, platform);
        if let Err(e) = adapter.cancel(&handle).await {
            warn!(platform = %name, error = %e, "delivery cancellation notification failed");
        }

        self.store
            .record_event(
                platform,
                false,
                "SyncCancelled",
                &format!("sync {} cancelled: {reason}", record.sequence),
            )
            .await;
        Ok(true)
    }

    /// Flag the current revision as known-good once the platform reaches
    /// Ready; rollback targets come from here.
    pub async fn note_platform_ready(&self, platform: &ObservabilityPlatform) -> Result<()> {
        let Some(gitops) = platform.spec.gitops.as_ref().filter(|g| g.enabled) else {
            return Ok(());
        };
        let Some(revision) = platform
            .status
            .as_ref()
            .and_then(|s| s.gitops.as_ref())
            .and_then(|g| g.revision.clone())
        else {
            return Ok(());
        };
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        self.syncstate
            .mark_ready(&namespace, &platform.name_any(), &revision, max_history(gitops))
            .await
    }

    /// Pause delivery ahead of teardown.
    pub async fn suspend(&self, platform: &ObservabilityPlatform) -> Result<()> {
        let Some(gitops) = platform.spec.gitops.as_ref().filter(|g| g.enabled) else {
            return Ok(());
        };
        let adapter = self.adapter_for(gitops)?;
        let handle = DeliveryHandle::for_platform(gitops.provider, platform);
        adapter.suspend(&handle).await
    }

    /// Remove delivery objects and sync history.
    pub async fn uninstall(&self, platform: &ObservabilityPlatform) -> Result<()> {
        let Some(gitops) = platform.spec.gitops.as_ref().filter(|g| g.enabled) else {
            return Ok(());
        };
        let adapter = self.adapter_for(gitops)?;
        adapter.uninstall(platform).await?;
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        self.syncstate.clear(&namespace, &platform.name_any()).await
    }

    /// Promote a platform to the named environment.
    pub async fn promote(
        &self,
        source: &ObservabilityPlatform,
        environment: &str,
        actor: &str,
    ) -> Result<PromotionRecord> {
        let gitops = source
            .spec
            .gitops
            .as_ref()
            .filter(|g| g.enabled)
            .ok_or_else(|| Error::InvalidSpec("platform has no GitOps coupling".to_string()))?;
        let adapter = self.adapter_for(gitops)?;
        self.promotion
            .promote(source, environment, actor, &adapter, &self.rollback)
            .await
    }

    async fn resolve_revision(
        &self,
        platform: &ObservabilityPlatform,
        gitops: &GitOpsSpec,
    ) -> Option<String> {
        let sync = self.gitsync.as_ref()?;
        let auth = match &gitops.repository.credentials_secret {
            Some(secret_name) => {
                let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
                match self.store.get_secret_data(secret_name, &namespace).await {
                    Ok(Some(data)) => GitAuth::from_secret_data(&data),
                    Ok(None) => GitAuth::Anonymous,
                    Err(e) => {
                        warn!(error = %e, "failed to resolve repository credentials");
                        return None;
                    }
                }
            }
            None => GitAuth::Anonymous,
        };
        let repo = RepoSpec {
            url: gitops.repository.url.clone(),
            reference: gitops.repository.reference().to_string(),
            auth,
        };
        match GitSync::clone(&sync, &repo).await {
            Ok(dir) => match sync.revision(&dir).await {
                Ok(revision) => Some(revision),
                Err(e) => {
                    warn!(error = %e, "failed to resolve repository revision");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to sync repository for revision resolution");
                None
            }
        }
    }

    async fn webhook_secret(&self, platform: &ObservabilityPlatform) -> Result<Option<String>> {
        let Some(secret_name) = platform
            .spec
            .gitops
            .as_ref()
            .and_then(|g| g.repository.credentials_secret.as_ref())
        else {
            return Ok(None);
        };
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        let Some(data) = self.store.get_secret_data(secret_name, &namespace).await? else {
            return Ok(None);
        };
        for key in WEBHOOK_SECRET_KEYS {
            if let Some(raw) = data.get(key) {
                let value = String::from_utf8_lossy(raw).trim().to_string();
                if !value.is_empty() {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// FIFO per-platform dispatch; platforms drain independently.
    fn enqueue(this: &Arc<Self>, platform: ObservabilityPlatform, event: WebhookEvent) {
        let key = platform_key(&platform);
        let sender = this
            .dispatch_queues
            .entry(key)
            .or_insert_with(|| {
                let (tx, mut rx) =
                    mpsc::unbounded_channel::<(ObservabilityPlatform, WebhookEvent)>();
                let coordinator = this.clone();
                tokio::spawn(async move {
                    while let Some((platform, event)) = rx.recv().await {
                        if let Err(e) = coordinator.dispatch(&platform, &event).await {
                            warn!(
                                platform = %platform.name_any(),
                                error = %e,
                                "webhook dispatch failed"
                            );
                        }
                    }
                });
                tx
            })
            .clone();
        let _ = sender.send((platform, event));
    }

    async fn dispatch(&self, platform: &ObservabilityPlatform, event: &WebhookEvent) -> Result<()> {
        let gitops = platform
            .spec
            .gitops
            .as_ref()
            .filter(|g| g.enabled)
            .ok_or_else(|| Error::ConfigError("dispatch to platform without gitops".to_string()))?;

        match event.event_type {
            WebhookEventType::Push => {
                let tracked = gitops.repository.reference();
                if event.branch.as_deref() != Some(tracked) {
                    debug!(branch = ?event.branch, tracked, "push to untracked branch ignored");
                    return Ok(());
                }
                // A fresh push supersedes whatever sync is still in
                // flight.
                if let Err(e) = self.cancel_sync(platform, "superseded by newer push").await {
                    warn!(error = %e, "failed to cancel superseded sync");
                }
                let adapter = self.adapter_for(gitops)?;
                let handle = DeliveryHandle::for_platform(gitops.provider, platform);
                adapter.trigger(&handle).await?;
                self.drift.schedule_now(&platform_key(platform));
                self.nudge(platform).await;
                self.store
                    .record_event(
                        platform,
                        false,
                        "WebhookSync",
                        &format!(
                            "push by {} triggered sync",
                            event.author.as_deref().unwrap_or("unknown")
                        ),
                    )
                    .await;
            }
            WebhookEventType::PullRequest => {
                let preview_enabled = gitops
                    .preview_environments
                    .as_ref()
                    .is_some_and(|p| p.enabled);
                if !preview_enabled {
                    return Ok(());
                }
                let Some(pr) = &event.pull_request else {
                    return Ok(());
                };
                if pr.action.wants_preview() {
                    self.preview
                        .create(platform, pr.number, &pr.source_branch)
                        .await?;
                } else if pr.action == webhook::PullRequestAction::Closed {
                    self.preview.delete(platform, pr.number).await?;
                }
            }
            WebhookEventType::Tag | WebhookEventType::Release => {
                let Some(tag) = event.tag.as_deref().or(event
                    .release
                    .as_ref()
                    .map(|r| r.tag.as_str()))
                else {
                    return Ok(());
                };
                self.promote_for_tag(platform, gitops, tag, event).await?;
            }
        }
        Ok(())
    }

    /// A tag matching the promotion pattern promotes to the next pending
    /// environment in the declared order.
    async fn promote_for_tag(
        &self,
        platform: &ObservabilityPlatform,
        gitops: &GitOpsSpec,
        tag: &str,
        event: &WebhookEvent,
    ) -> Result<()> {
        let Some(promotion) = gitops.promotion.as_ref() else {
            return Ok(());
        };
        let Some(pattern) = promotion.tag_pattern.as_deref() else {
            return Ok(());
        };
        let matches = Regex::new(pattern)
            .map_err(|e| Error::InvalidSpec(format!("invalid tag pattern '{pattern}': {e}")))?
            .is_match(tag);
        if !matches {
            debug!(tag, pattern, "tag does not match promotion pattern");
            return Ok(());
        }

        let Some(environment) = self.next_promotion_target(platform, event).await? else {
            debug!(tag, "all environments already at this revision");
            return Ok(());
        };

        let actor = event.author.as_deref().unwrap_or("webhook");
        match self.promote(platform, &environment, actor).await {
            Ok(record) => {
                self.store
                    .record_event(
                        platform,
                        false,
                        "Promoted",
                        &format!(
                            "tag {tag} promoted {} to '{}'",
                            record.source_revision, record.target_environment
                        ),
                    )
                    .await;
            }
            Err(e @ Error::RequirementsNotMet(_)) => {
                self.store
                    .record_event(platform, true, "PromotionBlocked", &e.to_string())
                    .await;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// First declared environment whose platform is not at the event's
    /// revision.
    async fn next_promotion_target(
        &self,
        platform: &ObservabilityPlatform,
        event: &WebhookEvent,
    ) -> Result<Option<String>> {
        let Some(promotion) = platform
            .spec
            .gitops
            .as_ref()
            .and_then(|g| g.promotion.as_ref())
        else {
            return Ok(None);
        };
        for env in &promotion.environments {
            let (name, namespace) =
                promotion::environment_target_for(&platform.name_any(), env);
            let target = self.store.get_platform(&name, &namespace).await?;
            let at_revision = target
                .as_ref()
                .and_then(|p| p.status.as_ref())
                .and_then(|s| s.gitops.as_ref())
                .and_then(|g| g.revision.as_deref())
                == event.commit.as_deref();
            if !at_revision || event.commit.is_none() {
                return Ok(Some(env.name.clone()));
            }
        }
        Ok(None)
    }

    /// Benign annotation patch to emit a watch event for the platform.
    async fn nudge(&self, platform: &ObservabilityPlatform) {
        let namespace = platform.namespace().unwrap_or_else(|| "default".to_string());
        let patch = json!({
            "metadata": { "annotations": { RESYNC_ANNOTATION: Utc::now().to_rfc3339() } }
        });
        if let Err(e) = self
            .store
            .patch_platform(&platform.name_any(), &namespace, &patch)
            .await
        {
            debug!(error = %e, "resync nudge skipped");
        }
    }
}

fn max_history(gitops: &GitOpsSpec) -> usize {
    gitops
        .rollback
        .as_ref()
        .and_then(|r| r.max_history)
        .map(|h| usize::try_from(h.max(1)).unwrap_or(10))
        .unwrap_or(10)
}

#[must_use]
pub fn platform_key(platform: &ObservabilityPlatform) -> String {
    format!(
        "{}/{}",
        platform.namespace().unwrap_or_default(),
        platform.name_any()
    )
}

#[async_trait]
impl WebhookIngest for Arc<GitOpsCoordinator> {
    async fn ingest(
        &self,
        provider: WebhookProvider,
        headers: &HeaderMap,
        body: &[u8],
    ) -> IngestOutcome {
        let hint = event_hint(provider, headers);
        let event = match providers::parse(provider, hint.as_deref(), body) {
            Ok(event) => event,
            Err(e) => return IngestOutcome::BadRequest(e.to_string()),
        };

        let platforms = match self.store.list_platforms().await {
            Ok(platforms) => platforms,
            Err(e) => {
                warn!(error = %e, "platform listing failed during webhook ingest");
                return IngestOutcome::Accepted { matched: 0 };
            }
        };

        let matched: Vec<ObservabilityPlatform> = platforms
            .into_iter()
            .filter(|p| {
                p.spec
                    .gitops
                    .as_ref()
                    .is_some_and(|g| g.enabled && webhook::urls_match(&g.repository.url, &event.repository))
            })
            .collect();
        if matched.is_empty() {
            return IngestOutcome::Accepted { matched: 0 };
        }

        let header = header_resolver(headers);
        let mut verified = Vec::new();
        let mut rejected = false;
        for platform in matched {
            match self.webhook_secret(&platform).await {
                Ok(Some(secret)) => {
                    if signature::verify_provider(provider, &header, body, &secret) {
                        verified.push(platform);
                    } else {
                        rejected = true;
                        // Audit the rejection; never the payload body.
                        self.store
                            .record_event(
                                &platform,
                                true,
                                "WebhookRejected",
                                &format!(
                                    "webhook signature verification failed (provider '{}')",
                                    provider.as_str()
                                ),
                            )
                            .await;
                    }
                }
                Ok(None) => {
                    warn!(
                        platform = %platform.name_any(),
                        "no webhook secret configured, accepting unverified webhook"
                    );
                    verified.push(platform);
                }
                Err(e) => {
                    warn!(platform = %platform.name_any(), error = %e, "webhook secret lookup failed");
                    rejected = true;
                }
            }
        }

        if verified.is_empty() {
            if rejected {
                return IngestOutcome::Unauthorized;
            }
            return IngestOutcome::Accepted { matched: 0 };
        }

        let matched = verified.len();
        for platform in verified {
            GitOpsCoordinator::enqueue(self, platform, event.clone());
        }
        IngestOutcome::Accepted { matched }
    }
}

fn event_hint(provider: WebhookProvider, headers: &HeaderMap) -> Option<String> {
    let name = match provider {
        WebhookProvider::Github => "X-GitHub-Event",
        WebhookProvider::Gitlab => "X-Gitlab-Event",
        WebhookProvider::Bitbucket => "X-Event-Key",
        WebhookProvider::Gitea => "X-Gitea-Event",
        WebhookProvider::Generic => return None,
    };
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

// --- Default pluggable promotion interfaces ---

/// Test status read from a `{platform}-test-status` ConfigMap: a test is
/// passing only when its key holds `passing`.
pub struct ConfigMapTestStatus {
    store: Arc<dyn StateStore>,
}

impl ConfigMapTestStatus {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TestStatusProvider for ConfigMapTestStatus {
    async fn is_passing(&self, platform: &str, namespace: &str, test_name: &str) -> Result<bool> {
        let name = format!("{platform}-test-status");
        let configmaps = self
            .store
            .list_configmaps(namespace, &format!("{}={}", syncstate::PLATFORM_LABEL, platform))
            .await?;
        let Some(cm) = configmaps.iter().find(|cm| cm.name_any() == name) else {
            return Ok(false);
        };
        Ok(cm
            .data
            .as_ref()
            .and_then(|d| d.get(test_name))
            .is_some_and(|v| v == "passing"))
    }
}

/// Gates read from a `{platform}-gates` ConfigMap; a gate passes unless
/// its key holds `fail`.
pub struct ConfigMapGates {
    store: Arc<dyn StateStore>,
}

impl ConfigMapGates {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl GateEvaluator for ConfigMapGates {
    async fn evaluate(
        &self,
        platform: &str,
        namespace: &str,
        _environment: &str,
        gate: &GateSpec,
    ) -> Result<bool> {
        let name = format!("{platform}-gates");
        let configmaps = self
            .store
            .list_configmaps(namespace, &format!("{}={}", syncstate::PLATFORM_LABEL, platform))
            .await?;
        let Some(cm) = configmaps.iter().find(|cm| cm.name_any() == name) else {
            return Ok(true);
        };
        Ok(cm
            .data
            .as_ref()
            .and_then(|d| d.get(&gate.name))
            .is_none_or(|v| v != "fail"))
    }
}

/// Readiness of a platform's environment chain is consulted through phase;
/// re-exported for the planner.
#[must_use]
pub fn is_ready(platform: &ObservabilityPlatform) -> bool {
    platform
        .status
        .as_ref()
        .is_some_and(|s| s.phase == PlatformPhase::Ready)
}
