//! Sync-state persistence.
//!
//! Sync records are opaque JSON payloads stored in ConfigMaps labelled
//! `observability.platform.io/sync-state=true`, keyed by platform name plus
//! a monotonic sequence suffix. History is capped by the platform's
//! `rollback.maxHistory`.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::{Error, Result};
use crate::store::StateStore;

pub const SYNC_STATE_LABEL: &str = "observability.platform.io/sync-state";
pub const PLATFORM_LABEL: &str = "observability.platform.io/platform";

const PAYLOAD_KEY: &str = "record.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedResource {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    /// `create`, `update` or `delete`.
    pub action: String,
    pub status: String,
}

/// One persisted sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub platform: String,
    pub sequence: u64,
    pub revision: String,
    pub status: SyncStatus,

    pub started_at: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<SyncedResource>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Set once the platform reaches Ready on this revision; rollback
    /// targets the newest record with this flag.
    #[serde(default)]
    pub reached_ready: bool,
}

impl SyncRecord {
    #[must_use]
    pub fn started(platform: &str, sequence: u64, revision: &str) -> Self {
        Self {
            platform: platform.to_string(),
            sequence,
            revision: revision.to_string(),
            status: SyncStatus::InProgress,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            message: None,
            resources: Vec::new(),
            errors: Vec::new(),
            reached_ready: false,
        }
    }

    fn configmap_name(&self) -> String {
        format!("{}-sync-{:06}", self.platform, self.sequence)
    }
}

/// Store for sync records and their retention.
pub struct SyncStateStore {
    store: Arc<dyn StateStore>,
}

impl SyncStateStore {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn selector(platform: &str) -> String {
        format!("{SYNC_STATE_LABEL}=true,{PLATFORM_LABEL}={platform}")
    }

    /// Persist a record and prune history beyond `max_history`.
    pub async fn record(
        &self,
        namespace: &str,
        record: &SyncRecord,
        max_history: usize,
    ) -> Result<()> {
        let manifest: ConfigMap = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": record.configmap_name(),
                "namespace": namespace,
                "labels": {
                    SYNC_STATE_LABEL: "true",
                    PLATFORM_LABEL: record.platform,
                },
            },
            "data": { PAYLOAD_KEY: serde_json::to_string(record)? },
        }))?;
        self.store.upsert_configmap(&manifest).await?;
        self.prune(namespace, &record.platform, max_history).await
    }

    /// Full history for a platform, oldest first.
    pub async fn history(&self, namespace: &str, platform: &str) -> Result<Vec<SyncRecord>> {
        let configmaps = self
            .store
            .list_configmaps(namespace, &Self::selector(platform))
            .await?;
        let mut records: Vec<SyncRecord> = configmaps
            .iter()
            .filter_map(|cm| {
                let payload = cm.data.as_ref()?.get(PAYLOAD_KEY)?;
                match serde_json::from_str(payload) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(configmap = %cm.name_any(), error = %e, "unreadable sync record");
                        None
                    }
                }
            })
            .collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// Next sequence number for a platform.
    pub async fn next_sequence(&self, namespace: &str, platform: &str) -> Result<u64> {
        let history = self.history(namespace, platform).await?;
        Ok(history.last().map_or(1, |r| r.sequence + 1))
    }

    /// Newest record still awaiting an outcome, if any.
    pub async fn in_flight(&self, namespace: &str, platform: &str) -> Result<Option<SyncRecord>> {
        let history = self.history(namespace, platform).await?;
        Ok(history
            .into_iter()
            .rev()
            .find(|r| matches!(r.status, SyncStatus::Pending | SyncStatus::InProgress)))
    }

    /// Flag the newest record for `revision` as having reached Ready.
    pub async fn mark_ready(
        &self,
        namespace: &str,
        platform: &str,
        revision: &str,
        max_history: usize,
    ) -> Result<()> {
        let history = self.history(namespace, platform).await?;
        let Some(record) = history
            .into_iter()
            .rev()
            .find(|r| r.revision == revision && r.status == SyncStatus::Completed)
        else {
            return Ok(());
        };
        if record.reached_ready {
            return Ok(());
        }
        let mut record = record;
        record.reached_ready = true;
        self.record(namespace, &record, max_history).await
    }

    /// Newest revision that reached Ready, for rollback targeting.
    pub async fn last_ready_revision(
        &self,
        namespace: &str,
        platform: &str,
    ) -> Result<Option<String>> {
        let history = self.history(namespace, platform).await?;
        Ok(history
            .into_iter()
            .rev()
            .find(|r| r.reached_ready)
            .map(|r| r.revision))
    }

    /// Count failed syncs newer than a cutoff timestamp.
    pub async fn failures_since(
        &self,
        namespace: &str,
        platform: &str,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<usize> {
        let history = self.history(namespace, platform).await?;
        Ok(history
            .iter()
            .filter(|r| r.status == SyncStatus::Failed)
            .filter(|r| {
                chrono::DateTime::parse_from_rfc3339(&r.started_at)
                    .map(|t| t.with_timezone(&chrono::Utc) >= cutoff)
                    .unwrap_or(false)
            })
            .count())
    }

    async fn prune(&self, namespace: &str, platform: &str, max_history: usize) -> Result<()> {
        let history = self.history(namespace, platform).await?;
        if history.len() <= max_history {
            return Ok(());
        }
        let excess = history.len() - max_history;
        for record in history.into_iter().take(excess) {
            self.store
                .delete_configmap(&record.configmap_name(), namespace)
                .await?;
        }
        Ok(())
    }

    /// Remove every record for a platform (teardown).
    pub async fn clear(&self, namespace: &str, platform: &str) -> Result<()> {
        for record in self.history(namespace, platform).await? {
            self.store
                .delete_configmap(&record.configmap_name(), namespace)
                .await?;
        }
        Ok(())
    }
}

/// Mark an in-flight record cancelled. Adapter notification is best-effort
/// and failures are swallowed by the caller.
pub fn cancel(record: &mut SyncRecord, reason: &str) -> Result<()> {
    if !matches!(record.status, SyncStatus::Pending | SyncStatus::InProgress) {
        return Err(Error::ConfigError(format!(
            "sync {} is not cancellable",
            record.sequence
        )));
    }
    record.status = SyncStatus::Cancelled;
    record.completed_at = Some(Utc::now().to_rfc3339());
    record.message = Some(reason.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_name_embeds_platform_and_padded_sequence() {
        let record = SyncRecord::started("demo", 7, "abc123");
        assert_eq!(record.configmap_name(), "demo-sync-000007");
        assert_eq!(record.status, SyncStatus::InProgress);
        assert!(!record.reached_ready);
    }

    #[test]
    fn record_payload_round_trips() {
        let mut record = SyncRecord::started("demo", 1, "abc123");
        record.resources.push(SyncedResource {
            kind: "Service".to_string(),
            name: "demo-metrics".to_string(),
            namespace: "monitoring".to_string(),
            action: "update".to_string(),
            status: "applied".to_string(),
        });
        let payload = serde_json::to_string(&record).unwrap();
        let back: SyncRecord = serde_json::from_str(&payload).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn cancel_flags_in_flight_records_only() {
        let mut record = SyncRecord::started("demo", 1, "abc123");
        cancel(&mut record, "superseded by newer push").unwrap();
        assert_eq!(record.status, SyncStatus::Cancelled);
        assert!(record.completed_at.is_some());

        let mut completed = SyncRecord::started("demo", 2, "def456");
        completed.status = SyncStatus::Completed;
        assert!(cancel(&mut completed, "too late").is_err());
    }
}
