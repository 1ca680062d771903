//! Lease-based leader election.
//!
//! Only the leader runs controllers; followers block in `acquire`. A
//! leader that loses its lease gets a grace period to reacquire before the
//! process must exit with code 2.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const LEASE_NAME: &str = "platform-controller-leader";

const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Grace period to reacquire a lost lease before exiting.
pub const REACQUIRE_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
#[error("lost leadership and did not reacquire within {0:?}")]
pub struct LeadershipLost(pub Duration);

pub struct LeaderElector {
    api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    #[must_use]
    pub fn new(client: Client, namespace: &str, identity: String) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            identity,
        }
    }

    /// Block until this instance holds the lease.
    pub async fn acquire(&self) -> Result<()> {
        info!(identity = %self.identity, lease = LEASE_NAME, "campaigning for leadership");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "acquired leadership");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "lease acquisition attempt failed"),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renew the lease until it is lost beyond the grace period.
    pub async fn hold(&self) -> LeadershipLost {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire().await {
                Ok(true) => continue,
                Ok(false) => {
                    warn!(identity = %self.identity, "leadership lost, attempting to reacquire");
                }
                Err(e) => {
                    warn!(error = %e, "lease renewal failed, attempting to reacquire");
                }
            }

            let deadline = tokio::time::Instant::now() + REACQUIRE_GRACE;
            loop {
                if tokio::time::Instant::now() >= deadline {
                    return LeadershipLost(REACQUIRE_GRACE);
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
                if matches!(self.try_acquire().await, Ok(true)) {
                    info!(identity = %self.identity, "reacquired leadership");
                    break;
                }
            }
        }
    }

    /// One acquire-or-renew attempt. Returns whether this instance holds
    /// the lease afterwards; conflicts are simply a lost round.
    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());

        match self.api.get_opt(LEASE_NAME).await {
            Ok(None) => match self.api.create(&PostParams::default(), &self.lease(&now, 1)).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(Error::classify(e, "lease create")),
            },
            Ok(Some(current)) => {
                let spec = current.spec.clone().unwrap_or_default();
                let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());
                let expired = spec
                    .renew_time
                    .as_ref()
                    .map(|renew| {
                        let age = Utc::now() - renew.0;
                        age.num_seconds() > i64::from(LEASE_DURATION_SECS)
                    })
                    .unwrap_or(true);

                if !held_by_us && !expired {
                    debug!(holder = ?spec.holder_identity, "lease held by another instance");
                    return Ok(false);
                }

                let transitions = spec.lease_transitions.unwrap_or(0)
                    + i32::from(!held_by_us);
                let mut updated = self.lease(&now, transitions);
                updated.metadata.resource_version = current.metadata.resource_version.clone();
                if held_by_us {
                    // Keep the original acquire time across renewals.
                    if let (Some(updated_spec), Some(acquired)) =
                        (updated.spec.as_mut(), spec.acquire_time)
                    {
                        updated_spec.acquire_time = Some(acquired);
                    }
                }

                match self
                    .api
                    .replace(LEASE_NAME, &PostParams::default(), &updated)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(Error::classify(e, "lease replace")),
                }
            }
            Err(e) => Err(Error::classify(e, "lease get")),
        }
    }

    fn lease(&self, now: &MicroTime, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now.clone()),
                lease_transitions: Some(transitions),
                ..LeaseSpec::default()
            }),
        }
    }
}
