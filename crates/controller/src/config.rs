//! Engine Configuration
//!
//! Everything is environment-driven with working defaults; nothing is
//! required for development. Values are read once at startup.

use std::path::PathBuf;
use std::time::Duration;

use gitsync::HostKeyPolicy;
use serde::{Deserialize, Serialize};

/// Main engine configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Default tracing filter directive (`LOG_LEVEL`).
    pub log_level: String,

    /// Emit JSON-formatted logs (`LOG_JSON`).
    pub log_json: bool,

    /// Namespace holding the leader-election lease
    /// (`LEADER_ELECTION_NAMESPACE`).
    pub leader_election_namespace: String,

    /// Disable leader election for single-instance development
    /// (`LEADER_ELECTION_DISABLED`).
    pub leader_election_disabled: bool,

    /// Reconcile worker tasks (`WORKER_CONCURRENCY`).
    pub worker_concurrency: usize,

    /// Soft per-reconcile deadline in seconds (`RECONCILE_DEADLINE_SECS`).
    pub reconcile_deadline_secs: u64,

    /// Root of the git working-tree cache (`GIT_CACHE_DIR`).
    pub git_cache_dir: PathBuf,

    /// SSH host-key verification policy (`GIT_HOST_KEY_POLICY`).
    pub git_host_key_policy: String,

    /// HTTP front bind address (`WEBHOOK_BIND_ADDR`).
    pub webhook_bind_addr: String,

    /// TLS material; the front serves TLS only when both are set
    /// (`TLS_CERT_PATH`, `TLS_KEY_PATH`).
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            leader_election_namespace: "observability-system".to_string(),
            leader_election_disabled: false,
            worker_concurrency: 4,
            reconcile_deadline_secs: 120,
            git_cache_dir: PathBuf::from("/var/cache/gitsync"),
            git_host_key_policy: "strict".to_string(),
            webhook_bind_addr: "0.0.0.0:8080".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl EngineConfig {
    /// Load from the process environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_level: env_or("LOG_LEVEL", defaults.log_level),
            log_json: env_flag("LOG_JSON"),
            leader_election_namespace: env_or(
                "LEADER_ELECTION_NAMESPACE",
                defaults.leader_election_namespace,
            ),
            leader_election_disabled: env_flag("LEADER_ELECTION_DISABLED"),
            worker_concurrency: env_parsed("WORKER_CONCURRENCY", defaults.worker_concurrency),
            reconcile_deadline_secs: env_parsed(
                "RECONCILE_DEADLINE_SECS",
                defaults.reconcile_deadline_secs,
            ),
            git_cache_dir: std::env::var("GIT_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.git_cache_dir),
            git_host_key_policy: env_or("GIT_HOST_KEY_POLICY", defaults.git_host_key_policy),
            webhook_bind_addr: env_or("WEBHOOK_BIND_ADDR", defaults.webhook_bind_addr),
            tls_cert_path: std::env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            tls_key_path: std::env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
        }
    }

    #[must_use]
    pub fn reconcile_deadline(&self) -> Duration {
        Duration::from_secs(self.reconcile_deadline_secs)
    }

    #[must_use]
    pub fn host_key_policy(&self) -> HostKeyPolicy {
        HostKeyPolicy::from_config(&self.git_host_key_policy)
    }

    /// TLS is enabled only when both paths are present.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }

    /// Sanity-check the loaded values.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.worker_concurrency == 0 {
            return Err(anyhow::anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }
        if self.reconcile_deadline_secs == 0 {
            return Err(anyhow::anyhow!("RECONCILE_DEADLINE_SECS must be at least 1"));
        }
        if self.webhook_bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "WEBHOOK_BIND_ADDR '{}' is not a valid socket address",
                self.webhook_bind_addr
            ));
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(anyhow::anyhow!(
                "TLS_CERT_PATH and TLS_KEY_PATH must be set together"
            ));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse a duration shorthand like `30s`, `5m`, `2h`, `30d`.
#[must_use]
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let (digits, multiplier) = match unit {
        "s" => (digits, 1),
        "m" => (digits, 60),
        "h" => (digits, 3600),
        "d" => (digits, 86_400),
        _ if unit.chars().all(|c| c.is_ascii_digit()) => (value, 1),
        _ => return None,
    };
    digits
        .parse::<u64>()
        .ok()
        .map(|n| Duration::from_secs(n * multiplier))
}
