//! Webhook ingest: provider payload normalization and dispatch.

pub mod providers;
pub mod server;
pub mod signature;

use serde::{Deserialize, Serialize};

/// Supported webhook providers, addressed as `/webhook/{provider}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookProvider {
    Github,
    Gitlab,
    Bitbucket,
    Gitea,
    Generic,
}

impl WebhookProvider {
    #[must_use]
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "github" => Some(Self::Github),
            "gitlab" => Some(Self::Gitlab),
            "bitbucket" => Some(Self::Bitbucket),
            "gitea" => Some(Self::Gitea),
            "generic" => Some(Self::Generic),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Bitbucket => "bitbucket",
            Self::Gitea => "gitea",
            Self::Generic => "generic",
        }
    }
}

/// Normalized webhook event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    Push,
    PullRequest,
    Tag,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestAction {
    Opened,
    Reopened,
    Synchronize,
    Closed,
    Other,
}

impl PullRequestAction {
    #[must_use]
    pub fn parse(action: &str) -> Self {
        match action {
            "opened" | "open" | "created" => Self::Opened,
            "reopened" | "reopen" => Self::Reopened,
            "synchronize" | "synchronized" | "update" | "updated" => Self::Synchronize,
            "closed" | "close" | "merged" | "merge" => Self::Closed,
            _ => Self::Other,
        }
    }

    /// Actions that (re)materialize a preview environment.
    #[must_use]
    pub fn wants_preview(self) -> bool {
        matches!(self, Self::Opened | Self::Reopened | Self::Synchronize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestInfo {
    pub number: u64,
    pub action: PullRequestAction,
    pub source_branch: String,
    pub target_branch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Provider-agnostic webhook event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: WebhookEventType,

    /// Repository URL as reported by the provider.
    pub repository: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseInfo>,
}

/// Compare repository URLs tolerant of `.git` suffixes, trailing slashes
/// and case.
#[must_use]
pub fn urls_match(left: &str, right: &str) -> bool {
    normalize_repo_url(left) == normalize_repo_url(right)
}

fn normalize_repo_url(url: &str) -> String {
    let trimmed = url.trim();
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}
