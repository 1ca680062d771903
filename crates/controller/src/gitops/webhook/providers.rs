//! Provider-specific payload parsing into the normalized event shape.
//!
//! Parsing is body-driven; the provider's event header (`X-GitHub-Event`,
//! `X-Gitlab-Event`, `X-Event-Key`, `X-Gitea-Event`) disambiguates where
//! body shapes overlap.

use serde_json::Value;

use super::{
    PullRequestAction, PullRequestInfo, ReleaseInfo, WebhookEvent, WebhookEventType,
    WebhookProvider,
};
use crate::error::{Error, Result};

/// Parse a raw payload for one provider.
pub fn parse(
    provider: WebhookProvider,
    event_hint: Option<&str>,
    body: &[u8],
) -> Result<WebhookEvent> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidSpec(format!("unparseable webhook payload: {e}")))?;

    match provider {
        WebhookProvider::Github => parse_github(event_hint, &payload),
        WebhookProvider::Gitlab => parse_gitlab(&payload),
        WebhookProvider::Bitbucket => parse_bitbucket(event_hint, &payload),
        WebhookProvider::Gitea => parse_gitea(event_hint, &payload),
        WebhookProvider::Generic => serde_json::from_value(payload)
            .map_err(|e| Error::InvalidSpec(format!("generic payload not in normalized form: {e}"))),
    }
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    current.as_str()
}

fn parse_github(event_hint: Option<&str>, payload: &Value) -> Result<WebhookEvent> {
    let repository = str_at(payload, &["repository", "clone_url"])
        .or_else(|| str_at(payload, &["repository", "html_url"]))
        .ok_or_else(|| Error::InvalidSpec("payload has no repository URL".to_string()))?
        .to_string();

    match event_hint {
        Some("pull_request") | None if payload.get("pull_request").is_some() => {
            let action = PullRequestAction::parse(
                str_at(payload, &["action"]).unwrap_or_default(),
            );
            let number = payload["number"]
                .as_u64()
                .or_else(|| payload["pull_request"]["number"].as_u64())
                .ok_or_else(|| Error::InvalidSpec("pull request has no number".to_string()))?;
            Ok(WebhookEvent {
                event_type: WebhookEventType::PullRequest,
                repository,
                branch: str_at(payload, &["pull_request", "head", "ref"]).map(ToString::to_string),
                tag: None,
                commit: str_at(payload, &["pull_request", "head", "sha"]).map(ToString::to_string),
                author: str_at(payload, &["pull_request", "user", "login"]).map(ToString::to_string),
                message: str_at(payload, &["pull_request", "title"]).map(ToString::to_string),
                pull_request: Some(PullRequestInfo {
                    number,
                    action,
                    source_branch: str_at(payload, &["pull_request", "head", "ref"])
                        .unwrap_or_default()
                        .to_string(),
                    target_branch: str_at(payload, &["pull_request", "base", "ref"])
                        .unwrap_or_default()
                        .to_string(),
                }),
                release: None,
            })
        }
        Some("release") | None if payload.get("release").is_some() => {
            let tag = str_at(payload, &["release", "tag_name"])
                .ok_or_else(|| Error::InvalidSpec("release has no tag".to_string()))?;
            Ok(WebhookEvent {
                event_type: WebhookEventType::Release,
                repository,
                branch: None,
                tag: Some(tag.to_string()),
                commit: None,
                author: str_at(payload, &["release", "author", "login"]).map(ToString::to_string),
                message: str_at(payload, &["release", "name"]).map(ToString::to_string),
                pull_request: None,
                release: Some(ReleaseInfo {
                    tag: tag.to_string(),
                    name: str_at(payload, &["release", "name"]).map(ToString::to_string),
                }),
            })
        }
        _ => parse_ref_push(payload, repository),
    }
}

/// Push-style payload: `ref` is `refs/heads/...` or `refs/tags/...`.
fn parse_ref_push(payload: &Value, repository: String) -> Result<WebhookEvent> {
    let git_ref = str_at(payload, &["ref"])
        .ok_or_else(|| Error::InvalidSpec("push payload has no ref".to_string()))?;
    let commit = str_at(payload, &["after"])
        .or_else(|| str_at(payload, &["checkout_sha"]))
        .map(ToString::to_string);
    let author = str_at(payload, &["pusher", "name"])
        .or_else(|| str_at(payload, &["user_name"]))
        .or_else(|| str_at(payload, &["head_commit", "author", "name"]))
        .map(ToString::to_string);
    let message = str_at(payload, &["head_commit", "message"]).map(ToString::to_string);

    if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        Ok(WebhookEvent {
            event_type: WebhookEventType::Tag,
            repository,
            branch: None,
            tag: Some(tag.to_string()),
            commit,
            author,
            message,
            pull_request: None,
            release: None,
        })
    } else {
        let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
        Ok(WebhookEvent {
            event_type: WebhookEventType::Push,
            repository,
            branch: Some(branch.to_string()),
            tag: None,
            commit,
            author,
            message,
            pull_request: None,
            release: None,
        })
    }
}

fn parse_gitlab(payload: &Value) -> Result<WebhookEvent> {
    let repository = str_at(payload, &["project", "git_http_url"])
        .or_else(|| str_at(payload, &["project", "web_url"]))
        .or_else(|| str_at(payload, &["repository", "homepage"]))
        .ok_or_else(|| Error::InvalidSpec("payload has no repository URL".to_string()))?
        .to_string();

    match str_at(payload, &["object_kind"]) {
        Some("push") | Some("tag_push") => parse_ref_push(payload, repository),
        Some("merge_request") => {
            let attributes = &payload["object_attributes"];
            let number = attributes["iid"]
                .as_u64()
                .ok_or_else(|| Error::InvalidSpec("merge request has no iid".to_string()))?;
            Ok(WebhookEvent {
                event_type: WebhookEventType::PullRequest,
                repository,
                branch: attributes["source_branch"].as_str().map(ToString::to_string),
                tag: None,
                commit: str_at(attributes, &["last_commit", "id"]).map(ToString::to_string),
                author: str_at(payload, &["user", "username"]).map(ToString::to_string),
                message: attributes["title"].as_str().map(ToString::to_string),
                pull_request: Some(PullRequestInfo {
                    number,
                    action: PullRequestAction::parse(
                        attributes["action"].as_str().unwrap_or_default(),
                    ),
                    source_branch: attributes["source_branch"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    target_branch: attributes["target_branch"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                }),
                release: None,
            })
        }
        other => Err(Error::InvalidSpec(format!(
            "unsupported gitlab object_kind '{}'",
            other.unwrap_or("missing")
        ))),
    }
}

fn parse_bitbucket(event_hint: Option<&str>, payload: &Value) -> Result<WebhookEvent> {
    let repository = str_at(payload, &["repository", "links", "html", "href"])
        .ok_or_else(|| Error::InvalidSpec("payload has no repository URL".to_string()))?
        .to_string();

    if let Some(pull_request) = payload.get("pullrequest") {
        let action = match event_hint {
            Some("pullrequest:created") => PullRequestAction::Opened,
            Some("pullrequest:updated") => PullRequestAction::Synchronize,
            Some("pullrequest:fulfilled") | Some("pullrequest:rejected") => {
                PullRequestAction::Closed
            }
            _ => PullRequestAction::Other,
        };
        let number = pull_request["id"]
            .as_u64()
            .ok_or_else(|| Error::InvalidSpec("pull request has no id".to_string()))?;
        return Ok(WebhookEvent {
            event_type: WebhookEventType::PullRequest,
            repository,
            branch: str_at(pull_request, &["source", "branch", "name"]).map(ToString::to_string),
            tag: None,
            commit: str_at(pull_request, &["source", "commit", "hash"]).map(ToString::to_string),
            author: str_at(pull_request, &["author", "display_name"]).map(ToString::to_string),
            message: pull_request["title"].as_str().map(ToString::to_string),
            pull_request: Some(PullRequestInfo {
                number,
                action,
                source_branch: str_at(pull_request, &["source", "branch", "name"])
                    .unwrap_or_default()
                    .to_string(),
                target_branch: str_at(pull_request, &["destination", "branch", "name"])
                    .unwrap_or_default()
                    .to_string(),
            }),
            release: None,
        });
    }

    let change = payload["push"]["changes"]
        .as_array()
        .and_then(|changes| changes.first())
        .and_then(|change| change.get("new"))
        .ok_or_else(|| Error::InvalidSpec("push payload has no changes".to_string()))?;

    let name = change["name"]
        .as_str()
        .ok_or_else(|| Error::InvalidSpec("change has no ref name".to_string()))?;
    let commit = str_at(change, &["target", "hash"]).map(ToString::to_string);
    let author = str_at(payload, &["actor", "display_name"]).map(ToString::to_string);
    let message = str_at(change, &["target", "message"]).map(ToString::to_string);

    if change["type"].as_str() == Some("tag") {
        Ok(WebhookEvent {
            event_type: WebhookEventType::Tag,
            repository,
            branch: None,
            tag: Some(name.to_string()),
            commit,
            author,
            message,
            pull_request: None,
            release: None,
        })
    } else {
        Ok(WebhookEvent {
            event_type: WebhookEventType::Push,
            repository,
            branch: Some(name.to_string()),
            tag: None,
            commit,
            author,
            message,
            pull_request: None,
            release: None,
        })
    }
}

fn parse_gitea(event_hint: Option<&str>, payload: &Value) -> Result<WebhookEvent> {
    // Gitea payloads mirror the GitHub shapes closely enough to share the
    // parser.
    parse_github(event_hint, payload)
}
