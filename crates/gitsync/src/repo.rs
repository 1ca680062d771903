//! Git operations using shell commands.
//!
//! Uses `tokio::process::Command` for async git operations. Clone and fetch
//! carry hard deadlines (5 and 2 minutes); a stale working tree may be
//! returned when a refresh fails, with a logged warning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::auth::{GitAuth, HostKeyPolicy};
use crate::cache::{cache_key, RepoCache};
use crate::{Error, Result};

const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Repository coordinates plus resolved credentials.
#[derive(Debug, Clone)]
pub struct RepoSpec {
    pub url: String,
    pub reference: String,
    pub auth: GitAuth,
}

/// Metadata for a single commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Handle over the shared repository cache.
pub struct GitSync {
    cache: RepoCache,
    policy: HostKeyPolicy,
    specs: DashMap<String, RepoSpec>,
}

impl GitSync {
    #[must_use]
    pub fn new(cache_dir: impl Into<PathBuf>, policy: HostKeyPolicy) -> Self {
        Self {
            cache: RepoCache::new(cache_dir),
            policy,
            specs: DashMap::new(),
        }
    }

    /// Clone a repository, returning its working directory.
    ///
    /// A fresh cache entry is returned as-is; a stale one is updated in
    /// place first. A corrupted entry is purged and re-cloned.
    pub async fn clone(&self, repo: &RepoSpec) -> Result<PathBuf> {
        let key = cache_key(&repo.url, &repo.reference);
        let _guard = self.cache.lock(&key).await;
        self.specs.insert(key.clone(), repo.clone());

        let path = self.cache.path_for(&key);

        if let Some((cached, fresh)) = self.cache.get(&key) {
            if self.is_valid_worktree(&cached).await {
                if fresh {
                    debug!(key = %key, "cache hit, entry is fresh");
                    return Ok(cached);
                }
                return self.refresh_or_stale(&key, &cached, repo).await;
            }
            warn!(key = %key, "cache entry corrupted, purging");
            self.purge(&key, &cached).await;
        } else if path.exists() {
            // Directory survived a restart; adopt or purge it.
            if self.is_valid_worktree(&path).await {
                debug!(key = %key, "adopting working tree left by a previous run");
                return self.refresh_or_stale(&key, &path, repo).await;
            }
            self.purge(&key, &path).await;
        }

        self.clone_into(repo, &path).await?;
        self.cache.record(&key, path.clone());
        Ok(path)
    }

    /// Update a previously cloned working directory from its remote.
    pub async fn pull(&self, working_dir: &Path) -> Result<()> {
        let (key, spec) = self.spec_for(working_dir)?;
        let _guard = self.cache.lock(&key).await;
        self.update_in_place(&spec, working_dir).await?;
        self.cache.record(&key, working_dir.to_path_buf());
        Ok(())
    }

    /// Resolve the current HEAD commit hash.
    pub async fn revision(&self, working_dir: &Path) -> Result<String> {
        let out = self
            .run_unauthenticated("rev-parse", &["rev-parse", "HEAD"], working_dir)
            .await?;
        Ok(out.trim().to_string())
    }

    /// List files under the working tree matching a git pathspec glob.
    pub async fn files(&self, working_dir: &Path, glob: &str) -> Result<Vec<PathBuf>> {
        let out = self
            .run_unauthenticated("ls-files", &["ls-files", "--", glob], working_dir)
            .await?;
        Ok(out
            .lines()
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Produce a unified diff between two revisions.
    pub async fn diff(&self, working_dir: &Path, from: &str, to: &str) -> Result<String> {
        self.run_unauthenticated("diff", &["diff", from, to], working_dir)
            .await
    }

    /// List remote branch names (without the `origin/` prefix).
    pub async fn list_branches(&self, working_dir: &Path) -> Result<Vec<String>> {
        let out = self
            .run_unauthenticated(
                "branch",
                &["branch", "-r", "--format=%(refname:short)"],
                working_dir,
            )
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| line.trim().strip_prefix("origin/"))
            .filter(|name| *name != "HEAD")
            .map(ToString::to_string)
            .collect())
    }

    /// List tag names.
    pub async fn list_tags(&self, working_dir: &Path) -> Result<Vec<String>> {
        let out = self
            .run_unauthenticated("tag", &["tag", "--list"], working_dir)
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Fetch commit metadata for a revision.
    pub async fn commit_info(&self, working_dir: &Path, revision: &str) -> Result<CommitInfo> {
        let format = "--format=%H%x1f%an%x1f%ae%x1f%aI%x1f%s";
        let out = self
            .run_unauthenticated("show", &["show", "-s", format, revision], working_dir)
            .await?;
        parse_commit_info(out.trim()).ok_or_else(|| Error::InvalidRevision(revision.to_string()))
    }

    /// Check out a revision (detached).
    pub async fn checkout(&self, working_dir: &Path, revision: &str) -> Result<()> {
        match self
            .run_unauthenticated("checkout", &["checkout", "--detach", revision], working_dir)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Command { stderr, .. })
                if stderr.contains("unknown revision") || stderr.contains("pathspec") =>
            {
                Err(Error::InvalidRevision(revision.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Remove one working directory and its cache entry.
    pub async fn cleanup(&self, working_dir: &Path) -> Result<()> {
        if let Some(key) = self.cache.key_for_path(working_dir) {
            let _guard = self.cache.lock(&key).await;
            self.cache.evict(&key);
            self.specs.remove(&key);
        }
        match tokio::fs::remove_dir_all(working_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every cached working directory.
    pub async fn cleanup_all(&self) -> Result<()> {
        for (key, path) in self.cache.all_paths() {
            let _guard = self.cache.lock(&key).await;
            self.cache.evict(&key);
            self.specs.remove(&key);
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove cached working tree");
                }
            }
        }
        Ok(())
    }

    fn spec_for(&self, working_dir: &Path) -> Result<(String, RepoSpec)> {
        let key = self
            .cache
            .key_for_path(working_dir)
            .ok_or_else(|| Error::UnknownWorkingDir(working_dir.to_path_buf()))?;
        let spec = self
            .specs
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownWorkingDir(working_dir.to_path_buf()))?;
        Ok((key, spec))
    }

    async fn refresh_or_stale(&self, key: &str, path: &Path, repo: &RepoSpec) -> Result<PathBuf> {
        match self.update_in_place(repo, path).await {
            Ok(()) => {
                self.cache.record(key, path.to_path_buf());
                Ok(path.to_path_buf())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "update failed, returning stale working tree");
                Ok(path.to_path_buf())
            }
        }
    }

    async fn update_in_place(&self, repo: &RepoSpec, path: &Path) -> Result<()> {
        self.run_git(
            repo,
            "fetch",
            &["fetch", "--depth", "1", "origin", &repo.reference],
            Some(path),
            FETCH_TIMEOUT,
        )
        .await?;
        self.run_git(
            repo,
            "reset",
            &["reset", "--hard", "FETCH_HEAD"],
            Some(path),
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn clone_into(&self, repo: &RepoSpec, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = repo.auth.authenticated_url(&repo.url);
        let path_str = path.to_string_lossy().to_string();

        // Shallow clone of the tracked ref; commit-hash refs need the full
        // history, so fall back to a plain clone plus checkout.
        let shallow = [
            "clone",
            "--depth",
            "1",
            "--branch",
            &repo.reference,
            &url,
            &path_str,
        ];
        match self
            .run_git(repo, "clone", &shallow, None, CLONE_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Command { .. }) => {
                debug!(reference = %repo.reference, "shallow clone refused, falling back to full clone");
                let _ = tokio::fs::remove_dir_all(path).await;
                self.run_git(repo, "clone", &["clone", &url, &path_str], None, CLONE_TIMEOUT)
                    .await?;
                self.checkout(path, &repo.reference).await
            }
            Err(e) => Err(e),
        }
    }

    async fn is_valid_worktree(&self, path: &Path) -> bool {
        if !path.join(".git").exists() {
            return false;
        }
        self.run_unauthenticated("rev-parse", &["rev-parse", "--git-dir"], path)
            .await
            .is_ok()
    }

    async fn purge(&self, key: &str, path: &Path) {
        self.cache.evict(key);
        if let Err(e) = tokio::fs::remove_dir_all(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to purge corrupted cache entry");
            }
        }
    }

    async fn run_unauthenticated(
        &self,
        operation: &str,
        args: &[&str],
        cwd: &Path,
    ) -> Result<String> {
        let spec = RepoSpec {
            url: String::new(),
            reference: String::new(),
            auth: GitAuth::Anonymous,
        };
        self.run_git(&spec, operation, args, Some(cwd), DEFAULT_TIMEOUT)
            .await
    }

    async fn run_git(
        &self,
        repo: &RepoSpec,
        operation: &str,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<String> {
        let mut command = Command::new("git");
        command.args(args).kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        // Never fall through to interactive prompts inside the operator.
        command.env("GIT_TERMINAL_PROMPT", "0");
        let _key_guard = repo.auth.prepare(&mut command, self.policy)?;

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: operation.to_string(),
                timeout,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Command {
                operation: operation.to_string(),
                stderr: repo.auth.redact(stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn parse_commit_info(line: &str) -> Option<CommitInfo> {
    let mut parts = line.split('\u{1f}');
    let hash = parts.next()?.to_string();
    let author = parts.next()?.to_string();
    let email = parts.next()?.to_string();
    let timestamp = DateTime::parse_from_rfc3339(parts.next()?)
        .ok()?
        .with_timezone(&Utc);
    let message = parts.next()?.to_string();
    if hash.is_empty() {
        return None;
    }
    Some(CommitInfo {
        hash,
        author,
        email,
        timestamp,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_info_parses_unit_separated_fields() {
        let line = "abc123\u{1f}Jan Doe\u{1f}jan@example.com\u{1f}2025-06-01T12:00:00+00:00\u{1f}fix: port";
        let info = parse_commit_info(line).expect("parses");
        assert_eq!(info.hash, "abc123");
        assert_eq!(info.author, "Jan Doe");
        assert_eq!(info.email, "jan@example.com");
        assert_eq!(info.message, "fix: port");
        assert_eq!(info.timestamp.to_rfc3339(), "2025-06-01T12:00:00+00:00");
    }

    #[test]
    fn commit_info_rejects_garbage() {
        assert!(parse_commit_info("").is_none());
        assert!(parse_commit_info("onlyhash").is_none());
    }

    #[tokio::test]
    async fn cleanup_of_unknown_dir_is_idempotent() {
        let sync = GitSync::new("/tmp/gitsync-test-repo", HostKeyPolicy::Strict);
        sync.cleanup(Path::new("/tmp/gitsync-test-repo/definitely-missing"))
            .await
            .expect("missing dir is success");
    }

    #[tokio::test]
    async fn pull_of_untracked_dir_fails_cleanly() {
        let sync = GitSync::new("/tmp/gitsync-test-repo", HostKeyPolicy::Strict);
        let err = sync
            .pull(Path::new("/tmp/gitsync-test-repo/untracked"))
            .await
            .expect_err("untracked dir");
        assert!(matches!(err, Error::UnknownWorkingDir(_)));
    }
}
