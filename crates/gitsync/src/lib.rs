/*
 * 5D Labs Observability Platform - Git Synchronizer
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Git repository synchronizer.
//!
//! Wraps the `git` CLI behind an async interface with an on-disk cache.
//! Working trees are derived state: callers must tolerate concurrent use of
//! the same cache entry, and all mutating operations on one entry are
//! serialized through a per-key lock.

pub mod auth;
pub mod cache;
pub mod repo;

pub use auth::{GitAuth, HostKeyPolicy};
pub use cache::{cache_key, RepoCache};
pub use repo::{CommitInfo, GitSync, RepoSpec};

use std::path::PathBuf;
use std::time::Duration;

/// Errors produced by git operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("git {operation} failed: {stderr}")]
    Command { operation: String, stderr: String },

    #[error("git {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repository cache corrupted at {0}")]
    CorruptCache(PathBuf),

    #[error("unknown working directory: {0}")]
    UnknownWorkingDir(PathBuf),

    #[error("invalid revision '{0}'")]
    InvalidRevision(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
