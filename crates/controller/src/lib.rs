/*
 * 5D Labs Observability Platform - Kubernetes Operator
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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Reconciliation and GitOps engine for declarative observability
//! platforms.
//!
//! This crate provides the closed-loop controller for the
//! `ObservabilityPlatform` custom resource: spec validation and
//! defaulting, component rendering, convergence of cluster state, GitOps
//! delivery coordination with drift detection, promotion and rollback,
//! and the webhook intake front.

pub mod config;
pub mod crds;
pub mod error;
pub mod gitops;
pub mod leader;
pub mod reconcile;
pub mod render;
pub mod store;
pub mod validation;

// Re-export commonly used types
pub use config::EngineConfig;
pub use crds::{ObservabilityPlatform, ObservabilityPlatformSpec, ObservabilityPlatformStatus};
pub use error::{Error, Result};
pub use reconcile::Context;
