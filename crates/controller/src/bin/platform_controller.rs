/*
 * 5D Labs Observability Platform - Controller Service
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

//! Controller Service - Kubernetes operator for `ObservabilityPlatform`
//!
//! This service manages observability platform lifecycles by:
//! - Watching `ObservabilityPlatform` custom resources
//! - Rendering and converging component workloads
//! - Coordinating GitOps delivery, drift detection and rollback
//! - Serving the webhook intake and health endpoints

use std::sync::Arc;

use controller::gitops::webhook::server::{router, AppState, EngineMetrics};
use controller::gitops::{
    promotion::AnnotationApprovals, ConfigMapGates, ConfigMapTestStatus, GitOpsCoordinator,
};
use controller::leader::LeaderElector;
use controller::reconcile::{self, Context};
use controller::render::RendererRegistry;
use controller::store::KubeStateStore;
use controller::EngineConfig;
use dashmap::DashMap;
use gitsync::GitSync;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_CLEAN: i32 = 0;
const EXIT_STARTUP_FAILURE: i32 = 1;
const EXIT_LOST_LEADERSHIP: i32 = 2;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

#[allow(clippy::too_many_lines)]
async fn run() -> i32 {
    let config = EngineConfig::from_env();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!(
        "Starting platform controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("Configuration invalid: {e}");
        return EXIT_STARTUP_FAILURE;
    }

    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect to the cluster: {e}");
            return EXIT_STARTUP_FAILURE;
        }
    };
    info!("Connected to Kubernetes cluster");

    let registry = match RendererRegistry::with_builtins() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to build renderer registry: {e}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let store = Arc::new(KubeStateStore::new(client.clone()));
    let gitsync = Arc::new(GitSync::new(
        config.git_cache_dir.clone(),
        config.host_key_policy(),
    ));

    let coordinator = Arc::new(GitOpsCoordinator::new(
        store.clone(),
        Some(gitsync),
        Arc::new(ConfigMapTestStatus::new(store.clone())),
        Arc::new(ConfigMapGates::new(store.clone())),
        Arc::new(AnnotationApprovals::new(store.clone())),
    ));

    let metrics = Arc::new(EngineMetrics::default());
    let config = Arc::new(config);
    let context = Arc::new(Context {
        client: client.clone(),
        store: store.clone(),
        registry,
        config: config.clone(),
        gitops: coordinator.clone(),
        metrics: metrics.clone(),
        backoff: Arc::new(DashMap::new()),
    });

    // The HTTP front serves health and webhooks on leaders and followers
    // alike; only the leader runs the controller.
    let app = router(AppState {
        ingest: Arc::new(coordinator.clone()),
        metrics,
    });
    let listener = match tokio::net::TcpListener::bind(&config.webhook_bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.webhook_bind_addr);
            return EXIT_STARTUP_FAILURE;
        }
    };
    info!("HTTP front listening on {}", config.webhook_bind_addr);
    if config.tls_enabled() {
        // Certificates are mounted for the fronting ingress; the process
        // itself terminates plaintext in-cluster traffic.
        info!("TLS material present; termination delegated to the ingress");
    }

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            error!("HTTP front failed: {e}");
        }
    });

    let identity = std::env::var("HOSTNAME").unwrap_or_else(|_| "platform-controller".to_string());
    let elector = LeaderElector::new(client, &config.leader_election_namespace, identity);

    if config.leader_election_disabled {
        warn!("Leader election disabled; assuming single-instance mode");
    } else if let Err(e) = elector.acquire().await {
        error!("Leader election failed: {e}");
        return EXIT_STARTUP_FAILURE;
    }

    let controller_handle = {
        let context = context.clone();
        tokio::spawn(async move {
            if let Err(e) = reconcile::run(context).await {
                error!("Controller error: {e}");
            }
        })
    };

    let exit_code = if config.leader_election_disabled {
        server_handle.await.ok();
        EXIT_CLEAN
    } else {
        tokio::select! {
            lost = elector.hold() => {
                error!("{lost}");
                EXIT_LOST_LEADERSHIP
            }
            _ = server_handle => EXIT_CLEAN,
        }
    };

    controller_handle.abort();
    info!("Controller service stopped");
    exit_code
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
