//! Webhook intake tests: HTTP status mapping through the axum router and
//! signature enforcement through the coordinator.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::InMemoryStore;
use controller::crds::{
    ComponentSpec, ComponentsSpec, GitOpsSpec, GitRepositorySpec, ObservabilityPlatform,
    ObservabilityPlatformSpec,
};
use controller::gitops::promotion::AnnotationApprovals;
use controller::gitops::syncstate::{SyncRecord, SyncStateStore, SyncStatus};
use controller::gitops::webhook::server::{router, AppState, EngineMetrics};
use controller::gitops::{ConfigMapGates, ConfigMapTestStatus, GitOpsCoordinator};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tower::ServiceExt;

const WEBHOOK_SECRET: &str = "w3bhook-s3cret";

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn tracked_platform() -> ObservabilityPlatform {
    let mut platform = ObservabilityPlatform::new(
        "demo",
        ObservabilityPlatformSpec {
            components: ComponentsSpec {
                metrics: Some(ComponentSpec {
                    enabled: true,
                    version: "v2.48.0".to_string(),
                    ..ComponentSpec::default()
                }),
                ..ComponentsSpec::default()
            },
            gitops: Some(GitOpsSpec {
                enabled: true,
                repository: GitRepositorySpec {
                    url: "https://github.com/acme/config".to_string(),
                    branch: Some("main".to_string()),
                    credentials_secret: Some("repo-creds".to_string()),
                    ..GitRepositorySpec::default()
                },
                ..GitOpsSpec::default()
            }),
            ..ObservabilityPlatformSpec::default()
        },
    );
    platform.metadata.namespace = Some("monitoring".to_string());
    platform
}

fn coordinator_with(store: Arc<InMemoryStore>) -> Arc<GitOpsCoordinator> {
    Arc::new(GitOpsCoordinator::new(
        store.clone(),
        None,
        Arc::new(ConfigMapTestStatus::new(store.clone())),
        Arc::new(ConfigMapGates::new(store.clone())),
        Arc::new(AnnotationApprovals::new(store)),
    ))
}

fn app_with(store: Arc<InMemoryStore>) -> (axum::Router, Arc<InMemoryStore>) {
    let app = router(AppState {
        ingest: Arc::new(coordinator_with(store.clone())),
        metrics: Arc::new(EngineMetrics::default()),
    });
    (app, store)
}

fn push_body() -> Vec<u8> {
    json!({
        "ref": "refs/heads/main",
        "after": "abc123",
        "repository": { "clone_url": "https://github.com/acme/config.git" },
        "pusher": { "name": "jan" },
    })
    .to_string()
    .into_bytes()
}

async fn post(app: axum::Router, uri: &str, headers: &[(&str, String)], body: Vec<u8>) -> StatusCode {
    let mut request = Request::builder().method("POST").uri(uri);
    for (name, value) in headers {
        request = request.header(*name, value.as_str());
    }
    let response = app
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap();
    response.status()
}

#[tokio::test]
async fn valid_signature_is_accepted_with_202() {
    let store = Arc::new(InMemoryStore::default());
    store.seed_platform(tracked_platform());
    store.seed_secret("monitoring", "repo-creds", &[("webhookSecret", WEBHOOK_SECRET)]);
    let (app, _store) = app_with(store);

    let body = push_body();
    let signature = sign(&body);
    let status = post(
        app,
        "/webhook/github",
        &[
            ("X-GitHub-Event", "push".to_string()),
            ("X-Hub-Signature-256", signature),
        ],
        body,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn invalid_signature_is_rejected_with_401_and_audited() {
    let store = Arc::new(InMemoryStore::default());
    store.seed_platform(tracked_platform());
    store.seed_secret("monitoring", "repo-creds", &[("webhookSecret", WEBHOOK_SECRET)]);
    let (app, store) = app_with(store);

    let body = push_body();
    let status = post(
        app,
        "/webhook/github",
        &[
            ("X-GitHub-Event", "push".to_string()),
            (
                "X-Hub-Signature-256",
                "sha256=0000000000000000000000000000000000000000000000000000000000000000"
                    .to_string(),
            ),
        ],
        body,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The rejection is audited without the payload body.
    let events = store.events.lock().unwrap();
    let rejection = events
        .iter()
        .find(|(_, reason, _)| reason == "WebhookRejected")
        .expect("rejection event recorded");
    assert!(rejection.0, "rejection is a warning event");
    assert!(!rejection.2.contains("abc123"), "payload must not leak into events");
}

#[tokio::test]
async fn unparseable_payload_is_a_400() {
    let store = Arc::new(InMemoryStore::default());
    store.seed_platform(tracked_platform());
    let (app, _store) = app_with(store);

    let status = post(app, "/webhook/github", &[], b"not json".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_provider_is_a_404() {
    let (app, _store) = app_with(Arc::new(InMemoryStore::default()));
    let status = post(app, "/webhook/svn", &[], b"{}".to_vec()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn push_for_untracked_repository_is_accepted_with_zero_matches() {
    let store = Arc::new(InMemoryStore::default());
    // No platforms seeded at all.
    let (app, _store) = app_with(store);

    let body = push_body();
    let status = post(
        app,
        "/webhook/github",
        &[("X-GitHub-Event", "push".to_string())],
        body,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn gitlab_token_equality_gates_ingest() {
    let store = Arc::new(InMemoryStore::default());
    let mut platform = tracked_platform();
    platform
        .spec
        .gitops
        .as_mut()
        .unwrap()
        .repository
        .url = "https://gitlab.com/acme/config".to_string();
    store.seed_platform(platform);
    store.seed_secret("monitoring", "repo-creds", &[("webhookSecret", WEBHOOK_SECRET)]);
    let (app, _store) = app_with(store.clone());

    let body = json!({
        "object_kind": "push",
        "ref": "refs/heads/main",
        "checkout_sha": "abc123",
        "project": { "git_http_url": "https://gitlab.com/acme/config.git" },
    })
    .to_string()
    .into_bytes();

    let ok = post(
        app,
        "/webhook/gitlab",
        &[("X-Gitlab-Token", WEBHOOK_SECRET.to_string())],
        body.clone(),
    )
    .await;
    assert_eq!(ok, StatusCode::ACCEPTED);

    let (app, _store) = app_with(store);
    let bad = post(
        app,
        "/webhook/gitlab",
        &[("X-Gitlab-Token", "wrong".to_string())],
        body,
    )
    .await;
    assert_eq!(bad, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn in_flight_sync_is_cancelled_and_audited() {
    let store = Arc::new(InMemoryStore::default());
    let platform = tracked_platform();
    store.seed_platform(platform.clone());

    // An attempt is still open when the cancellation arrives.
    let syncstate = SyncStateStore::new(store.clone());
    let record = SyncRecord::started("demo", 4, "abc123");
    assert_eq!(record.status, SyncStatus::InProgress);
    syncstate.record("monitoring", &record, 10).await.unwrap();

    let coordinator = coordinator_with(store.clone());
    let cancelled = coordinator
        .cancel_sync(&platform, "superseded by newer push")
        .await
        .unwrap();
    assert!(cancelled);

    let history = syncstate.history("monitoring", "demo").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sequence, 4);
    assert_eq!(history[0].status, SyncStatus::Cancelled);
    assert!(history[0].completed_at.is_some());
    assert_eq!(
        history[0].message.as_deref(),
        Some("superseded by newer push")
    );
    assert!(store.event_reasons().contains(&"SyncCancelled".to_string()));

    // Nothing left in flight; a second cancellation is a no-op.
    let again = coordinator
        .cancel_sync(&platform, "still superseded")
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test]
async fn health_and_metrics_endpoints_respond() {
    let (app, _store) = app_with(Arc::new(InMemoryStore::default()));
    let health = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let metrics = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
}
