use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::PolicyCatalog;
use crate::config::BasicAuth;
use crate::error::ExceptionError;
use crate::exception::ExceptionRequest;
use crate::metrics;

/* ============================= STATE ============================= */

#[derive(Clone)]
pub struct AppState {
    ready: Arc<AtomicBool>,
    catalog: Arc<dyn PolicyCatalog>,
    auth: Option<Arc<BasicAuth>>,
}

impl AppState {
    /// Basic auth is enforced on the API only when both credentials are set.
    pub fn new(catalog: Arc<dyn PolicyCatalog>, auth: BasicAuth) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            catalog,
            auth: auth.is_enabled().then(|| Arc::new(auth)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/* ============================= ROUTER ============================= */

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/policies", get(list_policies))
        .route("/policies/exception", post(create_exception))
        .route("/policies/*policy", get(get_policy))
        .route_layer(middleware::from_fn_with_state(state.clone(), basic_auth));

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(ready_handler))
        .nest("/api/v1", api)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server on {addr}"))?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("http_server_stopped");
    Ok(())
}

/* ============================= HANDLERS ============================= */

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

async fn list_policies(State(state): State<AppState>) -> Response {
    match state.catalog.list().await {
        Ok(items) => Json(items).into_response(),
        Err(e) => {
            warn!(error = %e, "policy_list_failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to list policies: {e}"),
            )
                .into_response()
        }
    }
}

async fn get_policy(State(state): State<AppState>, Path(policy): Path<String>) -> Response {
    match state.catalog.get(&policy).await {
        Ok(Some(details)) => Json(details).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(policy = %policy, error = %e, "policy_details_failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to get policy details: {e}"),
            )
                .into_response()
        }
    }
}

async fn create_exception(State(state): State<AppState>, Json(request): Json<ExceptionRequest>) -> Response {
    let resource = format!("{}/{}", request.resource.kind, request.resource.name);

    match state.catalog.exception(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            warn!(resource = %resource, error = %e, "policy_exception_failed");
            let status = match e {
                ExceptionError::PolicyNotFound(_) => StatusCode::NOT_FOUND,
                ExceptionError::Render(_) => StatusCode::BAD_REQUEST,
                ExceptionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, e.to_string()).into_response()
        }
    }
}

/* ============================= BASIC AUTH ============================= */

fn authorized(auth: &BasicAuth, header: Option<&HeaderValue>) -> bool {
    let Some(encoded) = header
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Basic "))
    else {
        return false;
    };

    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };

    match credentials.split_once(':') {
        Some((user, pass)) => user == auth.username && pass == auth.password,
        None => false,
    }
}

async fn basic_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(auth) = &state.auth else {
        return next.run(request).await;
    };

    if authorized(auth, request.headers().get(header::AUTHORIZATION)) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"kyverno-plugin\"")],
    )
        .into_response()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DetailsItem, Engine as PolicyEngine, PolicyDetails, PolicyListItem, SourceCode};
    use base64::Engine as _;
    use crate::error::StoreError;
    use crate::exception::{self, ExceptionResponse};
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct FixedCatalog;

    fn item(name: &str) -> PolicyListItem {
        PolicyListItem {
            category: "Other".to_string(),
            namespace: String::new(),
            name: name.to_string(),
            title: name.to_string(),
            description: String::new(),
            severity: String::new(),
        }
    }

    #[async_trait]
    impl PolicyCatalog for FixedCatalog {
        async fn list(&self) -> Result<Vec<PolicyListItem>, StoreError> {
            Ok(vec![item("require-requests")])
        }

        async fn get(&self, resource: &str) -> Result<Option<PolicyDetails>, StoreError> {
            if resource != "team-a/require-requests" {
                return Ok(None);
            }
            Ok(Some(PolicyDetails {
                item: item("require-requests"),
                engine: PolicyEngine {
                    name: "Kyverno".to_string(),
                    version: String::new(),
                    subjects: vec![],
                },
                code: SourceCode {
                    content_type: "yaml".to_string(),
                    content: String::new(),
                },
                details: vec![DetailsItem {
                    title: "Mode".to_string(),
                    value: "Enforce".to_string(),
                }],
            }))
        }

        async fn exception(&self, request: ExceptionRequest) -> Result<ExceptionResponse, ExceptionError> {
            if let Some(policy) = request.policies.iter().find(|p| p.rules.is_empty()) {
                return Err(ExceptionError::PolicyNotFound(policy.name.clone()));
            }
            exception::build(request)
        }
    }

    fn test_state(ready: bool, auth: BasicAuth) -> AppState {
        let state = AppState::new(Arc::new(FixedCatalog), auth);
        state.set_ready(ready);
        state
    }

    fn credentials() -> BasicAuth {
        BasicAuth {
            username: "admin".to_string(),
            password: "secret".to_string(),
            secret_ref: String::new(),
        }
    }

    async fn get_request(app: Router, uri: &str, auth: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut req = axum::http::Request::builder().uri(uri);
        if let Some(auth) = auth {
            req = req.header(header::AUTHORIZATION, auth);
        }
        let resp = app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let (status, body) = get_request(build_router(test_state(false, BasicAuth::default())), "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readyz_follows_state() {
        let (status, body) = get_request(build_router(test_state(true, BasicAuth::default())), "/readyz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"READY");

        let (status, body) = get_request(build_router(test_state(false, BasicAuth::default())), "/readyz", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(&body[..], b"NOT READY");
    }

    #[tokio::test]
    async fn test_metrics_returns_ok() {
        let (status, _) = get_request(build_router(test_state(false, BasicAuth::default())), "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_policies() {
        let (status, body) = get_request(build_router(test_state(true, BasicAuth::default())), "/api/v1/policies", None).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json[0]["name"], "require-requests");
        assert_eq!(json[0]["category"], "Other");
        assert!(json[0].get("namespace").is_none());
    }

    #[tokio::test]
    async fn test_policy_details_with_namespace() {
        let app = build_router(test_state(true, BasicAuth::default()));
        let (status, body) = get_request(app, "/api/v1/policies/team-a/require-requests", None).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "require-requests");
        assert_eq!(json["engine"]["name"], "Kyverno");
        assert_eq!(json["code"]["contentType"], "yaml");
        assert_eq!(json["details"][0]["value"], "Enforce");
    }

    async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_exception_for_deployment() {
        let app = build_router(test_state(true, BasicAuth::default()));
        let (status, body) = post_json(
            app,
            "/api/v1/policies/exception",
            serde_json::json!({
                "resource": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web", "namespace": "team-a"},
                "policies": [{"name": "require-requests", "rules": [{"name": "autogen-check-requests"}]}],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["minVersion"], "1.11");
        let manifest = json["resource"].as_str().unwrap();
        assert!(manifest.contains("kind: PolicyException"));
        assert!(manifest.contains("name: web-exception"));
        assert!(manifest.contains("- ReplicaSet"));
        assert!(manifest.contains("- check-requests"));
    }

    #[tokio::test]
    async fn test_exception_unknown_policy_returns_404() {
        let app = build_router(test_state(true, BasicAuth::default()));
        let (status, _) = post_json(
            app,
            "/api/v1/policies/exception",
            serde_json::json!({
                "resource": {"kind": "Pod", "name": "nginx", "namespace": "team-a"},
                "policies": [{"name": "missing"}],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_exception_rejects_malformed_body() {
        let app = build_router(test_state(true, BasicAuth::default()));
        let (status, _) = post_json(app, "/api/v1/policies/exception", serde_json::json!({"policies": 3})).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_exception_requires_basic_auth() {
        let app = build_router(test_state(true, credentials()));
        let (status, _) = post_json(
            app,
            "/api/v1/policies/exception",
            serde_json::json!({"resource": {"kind": "Pod", "name": "nginx"}}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_policy_returns_404() {
        let app = build_router(test_state(true, BasicAuth::default()));
        let (status, _) = get_request(app, "/api/v1/policies/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_basic_auth_rejects_missing_credentials() {
        let app = build_router(test_state(true, credentials()));
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/api/v1/policies").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn test_basic_auth_accepts_valid_credentials() {
        let token = format!("Basic {}", STANDARD.encode("admin:secret"));
        let app = build_router(test_state(true, credentials()));
        let (status, _) = get_request(app, "/api/v1/policies", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_basic_auth_rejects_wrong_password() {
        let token = format!("Basic {}", STANDARD.encode("admin:nope"));
        let app = build_router(test_state(true, credentials()));
        let (status, _) = get_request(app, "/api/v1/policies", Some(&token)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_basic_auth_does_not_guard_probes() {
        let app = build_router(test_state(true, credentials()));
        let (status, _) = get_request(app, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let app = build_router(test_state(false, BasicAuth::default()));
        let (status, _) = get_request(app, "/nonexistent", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_fails_when_port_is_taken() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            serve(addr, test_state(true, BasicAuth::default()), shutdown.clone()),
        )
        .await
        .expect("bind failure must not wait for shutdown");

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to bind HTTP server"));
        assert!(!shutdown.is_cancelled());
    }
}
