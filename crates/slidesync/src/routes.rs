use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use slidesync_core::db::ConflictFilter;
use slidesync_core::models::ConflictEntry;
use slidesync_core::sync::{CycleReport, EngineStatus};
use slidesync_core::{EntityType, SyncEngine};
use tower_http::trace::TraceLayer;

use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    engine: SyncEngine,
    admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(engine: SyncEngine, admin_token: Option<String>) -> Self {
        Self {
            engine,
            admin_token: admin_token.map(Arc::from),
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/status", get(status))
        .route("/sync/trigger", post(trigger_sync))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
        .route("/hot", post(mark_hot))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    shutting_down: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        shutting_down: state.engine.is_shutting_down(),
    })
}

/// Admin routes are open when no token is configured.
async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = state.admin_token.as_deref() {
        let token = extract_bearer_token(request.headers())?;
        if !tokens_match(token, expected) {
            return Err(AppError::unauthorized("Invalid admin token"));
        }
    }
    Ok(next.run(request).await)
}

/// Compares every byte regardless of where the first mismatch is.
fn tokens_match(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    if given.len() != expected.len() {
        return false;
    }
    given
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

async fn status(State(state): State<AppState>) -> Result<Json<EngineStatus>, AppError> {
    Ok(Json(state.engine.status().await?))
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    entity_type: Option<EntityType>,
    #[serde(default)]
    with_deletions: bool,
}

async fn trigger_sync(
    State(state): State<AppState>,
    body: Option<Json<TriggerRequest>>,
) -> Result<Json<CycleReport>, AppError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let report = state
        .engine
        .trigger(request.entity_type, request.with_deletions)
        .await?;
    tracing::info!(
        endpoint = "sync_trigger",
        entity = request.entity_type.map_or("all", EntityType::as_str),
        passes = report.passes.len(),
        failures = report.failures.len(),
        "Operator sync cycle finished"
    );
    Ok(Json(report))
}

async fn list_conflicts(
    State(state): State<AppState>,
    Query(filter): Query<ConflictFilter>,
) -> Result<Json<Vec<ConflictEntry>>, AppError> {
    Ok(Json(state.engine.conflicts(&filter).await?))
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ConflictEntry>, AppError> {
    Ok(Json(state.engine.resolve_conflict(id).await?))
}

#[derive(Debug, Deserialize)]
struct HotRequest {
    entity_type: EntityType,
    natural_key: String,
}

#[derive(Debug, Serialize)]
struct HotResponse {
    accepted: bool,
}

async fn mark_hot(
    State(state): State<AppState>,
    Json(request): Json<HotRequest>,
) -> Result<(StatusCode, Json<HotResponse>), AppError> {
    if request.natural_key.trim().is_empty() {
        return Err(AppError::bad_request("natural_key must not be empty"));
    }
    state
        .engine
        .mark_hot(request.entity_type, request.natural_key.trim())?;
    Ok((StatusCode::ACCEPTED, Json(HotResponse { accepted: true })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use slidesync_core::db::Database;
    use slidesync_core::SyncEngine;
    use tower::ServiceExt;

    use super::*;

    const TOKEN: &str = "admin-token-for-tests";

    async fn router(token: Option<&str>) -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(Database::open(&dir.path().join("local.db")).await.unwrap());
        let engine = SyncEngine::builder(local).build().unwrap();
        (
            app_router(AppState::new(engine, token.map(str::to_string))),
            dir,
        )
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn authed(method: Method, uri: &str, body: Option<&str>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[test]
    fn extract_bearer_token_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert!(extract_bearer_token(&headers).is_err());

        headers.insert("authorization", "bearer  abc ".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc");
    }

    #[test]
    fn tokens_match_requires_identical_bytes() {
        assert!(tokens_match(TOKEN, TOKEN));
        assert!(!tokens_match("admin-token-for-test", TOKEN));
        assert!(!tokens_match("admin-token-for-testZ", TOKEN));
        assert!(!tokens_match("", TOKEN));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_is_public() {
        let (router, _dir) = router(Some(TOKEN)).await;
        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["shutting_down"], false);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admin_routes_require_configured_token() {
        let (router, _dir) = router(Some(TOKEN)).await;

        let missing = Request::builder().uri("/v1/status").body(Body::empty()).unwrap();
        let (status, body) = send(&router, missing).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("Authorization"));

        let wrong = Request::builder()
            .uri("/v1/status")
            .header(header::AUTHORIZATION, "Bearer not-the-token")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let prefixed = Request::builder()
            .uri("/v1/status")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}-extra"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, prefixed).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&router, authed(Method::GET, "/v1/status", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "local_only");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admin_routes_are_open_without_token() {
        let (router, _dir) = router(None).await;
        let request = Request::builder().uri("/v1/conflicts").body(Body::empty()).unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Array(Vec::new()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_runs_a_cycle_for_one_entity() {
        let (router, _dir) = router(Some(TOKEN)).await;
        let request = authed(
            Method::POST,
            "/v1/sync/trigger",
            Some(r#"{"entity_type":"document"}"#),
        );
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["passes"].as_array().unwrap().is_empty());
        assert!(body["failures"].as_array().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolving_unknown_conflict_is_not_found() {
        let (router, _dir) = router(Some(TOKEN)).await;
        let (status, body) =
            send(&router, authed(Method::POST, "/v1/conflicts/42/resolve", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_hot_accepts_documents_and_rejects_blank_keys() {
        let (router, _dir) = router(Some(TOKEN)).await;

        let request = authed(
            Method::POST,
            "/v1/hot",
            Some(r#"{"entity_type":"document","natural_key":"deck-1"}"#),
        );
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], true);

        let blank = authed(
            Method::POST,
            "/v1/hot",
            Some(r#"{"entity_type":"document","natural_key":"  "}"#),
        );
        let (status, _) = send(&router, blank).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
