use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::request_id::{
    MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;

use cloudpaste_cache::{CacheBus, DirectoryCache};
use cloudpaste_core::AppError;
use cloudpaste_engine::TaskOrchestrator;
use cloudpaste_fs::FsService;
use cloudpaste_storage::{admins_repo, password};

mod auth;
mod backup;
mod error;
mod fs;
mod multipart;
mod share;
mod tasks;
mod upload;

use error::{ApiError, ok_envelope};

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub fs: Arc<FsService>,
    pub orchestrator: Arc<TaskOrchestrator>,
    pub cache: Arc<DirectoryCache>,
    pub bus: Arc<CacheBus>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    state: axum::extract::State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let admin = admins_repo::get_admin_by_username(&state.db, &req.username)
        .await?
        .ok_or_else(|| ApiError::unauthorized("invalid credentials"))?;
    if !password::verify_password(&admin.password_hash, &req.password).unwrap_or(false) {
        return Err(ApiError::unauthorized("invalid credentials"));
    }

    let token = admins_repo::issue_token(&state.db, &admin.id).await?;
    Ok(ok_envelope(
        "login ok",
        serde_json::json!({
            "token": token.token,
            "expires_at": token.expires_at,
            "username": admin.username,
        }),
    ))
}

async fn logout(
    state: axum::extract::State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = auth::authenticate(&state.db, &headers).await?;
    if let Some(token) = authed.admin_token {
        admins_repo::revoke_token(&state.db, &token).await?;
    } else if authed.principal.is_guest() {
        return Err(AppError::Unauthenticated("no session to log out".to_string()).into());
    }
    Ok(ok_envelope("logged out", serde_json::Value::Null))
}

pub fn router(state: AppState) -> Router {
    let request_id_header = axum::http::HeaderName::from_static("x-request-id");
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let request_id = request
                .extensions()
                .get::<RequestId>()
                .and_then(|v| v.header_value().to_str().ok())
                .unwrap_or("-");
            tracing::info_span!(
                "http.request",
                request_id = %request_id,
                method = %request.method(),
                uri = %request.uri(),
            )
        });

    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/upload-direct/{filename}", put(upload::upload_direct))
        .route("/api/share/{slug}", get(share::download_share))
        .route("/api/fs/list", get(fs::list))
        .route("/api/fs/info", get(fs::info))
        .route("/api/fs/file", get(fs::download))
        .route("/api/fs/mkdir", post(fs::mkdir))
        .route("/api/fs/rename", post(fs::rename))
        .route("/api/fs/copy", post(fs::copy))
        .route("/api/fs/batch-delete", post(fs::batch_delete))
        .route("/api/fs/batch-copy", post(fs::batch_copy))
        .route("/api/fs/multipart/init", post(multipart::init))
        .route("/api/fs/multipart/complete", post(multipart::complete))
        .route("/api/fs/multipart/abort", post(multipart::abort))
        .route("/api/fs/multipart/parts", get(multipart::parts))
        .route("/api/fs/multipart/refresh", post(multipart::refresh))
        .route("/api/tasks", get(tasks::list).post(tasks::create))
        .route(
            "/api/tasks/{id}",
            get(tasks::get_one).delete(tasks::delete),
        )
        .route("/api/tasks/{id}/cancel", post(tasks::cancel))
        .route("/api/admin/backup/create", post(backup::create))
        .route("/api/admin/backup/restore", post(backup::restore))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(state)
}
