use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use serde::Deserialize;

use cloudpaste_driver_api::CopyOptions;
use cloudpaste_fs::{Channel, CopyItemSpec, StreamRequest};

use super::auth::authenticate;
use super::error::{ApiError, ok_envelope};
use super::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct PathQuery {
    path: String,
    #[serde(default)]
    refresh: bool,
}

pub(super) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let page = state
        .fs
        .list_directory(&authed.principal, &query.path, query.refresh)
        .await?;
    Ok(ok_envelope("ok", page))
}

pub(super) async fn info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let info = state.fs.get_file_info(&authed.principal, &query.path).await?;
    Ok(ok_envelope("ok", info))
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Assemble an HTTP response from a `RangeReader`.
pub(super) fn reader_response(
    mut reader: cloudpaste_fs::RangeReader,
) -> Result<Response, ApiError> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(reader.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in &reader.headers {
        builder = builder.header(name, value);
    }
    let body = match reader.take_body() {
        Some(handle) => Body::from_stream(handle.stream),
        None => Body::empty(),
    };
    builder
        .body(body)
        .map_err(|e| ApiError::from(anyhow::Error::new(e)))
}

pub(super) async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<Response, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let request = StreamRequest {
        channel: Some(Channel::FsWeb),
        range_header: header(&headers, "range"),
        if_none_match: header(&headers, "if-none-match"),
        if_modified_since: header(&headers, "if-modified-since"),
        if_match: header(&headers, "if-match"),
        if_unmodified_since: header(&headers, "if-unmodified-since"),
    };
    let reader = state
        .fs
        .open_download(&authed.principal, &query.path, &request)
        .await?;
    reader_response(reader)
}

#[derive(Debug, Deserialize)]
pub(super) struct MkdirRequest {
    path: String,
}

pub(super) async fn mkdir(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MkdirRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    state.fs.create_directory(&authed.principal, &req.path).await?;
    Ok(ok_envelope("directory created", serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RenameRequest {
    old_path: String,
    new_path: String,
}

pub(super) async fn rename(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RenameRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    state
        .fs
        .rename_item(&authed.principal, &req.old_path, &req.new_path)
        .await?;
    Ok(ok_envelope("renamed", serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CopyRequest {
    source_path: String,
    target_path: String,
    #[serde(default)]
    skip_existing: bool,
}

pub(super) async fn copy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CopyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let outcome = state
        .fs
        .copy_item(
            &authed.principal,
            &req.source_path,
            &req.target_path,
            &CopyOptions {
                skip_existing: req.skip_existing,
                on_progress: None,
            },
        )
        .await?;
    Ok(ok_envelope("copied", outcome))
}

#[derive(Debug, Deserialize)]
pub(super) struct BatchDeleteRequest {
    paths: Vec<String>,
}

pub(super) async fn batch_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BatchDeleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let result = state
        .fs
        .batch_remove_items(&authed.principal, &req.paths)
        .await?;
    Ok(ok_envelope("batch delete finished", result))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct BatchCopyRequest {
    items: Vec<CopyItemSpec>,
    #[serde(default)]
    skip_existing: bool,
}

/// Same-storage items copy inline; cross-storage items enqueue a copy task
/// whose id is returned alongside the plans.
pub(super) async fn batch_copy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BatchCopyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let result = state
        .fs
        .batch_copy_items(
            &authed.principal,
            &req.items,
            &CopyOptions {
                skip_existing: req.skip_existing,
                on_progress: None,
            },
        )
        .await?;

    let task_id = if result.cross_storage_results.is_empty() {
        None
    } else {
        let items: Vec<CopyItemSpec> = result
            .cross_storage_results
            .iter()
            .map(|plan| CopyItemSpec {
                source_path: plan.source_path.clone(),
                target_path: plan.target_path.clone(),
            })
            .collect();
        let task = state
            .orchestrator
            .create_task(
                "copy",
                serde_json::json!({
                    "items": items,
                    "options": {"skipExisting": req.skip_existing},
                }),
                &authed.principal,
            )
            .await?;
        Some(task.id)
    };

    Ok(ok_envelope(
        "batch copy dispatched",
        serde_json::json!({
            "outcomes": result.outcomes,
            "crossStorageResults": result.cross_storage_results,
            "taskId": task_id,
        }),
    ))
}
