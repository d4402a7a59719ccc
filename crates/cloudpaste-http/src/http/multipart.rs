//! Frontend multipart uploads: the driver mints per-part presigned URLs,
//! the browser uploads directly, and an upload-session row tracks the
//! lifecycle.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;

use cloudpaste_cache::InvalidateEvent;
use cloudpaste_core::authorize::authorize;
use cloudpaste_core::ids::epoch_s;
use cloudpaste_core::policy::{self, AuthzContext};
use cloudpaste_core::{AppError, Principal};
use cloudpaste_core::path as vpath;
use cloudpaste_driver_api::{
    Capability, CompletedPart, MultipartInitRequest, MultipartStrategy, require_capability,
};
use cloudpaste_fs::ResolvedPath;
use cloudpaste_storage::upload_sessions_repo::{
    self, NewUploadSession, SessionStatus, UploadSession,
};

use super::AppState;
use super::auth::authenticate;
use super::error::{ApiError, ok_envelope};

const SESSION_TTL_SECONDS: i64 = 24 * 3600;

async fn resolve_for_upload(
    state: &AppState,
    principal: &Principal,
    path: &str,
) -> Result<ResolvedPath, ApiError> {
    let upload_policy = policy::lookup("fs.upload")
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("missing fs.upload policy")))?;
    authorize(
        principal,
        &upload_policy,
        &AuthzContext::new("POST", vec![path.to_string()]),
    )?;
    let resolved = state.fs.resolver().resolve(path, principal).await?;
    require_capability(resolved.driver.as_ref(), Capability::Multipart)?;
    Ok(resolved)
}

async fn session_for(
    state: &AppState,
    principal: &Principal,
    session_id: &str,
) -> Result<(UploadSession, ResolvedPath), ApiError> {
    let session = upload_sessions_repo::get_session(&state.db, session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("upload session {session_id} not found")))?;
    if session.status != SessionStatus::Active {
        return Err(ApiError::conflict(format!(
            "upload session {session_id} is {}",
            session.status.as_str()
        )));
    }
    let resolved = resolve_for_upload(state, principal, &session.fs_path).await?;
    Ok((session, resolved))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InitRequest {
    path: String,
    file_size: u64,
    mime_type: Option<String>,
    part_size: Option<u64>,
    fingerprint_algo: Option<String>,
    fingerprint_value: Option<String>,
}

pub(super) async fn init(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InitRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let resolved = resolve_for_upload(&state, &authed.principal, &req.path).await?;

    let init = resolved
        .driver
        .init_multipart_upload(
            &resolved.sub_path,
            &MultipartInitRequest {
                file_size: req.file_size,
                content_type: req.mime_type.clone(),
                part_size: req.part_size,
            },
        )
        .await
        .map_err(AppError::Driver)?;

    let strategy = match init.strategy {
        MultipartStrategy::PerPartUrl => "per_part_url",
        MultipartStrategy::SingleSession => "single_session",
    };
    let session_id = upload_sessions_repo::create_session(
        &state.db,
        NewUploadSession {
            user_id: authed.principal.id.as_deref(),
            user_type: Some(authed.principal.kind.as_str()),
            mount_id: Some(&resolved.mount.id),
            fs_path: &req.path,
            file_size: Some(req.file_size as i64),
            mime_type: req.mime_type.as_deref(),
            fingerprint_algo: req.fingerprint_algo.as_deref(),
            fingerprint_value: req.fingerprint_value.as_deref(),
            strategy,
            part_size: Some(init.part_size as i64),
            total_parts: Some(init.total_parts as i64),
            provider_upload_id: init.upload_id.as_deref(),
            provider_url: init.session_url.as_deref(),
            provider_meta: None,
            expires_at: Some(epoch_s() + SESSION_TTL_SECONDS),
        },
    )
    .await?;

    Ok(ok_envelope(
        "multipart upload initialized",
        serde_json::json!({
            "sessionId": session_id,
            "storagePath": req.path,
            "strategy": init.strategy,
            "partSize": init.part_size,
            "totalParts": init.total_parts,
            "uploadId": init.upload_id,
            "partUrls": init.part_urls,
            "sessionUrl": init.session_url,
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CompleteRequest {
    session_id: String,
    parts: Vec<CompletedPart>,
}

pub(super) async fn complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let (session, resolved) = session_for(&state, &authed.principal, &req.session_id).await?;
    let upload_id = session
        .provider_upload_id
        .clone()
        .ok_or_else(|| AppError::validation("session has no provider upload id"))?;

    let bytes_uploaded: i64 = session.file_size.unwrap_or(0);
    let completed = resolved
        .driver
        .complete_multipart_upload(&resolved.sub_path, &upload_id, req.parts.clone())
        .await
        .map_err(AppError::Driver)?;

    upload_sessions_repo::record_part_progress(
        &state.db,
        &session.id,
        req.parts.len() as i64,
        bytes_uploaded,
    )
    .await?;
    upload_sessions_repo::transition_session(&state.db, &session.id, SessionStatus::Completed)
        .await?;

    let parent = vpath::parent(&session.fs_path).unwrap_or_else(|| "/".to_string());
    state.cache.invalidate_path_and_ancestors(&resolved.mount.id, &parent);
    state.bus.publish(InvalidateEvent::fs_paths(
        resolved.mount.id.clone(),
        vec![parent],
        "multipart upload",
    ));

    Ok(ok_envelope(
        "multipart upload completed",
        serde_json::json!({
            "storagePath": session.fs_path,
            "etag": completed.etag,
            "size": completed.size,
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SessionRequest {
    session_id: String,
}

pub(super) async fn abort(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SessionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let (session, resolved) = session_for(&state, &authed.principal, &req.session_id).await?;

    if let Some(upload_id) = &session.provider_upload_id {
        resolved
            .driver
            .abort_multipart_upload(&resolved.sub_path, upload_id)
            .await
            .map_err(AppError::Driver)?;
    }
    upload_sessions_repo::transition_session(&state.db, &session.id, SessionStatus::Aborted)
        .await?;

    Ok(ok_envelope("multipart upload aborted", serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PartsQuery {
    session_id: String,
}

pub(super) async fn parts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PartsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let (session, resolved) = session_for(&state, &authed.principal, &query.session_id).await?;
    let upload_id = session
        .provider_upload_id
        .clone()
        .ok_or_else(|| AppError::validation("session has no provider upload id"))?;

    let parts = resolved
        .driver
        .list_multipart_parts(&resolved.sub_path, &upload_id)
        .await
        .map_err(AppError::Driver)?;
    Ok(ok_envelope("ok", parts))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RefreshRequest {
    session_id: String,
    part_numbers: Vec<u32>,
}

pub(super) async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let (session, resolved) = session_for(&state, &authed.principal, &req.session_id).await?;
    let upload_id = session
        .provider_upload_id
        .clone()
        .ok_or_else(|| AppError::validation("session has no provider upload id"))?;

    let urls = resolved
        .driver
        .refresh_multipart_urls(&resolved.sub_path, &upload_id, &req.part_numbers)
        .await
        .map_err(AppError::Driver)?;
    Ok(ok_envelope("ok", urls))
}
