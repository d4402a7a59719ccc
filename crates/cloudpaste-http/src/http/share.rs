use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;

use cloudpaste_core::{AppError, DenyReason, Principal};
use cloudpaste_fs::{Channel, StreamRequest, open_range_reader};
use cloudpaste_storage::shares_repo;
use cloudpaste_storage::password;

use super::AppState;
use super::error::ApiError;
use super::fs::reader_response;

#[derive(Debug, Deserialize)]
pub(super) struct ShareQuery {
    password: Option<String>,
}

/// Public share download by slug: password gate, expiry and view caps,
/// then the streaming layer over the backing driver.
pub(super) async fn download_share(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<ShareQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let share = shares_repo::get_file_by_slug(&state.db, &slug)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("share {slug} not found")))?;

    if let Some(hash) = shares_repo::get_file_password_hash(&state.db, &share.id).await? {
        let supplied = query.password.as_deref().unwrap_or_default();
        if supplied.is_empty() {
            return Err(AppError::Unauthenticated("password required".to_string()).into());
        }
        if !password::verify_password(&hash, supplied).unwrap_or(false) {
            return Err(
                AppError::forbidden(DenyReason::CustomCheck, "wrong share password").into(),
            );
        }
    }

    // Counting the view also enforces expiry and the view cap.
    let share = shares_repo::register_view(&state.db, &slug)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("share {slug} expired")))?;

    let (config_id, storage_path) = match (&share.storage_config_id, &share.storage_path) {
        (Some(config_id), Some(path)) => (config_id.clone(), path.clone()),
        _ => {
            return Err(
                AppError::streaming("STREAMING_ERROR.NO_RESOLVER", "share has no storage").into(),
            );
        }
    };

    // Shares are public artifacts; the driver is materialized with system
    // authority, not the downloader's.
    let (driver, _) = state
        .fs
        .resolver()
        .driver_for_config_id(&config_id, &Principal::admin("system", "system"))
        .await?;
    let descriptor = driver
        .download_file(&storage_path)
        .await
        .map_err(AppError::Driver)?;

    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let request = StreamRequest {
        channel: Some(Channel::Share),
        range_header: get("range"),
        if_none_match: get("if-none-match"),
        if_modified_since: get("if-modified-since"),
        if_match: get("if-match"),
        if_unmodified_since: get("if-unmodified-since"),
    };
    let reader = open_range_reader(descriptor.as_ref(), &request).await?;
    reader_response(reader)
}
