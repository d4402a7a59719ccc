use axum::Json;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use time::OffsetDateTime;

use cloudpaste_backup::{BackupOptions, RestoreMode, RestoreOptions, create_backup, restore_backup};
use cloudpaste_cache::InvalidateEvent;
use cloudpaste_core::AppError;
use cloudpaste_core::authorize::authorize;
use cloudpaste_core::policy::{self, AuthzContext};

use super::AppState;
use super::auth::authenticate;
use super::error::{ApiError, ok_envelope};

async fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
    method: &str,
) -> Result<cloudpaste_core::Principal, ApiError> {
    let authed = authenticate(&state.db, headers).await?;
    let admin_policy = policy::lookup("admin.all")
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("missing admin.all policy")))?;
    authorize(
        &authed.principal,
        &admin_policy,
        &AuthzContext::new(method, Vec::new()),
    )?;
    Ok(authed.principal)
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateBackupRequest {
    backup_type: String,
    #[serde(default)]
    selected_modules: Vec<String>,
}

pub(super) async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateBackupRequest>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers, "POST").await?;

    let opts = BackupOptions {
        backup_type: req.backup_type.parse()?,
        selected_modules: req.selected_modules,
    };
    let envelope = create_backup(&state.db, &opts).await?;

    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    let filename = format!(
        "cloudpaste-{}-{timestamp}.json",
        opts.backup_type.as_str()
    );

    let response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        Json(envelope),
    );
    Ok(response.into_response())
}

#[derive(Debug, Default)]
struct RestoreForm {
    backup_file: Option<Vec<u8>>,
    mode: Option<String>,
    skip_integrity_check: bool,
    preserve_timestamps: bool,
}

async fn parse_restore_form(mut multipart: Multipart) -> Result<RestoreForm, ApiError> {
    let mut form = RestoreForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("bad multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "backup_file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("bad backup file: {e}")))?;
                form.backup_file = Some(bytes.to_vec());
            }
            "mode" => {
                form.mode = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(e.to_string()))?,
                )
            }
            "skipIntegrityCheck" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                form.skip_integrity_check = matches!(text.as_str(), "true" | "1");
            }
            "preserveTimestamps" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                form.preserve_timestamps = matches!(text.as_str(), "true" | "1");
            }
            _ => {}
        }
    }
    Ok(form)
}

pub(super) async fn restore(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = require_admin(&state, &headers, "POST").await?;
    let form = parse_restore_form(multipart).await?;

    let bytes = form
        .backup_file
        .ok_or_else(|| ApiError::bad_request("backup_file field is required"))?;
    let envelope: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::validation(format!("backup file is not JSON: {e}")))?;
    let mode: RestoreMode = form
        .mode
        .as_deref()
        .unwrap_or("overwrite")
        .parse()?;

    let outcome = restore_backup(
        &state.db,
        &envelope,
        &RestoreOptions {
            mode,
            current_admin_id: principal.id.clone(),
            skip_integrity_check: form.skip_integrity_check,
            preserve_timestamps: form.preserve_timestamps,
        },
    )
    .await?;

    // Everything the resolver and directory cache knew may be stale now.
    state.cache.invalidate_all();
    state.bus.publish(InvalidateEvent::all("backup restore"));

    Ok(ok_envelope("restore finished", outcome))
}
