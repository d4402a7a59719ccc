//! Direct upload: stream the request body into a storage driver and
//! publish the result as a file share.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use futures_util::TryStreamExt as _;
use rand::RngExt as _;
use serde::Deserialize;

use cloudpaste_core::authorize::authorize;
use cloudpaste_core::ids::epoch_s;
use cloudpaste_core::policy::{self, AuthzContext};
use cloudpaste_core::{AppError, Principal};
use cloudpaste_core::path as vpath;
use cloudpaste_driver_api::{Capability, UploadOptions, UploadSource};
use cloudpaste_storage::shares_repo::{self, NewFileShare};
use cloudpaste_storage::storage_configs_repo;
use cloudpaste_storage::password;

use super::AppState;
use super::auth::authenticate;
use super::error::ApiError;

const SLUG_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";
const SLUG_LEN: usize = 6;
const DEFAULT_LINK_TTL: u64 = 3600;

fn random_slug() -> String {
    let mut rng = rand::rng();
    (0..SLUG_LEN)
        .map(|_| SLUG_CHARSET[rng.random_range(0..SLUG_CHARSET.len())] as char)
        .collect()
}

#[derive(Debug, Deserialize)]
pub(super) struct UploadQuery {
    slug: Option<String>,
    path: Option<String>,
    storage_config_id: Option<String>,
    /// Share lifetime in hours.
    expires_in: Option<i64>,
    max_views: Option<i64>,
    remark: Option<String>,
    password: Option<String>,
    /// "0" | "1"
    use_proxy: Option<String>,
    /// "0" | "1": replace an existing share with the same slug.
    r#override: Option<String>,
    original_filename: Option<String>,
}

fn flag(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true"))
}

async fn pick_storage_config(
    state: &AppState,
    principal: &Principal,
    requested: Option<&str>,
) -> Result<String, AppError> {
    if let Some(id) = requested {
        return Ok(id.to_string());
    }
    let configs = storage_configs_repo::list_configs(&state.db)
        .await
        .map_err(AppError::Internal)?;
    // The caller's own default wins; any default is the fallback.
    let own_default = configs.iter().find(|c| {
        c.is_default && principal.id.is_some() && c.admin_id == principal.id
    });
    let any_default = configs.iter().find(|c| c.is_default);
    own_default
        .or(any_default)
        .map(|c| c.id.clone())
        .ok_or_else(|| AppError::validation("no storage config selected and no default exists"))
}

pub(super) async fn upload_direct(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    let principal = authed.principal;

    let share_policy = policy::lookup("file.share")
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("missing file.share policy")))?;
    authorize(
        &principal,
        &share_policy,
        &AuthzContext::new("PUT", Vec::new()),
    )?;

    if filename.trim().is_empty() {
        return Err(AppError::validation("filename must not be empty").into());
    }

    // Slug collision handling: override replaces, otherwise conflict.
    let slug = match &query.slug {
        Some(slug) if !slug.trim().is_empty() => slug.trim().to_string(),
        _ => random_slug(),
    };
    if flag(&query.r#override) {
        if let Some(existing) = shares_repo::get_file_by_slug(&state.db, &slug).await? {
            shares_repo::delete_file_share(&state.db, &existing.id).await?;
        }
    } else if shares_repo::slug_exists(&state.db, &slug).await? {
        return Err(ApiError::conflict(format!("slug {slug} already exists")));
    }

    let config_id =
        pick_storage_config(&state, &principal, query.storage_config_id.as_deref()).await?;
    let (driver, config) = state
        .fs
        .resolver()
        .driver_for_config_id(&config_id, &principal)
        .await?;

    let base_dir = query.path.as_deref().unwrap_or("/");
    let storage_path = vpath::join(
        &vpath::normalize(base_dir).map_err(AppError::Internal)?,
        &format!("{slug}-{filename}"),
    );

    let content_length = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    let stream = body
        .into_data_stream()
        .map_err(std::io::Error::other);
    let source = UploadSource::Stream {
        stream: Box::pin(stream),
        size: content_length,
    };

    let mimetype = mime_guess::from_path(&filename)
        .first_or_octet_stream()
        .to_string();
    let info = driver
        .upload_file(
            &storage_path,
            source,
            &UploadOptions {
                content_type: Some(mimetype.clone()),
                overwrite: true,
            },
        )
        .await
        .map_err(AppError::Driver)?;

    let display_name = query
        .original_filename
        .clone()
        .unwrap_or_else(|| filename.clone());
    let expires_at = query.expires_in.map(|hours| epoch_s() + hours * 3600);
    let use_proxy = flag(&query.use_proxy);

    let share = shares_repo::create_file_share(
        &state.db,
        NewFileShare {
            slug: &slug,
            filename: &display_name,
            mimetype: Some(&mimetype),
            size: info.size.map(|s| s as i64),
            remark: query.remark.as_deref(),
            storage_config_id: Some(&config.id),
            storage_path: Some(&storage_path),
            use_proxy,
            expires_at,
            max_views: query.max_views,
            created_by: principal.created_by().as_deref(),
        },
    )
    .await?;

    let requires_password = match &query.password {
        Some(password) if !password.is_empty() => {
            let hash = password::hash_password(password).map_err(AppError::Internal)?;
            shares_repo::set_file_password(&state.db, &share.id, &hash, password).await?;
            true
        }
        _ => false,
    };

    // Link selection mirrors the driver's capability set.
    let capabilities = driver.capabilities();
    let (download_url, link_type) = if !use_proxy && capabilities.contains(Capability::DirectLink) {
        let link = driver
            .generate_download_url(&storage_path, DEFAULT_LINK_TTL)
            .await
            .map_err(AppError::Driver)?;
        (link.url, "direct")
    } else if driver.supports_proxy_mode() {
        (format!("/api/share/{slug}"), "proxy")
    } else {
        (format!("/api/share/{slug}"), "url_proxy")
    };
    let preview_url = format!("/api/share/{slug}?preview=1");

    Ok(Json(serde_json::json!({
        "code": 200,
        "success": true,
        "message": "upload completed",
        "data": {
            "id": share.id,
            "slug": share.slug,
            "filename": share.filename,
            "mimetype": share.mimetype,
            "size": share.size,
            "remark": share.remark,
            "created_at": share.created_at,
            "requires_password": requires_password,
            "views": share.views,
            "max_views": share.max_views,
            "expires_at": share.expires_at,
            "previewUrl": preview_url,
            "downloadUrl": download_url,
            "linkType": link_type,
            "use_proxy": if use_proxy { 1 } else { 0 },
            "created_by": share.created_by,
        },
    })))
}
