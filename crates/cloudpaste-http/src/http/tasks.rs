use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;

use cloudpaste_core::task::TaskStatus;
use cloudpaste_core::{AppError, DenyReason, Principal};
use cloudpaste_storage::tasks_repo::{TaskFilter, TaskRow};

use super::AppState;
use super::auth::authenticate;
use super::error::{ApiError, ok_envelope};

fn require_user(principal: &Principal) -> Result<(), AppError> {
    if principal.is_guest() {
        return Err(AppError::Unauthenticated(
            "authentication required for tasks".to_string(),
        ));
    }
    Ok(())
}

fn require_owner(principal: &Principal, task: &TaskRow) -> Result<(), AppError> {
    if principal.is_admin() {
        return Ok(());
    }
    if task.user_id.as_deref() == principal.id.as_deref() {
        return Ok(());
    }
    Err(AppError::forbidden(
        DenyReason::CustomCheck,
        "task belongs to another user",
    ))
}

fn task_json(task: &TaskRow) -> serde_json::Value {
    serde_json::json!({
        "id": task.id,
        "taskType": task.task_type,
        "status": task.status,
        "payload": task.payload,
        "stats": task.stats,
        "error": task.error,
        "userId": task.user_id,
        "userType": task.user_type,
        "ownerName": task.owner_name,
        "createdAt": task.created_at,
        "startedAt": task.started_at,
        "updatedAt": task.updated_at,
        "finishedAt": task.finished_at,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateTaskRequest {
    task_type: String,
    payload: serde_json::Value,
}

pub(super) async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    require_user(&authed.principal)?;
    let task = state
        .orchestrator
        .create_task(&req.task_type, req.payload, &authed.principal)
        .await?;
    Ok(ok_envelope("task created", task_json(&task)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ListQuery {
    status: Option<String>,
    task_type: Option<String>,
    #[serde(default)]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

pub(super) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    require_user(&authed.principal)?;

    let status = match &query.status {
        Some(s) => Some(
            s.parse::<TaskStatus>()
                .map_err(|e| AppError::validation(e.to_string()))?,
        ),
        None => None,
    };
    // Non-admin callers only see their own jobs.
    let own_id = authed.principal.id.clone();
    let filter = TaskFilter {
        status,
        task_type: query.task_type.as_deref(),
        user_id: if authed.principal.is_admin() {
            None
        } else {
            own_id.as_deref()
        },
        limit: query.limit,
        offset: query.offset,
    };
    let tasks = state.orchestrator.list_tasks(filter).await?;
    let items: Vec<serde_json::Value> = tasks.iter().map(task_json).collect();
    Ok(ok_envelope("ok", items))
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    require_user(&authed.principal)?;
    let task = state.orchestrator.get_task(&id).await?;
    require_owner(&authed.principal, &task)?;
    Ok(ok_envelope("ok", task_json(&task)))
}

pub(super) async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    require_user(&authed.principal)?;
    let task = state.orchestrator.get_task(&id).await?;
    require_owner(&authed.principal, &task)?;
    state.orchestrator.cancel_task(&id).await?;
    Ok(ok_envelope("task cancelled", serde_json::Value::Null))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let authed = authenticate(&state.db, &headers).await?;
    require_user(&authed.principal)?;
    let task = state.orchestrator.get_task(&id).await?;
    require_owner(&authed.principal, &task)?;
    state.orchestrator.delete_task(&id).await?;
    Ok(ok_envelope("task deleted", serde_json::Value::Null))
}
