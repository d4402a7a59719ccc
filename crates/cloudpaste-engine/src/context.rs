use std::sync::Arc;

use sqlx::SqlitePool;

use cloudpaste_core::task::merge_stats;
use cloudpaste_core::{AppError, Principal};
use cloudpaste_fs::FsService;
use cloudpaste_storage::{api_keys_repo, tasks_repo};

/// Capabilities a handler gets while executing a job.
#[derive(Clone)]
pub struct ExecutionContext {
    db: SqlitePool,
    fs: Arc<FsService>,
    task_id: String,
    principal: Principal,
}

impl ExecutionContext {
    pub fn new(db: SqlitePool, fs: Arc<FsService>, task_id: String, principal: Principal) -> Self {
        Self {
            db,
            fs,
            task_id,
            principal,
        }
    }

    /// Rebuild the owning principal from the task row. API keys are loaded
    /// fresh so scope changes apply to recovered jobs too.
    pub async fn principal_for_task(
        db: &SqlitePool,
        user_type: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Principal, AppError> {
        match (user_type, user_id) {
            (Some("admin"), Some(id)) => Ok(Principal::admin(id, "admin")),
            (Some("apikey"), Some(id)) => {
                let key = api_keys_repo::get_key(db, id)
                    .await
                    .map_err(AppError::Internal)?
                    .ok_or_else(|| AppError::not_found(format!("api key {id} gone")))?;
                Ok(Principal::api_key(
                    key.id,
                    key.name,
                    key.role,
                    key.permissions,
                    key.basic_path,
                ))
            }
            _ => Ok(Principal::guest()),
        }
    }

    pub fn fs(&self) -> &Arc<FsService> {
        &self.fs
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Cheap cancellation probe; handlers call this between items.
    pub async fn is_cancelled(&self) -> bool {
        tasks_repo::is_cancelled(&self.db, &self.task_id)
            .await
            .unwrap_or(false)
    }

    /// Merge a partial stats object into the persisted stats. Safe to call
    /// at any granularity; the row's status is never touched.
    pub async fn update_progress(&self, partial: &serde_json::Value) -> Result<(), AppError> {
        let task = tasks_repo::get_task(&self.db, &self.task_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::not_found(format!("task {} gone", self.task_id)))?;

        let mut stats = task.stats;
        merge_stats(&mut stats, partial);
        tasks_repo::update_stats(&self.db, &self.task_id, &stats)
            .await
            .map_err(AppError::Internal)
    }
}
