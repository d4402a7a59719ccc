//! Worker pool: claim pending tasks, run their handlers, finalize status.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cloudpaste_core::task::{TaskStats, TaskStatus, final_status};
use cloudpaste_fs::FsService;
use cloudpaste_storage::tasks_repo::{self, TaskRow};

use crate::context::ExecutionContext;
use crate::registry::HandlerRegistry;

const IDLE_BACKOFF_MIN: Duration = Duration::from_millis(500);
const IDLE_BACKOFF_MAX: Duration = Duration::from_secs(8);

pub struct WorkerArgs {
    pub db: SqlitePool,
    pub fs: Arc<FsService>,
    pub registry: Arc<HandlerRegistry>,
    pub shutdown: CancellationToken,
}

pub async fn run_worker_loop(worker_id: usize, args: WorkerArgs) {
    let WorkerArgs {
        db,
        fs,
        registry,
        shutdown,
    } = args;

    let mut backoff = IDLE_BACKOFF_MIN;
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let claimed = match tasks_repo::claim_next_pending(&db).await {
            Ok(claimed) => claimed,
            Err(error) => {
                warn!(worker_id, error = %error, "failed to claim pending task");
                None
            }
        };

        let Some(task) = claimed else {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(IDLE_BACKOFF_MAX);
            continue;
        };

        backoff = IDLE_BACKOFF_MIN;
        process_task(worker_id, &db, &fs, &registry, task).await;
    }
}

async fn process_task(
    worker_id: usize,
    db: &SqlitePool,
    fs: &Arc<FsService>,
    registry: &Arc<HandlerRegistry>,
    task: TaskRow,
) {
    info!(worker_id, task_id = %task.id, task_type = %task.task_type, "task started");

    let Some(handler) = registry.get(&task.task_type) else {
        let _ = tasks_repo::complete_task(
            db,
            &task.id,
            TaskStatus::Failed,
            &task.stats,
            Some("unknown task type"),
        )
        .await;
        return;
    };

    let principal = match ExecutionContext::principal_for_task(
        db,
        task.user_type.as_deref(),
        task.user_id.as_deref(),
    )
    .await
    {
        Ok(principal) => principal,
        Err(error) => {
            warn!(task_id = %task.id, error = %error, "failed to resolve task principal");
            let _ = tasks_repo::complete_task(
                db,
                &task.id,
                TaskStatus::Failed,
                &task.stats,
                Some("owner principal unavailable"),
            )
            .await;
            return;
        }
    };

    let ctx = ExecutionContext::new(db.clone(), fs.clone(), task.id.clone(), principal);
    let (status, stats_value, error) = match handler.execute(&task, &ctx).await {
        Ok(stats) => {
            let status = final_status(&stats);
            let value = serde_json::to_value(&stats).unwrap_or(task.stats.clone());
            (status, value, stats.error)
        }
        Err(error) => {
            let mut stats: TaskStats = serde_json::from_value(task.stats.clone())
                .unwrap_or_default();
            stats.error = Some(error.to_string());
            let value = serde_json::to_value(&stats).unwrap_or(task.stats.clone());
            (TaskStatus::Failed, value, Some(error.to_string()))
        }
    };

    // The completion update only applies while the row is still running; a
    // user cancel mid-flight wins and is left untouched.
    match tasks_repo::complete_task(db, &task.id, status, &stats_value, error.as_deref()).await {
        Ok(true) => {
            info!(worker_id, task_id = %task.id, status = status.as_str(), "task finished")
        }
        Ok(false) => {
            info!(worker_id, task_id = %task.id, "task was cancelled mid-flight")
        }
        Err(persist_error) => {
            warn!(task_id = %task.id, error = %persist_error, "failed to finalize task")
        }
    }
}
