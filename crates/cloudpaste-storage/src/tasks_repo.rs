use sqlx::{Connection as _, Row, SqlitePool};
use tracing::warn;

use cloudpaste_core::ids::epoch_ms;
use cloudpaste_core::task::TaskStatus;

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub stats: serde_json::Value,
    pub error: Option<String>,
    pub user_id: Option<String>,
    pub user_type: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
    pub workflow_id: Option<String>,
    /// Joined display name of the owning admin or api key (list queries).
    pub owner_name: Option<String>,
}

const COLUMNS: &str = "id, task_type, status, payload_json, stats_json, error, user_id, user_type, created_at, started_at, updated_at, finished_at, workflow_id";

fn row_to_task(row: &sqlx::sqlite::SqliteRow, with_owner: bool) -> Result<TaskRow, anyhow::Error> {
    let payload_json = row.get::<String, _>("payload_json");
    let stats_json = row.get::<String, _>("stats_json");
    Ok(TaskRow {
        id: row.get::<String, _>("id"),
        task_type: row.get::<String, _>("task_type"),
        status: row.get::<String, _>("status").parse()?,
        payload: serde_json::from_str(&payload_json)?,
        stats: serde_json::from_str(&stats_json)?,
        error: row.get::<Option<String>, _>("error"),
        user_id: row.get::<Option<String>, _>("user_id"),
        user_type: row.get::<Option<String>, _>("user_type"),
        created_at: row.get::<i64, _>("created_at"),
        started_at: row.get::<Option<i64>, _>("started_at"),
        updated_at: row.get::<i64, _>("updated_at"),
        finished_at: row.get::<Option<i64>, _>("finished_at"),
        workflow_id: row.get::<Option<String>, _>("workflow_id"),
        owner_name: if with_owner {
            row.get::<Option<String>, _>("owner_name")
        } else {
            None
        },
    })
}

pub async fn insert_task(
    db: &SqlitePool,
    id: &str,
    task_type: &str,
    payload: &serde_json::Value,
    stats: &serde_json::Value,
    user_id: Option<&str>,
    user_type: Option<&str>,
) -> Result<TaskRow, anyhow::Error> {
    let now = epoch_ms();
    let payload_json = serde_json::to_string(payload)?;
    let stats_json = serde_json::to_string(stats)?;

    sqlx::query(
        r#"
        INSERT INTO tasks (id, task_type, status, payload_json, stats_json, user_id, user_type, created_at, updated_at)
        VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(task_type)
    .bind(&payload_json)
    .bind(&stats_json)
    .bind(user_id)
    .bind(user_type)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(TaskRow {
        id: id.to_string(),
        task_type: task_type.to_string(),
        status: TaskStatus::Pending,
        payload: payload.clone(),
        stats: stats.clone(),
        error: None,
        user_id: user_id.map(|s| s.to_string()),
        user_type: user_type.map(|s| s.to_string()),
        created_at: now,
        started_at: None,
        updated_at: now,
        finished_at: None,
        workflow_id: None,
        owner_name: None,
    })
}

/// Atomically claim the oldest pending task. `BEGIN IMMEDIATE` takes the
/// write lock up front so two workers can never select the same row.
pub async fn claim_next_pending(db: &SqlitePool) -> Result<Option<TaskRow>, anyhow::Error> {
    let now = epoch_ms();
    let mut conn = db.acquire().await?;

    let mut tx = conn.begin_with("BEGIN IMMEDIATE").await?;

    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM tasks WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1"
    ))
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(None);
    };
    let mut task = row_to_task(&row, false)?;

    sqlx::query("UPDATE tasks SET status = 'running', started_at = ?, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(now)
        .bind(&task.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    task.status = TaskStatus::Running;
    task.started_at = Some(now);
    task.updated_at = now;
    Ok(Some(task))
}

pub async fn get_task(db: &SqlitePool, task_id: &str) -> Result<Option<TaskRow>, anyhow::Error> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM tasks WHERE id = ? LIMIT 1"))
        .bind(task_id)
        .fetch_optional(db)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(row_to_task(&row, false)?))
}

/// Cheap cancellation check used by handlers between items.
pub async fn is_cancelled(db: &SqlitePool, task_id: &str) -> Result<bool, anyhow::Error> {
    let row = sqlx::query("SELECT status FROM tasks WHERE id = ? LIMIT 1")
        .bind(task_id)
        .fetch_optional(db)
        .await?;
    Ok(matches!(row, Some(r) if r.get::<String, _>("status") == "cancelled"))
}

/// Persist merged stats. Status is untouched, so a concurrent cancel is
/// never overwritten; `updated_at` advances monotonically.
pub async fn update_stats(
    db: &SqlitePool,
    task_id: &str,
    stats: &serde_json::Value,
) -> Result<(), anyhow::Error> {
    let now = epoch_ms();
    sqlx::query("UPDATE tasks SET stats_json = ?, updated_at = max(updated_at, ?) WHERE id = ?")
        .bind(serde_json::to_string(stats)?)
        .bind(now)
        .bind(task_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Finish a running task. Returns false when the row was no longer
/// `running` (the user cancelled mid-flight); the cancelled status wins.
pub async fn complete_task(
    db: &SqlitePool,
    task_id: &str,
    status: TaskStatus,
    stats: &serde_json::Value,
    error: Option<&str>,
) -> Result<bool, anyhow::Error> {
    let now = epoch_ms();
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, stats_json = ?, error = ?, finished_at = ?, updated_at = ? WHERE id = ? AND status = 'running'",
    )
    .bind(status.as_str())
    .bind(serde_json::to_string(stats)?)
    .bind(error)
    .bind(now)
    .bind(now)
    .bind(task_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Cancel a pending or running task. Terminal statuses never transition,
/// so cancelling a finished (or already cancelled) task is a conflict.
pub async fn cancel_task(db: &SqlitePool, task_id: &str) -> Result<bool, anyhow::Error> {
    let now = epoch_ms();
    let result = sqlx::query(
        "UPDATE tasks SET status = 'cancelled', finished_at = ?, updated_at = ? WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(now)
    .bind(now)
    .bind(task_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete a task row; only terminal tasks may be removed.
pub async fn delete_task(db: &SqlitePool, task_id: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query(
        "DELETE FROM tasks WHERE id = ? AND status IN ('completed', 'partial', 'failed', 'cancelled')",
    )
    .bind(task_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter<'a> {
    pub status: Option<TaskStatus>,
    pub task_type: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub limit: u32,
    pub offset: u32,
}

pub async fn list_tasks(
    db: &SqlitePool,
    filter: TaskFilter<'_>,
) -> Result<Vec<TaskRow>, anyhow::Error> {
    let limit = if filter.limit == 0 { 50 } else { filter.limit };
    let rows = sqlx::query(
        r#"
        SELECT t.id, t.task_type, t.status, t.payload_json, t.stats_json, t.error,
               t.user_id, t.user_type, t.created_at, t.started_at, t.updated_at,
               t.finished_at, t.workflow_id,
               COALESCE(a.username, k.name) AS owner_name
        FROM tasks t
        LEFT JOIN admins a ON t.user_type = 'admin' AND a.id = t.user_id
        LEFT JOIN api_keys k ON t.user_type = 'apikey' AND k.id = t.user_id
        WHERE (? IS NULL OR t.status = ?)
          AND (? IS NULL OR t.task_type = ?)
          AND (? IS NULL OR t.user_id = ?)
        ORDER BY t.created_at DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.task_type)
    .bind(filter.task_type)
    .bind(filter.user_id)
    .bind(filter.user_id)
    .bind(limit as i64)
    .bind(filter.offset as i64)
    .fetch_all(db)
    .await?;

    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        tasks.push(row_to_task(&row, true)?);
    }
    Ok(tasks)
}

/// Crash recovery: any task still marked running from a previous process
/// goes back to pending. Work is at-least-once; handlers tolerate re-runs.
pub async fn recover_interrupted(db: &SqlitePool) -> Result<u64, anyhow::Error> {
    let now = epoch_ms();
    let result = sqlx::query(
        "UPDATE tasks SET status = 'pending', started_at = NULL, updated_at = ? WHERE status = 'running'",
    )
    .bind(now)
    .execute(db)
    .await?;

    let recovered = result.rows_affected();
    if recovered > 0 {
        warn!(recovered, "requeued interrupted tasks from previous run");
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn seed_task(pool: &SqlitePool, id: &str) -> TaskRow {
        insert_task(
            pool,
            id,
            "copy",
            &serde_json::json!({"items": []}),
            &serde_json::json!({}),
            Some("a1"),
            Some("admin"),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn claim_marks_oldest_pending_running() {
        let pool = db::init_in_memory().await.unwrap();
        seed_task(&pool, "copy-2501010101-aaaaaa").await;

        let claimed = claim_next_pending(&pool).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);
        assert!(claimed.started_at.is_some());

        // Nothing left to claim.
        assert!(claim_next_pending(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_wins_over_late_completion() {
        let pool = db::init_in_memory().await.unwrap();
        seed_task(&pool, "copy-2501010101-bbbbbb").await;
        let claimed = claim_next_pending(&pool).await.unwrap().unwrap();

        assert!(cancel_task(&pool, &claimed.id).await.unwrap());
        assert!(is_cancelled(&pool, &claimed.id).await.unwrap());

        // Handler returns late: completion must not overwrite the cancel.
        let done = complete_task(
            &pool,
            &claimed.id,
            TaskStatus::Completed,
            &serde_json::json!({}),
            None,
        )
        .await
        .unwrap();
        assert!(!done);
        let task = get_task(&pool, &claimed.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);

        // Double-cancel is rejected.
        assert!(!cancel_task(&pool, &claimed.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_only_terminal() {
        let pool = db::init_in_memory().await.unwrap();
        seed_task(&pool, "copy-2501010101-cccccc").await;
        assert!(!delete_task(&pool, "copy-2501010101-cccccc").await.unwrap());

        let claimed = claim_next_pending(&pool).await.unwrap().unwrap();
        complete_task(&pool, &claimed.id, TaskStatus::Completed, &serde_json::json!({}), None)
            .await
            .unwrap();
        assert!(delete_task(&pool, &claimed.id).await.unwrap());
    }

    #[tokio::test]
    async fn recovery_requeues_running_rows() {
        let pool = db::init_in_memory().await.unwrap();
        seed_task(&pool, "copy-2501010101-dddddd").await;
        claim_next_pending(&pool).await.unwrap().unwrap();

        let recovered = recover_interrupted(&pool).await.unwrap();
        assert_eq!(recovered, 1);
        let task = get_task(&pool, "copy-2501010101-dddddd").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
    }

    #[tokio::test]
    async fn list_joins_owner_name() {
        let pool = db::init_in_memory().await.unwrap();
        crate::admins_repo::create_admin(&pool, "root", "h").await.unwrap();
        let admin = crate::admins_repo::get_admin_by_username(&pool, "root")
            .await
            .unwrap()
            .unwrap();
        insert_task(
            &pool,
            "copy-2501010101-eeeeee",
            "copy",
            &serde_json::json!({}),
            &serde_json::json!({}),
            Some(&admin.id),
            Some("admin"),
        )
        .await
        .unwrap();

        let tasks = list_tasks(&pool, TaskFilter::default()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].owner_name.as_deref(), Some("root"));
    }
}
