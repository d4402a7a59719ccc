use serde::{Deserialize, Serialize};

/// Durable job status. Terminal statuses never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Partial => "partial",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Partial | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "partial" => Ok(TaskStatus::Partial),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Retrying,
    Success,
    Failed,
    Skipped,
}

/// Per-item outcome embedded in task stats. Field names are part of the
/// persisted JSON contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub source_path: String,
    pub target_path: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_transferred: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<i64>,
}

impl ItemResult {
    pub fn pending(source_path: impl Into<String>, target_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            target_path: target_path.into(),
            status: ItemStatus::Pending,
            error: None,
            file_size: None,
            bytes_transferred: None,
            retry_count: None,
            last_retry_at: None,
        }
    }
}

/// Aggregated job statistics persisted alongside the task row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub processed_items: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub skipped_count: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub item_results: Vec<ItemResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final status derivation. Order matters: an aggregate error always fails
/// the job, a run with zero failures completes, a run with zero successes
/// failed outright, anything in between is partial.
pub fn final_status(stats: &TaskStats) -> TaskStatus {
    if stats.error.is_some() {
        return TaskStatus::Failed;
    }
    if stats.failed_count == 0 {
        return TaskStatus::Completed;
    }
    if stats.success_count == 0 {
        return TaskStatus::Failed;
    }
    TaskStatus::Partial
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Linear,
    Exponential,
}

/// Retry policy accepted in copy-task payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_limit")]
    pub limit: u32,
    /// Base delay in milliseconds.
    #[serde(default = "RetryPolicy::default_delay")]
    pub delay: u64,
    #[serde(default = "RetryPolicy::default_backoff")]
    pub backoff: Backoff,
}

impl RetryPolicy {
    fn default_limit() -> u32 {
        3
    }

    fn default_delay() -> u64 {
        2000
    }

    fn default_backoff() -> Backoff {
        Backoff::Exponential
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: Self::default_limit(),
            delay: Self::default_delay(),
            backoff: Self::default_backoff(),
        }
    }
}

/// Shallow JSON-object merge used by `updateProgress`: keys in `patch`
/// replace keys in `base`; non-object patches replace the value wholesale.
pub fn merge_stats(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(base_map), Some(patch_map)) => {
            for (k, v) in patch_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        _ => *base = patch.clone(),
    }
}
