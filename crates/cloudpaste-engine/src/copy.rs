//! The cross/same-storage copy task handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt as _;
use rand::RngExt as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cloudpaste_core::AppError;
use cloudpaste_core::task::{
    Backoff, ItemResult, ItemStatus, RetryPolicy, TaskStats,
};
use cloudpaste_driver_api::{CopyOptions, CopyStatus};
use cloudpaste_fs::CopyItemSpec;
use cloudpaste_storage::tasks_repo::TaskRow;

use crate::context::ExecutionContext;
use crate::registry::TaskHandler;
use crate::retry::is_retryable;

pub const COPY_TASK_TYPE: &str = "copy";

/// Parallelism of the size pre-scan.
const SIZE_SCAN_CONCURRENCY: usize = 10;
/// Minimum interval between persisted progress writes for one item.
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(500);
/// Upper bound on any retry backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyTaskOptions {
    #[serde(default)]
    pub skip_existing: bool,
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyPayload {
    pub items: Vec<CopyItemSpec>,
    #[serde(default)]
    pub options: CopyTaskOptions,
}

pub struct CopyHandler;

fn parse_payload(payload: &serde_json::Value) -> Result<CopyPayload, AppError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| AppError::validation(format!("invalid copy payload: {e}")))
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = match policy.backoff {
        Backoff::Exponential => policy.delay.saturating_mul(1_u64 << (attempt - 1).min(20)),
        Backoff::Linear => policy.delay.saturating_mul(attempt as u64),
    };
    // ±10 % jitter keeps retried items from stampeding together.
    let jitter = rand::rng().random_range(0.9..=1.1);
    let with_jitter = Duration::from_millis((base as f64 * jitter) as u64);
    with_jitter.min(MAX_BACKOFF)
}

#[async_trait]
impl TaskHandler for CopyHandler {
    fn task_type(&self) -> &'static str {
        COPY_TASK_TYPE
    }

    fn validate(&self, payload: &serde_json::Value) -> Result<(), AppError> {
        let parsed = parse_payload(payload)?;
        if parsed.items.is_empty() {
            return Err(AppError::validation("copy payload has no items"));
        }
        for item in &parsed.items {
            if item.source_path.trim().is_empty() || item.target_path.trim().is_empty() {
                return Err(AppError::validation(
                    "copy items need non-empty source and target paths",
                ));
            }
        }
        Ok(())
    }

    fn stats_template(&self, payload: &serde_json::Value) -> TaskStats {
        let items = parse_payload(payload)
            .map(|p| p.items)
            .unwrap_or_default();
        TaskStats {
            total_items: items.len() as u64,
            item_results: items
                .iter()
                .map(|i| ItemResult::pending(&i.source_path, &i.target_path))
                .collect(),
            ..TaskStats::default()
        }
    }

    async fn execute(
        &self,
        task: &TaskRow,
        ctx: &ExecutionContext,
    ) -> Result<TaskStats, AppError> {
        let payload = parse_payload(&task.payload)?;
        let policy = payload.options.retry_policy.unwrap_or_default();

        // Size pre-scan in parallel batches; directory items are skipped.
        let sources: Vec<String> = payload.items.iter().map(|item| item.source_path.clone()).collect();
        let sizes: Vec<Option<u64>> = futures::stream::iter(sources.into_iter().map(|source| {
            let fs = ctx.fs().clone();
            let principal = ctx.principal().clone();
            async move {
                if source.ends_with('/') {
                    return None;
                }
                match fs.get_file_info(&principal, &source).await {
                    Ok(info) if !info.is_directory => info.size,
                    _ => None,
                }
            }
        }))
        .buffered(SIZE_SCAN_CONCURRENCY)
        .collect()
        .await;

        let mut stats = self.stats_template(&task.payload);
        stats.total_bytes = sizes.iter().flatten().sum();
        for (result, size) in stats.item_results.iter_mut().zip(&sizes) {
            result.file_size = *size;
        }

        for index in 0..payload.items.len() {
            if ctx.is_cancelled().await {
                info!(task_id = %task.id, "copy task cancelled; stopping");
                break;
            }

            let item = &payload.items[index];
            stats.item_results[index].status = ItemStatus::Processing;
            persist(ctx, &stats).await;

            let mut attempt = 0_u32;
            loop {
                if attempt > 0 {
                    let delay = backoff_delay(&policy, attempt);
                    debug!(
                        task_id = %task.id,
                        source = %item.source_path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying copy item"
                    );
                    stats.item_results[index].status = ItemStatus::Retrying;
                    stats.item_results[index].retry_count = Some(attempt);
                    stats.item_results[index].last_retry_at =
                        Some(cloudpaste_core::ids::epoch_ms());
                    persist(ctx, &stats).await;
                    tokio::time::sleep(delay).await;
                }

                let progress = Arc::new(AtomicU64::new(0));
                let ticker = spawn_progress_ticker(ctx.clone(), index, progress.clone());

                let progress_for_cb = progress.clone();
                let opts = CopyOptions {
                    skip_existing: payload.options.skip_existing,
                    on_progress: Some(Arc::new(move |bytes| {
                        // Monotone high-water mark; the ticker persists it.
                        progress_for_cb.fetch_max(bytes, Ordering::Relaxed);
                    })),
                };

                let outcome = ctx
                    .fs()
                    .copy_item(ctx.principal(), &item.source_path, &item.target_path, &opts)
                    .await;
                ticker.stop();

                match outcome {
                    Ok(outcome) => {
                        match outcome.status {
                            CopyStatus::Skipped => {
                                stats.item_results[index].status = ItemStatus::Skipped;
                                stats.skipped_count += 1;
                            }
                            _ => {
                                stats.item_results[index].status = ItemStatus::Success;
                                stats.success_count += 1;
                                if let Some(length) = outcome.content_length {
                                    stats.item_results[index].bytes_transferred = Some(length);
                                    stats.bytes_transferred += length;
                                }
                            }
                        }
                        break;
                    }
                    Err(error) => {
                        let retryable = is_retryable(&error);
                        warn!(
                            task_id = %task.id,
                            source = %item.source_path,
                            attempt,
                            retryable,
                            error = %error,
                            "copy item attempt failed"
                        );
                        if retryable && attempt < policy.limit {
                            attempt += 1;
                            continue;
                        }
                        stats.item_results[index].status = ItemStatus::Failed;
                        stats.item_results[index].error = Some(error.to_string());
                        if attempt > 0 {
                            stats.item_results[index].retry_count = Some(attempt);
                        }
                        stats.failed_count += 1;
                        break;
                    }
                }
            }

            stats.processed_items += 1;
            persist(ctx, &stats).await;
        }

        Ok(stats)
    }
}

async fn persist(ctx: &ExecutionContext, stats: &TaskStats) {
    match serde_json::to_value(stats) {
        Ok(value) => {
            if let Err(error) = ctx.update_progress(&value).await {
                warn!(task_id = %ctx.task_id(), error = %error, "failed to persist copy stats");
            }
        }
        Err(error) => warn!(error = %error, "failed to serialize copy stats"),
    }
}

struct ProgressTicker {
    stop: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl ProgressTicker {
    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}

/// Persist in-flight byte counts for one item, at most every
/// `PROGRESS_MIN_INTERVAL`. The final count is persisted by the item's
/// completion write, so the ticker only ever lags, never leads.
fn spawn_progress_ticker(
    ctx: ExecutionContext,
    index: usize,
    progress: Arc<AtomicU64>,
) -> ProgressTicker {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let handle = tokio::spawn(async move {
        let mut last_persisted = 0_u64;
        loop {
            tokio::time::sleep(PROGRESS_MIN_INTERVAL).await;
            if stop_flag.load(Ordering::Relaxed) {
                return;
            }
            let bytes = progress.load(Ordering::Relaxed);
            if bytes <= last_persisted {
                continue;
            }
            last_persisted = bytes;

            // Patch only this item's live byte count.
            let task = match cloudpaste_storage::tasks_repo::get_task(ctx.db(), ctx.task_id()).await
            {
                Ok(Some(task)) => task,
                _ => continue,
            };
            let mut stats = task.stats;
            if let Some(results) = stats
                .get_mut("itemResults")
                .and_then(|v| v.as_array_mut())
                && let Some(entry) = results.get_mut(index)
                && let Some(entry) = entry.as_object_mut()
            {
                entry.insert("bytesTransferred".to_string(), serde_json::json!(bytes));
                let _ = cloudpaste_storage::tasks_repo::update_stats(
                    ctx.db(),
                    ctx.task_id(),
                    &stats,
                )
                .await;
            }
        }
    });
    ProgressTicker { stop, handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_formula_and_cap() {
        let exponential = RetryPolicy {
            limit: 3,
            delay: 2000,
            backoff: Backoff::Exponential,
        };
        for (attempt, expected_ms) in [(1, 2000_u64), (2, 4000), (3, 8000)] {
            let delay = backoff_delay(&exponential, attempt).as_millis() as u64;
            let low = expected_ms * 9 / 10;
            let high = expected_ms * 11 / 10;
            assert!((low..=high).contains(&delay), "attempt {attempt}: {delay}ms");
        }

        let linear = RetryPolicy {
            limit: 3,
            delay: 1000,
            backoff: Backoff::Linear,
        };
        let delay = backoff_delay(&linear, 3).as_millis() as u64;
        assert!((2700..=3300).contains(&delay));

        // Large attempts cap at 60 s.
        let delay = backoff_delay(&exponential, 20);
        assert_eq!(delay, MAX_BACKOFF);
    }

    #[test]
    fn validation_rejects_empty_payloads() {
        let handler = CopyHandler;
        assert!(handler.validate(&serde_json::json!({"items": []})).is_err());
        assert!(
            handler
                .validate(&serde_json::json!({"items": [{"sourcePath": "", "targetPath": "/b"}]}))
                .is_err()
        );
        assert!(
            handler
                .validate(
                    &serde_json::json!({"items": [{"sourcePath": "/a", "targetPath": "/b"}]})
                )
                .is_ok()
        );
    }

    #[test]
    fn stats_template_seeds_pending_items() {
        let handler = CopyHandler;
        let stats = handler.stats_template(
            &serde_json::json!({"items": [{"sourcePath": "/a", "targetPath": "/b"}]}),
        );
        assert_eq!(stats.total_items, 1);
        assert_eq!(stats.item_results[0].status, ItemStatus::Pending);
        assert_eq!(stats.item_results[0].source_path, "/a");
    }
}
