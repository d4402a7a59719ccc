use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cloudpaste_core::{AppError, Principal};
use cloudpaste_core::ids::task_id;
use cloudpaste_fs::FsService;
use cloudpaste_storage::tasks_repo::{self, TaskFilter, TaskRow};

use crate::copy::CopyHandler;
use crate::registry::HandlerRegistry;
use crate::worker::{WorkerArgs, run_worker_loop};

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 10;
pub const DEFAULT_WORKERS: usize = 2;

/// Durable job engine over the tasks table: one writer for task rows, a
/// registry of handlers and an in-process worker pool.
pub struct TaskOrchestrator {
    db: SqlitePool,
    fs: Arc<FsService>,
    registry: Arc<HandlerRegistry>,
}

impl TaskOrchestrator {
    /// Standard construction registers the built-in handlers.
    pub fn new(db: SqlitePool, fs: Arc<FsService>) -> Arc<Self> {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(CopyHandler));
        Self::with_registry(db, fs, registry)
    }

    pub fn with_registry(
        db: SqlitePool,
        fs: Arc<FsService>,
        registry: HandlerRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            fs,
            registry: Arc::new(registry),
        })
    }

    pub async fn create_task(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        principal: &Principal,
    ) -> Result<TaskRow, AppError> {
        let handler = self
            .registry
            .get(task_type)
            .ok_or_else(|| AppError::validation(format!("unknown task type: {task_type}")))?;
        handler.validate(&payload)?;

        let stats = handler.stats_template(&payload);
        let stats_value = serde_json::to_value(&stats).map_err(|e| AppError::Internal(e.into()))?;
        let id = task_id(task_type);

        let row = tasks_repo::insert_task(
            &self.db,
            &id,
            task_type,
            &payload,
            &stats_value,
            principal.id.as_deref(),
            Some(principal.kind.as_str()),
        )
        .await
        .map_err(AppError::Internal)?;

        info!(task_id = %row.id, task_type, "task enqueued");
        Ok(row)
    }

    pub async fn get_task(&self, id: &str) -> Result<TaskRow, AppError> {
        tasks_repo::get_task(&self.db, id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::not_found(format!("task {id} not found")))
    }

    pub async fn list_tasks(&self, filter: TaskFilter<'_>) -> Result<Vec<TaskRow>, AppError> {
        tasks_repo::list_tasks(&self.db, filter)
            .await
            .map_err(AppError::Internal)
    }

    /// Cancel a pending or running task. Running handlers observe the
    /// cancel at their next checkpoint.
    pub async fn cancel_task(&self, id: &str) -> Result<(), AppError> {
        let cancelled = tasks_repo::cancel_task(&self.db, id)
            .await
            .map_err(AppError::Internal)?;
        if cancelled {
            Ok(())
        } else {
            Err(AppError::conflict(format!(
                "task {id} is not pending or running"
            )))
        }
    }

    /// Delete a terminal task.
    pub async fn delete_task(&self, id: &str) -> Result<(), AppError> {
        let deleted = tasks_repo::delete_task(&self.db, id)
            .await
            .map_err(AppError::Internal)?;
        if deleted {
            Ok(())
        } else {
            Err(AppError::conflict(format!("task {id} is not terminal")))
        }
    }

    /// Startup crash recovery; call before spawning workers.
    pub async fn recover(&self) -> Result<u64, AppError> {
        tasks_repo::recover_interrupted(&self.db)
            .await
            .map_err(AppError::Internal)
    }

    pub fn spawn_workers(
        self: &Arc<Self>,
        pool_size: usize,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let pool_size = pool_size.clamp(MIN_WORKERS, MAX_WORKERS);
        info!(pool_size, "starting task workers");
        (0..pool_size)
            .map(|worker_id| {
                let args = WorkerArgs {
                    db: self.db.clone(),
                    fs: self.fs.clone(),
                    registry: self.registry.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(run_worker_loop(worker_id, args))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use cloudpaste_cache::{CacheBus, DirectoryCache};
    use cloudpaste_core::DriverError;
    use cloudpaste_core::task::{ItemStatus, TaskStatus};
    use cloudpaste_driver_api::{
        CapabilitySet, CopyOptions, CopyOutcome, DriverKind, StorageDriver,
    };
    use cloudpaste_drivers::local::LocalDriver;
    use cloudpaste_fs::MountResolver;
    use cloudpaste_storage::db;
    use cloudpaste_storage::mounts_repo::{self, NewMount, WebdavPolicy};
    use cloudpaste_storage::secrets::SecretsCipher;
    use cloudpaste_storage::storage_configs_repo::{self, NewStorageConfig};

    use super::*;
    use crate::context::ExecutionContext;
    use crate::registry::TaskHandler;

    /// Local driver wrapper whose copy fails N times with a connection
    /// reset before succeeding.
    struct FlakyDriver {
        inner: LocalDriver,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl StorageDriver for FlakyDriver {
        fn kind(&self) -> DriverKind {
            self.inner.kind()
        }

        fn capabilities(&self) -> CapabilitySet {
            self.inner.capabilities()
        }

        async fn initialize(&self) -> Result<(), DriverError> {
            self.inner.initialize().await
        }

        async fn list_directory(
            &self,
            path: &str,
            opts: &cloudpaste_driver_api::ListOptions,
        ) -> Result<cloudpaste_driver_api::DirListing, DriverError> {
            self.inner.list_directory(path, opts).await
        }

        async fn get_file_info(
            &self,
            path: &str,
        ) -> Result<cloudpaste_driver_api::FileInfo, DriverError> {
            self.inner.get_file_info(path).await
        }

        async fn download_file(
            &self,
            path: &str,
        ) -> Result<Box<dyn cloudpaste_driver_api::StreamDescriptor>, DriverError> {
            self.inner.download_file(path).await
        }

        async fn upload_file(
            &self,
            path: &str,
            source: cloudpaste_driver_api::UploadSource,
            opts: &cloudpaste_driver_api::UploadOptions,
        ) -> Result<cloudpaste_driver_api::FileInfo, DriverError> {
            self.inner.upload_file(path, source, opts).await
        }

        async fn copy_item(
            &self,
            source_path: &str,
            target_path: &str,
            opts: &CopyOptions,
        ) -> Result<CopyOutcome, DriverError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DriverError::new(
                    "ECONNRESET",
                    "connection reset by peer",
                ));
            }
            self.inner.copy_item(source_path, target_path, opts).await
        }
    }

    struct Harness {
        orchestrator: Arc<TaskOrchestrator>,
        pool: SqlitePool,
        _tmp: tempfile::TempDir,
    }

    async fn harness(failures: u32) -> Harness {
        let pool = db::init_in_memory().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();

        let config = storage_configs_repo::create_config(
            &pool,
            NewStorageConfig {
                name: "local",
                driver_kind: "LOCAL",
                config: serde_json::json!({"root": tmp.path().to_string_lossy()}),
                is_public: true,
                is_default: false,
                quota_bytes: None,
                admin_id: None,
            },
        )
        .await
        .unwrap();
        mounts_repo::create_mount(
            &pool,
            NewMount {
                name: "root",
                storage_config_id: &config.id,
                mount_path: "/",
                web_proxy: false,
                enable_sign: false,
                sign_expires: None,
                webdav_policy: WebdavPolicy::Redirect302,
                sort_order: 0,
                cache_ttl: None,
                created_by: None,
            },
        )
        .await
        .unwrap();

        let cipher = SecretsCipher::from_secret("test").unwrap();
        let resolver = MountResolver::new(pool.clone(), cipher);
        resolver.prime_driver(
            &config.id,
            Arc::new(FlakyDriver {
                inner: LocalDriver::new(tmp.path()),
                failures_left: AtomicU32::new(failures),
            }),
        );

        let fs = cloudpaste_fs::FsService::new(
            pool.clone(),
            resolver,
            Arc::new(DirectoryCache::default()),
            Arc::new(CacheBus::new()),
        );
        let orchestrator = TaskOrchestrator::new(pool.clone(), fs);

        Harness {
            orchestrator,
            pool,
            _tmp: tmp,
        }
    }

    async fn wait_terminal(orchestrator: &TaskOrchestrator, id: &str) -> TaskRow {
        for _ in 0..600 {
            let task = orchestrator.get_task(id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {id} never reached a terminal status");
    }

    #[tokio::test]
    async fn copy_task_retries_transient_failure_then_completes() {
        let h = harness(1).await;
        let admin = Principal::admin("a1", "root");

        // 10 MiB source file.
        let payload = vec![0x5a_u8; 10 * 1024 * 1024];
        h.orchestrator
            .fs
            .upload_file(
                &admin,
                "/a.bin",
                cloudpaste_driver_api::UploadSource::Bytes(bytes::Bytes::from(payload)),
                &cloudpaste_driver_api::UploadOptions {
                    overwrite: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let task = h
            .orchestrator
            .create_task(
                "copy",
                serde_json::json!({
                    "items": [{"sourcePath": "/a.bin", "targetPath": "/b.bin"}],
                    "options": {"retryPolicy": {"limit": 3, "delay": 20, "backoff": "exponential"}},
                }),
                &admin,
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.id.starts_with("copy-"));

        let shutdown = CancellationToken::new();
        let workers = h.orchestrator.spawn_workers(2, shutdown.clone());

        let done = wait_terminal(&h.orchestrator, &task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.finished_at.unwrap() >= done.started_at.unwrap());
        assert!(done.started_at.unwrap() >= done.created_at);

        let stats: cloudpaste_core::task::TaskStats =
            serde_json::from_value(done.stats).unwrap();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failed_count, 0);
        assert_eq!(stats.processed_items, 1);
        let item = &stats.item_results[0];
        assert_eq!(item.status, ItemStatus::Success);
        assert_eq!(item.retry_count, Some(1));
        assert_eq!(item.bytes_transferred, Some(10 * 1024 * 1024));
        assert_eq!(stats.bytes_transferred, 10 * 1024 * 1024);

        shutdown.cancel();
        for worker in workers {
            let _ = worker.await;
        }
    }

    #[tokio::test]
    async fn exhausted_retries_mark_item_failed() {
        let h = harness(10).await;
        let admin = Principal::admin("a1", "root");

        h.orchestrator
            .fs
            .upload_file(
                &admin,
                "/a.bin",
                cloudpaste_driver_api::UploadSource::Bytes(bytes::Bytes::from_static(b"tiny")),
                &cloudpaste_driver_api::UploadOptions {
                    overwrite: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let task = h
            .orchestrator
            .create_task(
                "copy",
                serde_json::json!({
                    "items": [{"sourcePath": "/a.bin", "targetPath": "/b.bin"}],
                    "options": {"retryPolicy": {"limit": 2, "delay": 10, "backoff": "linear"}},
                }),
                &admin,
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let workers = h.orchestrator.spawn_workers(1, shutdown.clone());

        let done = wait_terminal(&h.orchestrator, &task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        let stats: cloudpaste_core::task::TaskStats =
            serde_json::from_value(done.stats).unwrap();
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.item_results[0].status, ItemStatus::Failed);
        assert_eq!(stats.item_results[0].retry_count, Some(2));
        assert!(stats.item_results[0].error.as_deref().unwrap().contains("ECONNRESET"));

        shutdown.cancel();
        for worker in workers {
            let _ = worker.await;
        }
    }

    struct StallHandler;

    #[async_trait]
    impl TaskHandler for StallHandler {
        fn task_type(&self) -> &'static str {
            "stall"
        }

        fn validate(&self, _payload: &serde_json::Value) -> Result<(), AppError> {
            Ok(())
        }

        fn stats_template(&self, _payload: &serde_json::Value) -> cloudpaste_core::task::TaskStats {
            cloudpaste_core::task::TaskStats::default()
        }

        async fn execute(
            &self,
            _task: &TaskRow,
            ctx: &ExecutionContext,
        ) -> Result<cloudpaste_core::task::TaskStats, AppError> {
            // Cooperative loop: observe the cancel at the next checkpoint.
            while !ctx.is_cancelled().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(cloudpaste_core::task::TaskStats::default())
        }
    }

    #[tokio::test]
    async fn cancellation_is_observed_and_preserved() {
        let h = harness(0).await;
        let admin = Principal::admin("a1", "root");

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(StallHandler));
        let orchestrator = TaskOrchestrator::with_registry(
            h.pool.clone(),
            h.orchestrator.fs.clone(),
            registry,
        );

        let task = orchestrator
            .create_task("stall", serde_json::json!({}), &admin)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let workers = orchestrator.spawn_workers(1, shutdown.clone());

        // Wait until the worker picked the task up.
        for _ in 0..200 {
            if orchestrator.get_task(&task.id).await.unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        orchestrator.cancel_task(&task.id).await.unwrap();
        let done = wait_terminal(&orchestrator, &task.id).await;
        assert_eq!(done.status, TaskStatus::Cancelled);

        // Double-cancel conflicts.
        let err = orchestrator.cancel_task(&task.id).await.unwrap_err();
        assert_eq!(err.status_code(), 409);

        shutdown.cancel();
        for worker in workers {
            let _ = worker.await;
        }
    }
}
