use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use cloudpaste_core::AppError;
use cloudpaste_core::task::TaskStats;
use cloudpaste_storage::tasks_repo::TaskRow;

use crate::context::ExecutionContext;

/// A background task implementation. Handlers must be idempotent enough to
/// tolerate at-least-once execution (crash recovery requeues running jobs)
/// and should poll `ctx.is_cancelled()` between units of work.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &'static str;

    fn validate(&self, payload: &serde_json::Value) -> Result<(), AppError>;

    fn stats_template(&self, payload: &serde_json::Value) -> TaskStats;

    async fn execute(&self, task: &TaskRow, ctx: &ExecutionContext)
    -> Result<TaskStats, AppError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.task_type(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}
