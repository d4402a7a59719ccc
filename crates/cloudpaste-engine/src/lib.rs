pub mod context;
pub mod copy;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod worker;

pub use context::ExecutionContext;
pub use copy::CopyHandler;
pub use orchestrator::TaskOrchestrator;
pub use registry::{HandlerRegistry, TaskHandler};
