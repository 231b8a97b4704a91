pub mod executors;
pub mod runtime;
pub mod scopes;

pub use executors::{executor_fn, ExecutorMap, ToolExecutor};
pub use runtime::{ClientRuntime, RuntimeConfig};
pub use scopes::ScopedContext;
