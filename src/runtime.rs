//! Async entry points for schedulers running on Tokio.
//!
//! Scans, cache queries and drains block on external libraries and the file
//! system, so they run on the blocking thread pool.

use std::sync::Arc;

use crate::context::{CompletionToken, OperationContext};
use crate::error::TaskError;
use crate::graph::{ScanRequest, ScanResult};
use crate::task::{ActionOutcome, TaskAction};

async fn blocking<T, F>(f: F) -> Result<T, TaskError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Ok(value),
        Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
        Err(error) => Err(TaskError::Join(error)),
    }
}

/// Scans one translation unit, see [`ModuleDependencyGraph::scan_dependencies`].
///
/// [`ModuleDependencyGraph::scan_dependencies`]: crate::graph::ModuleDependencyGraph::scan_dependencies
pub async fn scan_dependencies(
    context: Arc<OperationContext>,
    request: ScanRequest,
) -> Result<ScanResult, TaskError> {
    Ok(blocking(move || context.graph().scan_dependencies(&request)).await??)
}

pub async fn perform(
    context: Arc<OperationContext>,
    action: TaskAction,
) -> Result<ActionOutcome, TaskError> {
    blocking(move || action.perform(&context)).await?
}

/// Drains the context without blocking the async runtime.
pub async fn wait_for_completion(
    context: Arc<OperationContext>,
) -> Result<CompletionToken, TaskError> {
    blocking(move || context.wait_for_completion()).await
}
