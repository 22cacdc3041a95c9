use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pilot_budget::TaskLimiter;
use pilot_types::{Task, TaskResult};

/// The executor seam. The core never looks inside: it dispatches a task,
/// hands over the limiter and a cancellation token, and records the outcome.
///
/// Handlers are responsible for their own effect-level idempotency (PR
/// titles keyed off the task id, and so on) — a crash between the in-memory
/// mark and the durable mark can re-run a task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        task: &Task,
        limiter: Arc<TaskLimiter>,
        cancel: CancellationToken,
    ) -> anyhow::Result<TaskResult>;
}
