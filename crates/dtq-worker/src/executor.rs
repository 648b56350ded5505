use crate::handler::TaskHandler;
use dtq_core::Task;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

/// Runs a handler against a task, bounded by an execution timeout
pub struct TaskExecutor {
    handler: Arc<dyn TaskHandler>,
    timeout: Duration,
}

impl TaskExecutor {
    pub fn new(handler: Arc<dyn TaskHandler>, timeout: Duration) -> Self {
        TaskExecutor { handler, timeout }
    }

    /// Execute the task and return it in a terminal state.
    ///
    /// A handler error, a timeout and a panic all produce a FAILED task.
    pub async fn execute(&self, mut task: Task) -> Task {
        let task_id = task.task_id;
        info!("Executing task {} with timeout {:?}", task_id, self.timeout);

        let handler = self.handler.clone();
        let input = task.clone();
        let mut handle = tokio::spawn(async move { handler.execute(&input).await });

        match timeout(self.timeout, &mut handle).await {
            Ok(Ok(Ok(result))) => {
                info!("Task {} completed successfully", task_id);
                task.complete(result);
            }
            Ok(Ok(Err(reason))) => {
                error!("Task {} failed: {}", task_id, reason);
                task.fail(reason);
            }
            Ok(Err(e)) => {
                error!("Task {} panicked: {}", task_id, e);
                task.fail("Task panicked during execution");
            }
            Err(_) => {
                handle.abort();
                error!("Task {} timed out after {:?}", task_id, self.timeout);
                task.fail(format!("Task execution timed out after {:?}", self.timeout));
            }
        }

        task
    }
}
