use async_trait::async_trait;
use dtq_core::Task;
use std::time::Duration;

/// Result type for task handlers: the result string, or a failure reason
pub type TaskResult = Result<String, String>;

/// Trait for task handlers
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task's work
    async fn execute(&self, task: &Task) -> TaskResult;
}

/// Returns the payload unchanged
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, task: &Task) -> TaskResult {
        Ok(task.payload.clone())
    }
}

/// Simulates work by sleeping for the duration hinted in the payload.
///
/// Payloads of the form `... (Duration: 250ms)` sleep 250 ms; anything else
/// sleeps the default duration.
pub struct SimulatedHandler {
    default_duration: Duration,
}

impl SimulatedHandler {
    pub fn new(default_duration: Duration) -> Self {
        SimulatedHandler { default_duration }
    }

    fn duration_for(&self, payload: &str) -> Duration {
        parse_duration_hint(payload)
            .map(Duration::from_millis)
            .unwrap_or(self.default_duration)
    }
}

impl Default for SimulatedHandler {
    fn default() -> Self {
        SimulatedHandler::new(Duration::from_millis(1000))
    }
}

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn execute(&self, task: &Task) -> TaskResult {
        tokio::time::sleep(self.duration_for(&task.payload)).await;
        Ok(format!("Processed Result for task {}", task.task_id))
    }
}

/// Extract `N` from a `(Duration: Nms)` marker
pub fn parse_duration_hint(payload: &str) -> Option<u64> {
    const MARKER: &str = "(Duration: ";

    let start = payload.find(MARKER)? + MARKER.len();
    let rest = &payload[start..];
    let end = rest.find("ms)")?;
    rest[..end].trim().parse().ok()
}
