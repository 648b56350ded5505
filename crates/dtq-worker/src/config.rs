use dtq_protocol::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker_address: String,
    pub worker_id: Option<String>,
    /// Independent protocol loops run by this process
    pub concurrency: usize,
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    /// Wait before a new cycle when every connect attempt failed
    pub reconnect_backoff_ms: u64,
    /// Wait before asking again when the queue was empty
    pub poll_interval_ms: u64,
    pub unexpected_reply_delay_ms: u64,
    pub io_timeout_ms: u64,
    pub execution_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            broker_address: "127.0.0.1:5555".to_string(),
            worker_id: None,
            concurrency: 1,
            connect_retries: 3,
            retry_delay_ms: 500,
            reconnect_backoff_ms: 5000,
            poll_interval_ms: 500,
            unexpected_reply_delay_ms: 1000,
            io_timeout_ms: 10_000,
            execution_timeout_secs: 300,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn generate_worker_id(&self) -> String {
        use std::process;
        use uuid::Uuid;

        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = process::id();
        let uuid = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &uuid[..8])
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_retries,
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.io_timeout_ms),
        )
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn unexpected_reply_delay(&self) -> Duration {
        Duration::from_millis(self.unexpected_reply_delay_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}
