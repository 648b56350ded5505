use crate::{ClientError, Result};
use dtq_core::Task;
use dtq_protocol::{Message, RetryPolicy};
use tracing::{debug, info, warn};

/// Broker's answer to a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Not enqueued, with the broker's reason
    Rejected(String),
}

/// Submits tasks to a broker, one connection per task
#[derive(Debug, Clone)]
pub struct Producer {
    broker_address: String,
    retry: RetryPolicy,
}

impl Producer {
    pub fn new(broker_address: impl Into<String>, retry: RetryPolicy) -> Self {
        Producer {
            broker_address: broker_address.into(),
            retry,
        }
    }

    pub fn broker_address(&self) -> &str {
        &self.broker_address
    }

    /// Submit a task and wait for the broker's verdict
    pub async fn submit(&self, task: Task) -> Result<SubmitOutcome> {
        let task_id = task.task_id;
        let mut conn = self.retry.connect(&self.broker_address).await?;

        debug!("Sending task {} to {}", task_id, self.broker_address);
        let sent = conn.send_message(&Message::AddTask(task)).await;
        let reply = match sent {
            Ok(()) => conn.receive_message().await,
            Err(e) => Err(e),
        };
        conn.close().await;

        match reply? {
            Message::TaskAccepted => {
                info!("Task {} accepted", task_id);
                Ok(SubmitOutcome::Accepted)
            }
            Message::TaskRejected(reason) => {
                warn!("Task {} rejected: {}", task_id, reason);
                Ok(SubmitOutcome::Rejected(reason))
            }
            other => Err(ClientError::UnexpectedResponse(other.message_type())),
        }
    }
}
