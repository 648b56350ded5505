use crate::{config::WorkerConfig, executor::TaskExecutor, handler::TaskHandler};
use dtq_core::{Task, TaskId, TaskStatus};
use dtq_protocol::{Connection, ConnectionError, Message, MessageType, RetryPolicy};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How one request/execute/submit cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every connect attempt failed
    BrokerUnreachable,
    /// The broker had nothing to assign
    NoTask,
    /// The request failed or the reply was not an assignment
    RequestFailed,
    /// A task arrived but the receipt could not be sent
    HandoffFailed,
    /// A task was executed and its result submitted
    Processed {
        task_id: TaskId,
        status: TaskStatus,
        confirmed: bool,
    },
}

/// Worker process that executes tasks
pub struct Worker {
    config: WorkerConfig,
    worker_id: String,
    executor: TaskExecutor,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(config: WorkerConfig, handler: Arc<dyn TaskHandler>) -> Self {
        let worker_id = config.generate_worker_id();
        let executor = TaskExecutor::new(handler, config.execution_timeout());
        let retry = config.retry_policy();

        Worker {
            config,
            worker_id,
            executor,
            retry,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run `concurrency` protocol loops until shutdown
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let loops = self.config.concurrency.max(1);
        info!(
            "Starting worker {} against {} (concurrency: {})",
            self.worker_id, self.config.broker_address, loops
        );

        let mut set = JoinSet::new();
        for slot in 0..loops {
            let worker = self.clone();
            set.spawn(async move { worker.run_loop(slot).await });
        }

        while let Some(joined) = set.join_next().await {
            joined?;
        }

        info!("Worker {} stopped", self.worker_id);
        Ok(())
    }

    async fn run_loop(&self, slot: usize) {
        debug!("Worker {} loop {} started", self.worker_id, slot);

        while !self.shutdown.is_cancelled() {
            let delay = match self.run_cycle().await {
                CycleOutcome::BrokerUnreachable => Some(self.config.reconnect_backoff()),
                CycleOutcome::NoTask => Some(self.config.poll_interval()),
                CycleOutcome::RequestFailed | CycleOutcome::HandoffFailed => {
                    Some(self.config.unexpected_reply_delay())
                }
                CycleOutcome::Processed { .. } => None,
            };

            if let Some(delay) = delay {
                self.pause(delay).await;
            }
        }

        debug!("Worker {} loop {} exiting", self.worker_id, slot);
    }

    /// Sleep, waking early on shutdown
    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// One full cycle: request a task, acknowledge it, execute it and
    /// submit the result
    pub async fn run_cycle(&self) -> CycleOutcome {
        let mut conn = match self.retry.connect(&self.config.broker_address).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(
                    "Worker {} cannot reach broker at {}: {}",
                    self.worker_id, self.config.broker_address, e
                );
                return CycleOutcome::BrokerUnreachable;
            }
        };

        let task = match request_task(&mut conn).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("Worker {}: no task available", self.worker_id);
                conn.close().await;
                return CycleOutcome::NoTask;
            }
            Err(e) => {
                warn!("Worker {}: task request failed: {}", self.worker_id, e);
                conn.close().await;
                return CycleOutcome::RequestFailed;
            }
        };

        let task_id = task.task_id;
        info!("Worker {} received task {}", self.worker_id, task_id);

        // The broker requeues the task if this receipt never arrives
        if let Err(e) = conn.send_message(&Message::TaskReceived).await {
            warn!(
                "Worker {}: acknowledging task {} failed: {}",
                self.worker_id, task_id, e
            );
            conn.close().await;
            return CycleOutcome::HandoffFailed;
        }
        conn.close().await;

        let finished = self.executor.execute(task).await;
        let status = finished.status;
        let confirmed = self.submit_result(&finished).await;

        CycleOutcome::Processed {
            task_id,
            status,
            confirmed,
        }
    }

    /// Submit a finished task; true once the broker confirms it
    async fn submit_result(&self, task: &Task) -> bool {
        match self.send_result(task).await {
            Ok(()) => {
                info!(
                    "Worker {}: result for task {} confirmed ({})",
                    self.worker_id,
                    task.task_id,
                    task.status.as_str()
                );
                true
            }
            Err(e) => {
                error!(
                    "Worker {}: result for task {} not confirmed and will not be resent: {}",
                    self.worker_id, task.task_id, e
                );
                false
            }
        }
    }

    async fn send_result(&self, task: &Task) -> Result<(), ConnectionError> {
        let mut conn = self.retry.connect(&self.config.broker_address).await?;
        conn.send_message(&Message::SubmitResult(task.clone())).await?;
        let reply = conn.receive_message().await;
        conn.close().await;

        match reply? {
            Message::ResultConfirmed => Ok(()),
            other => Err(ConnectionError::unexpected(
                MessageType::ServerResultConfirmed,
                &other,
            )),
        }
    }

    /// Token cancelled when the worker shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Trigger shutdown; a cycle in progress still finishes
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Ask for a task; `None` when the queue is empty
async fn request_task(conn: &mut Connection) -> Result<Option<Task>, ConnectionError> {
    conn.send_message(&Message::RequestTask).await?;

    match conn.receive_message().await? {
        Message::AssignTask(task) => Ok(task),
        other => Err(ConnectionError::unexpected(
            MessageType::ServerAssignTask,
            &other,
        )),
    }
}
