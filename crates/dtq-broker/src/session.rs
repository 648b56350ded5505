use crate::{config::SessionMode, metrics::BrokerMetrics, queue::TaskQueue};
use dtq_core::{now_ms, Task};
use dtq_protocol::{Connection, ConnectionError, Message, MessageType, Transport};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REJECTED_QUEUE_FULL: &str = "queue full";

/// Server side of one accepted connection.
///
/// Turns inbound messages into queue operations and drives the
/// assign/acknowledge handshake. A task whose handoff fails is put back at
/// the tail of the queue.
pub struct SessionHandler {
    queue: Arc<TaskQueue>,
    metrics: Arc<BrokerMetrics>,
    mode: SessionMode,
    shutdown: CancellationToken,
}

impl SessionHandler {
    pub fn new(
        queue: Arc<TaskQueue>,
        metrics: Arc<BrokerMetrics>,
        mode: SessionMode,
        shutdown: CancellationToken,
    ) -> Self {
        SessionHandler {
            queue,
            metrics,
            mode,
            shutdown,
        }
    }

    /// Serve the connection until the exchange ends, then close it
    pub async fn run<S: Transport>(&self, mut conn: Connection<S>) {
        match self.mode {
            SessionMode::SingleExchange => self.run_single(&mut conn).await,
            SessionMode::Persistent => self.run_persistent(&mut conn).await,
        }
        conn.close().await;
        debug!("Session with {} closed", conn.peer());
    }

    async fn run_single<S: Transport>(&self, conn: &mut Connection<S>) {
        match conn.receive_message().await {
            Ok(message) => {
                if let Err(e) = self.dispatch(conn, message).await {
                    error!("Exchange with {} failed: {}", conn.peer(), e);
                }
            }
            Err(e) => self.log_receive_failure(conn, &e),
        }
    }

    async fn run_persistent<S: Transport>(&self, conn: &mut Connection<S>) {
        loop {
            let received = tokio::select! {
                received = conn.receive_message() => received,
                _ = self.shutdown.cancelled() => {
                    info!("Closing session with {} for shutdown", conn.peer());
                    return;
                }
            };

            match received {
                Ok(message) => {
                    if let Err(e) = self.dispatch(conn, message).await {
                        error!("Exchange with {} failed: {}", conn.peer(), e);
                        return;
                    }
                }
                Err(ConnectionError::Protocol(e)) if e.is_recoverable() => {
                    warn!("Ignoring invalid message from {}: {}", conn.peer(), e);
                }
                Err(e) => {
                    self.log_receive_failure(conn, &e);
                    return;
                }
            }
        }
    }

    fn log_receive_failure<S: Transport>(&self, conn: &Connection<S>, e: &ConnectionError) {
        match e {
            ConnectionError::Closed => info!("Peer {} disconnected", conn.peer()),
            ConnectionError::Timeout(idle) => {
                info!("Peer {} idle for {:?}, closing", conn.peer(), idle)
            }
            ConnectionError::Protocol(p) if p.is_recoverable() => {
                warn!("Invalid message from {}: {}", conn.peer(), p)
            }
            other => error!("Receive from {} failed: {}", conn.peer(), other),
        }
    }

    async fn dispatch<S: Transport>(
        &self,
        conn: &mut Connection<S>,
        message: Message,
    ) -> Result<(), ConnectionError> {
        match message {
            Message::AddTask(task) => self.add_task(conn, task).await,
            Message::RequestTask => self.assign_task(conn).await,
            Message::SubmitResult(task) => self.record_result(conn, task).await,
            other @ (Message::AssignTask(_)
            | Message::TaskAccepted
            | Message::TaskRejected(_)
            | Message::TaskReceived
            | Message::ResultConfirmed) => {
                warn!(
                    "Unexpected {:?} from {}, ignoring",
                    other.message_type(),
                    conn.peer()
                );
                Ok(())
            }
        }
    }

    async fn add_task<S: Transport>(
        &self,
        conn: &mut Connection<S>,
        mut task: Task,
    ) -> Result<(), ConnectionError> {
        let task_id = task.task_id;
        task.stamp_enqueue_time();

        let reply = if self.queue.enqueue(task) {
            self.metrics.tasks_accepted.inc();
            self.metrics.set_queue_depth(self.queue.size());
            info!("Accepted task {} from {}", task_id, conn.peer());
            Message::TaskAccepted
        } else {
            self.metrics.tasks_rejected.inc();
            warn!("Rejected task {} from {}: {}", task_id, conn.peer(), REJECTED_QUEUE_FULL);
            Message::TaskRejected(REJECTED_QUEUE_FULL.to_string())
        };

        conn.send_message(&reply).await
    }

    async fn assign_task<S: Transport>(&self, conn: &mut Connection<S>) -> Result<(), ConnectionError> {
        let Some(mut task) = self.queue.dequeue() else {
            debug!("No task available for {}", conn.peer());
            return conn.send_message(&Message::AssignTask(None)).await;
        };
        self.metrics.set_queue_depth(self.queue.size());

        task.start();
        let task_id = task.task_id;

        // The task is out of the queue now; nothing below holds the queue lock
        match self.hand_off(conn, &task).await {
            Ok(()) => {
                self.metrics.tasks_assigned.inc();
                info!("Task {} delivered to {}", task_id, conn.peer());
                Ok(())
            }
            Err(e) => {
                warn!("Handoff of task {} to {} failed: {}", task_id, conn.peer(), e);
                self.requeue(task);
                Err(e)
            }
        }
    }

    /// Send the assignment and wait for the worker's receipt
    async fn hand_off<S: Transport>(
        &self,
        conn: &mut Connection<S>,
        task: &Task,
    ) -> Result<(), ConnectionError> {
        conn.send_message(&Message::AssignTask(Some(task.clone()))).await?;

        match conn.receive_message().await? {
            Message::TaskReceived => Ok(()),
            other => Err(ConnectionError::unexpected(
                MessageType::WorkerTaskReceived,
                &other,
            )),
        }
    }

    fn requeue(&self, mut task: Task) {
        let task_id = task.task_id;
        task.requeue();
        let attempt = task.retry_count;

        if self.queue.enqueue(task) {
            self.metrics.tasks_requeued.inc();
            self.metrics.set_queue_depth(self.queue.size());
            warn!("Task {} requeued (delivery retry {})", task_id, attempt);
        } else {
            self.metrics.tasks_lost.inc();
            error!(
                "Task {} LOST: requeue after failed handoff found the queue full",
                task_id
            );
        }
    }

    async fn record_result<S: Transport>(
        &self,
        conn: &mut Connection<S>,
        task: Task,
    ) -> Result<(), ConnectionError> {
        let latency_ms = task.latency_ms(now_ms());
        self.metrics.record_result(task.status, latency_ms);
        self.queue
            .update_task_result(task.task_id, &task.result, task.status);
        info!(
            "Result for task {} from {} (latency {} ms)",
            task.task_id,
            conn.peer(),
            latency_ms
        );

        conn.send_message(&Message::ResultConfirmed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dtq_core::TaskStatus;
    use dtq_protocol::Frame;
    use tokio::io::{duplex, DuplexStream};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        queue: Arc<TaskQueue>,
        metrics: Arc<BrokerMetrics>,
        client: Connection<DuplexStream>,
        session: JoinHandle<()>,
    }

    fn start(capacity: usize, mode: SessionMode) -> Harness {
        let queue = Arc::new(TaskQueue::new(capacity));
        let metrics = Arc::new(BrokerMetrics::new().unwrap());
        start_with(queue, metrics, mode)
    }

    fn start_with(queue: Arc<TaskQueue>, metrics: Arc<BrokerMetrics>, mode: SessionMode) -> Harness {
        let (client, server) = duplex(1024);
        let handler = SessionHandler::new(
            queue.clone(),
            metrics.clone(),
            mode,
            CancellationToken::new(),
        );
        let session = tokio::spawn(async move {
            handler.run(Connection::new(server, "test-peer", None)).await;
        });

        Harness {
            queue,
            metrics,
            client: Connection::new(client, "broker", None),
            session,
        }
    }

    #[tokio::test]
    async fn test_add_task_accepted() {
        let mut h = start(10, SessionMode::Persistent);

        h.client.send_message(&Message::AddTask(Task::new(1, "X"))).await.unwrap();
        assert_eq!(h.client.receive_message().await.unwrap(), Message::TaskAccepted);

        assert_eq!(h.queue.size(), 1);
        let queued = h.queue.dequeue().unwrap();
        assert!(queued.enqueue_time_ms > 0);
        assert_eq!(h.metrics.tasks_accepted.get(), 1);
    }

    #[tokio::test]
    async fn test_add_task_rejected_when_full() {
        let mut h = start(2, SessionMode::Persistent);

        for id in 0..2 {
            h.client.send_message(&Message::AddTask(Task::new(id, "fill"))).await.unwrap();
            assert_eq!(h.client.receive_message().await.unwrap(), Message::TaskAccepted);
        }

        h.client.send_message(&Message::AddTask(Task::new(2, "one more"))).await.unwrap();
        assert_eq!(
            h.client.receive_message().await.unwrap(),
            Message::TaskRejected("queue full".to_string())
        );
        assert_eq!(h.queue.size(), 2);
        assert_eq!(h.metrics.tasks_rejected.get(), 1);
    }

    #[tokio::test]
    async fn test_request_on_empty_queue() {
        let mut h = start(10, SessionMode::Persistent);

        h.client.send_message(&Message::RequestTask).await.unwrap();
        assert_eq!(h.client.receive_message().await.unwrap(), Message::AssignTask(None));
    }

    #[tokio::test]
    async fn test_handshake_completes() {
        let mut h = start(10, SessionMode::Persistent);
        h.queue.enqueue(Task::new(1, "X"));

        h.client.send_message(&Message::RequestTask).await.unwrap();
        let task = match h.client.receive_message().await.unwrap() {
            Message::AssignTask(Some(task)) => task,
            other => panic!("Expected assignment, got {:?}", other),
        };
        assert_eq!(task.task_id, 1);
        assert_eq!(task.status, TaskStatus::InProgress);

        h.client.send_message(&Message::TaskReceived).await.unwrap();

        // Session keeps serving: the next request sees an empty queue
        h.client.send_message(&Message::RequestTask).await.unwrap();
        assert_eq!(h.client.receive_message().await.unwrap(), Message::AssignTask(None));
        assert_eq!(h.metrics.tasks_assigned.get(), 1);
        assert_eq!(h.metrics.tasks_requeued.get(), 0);
    }

    #[tokio::test]
    async fn test_worker_crash_after_assignment_requeues() {
        let mut h = start(10, SessionMode::Persistent);
        h.queue.enqueue(Task::new(1, "X"));
        h.queue.enqueue(Task::new(2, "Z"));

        h.client.send_message(&Message::RequestTask).await.unwrap();
        assert!(matches!(
            h.client.receive_message().await.unwrap(),
            Message::AssignTask(Some(_))
        ));
        assert_eq!(h.queue.size(), 1);

        // Worker dies before acknowledging
        drop(h.client);
        h.session.await.unwrap();

        assert_eq!(h.queue.size(), 2);
        assert_eq!(h.queue.dequeue().unwrap().task_id, 2);
        let requeued = h.queue.dequeue().unwrap();
        assert_eq!(requeued.task_id, 1);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(h.metrics.tasks_requeued.get(), 1);
        assert_eq!(h.metrics.tasks_assigned.get(), 0);
    }

    #[tokio::test]
    async fn test_wrong_acknowledgement_requeues() {
        let mut h = start(10, SessionMode::Persistent);
        h.queue.enqueue(Task::new(1, "X"));

        h.client.send_message(&Message::RequestTask).await.unwrap();
        h.client.receive_message().await.unwrap();
        h.client.send_message(&Message::RequestTask).await.unwrap();

        // Protocol error ends the session
        h.session.await.unwrap();
        assert!(h.client.receive_message().await.unwrap_err().is_closed());

        assert_eq!(h.queue.size(), 1);
        assert_eq!(h.queue.dequeue().unwrap().task_id, 1);
    }

    #[tokio::test]
    async fn test_requeue_into_full_queue_loses_task() {
        let mut h = start(1, SessionMode::Persistent);
        h.queue.enqueue(Task::new(1, "X"));

        h.client.send_message(&Message::RequestTask).await.unwrap();
        h.client.receive_message().await.unwrap();

        // The freed slot is taken before the handoff fails
        assert!(h.queue.enqueue(Task::new(2, "Z")));
        drop(h.client);
        h.session.await.unwrap();

        assert_eq!(h.metrics.tasks_lost.get(), 1);
        assert_eq!(h.metrics.tasks_requeued.get(), 0);
        assert_eq!(h.queue.size(), 1);
        assert_eq!(h.queue.dequeue().unwrap().task_id, 2);
    }

    #[tokio::test]
    async fn test_submit_result_confirmed() {
        let mut h = start(10, SessionMode::Persistent);

        let mut task = Task::new(1, "X");
        task.enqueue_time_ms = now_ms() - 50;
        task.complete("Y");

        h.client.send_message(&Message::SubmitResult(task)).await.unwrap();
        assert_eq!(h.client.receive_message().await.unwrap(), Message::ResultConfirmed);

        assert_eq!(h.metrics.tasks_completed.get(), 1);
        assert!(h.metrics.latency_ms_total.get() >= 50);
    }

    #[tokio::test]
    async fn test_submit_result_with_extreme_enqueue_time() {
        let mut h = start(10, SessionMode::Persistent);

        let mut task = Task::new(1, "X");
        task.enqueue_time_ms = i64::MIN;
        task.complete("Y");

        h.client.send_message(&Message::SubmitResult(task)).await.unwrap();
        assert_eq!(h.client.receive_message().await.unwrap(), Message::ResultConfirmed);
        assert_eq!(h.metrics.tasks_completed.get(), 1);

        // The session is still serving
        h.client.send_message(&Message::RequestTask).await.unwrap();
        assert_eq!(h.client.receive_message().await.unwrap(), Message::AssignTask(None));
    }

    #[tokio::test]
    async fn test_requeue_at_max_retry_count() {
        let mut h = start(10, SessionMode::Persistent);
        let mut task = Task::new(1, "X");
        task.retry_count = i32::MAX;
        h.queue.enqueue(task);

        h.client.send_message(&Message::RequestTask).await.unwrap();
        assert!(matches!(
            h.client.receive_message().await.unwrap(),
            Message::AssignTask(Some(_))
        ));
        drop(h.client);
        h.session.await.unwrap();

        assert_eq!(h.metrics.tasks_requeued.get(), 1);
        assert_eq!(h.metrics.tasks_lost.get(), 0);
        let requeued = h.queue.dequeue().unwrap();
        assert_eq!(requeued.task_id, 1);
        assert_eq!(requeued.retry_count, i32::MAX);
    }

    #[tokio::test]
    async fn test_idle_peer_times_out() {
        let (client, server) = duplex(64);
        let handler = SessionHandler::new(
            Arc::new(TaskQueue::new(1)),
            Arc::new(BrokerMetrics::new().unwrap()),
            SessionMode::Persistent,
            CancellationToken::new(),
        );
        let session = tokio::spawn(async move {
            let conn = Connection::new(server, "idle", Some(Duration::from_millis(50)));
            handler.run(conn).await;
        });

        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();

        let mut client = Connection::new(client, "broker", None);
        assert!(client.receive_message().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_unknown_message_is_skipped() {
        let mut h = start(10, SessionMode::Persistent);

        h.client.send_frame(Frame::new(42, Bytes::from_static(b"??"))).await.unwrap();
        h.client.send_message(&Message::TaskReceived).await.unwrap();
        h.client.send_message(&Message::RequestTask).await.unwrap();

        // Neither the unknown tag nor the stray receipt gets a reply
        assert_eq!(h.client.receive_message().await.unwrap(), Message::AssignTask(None));
    }

    #[tokio::test]
    async fn test_single_exchange_closes_after_reply() {
        let mut h = start(10, SessionMode::SingleExchange);

        h.client.send_message(&Message::AddTask(Task::new(1, "X"))).await.unwrap();
        assert_eq!(h.client.receive_message().await.unwrap(), Message::TaskAccepted);

        h.session.await.unwrap();
        assert!(h.client.receive_message().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_single_exchange_handshake() {
        let mut h = start(10, SessionMode::SingleExchange);
        h.queue.enqueue(Task::new(9, "X"));

        h.client.send_message(&Message::RequestTask).await.unwrap();
        assert!(matches!(
            h.client.receive_message().await.unwrap(),
            Message::AssignTask(Some(_))
        ));
        h.client.send_message(&Message::TaskReceived).await.unwrap();

        h.session.await.unwrap();
        assert!(h.queue.is_empty());
        assert_eq!(h.metrics.tasks_assigned.get(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_idle_session() {
        let (client, server) = duplex(64);
        let shutdown = CancellationToken::new();
        let handler = SessionHandler::new(
            Arc::new(TaskQueue::new(1)),
            Arc::new(BrokerMetrics::new().unwrap()),
            SessionMode::Persistent,
            shutdown.clone(),
        );
        let session = tokio::spawn(async move {
            handler.run(Connection::new(server, "idle", None)).await;
        });

        shutdown.cancel();
        session.await.unwrap();
        drop(client);
    }
}
