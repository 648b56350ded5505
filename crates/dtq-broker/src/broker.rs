use crate::{
    config::BrokerConfig,
    metrics::{spawn_reporter, BrokerMetrics},
    queue::TaskQueue,
    session::SessionHandler,
};
use dtq_protocol::Connection;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Main broker server
pub struct Broker {
    config: Arc<BrokerConfig>,
    queue: Arc<TaskQueue>,
    metrics: Arc<BrokerMetrics>,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> anyhow::Result<Self> {
        let queue = TaskQueue::new(config.queue.max_queue_size);
        let metrics = BrokerMetrics::new()?;

        Ok(Broker {
            config: Arc::new(config),
            queue: Arc::new(queue),
            metrics: Arc::new(metrics),
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown, one session task
    /// per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "Broker listening on {} (queue capacity {}, {:?} sessions)",
            listener.local_addr()?,
            self.queue.capacity(),
            self.config.session.mode
        );

        let reporter = spawn_reporter(
            self.metrics.clone(),
            self.config.report_interval(),
            self.config.metrics_window(),
            self.shutdown.clone(),
        );

        let mut sessions = JoinSet::new();
        let io_timeout = self.config.io_timeout();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            let handler = self.session_handler();
                            sessions.spawn(async move {
                                handler.run(Connection::from_accepted(stream, io_timeout)).await;
                            });
                        }
                        Err(e) => {
                            // Transient accept failures must not stop the server
                            error!("Accept error: {}", e);
                            self.pause_after_accept_error().await;
                        }
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {}", e);
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutting down broker");
                    break;
                }
            }
        }

        drop(listener);
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("Session task failed: {}", e);
            }
        }
        reporter.await?;

        info!("Broker stopped with {} tasks queued", self.queue.size());
        Ok(())
    }

    /// Wait before accepting again so a persistent failure (e.g. EMFILE)
    /// does not spin; returns early on shutdown
    async fn pause_after_accept_error(&self) {
        tokio::select! {
            _ = tokio::time::sleep(ACCEPT_ERROR_DELAY) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    fn session_handler(&self) -> SessionHandler {
        SessionHandler::new(
            self.queue.clone(),
            self.metrics.clone(),
            self.config.session.mode,
            self.shutdown.clone(),
        )
    }

    /// Get metrics registry
    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        self.metrics.clone()
    }

    /// Get task queue
    pub fn queue(&self) -> Arc<TaskQueue> {
        self.queue.clone()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Token cancelled when the broker shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtq_core::Task;
    use dtq_protocol::Message;
    use std::time::Instant;

    async fn start_broker(config: BrokerConfig) -> (Arc<Broker>, String, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let broker = Arc::new(Broker::new(config).unwrap());
        let handle = tokio::spawn(broker.clone().serve(listener));
        (broker, addr, handle)
    }

    #[tokio::test]
    async fn test_broker_creation() {
        let broker = Broker::new(BrokerConfig::default()).unwrap();
        assert_eq!(broker.queue().capacity(), 1000);
        assert!(broker.queue().is_empty());
    }

    #[tokio::test]
    async fn test_serves_concurrent_connections() {
        let (broker, addr, handle) = start_broker(BrokerConfig::default()).await;

        let mut first = Connection::connect(&addr, Duration::from_secs(5)).await.unwrap();
        let mut second = Connection::connect(&addr, Duration::from_secs(5)).await.unwrap();

        // An idle first connection does not block the second one
        second.send_message(&Message::AddTask(Task::new(2, "b"))).await.unwrap();
        assert_eq!(second.receive_message().await.unwrap(), Message::TaskAccepted);
        first.send_message(&Message::AddTask(Task::new(1, "a"))).await.unwrap();
        assert_eq!(first.receive_message().await.unwrap(), Message::TaskAccepted);

        assert_eq!(broker.queue().size(), 2);

        broker.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_accept_error_pause() {
        let broker = Broker::new(BrokerConfig::default()).unwrap();

        let started = Instant::now();
        broker.pause_after_accept_error().await;
        assert!(started.elapsed() >= ACCEPT_ERROR_DELAY);

        broker.shutdown();
        tokio::time::timeout(Duration::from_millis(50), broker.pause_after_accept_error())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = BrokerConfig::default();
        config.network.host = "127.0.0.1".to_string();
        config.network.port = taken.local_addr().unwrap().port();

        let broker = Arc::new(Broker::new(config).unwrap());
        assert!(broker.run().await.is_err());
    }
}
