use dtq_core::TaskStatus;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Prometheus metrics for the broker.
///
/// Every counter is atomic on its own; none of them is covered by the queue
/// lock.
pub struct BrokerMetrics {
    pub registry: Registry,

    pub tasks_accepted: IntCounter,
    pub tasks_rejected: IntCounter,
    pub tasks_assigned: IntCounter,
    pub tasks_requeued: IntCounter,
    pub tasks_lost: IntCounter,

    /// Results received, whatever their status
    pub tasks_completed: IntCounter,
    pub tasks_failed: IntCounter,
    pub latency_ms_total: IntCounter,
    pub task_latency: Histogram,

    pub queue_depth: IntGauge,
}

impl BrokerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_accepted = IntCounter::new("dtq_tasks_accepted_total", "Tasks accepted into the queue")?;
        registry.register(Box::new(tasks_accepted.clone()))?;

        let tasks_rejected = IntCounter::new("dtq_tasks_rejected_total", "Tasks rejected because the queue was full")?;
        registry.register(Box::new(tasks_rejected.clone()))?;

        let tasks_assigned = IntCounter::new("dtq_tasks_assigned_total", "Tasks acknowledged by a worker")?;
        registry.register(Box::new(tasks_assigned.clone()))?;

        let tasks_requeued = IntCounter::new("dtq_tasks_requeued_total", "Tasks requeued after a failed handoff")?;
        registry.register(Box::new(tasks_requeued.clone()))?;

        let tasks_lost = IntCounter::new("dtq_tasks_lost_total", "Tasks dropped because requeue found the queue full")?;
        registry.register(Box::new(tasks_lost.clone()))?;

        let tasks_completed = IntCounter::new("dtq_tasks_completed_total", "Results submitted by workers")?;
        registry.register(Box::new(tasks_completed.clone()))?;

        let tasks_failed = IntCounter::new("dtq_tasks_failed_total", "Results submitted with FAILED status")?;
        registry.register(Box::new(tasks_failed.clone()))?;

        let latency_ms_total = IntCounter::new("dtq_task_latency_ms_total", "Cumulative enqueue-to-result latency in milliseconds")?;
        registry.register(Box::new(latency_ms_total.clone()))?;

        let task_latency = Histogram::with_opts(HistogramOpts::new(
            "dtq_task_latency_seconds",
            "Enqueue-to-result latency in seconds",
        ))?;
        registry.register(Box::new(task_latency.clone()))?;

        let queue_depth = IntGauge::new("dtq_queue_depth", "Tasks waiting in the queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(BrokerMetrics {
            registry,
            tasks_accepted,
            tasks_rejected,
            tasks_assigned,
            tasks_requeued,
            tasks_lost,
            tasks_completed,
            tasks_failed,
            latency_ms_total,
            task_latency,
            queue_depth,
        })
    }

    /// Record a submitted result
    pub fn record_result(&self, status: TaskStatus, latency_ms: i64) {
        let latency_ms = latency_ms.max(0) as u64;
        self.tasks_completed.inc();
        if status == TaskStatus::Failed {
            self.tasks_failed.inc();
        }
        self.latency_ms_total.inc_by(latency_ms);
        self.task_latency.observe(latency_ms as f64 / 1000.0);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    /// Render the registry in Prometheus text format
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Throughput over a sliding window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub tasks_per_sec: f64,
    pub mean_latency_ms: f64,
    pub completed_total: u64,
}

/// Keeps (time, completed, latency) samples covering the last `window`
pub struct ThroughputWindow {
    window: Duration,
    samples: VecDeque<(Instant, u64, u64)>,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        ThroughputWindow {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant, completed: u64, latency_ms_total: u64) -> Throughput {
        self.samples.push_back((at, completed, latency_ms_total));
        // Baseline is the newest sample at least one window old
        while self.samples.len() > 1 && at.duration_since(self.samples[1].0) >= self.window {
            self.samples.pop_front();
        }

        let (first_at, first_completed, first_latency) = self.samples[0];
        let elapsed = at.duration_since(first_at).as_secs_f64();
        let done = completed.saturating_sub(first_completed);
        let latency = latency_ms_total.saturating_sub(first_latency);

        Throughput {
            tasks_per_sec: if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 },
            mean_latency_ms: if done > 0 { latency as f64 / done as f64 } else { 0.0 },
            completed_total: completed,
        }
    }
}

/// Periodically log throughput until `shutdown` is cancelled
pub fn spawn_reporter(
    metrics: Arc<BrokerMetrics>,
    interval: Duration,
    window: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut samples = ThroughputWindow::new(window);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let throughput = samples.record(
                        Instant::now(),
                        metrics.tasks_completed.get(),
                        metrics.latency_ms_total.get(),
                    );
                    info!(
                        "Throughput: {:.2} tasks/s over {:?}, mean latency {:.1} ms, {} completed, queue depth {}",
                        throughput.tasks_per_sec,
                        window,
                        throughput.mean_latency_ms,
                        throughput.completed_total,
                        metrics.queue_depth.get(),
                    );
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_result() {
        let metrics = BrokerMetrics::new().unwrap();
        metrics.record_result(TaskStatus::Completed, 120);
        metrics.record_result(TaskStatus::Failed, 80);
        metrics.record_result(TaskStatus::Completed, -5);

        assert_eq!(metrics.tasks_completed.get(), 3);
        assert_eq!(metrics.tasks_failed.get(), 1);
        assert_eq!(metrics.latency_ms_total.get(), 200);
        assert_eq!(metrics.task_latency.get_sample_count(), 3);
    }

    #[test]
    fn test_gather_text() {
        let metrics = BrokerMetrics::new().unwrap();
        metrics.tasks_accepted.inc();
        metrics.set_queue_depth(4);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("dtq_tasks_accepted_total 1"));
        assert!(text.contains("dtq_queue_depth 4"));
    }

    #[test]
    fn test_throughput_window() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(10));

        let first = window.record(start, 0, 0);
        assert_eq!(first.tasks_per_sec, 0.0);

        let second = window.record(start + Duration::from_secs(5), 50, 5_000);
        assert!((second.tasks_per_sec - 10.0).abs() < 1e-9);
        assert!((second.mean_latency_ms - 100.0).abs() < 1e-9);

        // The first sample falls out of the window; rate is measured from t=5s
        let third = window.record(start + Duration::from_secs(20), 80, 8_000);
        assert!((third.tasks_per_sec - 2.0).abs() < 1e-9);
        assert_eq!(third.completed_total, 80);
    }

    #[tokio::test]
    async fn test_reporter_exits_on_shutdown() {
        let metrics = Arc::new(BrokerMetrics::new().unwrap());
        let shutdown = CancellationToken::new();
        let handle = spawn_reporter(
            metrics,
            Duration::from_millis(10),
            Duration::from_secs(1),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
