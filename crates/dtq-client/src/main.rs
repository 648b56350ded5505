use dtq_client::{Producer, SubmitOutcome};
use dtq_core::{Task, TaskId};
use dtq_protocol::RetryPolicy;
use clap::Parser;
use rand::Rng;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dtq-producer")]
#[command(about = "Submit simulated user tasks to a Distributed Task Queue broker", long_about = None)]
struct Args {
    /// Broker address
    #[arg(short, long, default_value = "127.0.0.1:5555")]
    broker: String,

    /// Concurrent simulated users
    #[arg(short, long, default_value = "2")]
    users: u32,

    /// Tasks submitted by each user
    #[arg(short, long, default_value = "5")]
    tasks_per_user: u32,

    /// Offset added to every generated task id
    #[arg(long, default_value = "0")]
    start_id: TaskId,

    /// Connect attempts per task
    #[arg(long, default_value = "3")]
    connect_retries: u32,

    /// Delay between connect attempts
    #[arg(long, default_value = "500")]
    retry_delay_ms: u64,

    /// Pause between a user's tasks
    #[arg(long, default_value = "100")]
    task_delay_ms: u64,

    /// Per send/receive timeout
    #[arg(long, default_value = "10000")]
    io_timeout_ms: u64,
}

#[derive(Debug, Default)]
struct UserSummary {
    accepted: u32,
    rejected: u32,
    failed: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let producer = Producer::new(
        args.broker.clone(),
        RetryPolicy::new(
            args.connect_retries,
            Duration::from_millis(args.retry_delay_ms),
            Duration::from_millis(args.io_timeout_ms),
        ),
    );
    let task_delay = Duration::from_millis(args.task_delay_ms);

    info!(
        "Starting {} users with {} tasks each against {}",
        args.users, args.tasks_per_user, args.broker
    );

    let plans = (1..=args.users)
        .map(|user| user_task_ids(args.start_id, user, args.tasks_per_user).map(|ids| (user, ids)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut users = JoinSet::new();
    for (user, task_ids) in plans {
        let producer = producer.clone();
        users.spawn(async move {
            (user, run_user(producer, user, task_ids, task_delay).await)
        });
    }

    let mut total = UserSummary::default();
    while let Some(joined) = users.join_next().await {
        let (user, summary) = joined?;
        info!(
            "[User {}] Finished: {} accepted, {} rejected, {} failed",
            user, summary.accepted, summary.rejected, summary.failed
        );
        total.accepted += summary.accepted;
        total.rejected += summary.rejected;
        total.failed += summary.failed;
    }

    info!(
        "All users finished: {} accepted, {} rejected, {} failed",
        total.accepted, total.rejected, total.failed
    );
    Ok(())
}

/// Ids `start_id + user * 100 + i` for `i` in `0..count`
fn user_task_ids(start_id: TaskId, user: u32, count: u32) -> anyhow::Result<Vec<TaskId>> {
    let first = TaskId::try_from(user)
        .ok()
        .and_then(|user| user.checked_mul(100))
        .and_then(|offset| start_id.checked_add(offset))
        .ok_or_else(|| anyhow::anyhow!("task ids for user {} overflow from start id {}", user, start_id))?;

    (0..count)
        .map(|i| {
            TaskId::try_from(i)
                .ok()
                .and_then(|i| first.checked_add(i))
                .ok_or_else(|| anyhow::anyhow!("task id {} + {} for user {} overflows", first, i, user))
        })
        .collect()
}

async fn run_user(
    producer: Producer,
    user: u32,
    task_ids: Vec<TaskId>,
    task_delay: Duration,
) -> UserSummary {
    let mut summary = UserSummary::default();

    for (i, task_id) in task_ids.into_iter().enumerate() {
        let duration_ms = rand::thread_rng().gen_range(500..1500);

        let mut task = Task::new(
            task_id,
            format!("User {} Task {} (Duration: {}ms)", user, i, duration_ms),
        );
        task.stamp_enqueue_time();

        info!("[User {}] Sending task ID={}", user, task_id);
        match producer.submit(task).await {
            Ok(SubmitOutcome::Accepted) => summary.accepted += 1,
            Ok(SubmitOutcome::Rejected(reason)) => {
                warn!("[User {}] Task {} rejected: {}", user, task_id, reason);
                summary.rejected += 1;
            }
            Err(e) => {
                error!("[User {}] Task {} not submitted: {}", user, task_id, e);
                summary.failed += 1;
            }
        }

        tokio::time::sleep(task_delay).await;
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_task_ids() {
        assert_eq!(user_task_ids(0, 1, 3).unwrap(), vec![100, 101, 102]);
        assert_eq!(user_task_ids(1000, 2, 2).unwrap(), vec![1200, 1201]);
        assert!(user_task_ids(0, 3, 0).unwrap().is_empty());
    }

    #[test]
    fn test_user_task_ids_overflow_is_error() {
        assert!(user_task_ids(TaskId::MAX - 50, 1, 1).is_err());
        assert!(user_task_ids(0, u32::MAX, 1).is_err());
        assert!(user_task_ids(TaskId::MAX - 101, 1, 5).is_err());
        assert_eq!(user_task_ids(TaskId::MAX - 101, 1, 2).unwrap(), vec![TaskId::MAX - 1, TaskId::MAX]);
    }
}
