use dtq_worker::{EchoHandler, SimulatedHandler, TaskHandler, Worker, WorkerConfig};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dtq-worker")]
#[command(about = "Distributed Task Queue Worker", long_about = None)]
struct Args {
    /// Broker address
    #[arg(short, long)]
    broker: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Number of concurrent protocol loops
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Task handler
    #[arg(long, value_enum, default_value = "simulated")]
    handler: HandlerKind,

    /// Work duration when a payload carries no hint
    #[arg(long, default_value = "1000")]
    default_duration_ms: u64,

    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HandlerKind {
    Simulated,
    Echo,
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

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(broker) = args.broker {
        config.broker_address = broker;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }

    let handler: Arc<dyn TaskHandler> = match args.handler {
        HandlerKind::Simulated => Arc::new(SimulatedHandler::new(Duration::from_millis(
            args.default_duration_ms,
        ))),
        HandlerKind::Echo => Arc::new(EchoHandler),
    };

    let worker = Arc::new(Worker::new(config, handler));

    // Handle shutdown signals
    let signal_worker = worker.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                signal_worker.shutdown();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    worker.run().await?;

    Ok(())
}
