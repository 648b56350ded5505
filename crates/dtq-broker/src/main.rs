use dtq_broker::{metrics::BrokerMetrics, Broker, BrokerConfig, SessionMode};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use axum::Router;

#[derive(Parser, Debug)]
#[command(name = "dtq-broker")]
#[command(about = "Distributed Task Queue Broker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "broker.yaml")]
    config: String,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// Queue capacity
    #[arg(long)]
    max_queue_size: Option<usize>,

    /// Session mode
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Prometheus metrics port
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Persistent,
    SingleExchange,
}

impl From<ModeArg> for SessionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Persistent => SessionMode::Persistent,
            ModeArg::SingleExchange => SessionMode::SingleExchange,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_found = std::path::Path::new(&args.config).exists();
    let mut config = if config_found {
        BrokerConfig::from_file(&args.config)?
    } else {
        BrokerConfig::default()
    };

    // Initialize tracing
    let default_level = config.logging.level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if !config_found {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }

    // Override with CLI args
    if let Some(host) = args.host {
        config.network.host = host;
    }
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(size) = args.max_queue_size {
        config.queue.max_queue_size = size;
    }
    if let Some(mode) = args.mode {
        config.session.mode = mode.into();
    }
    if let Some(port) = args.metrics_port {
        config.metrics.prometheus_port = Some(port);
    }

    tracing::info!("Starting broker with config: {:?}", config);

    let broker = Arc::new(Broker::new(config.clone())?);
    let shutdown = broker.shutdown_token();

    // Start metrics server
    if let Some(port) = config.metrics.prometheus_port {
        let metrics = broker.metrics();
        let host = config.network.host.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics, &host, port, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    let signal_broker = broker.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl-C");
                signal_broker.shutdown();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    // Run broker
    broker.run().await?;

    Ok(())
}

async fn start_metrics_server(
    metrics: Arc<BrokerMetrics>,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use axum::{extract::State, http::StatusCode, routing::get};

    async fn metrics_handler(
        State(metrics): State<Arc<BrokerMetrics>>,
    ) -> Result<String, (StatusCode, String)> {
        metrics
            .gather_text()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = format!("{}:{}", host, port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
