use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub network: NetworkConfig,
    pub queue: QueueConfig,
    pub session: SessionConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Per send/receive timeout on accepted sockets
    pub io_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queue_size: usize,
}

/// How a session treats its connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Read messages until the peer disconnects
    #[default]
    Persistent,
    /// One request, one reply, close
    SingleExchange,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: SessionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub report_interval_secs: u64,
    pub window_secs: u64,
    /// Serve Prometheus text format on this port when set
    pub prometheus_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "0.0.0.0".to_string(),
            port: 5555,
            io_timeout_ms: 10_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_queue_size: 1000,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            report_interval_secs: 5,
            window_secs: 60,
            prometheus_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.network.io_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.metrics.report_interval_secs.max(1))
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics.window_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:5555");
        assert_eq!(config.queue.max_queue_size, 1000);
        assert_eq!(config.io_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.mode, SessionMode::Persistent);
        assert!(config.metrics.prometheus_port.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  port: 6000\nqueue:\n  max_queue_size: 2\nsession:\n  mode: single_exchange"
        )
        .unwrap();

        let config = BrokerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.network.port, 6000);
        assert_eq!(config.network.host, "0.0.0.0");
        assert_eq!(config.queue.max_queue_size, 2);
        assert_eq!(config.session.mode, SessionMode::SingleExchange);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(BrokerConfig::from_file("/nonexistent/broker.yaml").is_err());
    }
}
