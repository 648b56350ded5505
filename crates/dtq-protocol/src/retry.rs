//! Connection retry with a fixed delay between attempts.

use crate::connection::{Connection, ConnectionError};
use std::time::Duration;
use tracing::warn;

/// How many times to try opening a connection, and how long to wait between
/// attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total connection attempts, at least one is always made
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
    /// Per connect/send/receive timeout on the opened connection
    pub io_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
            io_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, io_timeout: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            io_timeout,
        }
    }

    /// Connect to `address`, retrying on failure.
    ///
    /// Returns the last error once every attempt has failed.
    pub async fn connect(&self, address: &str) -> Result<Connection, ConnectionError> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match Connection::connect(address, self.io_timeout).await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Connect to {} failed (attempt {}/{}): {}",
                        address, attempt, attempts, e
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("Giving up on {} after {} attempts: {}", address, attempts, e);
                    return Err(e);
                }
            }
        }
    }
}
