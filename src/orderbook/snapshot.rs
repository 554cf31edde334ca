//! Depth snapshot source
//!
//! The synchronizer calls the source from its own thread, so the REST client
//! is the blocking flavour of reqwest.

use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::error::{RecorderError, Result};
use crate::parser::OrderBookSnapshot;

/// Maximum exponent for snapshot backoff
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Anything that can return a full-depth snapshot
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotSource: Send {
    fn fetch_depth_snapshot(&self, symbol: &str, limit: u32) -> Result<OrderBookSnapshot>;
}

/// Binance REST `GET /depth`
pub struct RestSnapshotClient {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl RestSnapshotClient {
    /// Must be called outside the async runtime
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("market-recorder/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

impl SnapshotSource for RestSnapshotClient {
    fn fetch_depth_snapshot(&self, symbol: &str, limit: u32) -> Result<OrderBookSnapshot> {
        let url = format!("{}/depth?symbol={}&limit={}", self.endpoint, symbol, limit);

        info!(symbol = %symbol, url = %url, "Fetching order book snapshot");

        let response = self.client.get(&url).send()?;
        if !response.status().is_success() {
            return Err(RecorderError::RestApiError(format!(
                "Snapshot HTTP error: {}",
                response.status()
            )));
        }

        Ok(response.json::<OrderBookSnapshot>()?)
    }
}

/// Bounded retry with capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl SnapshotRetry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.snapshot_max_attempts,
            base_delay: Duration::from_millis(config.snapshot_backoff_ms),
            max_delay: Duration::from_millis(config.snapshot_max_backoff_ms),
        }
    }

    /// Delay after the given (1-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.pow(attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for SnapshotRetry {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = SnapshotRetry {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(4), Duration::from_millis(800));
        assert_eq!(retry.delay(5), Duration::from_millis(1000));
        assert_eq!(retry.delay(50), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponent_is_bounded() {
        let retry = SnapshotRetry {
            max_attempts: 100,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(3600),
        };
        assert_eq!(retry.delay(30), Duration::from_millis(64));
    }

    #[test]
    fn test_default_follows_config() {
        let retry = SnapshotRetry::default();
        assert_eq!(retry.max_attempts, 10);
        assert_eq!(retry.base_delay, Duration::from_millis(500));
    }
}
