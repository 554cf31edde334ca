//! Configuration module for the market recorder

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{RecorderError, Result};
use crate::queue::OverflowPolicy;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Trading symbol to record (e.g., "BTCUSDT")
    pub symbol: String,

    /// WebSocket endpoint for Binance
    pub ws_endpoint: String,

    /// REST API endpoint for snapshots
    pub rest_endpoint: String,

    /// Root directory; a per-day folder is created underneath
    pub output_dir: PathBuf,

    /// Slots per event queue
    pub queue_capacity: usize,

    /// What to do when a queue is full
    pub overflow_policy: OverflowPolicy,

    /// Buffered bytes that trigger a file write
    pub flush_threshold_bytes: usize,

    /// Snapshot settings
    pub snapshot_depth_limit: u32,
    pub snapshot_max_attempts: u32,
    pub snapshot_backoff_ms: u64,
    pub snapshot_max_backoff_ms: u64,

    /// Resync attempts after a sequence gap; zero makes a gap terminal
    pub max_resyncs: u32,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    /// Stream parameters
    pub kline_interval: String,
    pub partial_depth_levels: u32,

    /// Health server port
    pub health_port: u16,

    /// Status log interval in seconds
    pub status_interval_secs: u64,
}

impl Config {
    /// Load configuration from `.env`, an optional `recorder` file and
    /// `RECORDER_*` environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config: Config = config::Config::builder()
            .add_source(config::File::with_name("recorder").required(false))
            .add_source(config::Environment::with_prefix("RECORDER").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.symbol = config.symbol.trim().to_uppercase();
        config.validate()?;
        Ok(config)
    }

    /// Override the symbol, e.g. from the command line
    pub fn with_symbol(mut self, symbol: &str) -> Result<Self> {
        self.symbol = symbol.trim().to_uppercase();
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(RecorderError::ConfigError("symbol must not be empty".into()));
        }
        if self.queue_capacity == 0 {
            return Err(RecorderError::ConfigError(
                "queue_capacity must be positive".into(),
            ));
        }
        if self.flush_threshold_bytes == 0 {
            return Err(RecorderError::ConfigError(
                "flush_threshold_bytes must be positive".into(),
            ));
        }
        if self.snapshot_max_attempts == 0 {
            return Err(RecorderError::ConfigError(
                "snapshot_max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Combined stream channel names for the configured symbol
    pub fn stream_names(&self) -> Vec<String> {
        let symbol = self.symbol.to_lowercase();
        vec![
            format!("{}@aggTrade", symbol),
            format!("{}@kline_{}", symbol, self.kline_interval),
            format!("{}@bookTicker", symbol),
            format!("{}@depth{}@100ms", symbol, self.partial_depth_levels),
            format!("{}@depth@100ms", symbol),
        ]
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            output_dir: PathBuf::from("."),
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropNewest,
            flush_threshold_bytes: 64 * 1024,
            snapshot_depth_limit: 5000,
            snapshot_max_attempts: 10,
            snapshot_backoff_ms: 500,
            snapshot_max_backoff_ms: 30_000,
            max_resyncs: 0,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 10,
            kline_interval: "1s".to_string(),
            partial_depth_levels: 20,
            health_port: 9090,
            status_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_threshold_bytes, 65536);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn test_symbol_override_is_normalized() {
        let config = Config::default().with_symbol(" ethusdt ").unwrap();
        assert_eq!(config.symbol, "ETHUSDT");
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = Config {
            queue_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RecorderError::ConfigError(_))
        ));
    }

    #[test]
    fn test_stream_names() {
        let config = Config::default().with_symbol("ethusdt").unwrap();
        assert_eq!(
            config.stream_names(),
            vec![
                "ethusdt@aggTrade",
                "ethusdt@kline_1s",
                "ethusdt@bookTicker",
                "ethusdt@depth20@100ms",
                "ethusdt@depth@100ms",
            ]
        );
    }

    #[test]
    fn test_rejects_empty_symbol() {
        assert!(Config::default().with_symbol("  ").is_err());
    }
}
