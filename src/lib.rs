//! Market Recorder Library
//!
//! Records one Binance symbol's market data streams to per-category JSON
//! line files and maintains a synchronized local order book from a REST
//! snapshot plus the diff depth stream.

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod metrics;
pub mod orderbook;
pub mod parser;
pub mod queue;
pub mod recorder;
pub mod shutdown;
pub mod websocket;
pub mod writer;

pub use config::Config;
pub use error::{RecorderError, Result};
pub use metrics::RecorderMetrics;
pub use orderbook::{OrderBook, OrderBookMetrics, OrderBookState, SnapshotSource, Synchronizer};
pub use parser::{DepthUpdate, MarketEvent, OrderBookSnapshot, ParsedMessage};
pub use queue::{OverflowPolicy, QueueStats};
pub use recorder::{PipelineReport, Pipelines};
pub use shutdown::Shutdown;
pub use websocket::{EventRouter, WebSocketManager};
pub use writer::{BatchFile, BatchedWriter};

/// Application state shared with the health server
pub struct AppState {
    pub metrics: Arc<RecorderMetrics>,
    pub shutdown: Shutdown,
    pub config: Arc<Config>,
}
