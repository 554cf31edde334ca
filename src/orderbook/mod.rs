//! Order book module
//!
//! Rebuilds a local order book from a REST snapshot plus the diff depth
//! stream and keeps it synchronized.

mod book;
mod metrics;
mod snapshot;
mod sync;

pub use book::{DeltaOutcome, OrderBook};
pub use metrics::OrderBookMetrics;
pub use snapshot::{RestSnapshotClient, SnapshotRetry, SnapshotSource};
pub use sync::{SyncReport, SyncSettings, SyncState, Synchronizer};

#[cfg(test)]
pub use snapshot::MockSnapshotSource;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::parser::PriceLevel;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A single level in the order book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Top-of-book view of the local order book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookState {
    pub symbol: String,
    pub timestamp: u64,
    pub last_update_id: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub metrics: OrderBookMetrics,
}

/// One line of the order book log
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookRecord<'a> {
    /// Book seeded from a REST snapshot
    Snapshot {
        symbol: &'a str,
        last_update_id: u64,
        event_time: u64,
        bids: &'a [PriceLevel],
        asks: &'a [PriceLevel],
    },
    /// Diff depth event applied on top of the book
    Delta {
        symbol: &'a str,
        first_update_id: u64,
        final_update_id: u64,
        event_time: u64,
        bids: &'a [PriceLevel],
        asks: &'a [PriceLevel],
    },
}
