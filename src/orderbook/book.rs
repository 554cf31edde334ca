//! Core order book implementation
//!
//! Uses BTreeMap for sorted price level management. Quantities are exact
//! decimals; a zero quantity removes the level.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{Level, OrderBookMetrics, OrderBookState, Side};
use crate::parser::{DepthUpdate, OrderBookSnapshot, PriceLevel};

/// How a diff depth event related to the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Levels applied, `last_update_id` advanced to the event's `u`
    Applied,
    /// Event fully covered by the book already; nothing changed
    Stale,
    /// Event does not continue the book; the book can no longer be trusted
    Gap,
}

/// Order book for a single symbol
#[derive(Debug, Clone)]
pub struct OrderBook {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Last processed update ID
    last_update_id: u64,
    /// `U` of the first diff event buffered before the snapshot
    first_update_id: u64,
    /// Event time of the last applied update
    event_time: u64,
}

impl OrderBook {
    /// Seed a book from a REST snapshot.
    ///
    /// `first_update_id` and `event_time` come from the first diff event
    /// buffered before the snapshot was requested.
    pub fn from_snapshot(
        symbol: &str,
        snapshot: &OrderBookSnapshot,
        first_update_id: u64,
        event_time: u64,
    ) -> Self {
        let mut book = Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: snapshot.last_update_id,
            first_update_id,
            event_time,
        };

        for level in &snapshot.bids {
            book.update_side(Side::Bid, level);
        }
        for level in &snapshot.asks {
            book.update_side(Side::Ask, level);
        }

        book
    }

    /// Classify a diff depth event and apply it if it continues the book
    pub fn apply_delta(&mut self, update: &DepthUpdate) -> DeltaOutcome {
        if self.last_update_id >= update.final_update_id {
            return DeltaOutcome::Stale;
        }

        let next_id = self.last_update_id + 1;
        let contiguous =
            update.first_update_id <= next_id && next_id <= update.final_update_id;
        if self.last_update_id < self.first_update_id || !contiguous {
            return DeltaOutcome::Gap;
        }

        for level in &update.bids {
            self.update_side(Side::Bid, level);
        }
        for level in &update.asks {
            self.update_side(Side::Ask, level);
        }

        self.last_update_id = update.final_update_id;
        self.event_time = update.event_time;
        DeltaOutcome::Applied
    }

    /// Update a single price level
    fn update_side(&mut self, side: Side, level: &PriceLevel) {
        match side {
            Side::Bid => {
                if level.quantity.is_zero() {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level.quantity);
                }
            }
            Side::Ask => {
                if level.quantity.is_zero() {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level.quantity);
                }
            }
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn first_update_id(&self) -> u64 {
        self.first_update_id
    }

    pub fn event_time(&self) -> u64 {
        self.event_time
    }

    /// Quantity resting at a bid price
    pub fn bid(&self, price: Decimal) -> Option<Decimal> {
        self.bids.get(&Reverse(price)).copied()
    }

    /// Quantity resting at an ask price
    pub fn ask(&self, price: Decimal) -> Option<Decimal> {
        self.asks.get(&price).copied()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// Calculate order book imbalance at top N levels
    pub fn imbalance(&self, levels: usize) -> Option<Decimal> {
        let bid_volume: Decimal = self.bids.iter().take(levels).map(|(_, q)| q).sum();
        let ask_volume: Decimal = self.asks.iter().take(levels).map(|(_, q)| q).sum();

        let total = bid_volume + ask_volume;
        if total > Decimal::ZERO {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }

    /// Top `depth` levels per side plus metrics
    pub fn state(&self, depth: usize) -> OrderBookState {
        OrderBookState {
            symbol: self.symbol.clone(),
            timestamp: self.event_time,
            last_update_id: self.last_update_id,
            bids: self
                .bids
                .iter()
                .take(depth)
                .map(|(Reverse(p), q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
            asks: self
                .asks
                .iter()
                .take(depth)
                .map(|(p, q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
            metrics: self.calculate_metrics(),
        }
    }

    /// Calculate order book metrics
    pub fn calculate_metrics(&self) -> OrderBookMetrics {
        OrderBookMetrics {
            mid_price: self.mid_price(),
            spread_bps: self.spread_bps(),
            imbalance: self.imbalance(5),
            bid_depth: self.bids.values().copied().sum(),
            ask_depth: self.asks.values().copied().sum(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }
}
