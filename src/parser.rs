//! Parser module for Binance WebSocket messages
//!
//! Handles deserialization of the five recorded channels (aggregate trades,
//! klines, book ticker, partial depth and diff depth) from the combined
//! stream envelope. Every type serializes back to a single JSON line.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Price level (price, quantity pair), `["price", "qty"]` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "[String; 2]")]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

impl TryFrom<Vec<String>> for PriceLevel {
    type Error = String;

    fn try_from(pair: Vec<String>) -> Result<Self, Self::Error> {
        if pair.len() != 2 {
            return Err("Invalid price level format".to_string());
        }
        Ok(PriceLevel {
            price: Decimal::from_str(&pair[0]).map_err(|e| e.to_string())?,
            quantity: Decimal::from_str(&pair[1]).map_err(|e| e.to_string())?,
        })
    }
}

impl From<PriceLevel> for [String; 2] {
    fn from(level: PriceLevel) -> Self {
        [level.price.to_string(), level.quantity.to_string()]
    }
}

/// Binance diff depth update message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    /// Event type
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    /// Bids to update
    #[serde(rename = "b")]
    pub bids: Vec<PriceLevel>,

    /// Asks to update
    #[serde(rename = "a")]
    pub asks: Vec<PriceLevel>,
}

/// Binance aggregate trade message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggTrade {
    #[serde(rename = "e")]
    pub event_type: String,

    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    /// Aggregate trade ID
    #[serde(rename = "a")]
    pub agg_trade_id: u64,

    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,

    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quantity: Decimal,

    /// First and last trade IDs covered
    #[serde(rename = "f")]
    pub first_trade_id: u64,

    #[serde(rename = "l")]
    pub last_trade_id: u64,

    /// Trade time
    #[serde(rename = "T")]
    pub trade_time: u64,

    /// Is buyer maker
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Binance kline message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    #[serde(rename = "e")]
    pub event_type: String,

    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "k")]
    pub kline: KlineData,
}

/// Candle body of a kline message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineData {
    #[serde(rename = "t")]
    pub open_time: u64,

    #[serde(rename = "T")]
    pub close_time: u64,

    #[serde(rename = "i")]
    pub interval: String,

    #[serde(rename = "f")]
    pub first_trade_id: i64,

    #[serde(rename = "L")]
    pub last_trade_id: i64,

    #[serde(rename = "o", with = "rust_decimal::serde::str")]
    pub open: Decimal,

    #[serde(rename = "c", with = "rust_decimal::serde::str")]
    pub close: Decimal,

    #[serde(rename = "h", with = "rust_decimal::serde::str")]
    pub high: Decimal,

    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub low: Decimal,

    /// Base asset volume
    #[serde(rename = "v", with = "rust_decimal::serde::str")]
    pub volume: Decimal,

    #[serde(rename = "n")]
    pub trade_count: u64,

    /// Is this kline closed
    #[serde(rename = "x")]
    pub is_closed: bool,

    /// Quote asset volume
    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quote_volume: Decimal,

    #[serde(rename = "V", with = "rust_decimal::serde::str")]
    pub taker_buy_volume: Decimal,

    #[serde(rename = "Q", with = "rust_decimal::serde::str")]
    pub taker_buy_quote_volume: Decimal,
}

/// Binance best bid/ask message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookTicker {
    /// Order book update ID
    #[serde(rename = "u")]
    pub update_id: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "b", with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,

    #[serde(rename = "B", with = "rust_decimal::serde::str")]
    pub bid_quantity: Decimal,

    #[serde(rename = "a", with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,

    #[serde(rename = "A", with = "rust_decimal::serde::str")]
    pub ask_quantity: Decimal,
}

/// Binance partial book depth message (top N levels)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialDepth {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    pub bids: Vec<PriceLevel>,

    pub asks: Vec<PriceLevel>,
}

/// Order book snapshot from REST API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    /// Last update ID
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    /// Bids
    pub bids: Vec<PriceLevel>,

    /// Asks
    pub asks: Vec<PriceLevel>,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    /// Stream name
    pub stream: String,

    /// Data payload
    pub data: serde_json::Value,
}

/// Channel of a combined stream, derived from the stream name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    AggTrade,
    Kline,
    BookTicker,
    PartialDepth,
    DiffDepth,
}

impl StreamKind {
    /// Classify a stream name such as `btcusdt@depth20@100ms`
    pub fn from_stream_name(stream: &str) -> Option<Self> {
        let (_, channel) = stream.split_once('@')?;
        let head = channel.split('@').next().unwrap_or(channel);

        if head == "aggTrade" {
            Some(StreamKind::AggTrade)
        } else if head.starts_with("kline_") {
            Some(StreamKind::Kline)
        } else if head == "bookTicker" {
            Some(StreamKind::BookTicker)
        } else if head == "depth" {
            Some(StreamKind::DiffDepth)
        } else if head
            .strip_prefix("depth")
            .is_some_and(|levels| !levels.is_empty() && levels.chars().all(|c| c.is_ascii_digit()))
        {
            Some(StreamKind::PartialDepth)
        } else {
            None
        }
    }

    /// Output file suffix and metrics label for this channel
    pub fn category(&self) -> &'static str {
        match self {
            StreamKind::AggTrade => "agg_trades",
            StreamKind::Kline => "klines",
            StreamKind::BookTicker => "book_ticker",
            StreamKind::PartialDepth => "part_depths",
            StreamKind::DiffDepth => "diff_depths",
        }
    }
}

/// A decoded market data event
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    AggTrade(AggTrade),
    Kline(Kline),
    BookTicker(BookTicker),
    PartialDepth(PartialDepth),
    DiffDepth(DepthUpdate),
}

impl MarketEvent {
    pub fn kind(&self) -> StreamKind {
        match self {
            MarketEvent::AggTrade(_) => StreamKind::AggTrade,
            MarketEvent::Kline(_) => StreamKind::Kline,
            MarketEvent::BookTicker(_) => StreamKind::BookTicker,
            MarketEvent::PartialDepth(_) => StreamKind::PartialDepth,
            MarketEvent::DiffDepth(_) => StreamKind::DiffDepth,
        }
    }
}

/// Parsed WebSocket message
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Event(MarketEvent),
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        // Try to parse as stream message first (combined streams)
        if let Ok(stream_msg) = serde_json::from_str::<StreamMessage>(raw) {
            return match StreamKind::from_stream_name(&stream_msg.stream) {
                Some(kind) => Self::parse_data(kind, stream_msg.data).map(ParsedMessage::Event),
                None => Ok(ParsedMessage::Unknown(stream_msg.data.to_string())),
            };
        }

        // Raw streams carry the event type in "e"
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let kind = match value.get("e").and_then(|e| e.as_str()) {
            Some("depthUpdate") => Some(StreamKind::DiffDepth),
            Some("aggTrade") => Some(StreamKind::AggTrade),
            Some("kline") => Some(StreamKind::Kline),
            _ => None,
        };

        match kind {
            Some(kind) => Self::parse_data(kind, value).map(ParsedMessage::Event),
            None => Ok(ParsedMessage::Unknown(raw.to_string())),
        }
    }

    fn parse_data(kind: StreamKind, data: serde_json::Value) -> Result<MarketEvent, serde_json::Error> {
        Ok(match kind {
            StreamKind::AggTrade => MarketEvent::AggTrade(serde_json::from_value(data)?),
            StreamKind::Kline => MarketEvent::Kline(serde_json::from_value(data)?),
            StreamKind::BookTicker => MarketEvent::BookTicker(serde_json::from_value(data)?),
            StreamKind::PartialDepth => MarketEvent::PartialDepth(serde_json::from_value(data)?),
            StreamKind::DiffDepth => MarketEvent::DiffDepth(serde_json::from_value(data)?),
        })
    }
}
