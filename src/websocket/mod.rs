//! WebSocket module for the Binance combined stream

mod client;
mod manager;
mod router;

pub use client::WebSocketClient;
pub use manager::WebSocketManager;
pub use router::EventRouter;
