//! WebSocket connection manager
//!
//! Handles reconnection logic and hands decoded events to the router.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::{EventRouter, WebSocketClient};
use crate::config::Config;
use crate::error::{RecorderError, Result};
use crate::parser::ParsedMessage;
use crate::shutdown::Shutdown;

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;

/// Manages the combined stream connection with automatic reconnection
pub struct WebSocketManager {
    config: Arc<Config>,
    client: WebSocketClient,
    router: EventRouter,
    shutdown: Shutdown,
    reconnect_attempts: u32,
    last_successful_connection: Option<Instant>,
}

impl WebSocketManager {
    pub fn new(config: Arc<Config>, router: EventRouter, shutdown: Shutdown) -> Self {
        let client = WebSocketClient::new(&config.ws_endpoint, config.stream_names());

        Self {
            config,
            client,
            router,
            shutdown,
            reconnect_attempts: 0,
            last_successful_connection: None,
        }
    }

    /// Run until shutdown, reconnecting on failure.
    pub async fn run(&mut self) -> Result<()> {
        info!(symbol = %self.config.symbol, "Starting WebSocket manager");

        let shutdown = self.shutdown.clone();
        loop {
            if shutdown.is_triggered() {
                break;
            }

            if let Some(last_success) = self.last_successful_connection {
                if last_success.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                    && self.reconnect_attempts > 0
                {
                    info!(
                        previous_attempts = self.reconnect_attempts,
                        "Resetting reconnect counter after cooldown period"
                    );
                    self.reconnect_attempts = 0;
                }
            }

            let outcome = tokio::select! {
                res = self.connect_and_process() => res,
                _ = shutdown.wait() => Ok(()),
            };

            if shutdown.is_triggered() {
                break;
            }

            if let Err(e) = outcome {
                error!(error = %e, "WebSocket error");
                self.reconnect_attempts += 1;

                if self.reconnect_attempts > self.config.max_reconnect_attempts {
                    let err = RecorderError::MaxReconnectAttemptsExceeded {
                        attempts: self.config.max_reconnect_attempts,
                    };
                    let feed_error = RecorderError::WebSocketConnection(err.to_string());
                    self.router.handle("websocket", Err(feed_error));
                    self.client.close().await;
                    return Err(err);
                }

                let delay = self.backoff();
                warn!(
                    attempt = self.reconnect_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting after error..."
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.wait() => break,
                }
            } else {
                info!("Router unsubscribed, closing feed");
                break;
            }
        }

        self.client.close().await;
        info!(reason = ?shutdown.reason(), "WebSocket manager stopped");
        Ok(())
    }

    fn backoff(&self) -> Duration {
        let base_delay = self
            .config
            .reconnect_delay_ms
            .saturating_mul(2u64.pow(self.reconnect_attempts.min(6)));
        Duration::from_millis(base_delay.min(MAX_BACKOFF_MS))
    }

    /// Connect and process messages until the connection drops or the
    /// router unsubscribes.
    async fn connect_and_process(&mut self) -> Result<()> {
        self.client.connect().await?;

        self.last_successful_connection = Some(Instant::now());
        self.reconnect_attempts = 0;
        info!("WebSocket connected successfully, resetting reconnect counter");

        let mut last_message = Instant::now();
        let keepalive_timeout = Duration::from_secs(30);
        let recv_timeout = Duration::from_secs(45);

        loop {
            match timeout(recv_timeout, self.client.recv()).await {
                Ok(Ok(Some(text))) => {
                    last_message = Instant::now();
                    if !self.process_message(&text) {
                        self.client.close().await;
                        return Ok(());
                    }
                }
                Ok(Ok(None)) => {
                    if last_message.elapsed() > keepalive_timeout {
                        if let Err(e) = self.client.ping().await {
                            warn!(error = %e, "Failed to send keepalive ping");
                        }
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        last_message_secs = last_message.elapsed().as_secs(),
                        "No message received within timeout, sending keepalive"
                    );
                    if let Err(e) = self.client.ping().await {
                        warn!(error = %e, "Failed to send keepalive ping, reconnecting");
                        return Err(RecorderError::ConnectionTimeout);
                    }
                }
            }
        }
    }

    /// Decode one frame and route it. Returns false to unsubscribe.
    fn process_message(&self, raw: &str) -> bool {
        match ParsedMessage::parse(raw) {
            Ok(ParsedMessage::Event(event)) => self.router.dispatch(event),
            Ok(ParsedMessage::Unknown(msg)) => {
                debug!(msg = %msg, "Unknown message type");
                !self.shutdown.is_triggered()
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse message");
                !self.shutdown.is_triggered()
            }
        }
    }
}
