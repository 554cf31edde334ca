//! Event router
//!
//! Producer side of the pipelines: hands each decoded event to the queue of
//! its category. Runs on the feed task and never blocks.

use std::sync::Arc;
use tracing::{error, warn};

use crate::error::{RecorderError, Result};
use crate::metrics::RecorderMetrics;
use crate::parser::{AggTrade, BookTicker, DepthUpdate, Kline, MarketEvent, PartialDepth};
use crate::queue::{EventSender, Offer, QueueStats};
use crate::shutdown::Shutdown;

/// Queue senders for every recorded category
pub struct EventRouter {
    pub(crate) agg_trades: EventSender<AggTrade>,
    pub(crate) klines: EventSender<Kline>,
    pub(crate) book_tickers: EventSender<BookTicker>,
    pub(crate) part_depths: EventSender<PartialDepth>,
    pub(crate) diff_depths: EventSender<DepthUpdate>,
    pub(crate) shutdown: Shutdown,
    pub(crate) metrics: Arc<RecorderMetrics>,
}

impl EventRouter {
    /// Feed callback. Returns false when the subscription should end.
    pub fn handle(&self, source: &str, payload: Result<MarketEvent>) -> bool {
        match payload {
            Ok(event) => self.dispatch(event),
            Err(e) => {
                error!(source = %source, error = %e, "Feed error");
                self.shutdown.trigger(&format!("feed error on {}", source));
                false
            }
        }
    }

    /// Queue one event. Returns false once shutdown has been requested.
    pub fn dispatch(&self, event: MarketEvent) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }

        let category = event.kind().category();
        self.metrics
            .events_received
            .with_label_values(&[category])
            .inc();

        let offered = match event {
            MarketEvent::AggTrade(e) => self.agg_trades.offer(e),
            MarketEvent::Kline(e) => self.klines.offer(e),
            MarketEvent::BookTicker(e) => self.book_tickers.offer(e),
            MarketEvent::PartialDepth(e) => self.part_depths.offer(e),
            MarketEvent::DiffDepth(e) => self.diff_depths.offer(e),
        };

        match offered {
            Ok(Offer::Queued) => true,
            Ok(Offer::DroppedIncoming | Offer::EvictedOldest) => {
                self.metrics
                    .events_dropped
                    .with_label_values(&[category])
                    .inc();
                true
            }
            Err(RecorderError::QueueClosed) => {
                warn!(category, "Consumer gone, unsubscribing");
                false
            }
            Err(e) => {
                self.metrics
                    .events_dropped
                    .with_label_values(&[category])
                    .inc();
                error!(category, error = %e, "Queue overflow");
                self.shutdown.trigger(&e.to_string());
                false
            }
        }
    }

    /// Per-queue counters, for status reporting
    pub fn queue_stats(&self) -> Vec<(String, Arc<QueueStats>)> {
        vec![
            (self.agg_trades.name().to_string(), self.agg_trades.stats()),
            (self.klines.name().to_string(), self.klines.stats()),
            (self.book_tickers.name().to_string(), self.book_tickers.stats()),
            (self.part_depths.name().to_string(), self.part_depths.stats()),
            (self.diff_depths.name().to_string(), self.diff_depths.stats()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::StreamKind;
    use crate::queue::{channel, EventReceiver, OverflowPolicy};

    struct Receivers {
        diff_depths: EventReceiver<DepthUpdate>,
        _book_tickers: EventReceiver<BookTicker>,
    }

    fn router(policy: OverflowPolicy, capacity: usize) -> (EventRouter, Receivers) {
        let (agg_trades, _) = channel(StreamKind::AggTrade.category(), capacity, policy);
        let (klines, _) = channel(StreamKind::Kline.category(), capacity, policy);
        let (book_tickers, book_rx) = channel(StreamKind::BookTicker.category(), capacity, policy);
        let (part_depths, _) = channel(StreamKind::PartialDepth.category(), capacity, policy);
        let (diff_depths, diff_rx) = channel(StreamKind::DiffDepth.category(), capacity, policy);

        (
            EventRouter {
                agg_trades,
                klines,
                book_tickers,
                part_depths,
                diff_depths,
                shutdown: Shutdown::new(),
                metrics: Arc::new(RecorderMetrics::new().unwrap()),
            },
            Receivers {
                diff_depths: diff_rx,
                _book_tickers: book_rx,
            },
        )
    }

    fn depth(id: u64) -> MarketEvent {
        MarketEvent::DiffDepth(DepthUpdate {
            event_type: "depthUpdate".to_string(),
            event_time: id,
            symbol: "BTCUSDT".to_string(),
            first_update_id: id,
            final_update_id: id,
            bids: vec![],
            asks: vec![],
        })
    }

    #[test]
    fn test_dispatch_routes_by_category() {
        let (router, rx) = router(OverflowPolicy::DropNewest, 8);
        assert!(router.dispatch(depth(1)));
        assert!(router.dispatch(depth(2)));

        let ids: Vec<u64> = rx.diff_depths.drain().iter().map(|d| d.final_update_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(
            router.metrics.events_received.with_label_values(&["diff_depths"]).get(),
            2
        );
    }

    #[test]
    fn test_drops_are_counted() {
        let (router, _rx) = router(OverflowPolicy::DropNewest, 1);
        assert!(router.dispatch(depth(1)));
        assert!(router.dispatch(depth(2)));
        assert_eq!(
            router.metrics.events_dropped.with_label_values(&["diff_depths"]).get(),
            1
        );
        assert!(!router.shutdown.is_triggered());
    }

    #[test]
    fn test_fail_policy_requests_shutdown() {
        let (router, _rx) = router(OverflowPolicy::Fail, 1);
        assert!(router.dispatch(depth(1)));
        assert!(!router.dispatch(depth(2)));
        assert!(router.shutdown.is_triggered());
        assert!(!router.dispatch(depth(3)));
    }

    #[test]
    fn test_closed_consumer_unsubscribes() {
        let (router, _rx) = router(OverflowPolicy::DropNewest, 4);
        let trade = MarketEvent::AggTrade(AggTrade {
            event_type: "aggTrade".to_string(),
            event_time: 1,
            symbol: "BTCUSDT".to_string(),
            agg_trade_id: 1,
            price: rust_decimal::Decimal::ONE,
            quantity: rust_decimal::Decimal::ONE,
            first_trade_id: 1,
            last_trade_id: 1,
            trade_time: 1,
            is_buyer_maker: false,
        });
        assert!(!router.dispatch(trade));
    }

    #[test]
    fn test_feed_error_requests_shutdown() {
        let (router, _rx) = router(OverflowPolicy::DropNewest, 4);
        assert!(!router.handle(
            "klines",
            Err(RecorderError::WebSocketMessage("reset".to_string()))
        ));
        assert_eq!(router.shutdown.reason().as_deref(), Some("feed error on klines"));
    }
}
