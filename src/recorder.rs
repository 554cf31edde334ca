//! Pipeline wiring
//!
//! Opens the per-category files, starts one writer thread per recorded
//! category plus the order book synchronizer thread, and hands back the
//! producer side for the feed.

use chrono::NaiveDate;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use crate::config::Config;
use crate::error::{RecorderError, Result};
use crate::metrics::RecorderMetrics;
use crate::orderbook::{SnapshotSource, SyncReport, SyncSettings, Synchronizer};
use crate::parser::StreamKind;
use crate::queue::{self, EventReceiver};
use crate::shutdown::Shutdown;
use crate::websocket::EventRouter;
use crate::writer::{BatchFile, BatchedWriter, WriterReport};

/// Suffix of the synchronizer's log file
pub const ORDER_BOOK_CATEGORY: &str = "order_book";

/// Create (if needed) and return `<root>/<YYYY-MM-DD>`
pub fn day_directory(root: &Path, date: NaiveDate) -> Result<PathBuf> {
    let dir = root.join(date.format("%Y-%m-%d").to_string());
    std::fs::create_dir_all(&dir).map_err(|source| RecorderError::FileOpen {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// `<dir>/<SYMBOL>_<category>`
pub fn category_path(dir: &Path, symbol: &str, category: &str) -> PathBuf {
    dir.join(format!("{}_{}", symbol, category))
}

/// What a pipeline thread returned
#[derive(Debug)]
pub enum PipelineReport {
    Writer(WriterReport),
    Synchronizer(SyncReport),
}

/// Handles to every consumer thread
pub struct Pipelines {
    handles: Vec<(String, JoinHandle<Result<PipelineReport>>)>,
    shutdown: Shutdown,
}

impl Pipelines {
    /// Thread names, in start order
    pub fn names(&self) -> Vec<&str> {
        self.handles.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Wait for every thread. All threads are joined even when one fails;
    /// the first failure is returned.
    pub fn join(self) -> Result<Vec<PipelineReport>> {
        let mut reports = Vec::with_capacity(self.handles.len());
        let mut first_error = None;

        for (name, handle) in self.handles {
            let outcome = match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(pipeline = %name, "Pipeline thread panicked");
                    self.shutdown.trigger(&format!("{} panicked", name));
                    Err(RecorderError::PipelineFailed(name))
                }
            };

            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

/// Open all files, then start the consumer threads.
///
/// `make_source` runs on the synchronizer thread, so a blocking HTTP client
/// is never built inside the async runtime.
pub fn start<S, F>(
    config: &Config,
    day_dir: &Path,
    shutdown: Shutdown,
    metrics: Arc<RecorderMetrics>,
    make_source: F,
) -> Result<(EventRouter, Pipelines)>
where
    S: SnapshotSource + 'static,
    F: FnOnce() -> Result<S> + Send + 'static,
{
    let open = |category: &str| {
        BatchFile::open(
            category_path(day_dir, &config.symbol, category),
            config.flush_threshold_bytes,
        )
    };

    // Fail before any thread exists
    let agg_trades_file = open(StreamKind::AggTrade.category())?;
    let klines_file = open(StreamKind::Kline.category())?;
    let book_ticker_file = open(StreamKind::BookTicker.category())?;
    let part_depths_file = open(StreamKind::PartialDepth.category())?;
    let order_book_file = open(ORDER_BOOK_CATEGORY)?;

    let capacity = config.queue_capacity;
    let policy = config.overflow_policy;
    let (agg_trades, agg_trades_rx) = queue::channel(StreamKind::AggTrade.category(), capacity, policy);
    let (klines, klines_rx) = queue::channel(StreamKind::Kline.category(), capacity, policy);
    let (book_tickers, book_tickers_rx) =
        queue::channel(StreamKind::BookTicker.category(), capacity, policy);
    let (part_depths, part_depths_rx) =
        queue::channel(StreamKind::PartialDepth.category(), capacity, policy);
    let (diff_depths, diff_depths_rx) =
        queue::channel(StreamKind::DiffDepth.category(), capacity, policy);

    let mut pipelines = Pipelines {
        handles: Vec::with_capacity(5),
        shutdown: shutdown.clone(),
    };

    let spawned = (|| -> Result<()> {
        pipelines.spawn_writer(agg_trades_file, agg_trades_rx, &shutdown, &metrics)?;
        pipelines.spawn_writer(klines_file, klines_rx, &shutdown, &metrics)?;
        pipelines.spawn_writer(book_ticker_file, book_tickers_rx, &shutdown, &metrics)?;
        pipelines.spawn_writer(part_depths_file, part_depths_rx, &shutdown, &metrics)?;

        let settings = SyncSettings::from_config(config);
        let sync_shutdown = shutdown.clone();
        let sync_metrics = metrics.clone();
        pipelines.spawn(ORDER_BOOK_CATEGORY, move || {
            let source = match make_source() {
                Ok(source) => source,
                Err(e) => {
                    error!(error = %e, "Failed to build snapshot source");
                    sync_shutdown.trigger("snapshot source unavailable");
                    return Err(e);
                }
            };
            Synchronizer::new(
                settings,
                source,
                diff_depths_rx,
                order_book_file,
                sync_shutdown,
                sync_metrics,
            )
            .run()
            .map(PipelineReport::Synchronizer)
        })
    })();

    if let Err(e) = spawned {
        shutdown.trigger("failed to start pipelines");
        let _ = pipelines.join();
        return Err(e);
    }

    info!(
        symbol = %config.symbol,
        dir = %day_dir.display(),
        threads = ?pipelines.names(),
        "Pipelines started"
    );

    let router = EventRouter {
        agg_trades,
        klines,
        book_tickers,
        part_depths,
        diff_depths,
        shutdown,
        metrics,
    };
    Ok((router, pipelines))
}

impl Pipelines {
    fn spawn<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<PipelineReport> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)?;
        self.handles.push((name.to_string(), handle));
        Ok(())
    }

    fn spawn_writer<T>(
        &mut self,
        file: BatchFile,
        events: EventReceiver<T>,
        shutdown: &Shutdown,
        metrics: &Arc<RecorderMetrics>,
    ) -> Result<()>
    where
        T: Serialize + Send + 'static,
    {
        let category = events.name().to_string();
        let writer = BatchedWriter::new(&category, file, events, shutdown.clone(), metrics.clone());
        self.spawn(&category, move || writer.run().map(PipelineReport::Writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::MockSnapshotSource;
    use crate::parser::{AggTrade, DepthUpdate, MarketEvent, OrderBookSnapshot};
    use rust_decimal_macros::dec;
    use std::fs;

    fn config() -> Config {
        Config {
            flush_threshold_bytes: 1 << 16,
            ..Config::default()
        }
    }

    fn trade(id: u64) -> MarketEvent {
        MarketEvent::AggTrade(AggTrade {
            event_type: "aggTrade".to_string(),
            event_time: id,
            symbol: "BTCUSDT".to_string(),
            agg_trade_id: id,
            price: dec!(50000.10),
            quantity: dec!(0.5),
            first_trade_id: id,
            last_trade_id: id,
            trade_time: id,
            is_buyer_maker: true,
        })
    }

    fn depth(first: u64, last: u64) -> MarketEvent {
        MarketEvent::DiffDepth(DepthUpdate {
            event_type: "depthUpdate".to_string(),
            event_time: last,
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            final_update_id: last,
            bids: vec![],
            asks: vec![],
        })
    }

    #[test]
    fn test_day_directory_is_created() {
        let root = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let dir = day_directory(root.path(), date).unwrap();
        assert_eq!(dir, root.path().join("2024-03-09"));
        assert!(dir.is_dir());
        // Idempotent
        assert!(day_directory(root.path(), date).is_ok());
    }

    #[test]
    fn test_start_fails_fast_on_unwritable_directory() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("missing");
        let result = start(
            &config(),
            &missing,
            Shutdown::new(),
            Arc::new(RecorderMetrics::new().unwrap()),
            || Ok(MockSnapshotSource::new()),
        );
        assert!(matches!(result, Err(RecorderError::FileOpen { .. })));
    }

    #[test]
    fn test_pipelines_record_and_drain_on_shutdown() {
        let root = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::new();
        let metrics = Arc::new(RecorderMetrics::new().unwrap());

        let (router, pipelines) = start(&config(), root.path(), shutdown.clone(), metrics, || {
            let mut source = MockSnapshotSource::new();
            source.expect_fetch_depth_snapshot().returning(|_, _| {
                Ok(OrderBookSnapshot {
                    last_update_id: 100,
                    bids: vec![],
                    asks: vec![],
                })
            });
            Ok(source)
        })
        .unwrap();
        assert_eq!(
            pipelines.names(),
            vec!["agg_trades", "klines", "book_ticker", "part_depths", "order_book"]
        );

        for id in 1..=50 {
            assert!(router.dispatch(trade(id)));
        }
        assert!(router.dispatch(depth(95, 101)));
        assert!(router.dispatch(depth(102, 110)));

        // Let the synchronizer apply both deltas before stopping
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while router.metrics.book_last_update_id.get() != 110 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        shutdown.trigger("test");
        drop(router);
        let reports = pipelines.join().unwrap();
        assert_eq!(reports.len(), 5);

        let trades = fs::read_to_string(category_path(root.path(), "BTCUSDT", "agg_trades")).unwrap();
        assert_eq!(trades.lines().count(), 50);

        let book = reports
            .iter()
            .find_map(|r| match r {
                PipelineReport::Synchronizer(report) => Some(report),
                _ => None,
            })
            .unwrap();
        assert_eq!(book.last_update_id, Some(110));
    }

    #[test]
    fn test_source_failure_stops_everything() {
        let root = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::new();
        let (router, pipelines) = start(
            &config(),
            root.path(),
            shutdown.clone(),
            Arc::new(RecorderMetrics::new().unwrap()),
            || -> Result<MockSnapshotSource> { Err(RecorderError::RestApiError("no tls".into())) },
        )
        .unwrap();

        let err = pipelines.join().unwrap_err();
        assert!(matches!(err, RecorderError::RestApiError(_)));
        assert!(shutdown.is_triggered());
        assert!(!router.dispatch(trade(1)));
    }
}
