//! Order book synchronizer
//!
//! Runs on its own thread and owns the local book and its log file. The
//! protocol is: wait for the first diff event, fetch a snapshot that is at
//! least as recent as that event's `U`, seed the book, then apply every
//! following diff event in arrival order. A gap in update ids invalidates the
//! book; the synchronizer either starts over or, once `max_resyncs` is used
//! up, gives up and requests shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::snapshot::{SnapshotRetry, SnapshotSource};
use super::{BookRecord, DeltaOutcome, OrderBook};
use crate::config::Config;
use crate::error::{RecorderError, Result};
use crate::metrics::RecorderMetrics;
use crate::parser::{DepthUpdate, OrderBookSnapshot};
use crate::queue::EventReceiver;
use crate::shutdown::Shutdown;
use crate::writer::{BatchFile, BatchReport};

/// Synchronizer states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    AwaitingFirstDelta,
    FetchingSnapshot,
    Synced,
    Desynced,
}

/// Synchronizer parameters
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub symbol: String,
    pub depth_limit: u32,
    pub retry: SnapshotRetry,
    pub max_resyncs: u32,
    pub status_interval: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            symbol: config.symbol.clone(),
            depth_limit: config.snapshot_depth_limit,
            retry: SnapshotRetry::from_config(config),
            max_resyncs: config.max_resyncs,
            status_interval: Duration::from_secs(config.status_interval_secs),
        }
    }
}

/// Counters returned when the synchronizer exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub applied: u64,
    pub stale: u64,
    pub gaps: u64,
    pub resyncs: u32,
    pub last_update_id: Option<u64>,
    pub log: Option<BatchReport>,
}

/// How a synced session ended
enum SessionEnd {
    Stopped,
    Gap(RecorderError),
}

pub struct Synchronizer<S> {
    settings: SyncSettings,
    source: S,
    deltas: EventReceiver<DepthUpdate>,
    log: BatchFile,
    shutdown: Shutdown,
    metrics: Arc<RecorderMetrics>,
    state: SyncState,
    report: SyncReport,
    last_status: Instant,
}

impl<S: SnapshotSource> Synchronizer<S> {
    pub fn new(
        settings: SyncSettings,
        source: S,
        deltas: EventReceiver<DepthUpdate>,
        log: BatchFile,
        shutdown: Shutdown,
        metrics: Arc<RecorderMetrics>,
    ) -> Self {
        Self {
            settings,
            source,
            deltas,
            log,
            shutdown,
            metrics,
            state: SyncState::AwaitingFirstDelta,
            report: SyncReport::default(),
            last_status: Instant::now(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Run the protocol until shutdown, producer hang-up or a fatal error.
    /// Fatal errors trigger shutdown before they are returned.
    pub fn run(mut self) -> Result<SyncReport> {
        info!(symbol = %self.settings.symbol, "Order book synchronizer started");

        let outcome = self.sync_loop();
        let log = self.log.finish();

        if let Err(e) = &outcome {
            error!(symbol = %self.settings.symbol, error = %e, "Order book synchronizer stopped");
            self.shutdown.trigger(&format!("order book: {}", e));
        }
        outcome?;

        let mut report = self.report;
        report.log = Some(log?);
        info!(
            applied = report.applied,
            stale = report.stale,
            gaps = report.gaps,
            resyncs = report.resyncs,
            "Order book synchronizer finished"
        );
        Ok(report)
    }

    fn sync_loop(&mut self) -> Result<()> {
        loop {
            self.transition(SyncState::AwaitingFirstDelta);
            let Some(first) = self.next_delta() else {
                return Ok(());
            };
            debug!(
                first_update_id = first.first_update_id,
                final_update_id = first.final_update_id,
                "Buffered first diff event"
            );

            self.transition(SyncState::FetchingSnapshot);
            let Some(snapshot) = self.fetch_snapshot(first.first_update_id)? else {
                return Ok(());
            };
            let book = self.seed(&snapshot, &first)?;

            self.transition(SyncState::Synced);
            match self.follow(book, first)? {
                SessionEnd::Stopped => return Ok(()),
                SessionEnd::Gap(gap) => {
                    self.transition(SyncState::Desynced);
                    self.report.gaps += 1;
                    self.metrics.sequence_gaps.inc();

                    if self.report.resyncs >= self.settings.max_resyncs {
                        if self.settings.max_resyncs == 0 {
                            return Err(gap);
                        }
                        return Err(RecorderError::ResyncLimitExceeded {
                            resyncs: self.report.resyncs,
                        });
                    }

                    self.report.resyncs += 1;
                    self.metrics.resyncs.inc();
                    warn!(
                        error = %gap,
                        resync = self.report.resyncs,
                        max_resyncs = self.settings.max_resyncs,
                        "Discarding order book and resynchronizing"
                    );
                }
            }
        }
    }

    fn transition(&mut self, next: SyncState) {
        if self.state != next {
            info!(symbol = %self.settings.symbol, from = ?self.state, to = ?next, "Synchronizer state change");
            self.state = next;
        }
    }

    /// Block until the next diff event. `None` on shutdown or producer hang-up.
    fn next_delta(&self) -> Option<DepthUpdate> {
        if self.shutdown.is_triggered() {
            return None;
        }

        let deltas = self.deltas.raw();
        let closed = self.shutdown.closed();
        crossbeam::select! {
            recv(deltas) -> msg => match msg {
                Ok(delta) => Some(delta),
                Err(_) => {
                    debug!("Diff depth producer closed");
                    None
                }
            },
            recv(closed) -> _ => None,
        }
    }

    /// Fetch until a snapshot covers `first_update_id`, with bounded retries
    fn fetch_snapshot(&mut self, first_update_id: u64) -> Result<Option<OrderBookSnapshot>> {
        let retry = self.settings.retry;
        let mut attempt = 0;

        loop {
            if self.shutdown.is_triggered() {
                return Ok(None);
            }
            attempt += 1;

            match self
                .source
                .fetch_depth_snapshot(&self.settings.symbol, self.settings.depth_limit)
            {
                Ok(snapshot) if snapshot.last_update_id >= first_update_id => {
                    info!(
                        symbol = %self.settings.symbol,
                        last_update_id = snapshot.last_update_id,
                        attempt,
                        "Snapshot received"
                    );
                    return Ok(Some(snapshot));
                }
                Ok(snapshot) => {
                    debug!(
                        last_update_id = snapshot.last_update_id,
                        first_update_id,
                        "Snapshot older than first buffered event"
                    );
                }
                Err(e) => {
                    self.metrics.snapshot_failures.inc();
                    warn!(error = %e, attempt, max_attempts = retry.max_attempts, "Snapshot fetch failed");
                }
            }

            if attempt >= retry.max_attempts {
                return Err(RecorderError::SnapshotRetriesExhausted { attempts: attempt });
            }
            if !self.shutdown.sleep(retry.delay(attempt)) {
                return Ok(None);
            }
        }
    }

    fn seed(&mut self, snapshot: &OrderBookSnapshot, first: &DepthUpdate) -> Result<OrderBook> {
        let book = OrderBook::from_snapshot(
            &self.settings.symbol,
            snapshot,
            first.first_update_id,
            first.event_time,
        );

        self.log.append(&BookRecord::Snapshot {
            symbol: &self.settings.symbol,
            last_update_id: snapshot.last_update_id,
            event_time: first.event_time,
            bids: &snapshot.bids,
            asks: &snapshot.asks,
        })?;
        self.metrics.book_last_update_id.set(book.last_update_id() as i64);
        self.report.last_update_id = Some(book.last_update_id());

        info!(
            symbol = %self.settings.symbol,
            first_update_id = book.first_update_id(),
            last_update_id = book.last_update_id(),
            bid_levels = book.bid_levels(),
            ask_levels = book.ask_levels(),
            "Order book seeded"
        );
        Ok(book)
    }

    /// Replay the buffered first event, then follow the stream
    fn follow(&mut self, mut book: OrderBook, first: DepthUpdate) -> Result<SessionEnd> {
        let mut pending = Some(first);

        loop {
            let delta = match pending.take() {
                Some(delta) => delta,
                None => match self.next_delta() {
                    Some(delta) => delta,
                    None => return Ok(SessionEnd::Stopped),
                },
            };

            match book.apply_delta(&delta) {
                DeltaOutcome::Applied => {
                    self.log.append(&BookRecord::Delta {
                        symbol: &self.settings.symbol,
                        first_update_id: delta.first_update_id,
                        final_update_id: delta.final_update_id,
                        event_time: delta.event_time,
                        bids: &delta.bids,
                        asks: &delta.asks,
                    })?;
                    self.report.applied += 1;
                    self.report.last_update_id = Some(book.last_update_id());
                    self.metrics.deltas_applied.inc();
                    self.metrics.book_last_update_id.set(book.last_update_id() as i64);
                    self.log_status(&book);
                }
                DeltaOutcome::Stale => {
                    self.report.stale += 1;
                    self.metrics.deltas_stale.inc();
                    debug!(
                        final_update_id = delta.final_update_id,
                        last_update_id = book.last_update_id(),
                        "Discarding stale diff event"
                    );
                }
                DeltaOutcome::Gap => {
                    let gap = RecorderError::SequenceGap {
                        last_update_id: book.last_update_id(),
                        first_update_id: delta.first_update_id,
                        final_update_id: delta.final_update_id,
                    };
                    error!(error = %gap, "Order book desynchronized");
                    return Ok(SessionEnd::Gap(gap));
                }
            }
        }
    }

    fn log_status(&mut self, book: &OrderBook) {
        if self.last_status.elapsed() < self.settings.status_interval {
            return;
        }
        self.last_status = Instant::now();

        let metrics = book.calculate_metrics();
        info!(
            symbol = %book.symbol(),
            last_update_id = book.last_update_id(),
            mid_price = ?metrics.mid_price,
            spread_bps = ?metrics.spread_bps,
            imbalance = ?metrics.imbalance,
            healthy = metrics.is_healthy(),
            "Order book status"
        );
    }
}
