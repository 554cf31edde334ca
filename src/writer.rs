//! Batched append-only writers
//!
//! Records are serialized to JSON lines into an in-memory buffer which is
//! written to the file once it reaches the flush threshold. Whatever is left
//! in the buffer is written when the writer finishes.

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{RecorderError, Result};
use crate::metrics::RecorderMetrics;
use crate::queue::EventReceiver;
use crate::shutdown::Shutdown;

/// Default flush threshold (64 KiB)
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Totals for one output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub path: PathBuf,
    pub lines: u64,
    pub bytes_written: u64,
    pub flushes: u64,
}

/// Append-mode file with a byte buffer in front of it
pub struct BatchFile {
    path: PathBuf,
    file: File,
    buffer: Vec<u8>,
    threshold: usize,
    lines: u64,
    bytes_written: u64,
    flushes: u64,
}

impl BatchFile {
    /// Open (or create) `path` for appending
    pub fn open(path: impl AsRef<Path>, threshold: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| RecorderError::FileOpen {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file,
            buffer: Vec::with_capacity(threshold),
            threshold,
            lines: 0,
            bytes_written: 0,
            flushes: 0,
        })
    }

    /// Serialize one record as a line. Returns the bytes written to disk by
    /// this call, which is zero unless the buffer reached the threshold.
    pub fn append<R: Serialize + ?Sized>(&mut self, record: &R) -> Result<usize> {
        let mark = self.buffer.len();
        if let Err(e) = serde_json::to_writer(&mut self.buffer, record) {
            self.buffer.truncate(mark);
            return Err(RecorderError::SerializationError(e.to_string()));
        }
        self.buffer.push(b'\n');
        self.lines += 1;

        if self.buffer.len() >= self.threshold {
            return self.flush();
        }
        Ok(0)
    }

    /// Write the buffer out. Returns the number of bytes written.
    pub fn flush(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        self.file.write_all(&self.buffer)?;
        let written = self.buffer.len();
        self.bytes_written += written as u64;
        self.flushes += 1;
        self.buffer.clear();

        debug!(path = %self.path.display(), bytes = written, "Flushed buffer");
        Ok(written)
    }

    /// Flush the remainder, sync and close the file
    pub fn finish(mut self) -> Result<BatchReport> {
        self.flush()?;
        self.file.sync_all()?;

        Ok(BatchReport {
            path: self.path,
            lines: self.lines,
            bytes_written: self.bytes_written,
            flushes: self.flushes,
        })
    }

    /// Lines accepted into the buffer so far
    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Summary returned when a writer thread exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterReport {
    pub category: String,
    pub file: BatchReport,
    /// Events picked up by the terminal drain
    pub drained_at_shutdown: u64,
}

/// Moves events from a queue into a `BatchFile`
pub struct BatchedWriter<T> {
    category: String,
    file: BatchFile,
    events: EventReceiver<T>,
    shutdown: Shutdown,
    metrics: Arc<RecorderMetrics>,
}

impl<T: Serialize> BatchedWriter<T> {
    pub fn new(
        category: &str,
        file: BatchFile,
        events: EventReceiver<T>,
        shutdown: Shutdown,
        metrics: Arc<RecorderMetrics>,
    ) -> Self {
        Self {
            category: category.to_string(),
            file,
            events,
            shutdown,
            metrics,
        }
    }

    /// Run until shutdown or until the producer hangs up, then drain
    /// everything still queued and close the file.
    pub fn run(mut self) -> Result<WriterReport> {
        info!(category = %self.category, path = %self.file.path().display(), "Writer started");

        match self.write_until_shutdown() {
            Ok(drained_at_shutdown) => {
                let file = self.file.finish()?;
                info!(
                    category = %self.category,
                    lines = file.lines,
                    bytes = file.bytes_written,
                    drained_at_shutdown,
                    "Writer finished"
                );
                Ok(WriterReport {
                    category: self.category,
                    file,
                    drained_at_shutdown,
                })
            }
            Err(e) => {
                error!(category = %self.category, error = %e, "Writer failed");
                self.shutdown.trigger(&format!("{} writer failed", self.category));
                // Lines already buffered were dequeued; try once more to keep them
                match self.file.flush() {
                    Ok(flushed) => self.record_flush(flushed),
                    Err(retry) => {
                        error!(category = %self.category, error = %retry, "Buffered lines lost")
                    }
                }
                Err(e)
            }
        }
    }

    fn write_until_shutdown(&mut self) -> Result<u64> {
        let events = self.events.raw().clone();
        let closed = self.shutdown.closed().clone();

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            crossbeam::select! {
                recv(events) -> msg => match msg {
                    Ok(event) => {
                        self.write(&event)?;
                        self.drain()?;
                    }
                    Err(_) => {
                        debug!(category = %self.category, "Producer closed");
                        break;
                    }
                },
                recv(closed) -> _ => break,
            }
        }

        let drained = self.drain()?;
        let flushed = self.file.flush()?;
        self.record_flush(flushed);
        Ok(drained)
    }

    /// Write everything currently queued
    fn drain(&mut self) -> Result<u64> {
        let mut count = 0;
        while let Some(event) = self.events.try_pop() {
            self.write(&event)?;
            count += 1;
        }
        Ok(count)
    }

    /// Append one event. A record that cannot be serialized is dropped and
    /// counted; only I/O failures stop the writer.
    fn write(&mut self, event: &T) -> Result<()> {
        let lines_before = self.file.lines();
        let appended = self.file.append(event);

        if self.file.lines() > lines_before {
            self.metrics
                .events_written
                .with_label_values(&[self.category.as_str()])
                .inc();
        }

        match appended {
            Ok(flushed) => {
                self.record_flush(flushed);
                Ok(())
            }
            Err(RecorderError::SerializationError(e)) => {
                warn!(category = %self.category, error = %e, "Dropping unserializable event");
                self.metrics
                    .events_dropped
                    .with_label_values(&[self.category.as_str()])
                    .inc();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn record_flush(&self, bytes: usize) {
        if bytes > 0 {
            self.metrics
                .bytes_flushed
                .with_label_values(&[self.category.as_str()])
                .inc_by(bytes as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{channel, OverflowPolicy};
    use serde::{Serialize, Serializer};
    use std::fs;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Serialize)]
    struct Line {
        id: u64,
    }

    fn file_len(path: &Path) -> usize {
        fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0)
    }

    fn read_ids(path: &Path) -> Vec<u64> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["id"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_flush_happens_exactly_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        // {"id":1}\n is 9 bytes
        let mut file = BatchFile::open(&path, 27).unwrap();

        assert_eq!(file.append(&Line { id: 1 }).unwrap(), 0);
        assert_eq!(file.append(&Line { id: 2 }).unwrap(), 0);
        assert_eq!(file_len(&path), 0);
        assert_eq!(file.buffered(), 18);

        assert_eq!(file.append(&Line { id: 3 }).unwrap(), 27);
        assert_eq!(file_len(&path), 27);
        assert_eq!(file.buffered(), 0);

        file.append(&Line { id: 4 }).unwrap();
        let report = file.finish().unwrap();
        assert_eq!(report.lines, 4);
        assert_eq!(report.flushes, 2);
        assert_eq!(file_len(&path), 36);
        assert_eq!(read_ids(&path), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_default_threshold_is_64_kib() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        let mut file = BatchFile::open(&path, DEFAULT_FLUSH_THRESHOLD).unwrap();

        // 8-byte payload + quotes + newline = 11 bytes per line
        let payload = "x".repeat(8);
        let mut total = 0;
        while total + 11 < DEFAULT_FLUSH_THRESHOLD {
            assert_eq!(file.append(&payload).unwrap(), 0);
            total += 11;
        }
        assert_eq!(file_len(&path), 0);

        let flushed = file.append(&payload).unwrap();
        assert!(flushed >= DEFAULT_FLUSH_THRESHOLD);
        assert_eq!(file_len(&path), flushed);
    }

    #[test]
    fn test_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        fs::write(&path, "{\"id\":0}\n").unwrap();

        let mut file = BatchFile::open(&path, 1024).unwrap();
        file.append(&Line { id: 1 }).unwrap();
        file.finish().unwrap();

        assert_eq!(read_ids(&path), vec![0, 1]);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("lines");
        assert!(matches!(
            BatchFile::open(&path, 1024),
            Err(RecorderError::FileOpen { .. })
        ));
    }

    #[test]
    fn test_writer_drains_everything_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        let metrics = Arc::new(RecorderMetrics::new().unwrap());
        let shutdown = Shutdown::new();
        let (tx, rx) = channel("lines", 4096, OverflowPolicy::Fail);

        let file = BatchFile::open(&path, DEFAULT_FLUSH_THRESHOLD).unwrap();
        let writer = BatchedWriter::new("lines", file, rx, shutdown.clone(), metrics.clone());
        let handle = thread::spawn(move || writer.run());

        for id in 0..1000 {
            tx.offer(Line { id }).unwrap();
        }
        thread::sleep(Duration::from_millis(20));
        for id in 1000..3000 {
            tx.offer(Line { id }).unwrap();
        }
        shutdown.trigger("test");

        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.file.lines, 3000);
        assert_eq!(read_ids(&path), (0..3000).collect::<Vec<_>>());
        assert_eq!(
            metrics.events_written.with_label_values(&["lines"]).get(),
            3000
        );
        assert_eq!(
            metrics.bytes_flushed.with_label_values(&["lines"]).get(),
            file_len(&path) as u64
        );
    }

    #[test]
    fn test_writer_exits_when_producer_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        let metrics = Arc::new(RecorderMetrics::new().unwrap());
        let (tx, rx) = channel("lines", 16, OverflowPolicy::Fail);
        let file = BatchFile::open(&path, DEFAULT_FLUSH_THRESHOLD).unwrap();
        let writer = BatchedWriter::new("lines", file, rx, Shutdown::new(), metrics);

        tx.offer(Line { id: 7 }).unwrap();
        drop(tx);

        let report = writer.run().unwrap();
        assert_eq!(report.file.lines, 1);
        assert_eq!(read_ids(&path), vec![7]);
    }

    #[test]
    fn test_writer_with_pending_shutdown_still_drains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        let metrics = Arc::new(RecorderMetrics::new().unwrap());
        let shutdown = Shutdown::new();
        let (tx, rx) = channel("lines", 16, OverflowPolicy::Fail);
        for id in 0..5 {
            tx.offer(Line { id }).unwrap();
        }
        shutdown.trigger("test");

        let file = BatchFile::open(&path, DEFAULT_FLUSH_THRESHOLD).unwrap();
        let report = BatchedWriter::new("lines", file, rx, shutdown, metrics)
            .run()
            .unwrap();
        assert_eq!(report.drained_at_shutdown, 5);
        assert_eq!(read_ids(&path), vec![0, 1, 2, 3, 4]);
    }

    /// Serializes like `Line` unless `poisoned` is set
    struct Fragile {
        id: u64,
        poisoned: bool,
    }

    impl Serialize for Fragile {
        fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            if self.poisoned {
                return Err(serde::ser::Error::custom("unrepresentable record"));
            }
            Line { id: self.id }.serialize(serializer)
        }
    }

    #[test]
    fn test_unserializable_event_is_dropped_and_the_rest_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        let metrics = Arc::new(RecorderMetrics::new().unwrap());
        let (tx, rx) = channel("lines", 16, OverflowPolicy::Fail);
        for id in 0..8 {
            tx.offer(Fragile { id, poisoned: id == 4 }).unwrap();
        }
        drop(tx);

        let file = BatchFile::open(&path, DEFAULT_FLUSH_THRESHOLD).unwrap();
        let shutdown = Shutdown::new();
        let report = BatchedWriter::new("lines", file, rx, shutdown.clone(), metrics.clone())
            .run()
            .unwrap();

        assert_eq!(report.file.lines, 7);
        assert_eq!(read_ids(&path), vec![0, 1, 2, 3, 5, 6, 7]);
        assert_eq!(metrics.events_written.with_label_values(&["lines"]).get(), 7);
        assert_eq!(metrics.events_dropped.with_label_values(&["lines"]).get(), 1);
        assert!(!shutdown.is_triggered());
    }

    #[test]
    fn test_failed_append_leaves_buffer_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        let mut file = BatchFile::open(&path, 1024).unwrap();

        file.append(&Line { id: 1 }).unwrap();
        assert!(matches!(
            file.append(&Fragile { id: 2, poisoned: true }),
            Err(RecorderError::SerializationError(_))
        ));
        assert_eq!(file.lines(), 1);
        assert_eq!(file.buffered(), 9);

        file.finish().unwrap();
        assert_eq!(read_ids(&path), vec![1]);
    }
}
