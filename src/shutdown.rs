//! Cooperative shutdown
//!
//! One `Shutdown` context is cloned into every loop. Triggering it flips an
//! atomic flag, wakes async waiters through `Notify`, and closes a crossbeam
//! channel so blocked consumer threads wake up inside `select!`.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

struct Inner {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
    closer: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
    notify: Notify,
}

/// Process-wide shutdown request
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (closer, closed) = channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                reason: Mutex::new(None),
                closer: Mutex::new(Some(closer)),
                closed,
                notify: Notify::new(),
            }),
        }
    }

    /// Request shutdown. Returns true for the first caller only.
    pub fn trigger(&self, reason: &str) -> bool {
        if self.inner.flag.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!(reason = %reason, "Shutdown requested");
        *self
            .inner
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.to_string());
        self.inner
            .closer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Reason given by the first `trigger` call
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Disconnects when shutdown is triggered; for use in `crossbeam::select!`
    pub fn closed(&self) -> &Receiver<()> {
        &self.inner.closed
    }

    /// Blocking sleep that ends early on shutdown. Returns false if interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        matches!(
            self.inner.closed.recv_timeout(duration),
            Err(RecvTimeoutError::Timeout)
        )
    }

    /// Resolves once shutdown is triggered
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }

    /// Map SIGINT, SIGTERM and SIGQUIT onto `trigger`
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to install Ctrl+C handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = wait_for_unix(tokio::signal::unix::SignalKind::terminate());
            #[cfg(unix)]
            let quit = wait_for_unix(tokio::signal::unix::SignalKind::quit());

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();
            #[cfg(not(unix))]
            let quit = std::future::pending::<()>();

            tokio::select! {
                () = ctrl_c => { shutdown.trigger("SIGINT"); }
                () = terminate => { shutdown.trigger("SIGTERM"); }
                () = quit => { shutdown.trigger("SIGQUIT"); }
                () = shutdown.wait() => {}
            }
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_unix(kind: tokio::signal::unix::SignalKind) {
    match tokio::signal::unix::signal(kind) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger("gap"));
        assert!(!shutdown.trigger("SIGINT"));
        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.reason().as_deref(), Some("gap"));
    }

    #[test]
    fn test_clones_share_state() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        other.trigger("test");
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_sleep_runs_to_completion() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn test_sleep_is_interrupted() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            trigger.trigger("test");
        });

        let started = Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_closed_channel_disconnects() {
        let shutdown = Shutdown::new();
        shutdown.trigger("test");
        assert!(shutdown.closed().recv().is_err());
    }

    #[test]
    fn test_async_wait() {
        let shutdown = Shutdown::new();
        shutdown.trigger("test");
        tokio_test::block_on(shutdown.wait());
    }

    #[tokio::test]
    async fn test_async_wait_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger("test");
        });
        tokio::time::timeout(Duration::from_secs(5), shutdown.wait())
            .await
            .expect("shutdown wait should resolve");
    }
}
