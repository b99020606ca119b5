// src/sync/cancel.rs

//! Cooperative cancellation for long-running fetches
//!
//! A [`CancelToken`] is passed into every transfer, which checks it between
//! I/O chunks. A [`LockPoller`] runs on its own thread while a repository is
//! being fetched and cancels the token when the serving mirror becomes
//! download-locked. The poller is stopped and joined when dropped, so every
//! exit path of the fetch releases it.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] if the token has been cancelled
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(format!("{} aborted: mirror locked", what)));
        }
        Ok(())
    }
}

/// Background thread cancelling a token once a lock probe reports locked
pub struct LockPoller {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LockPoller {
    /// Start polling `is_locked` every `interval`
    ///
    /// Probe errors are logged and treated as "not locked".
    pub fn spawn<F>(token: CancelToken, interval: Duration, mut is_locked: F) -> Self
    where
        F: FnMut() -> Result<bool> + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = std::thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match is_locked() {
                        Ok(true) => {
                            warn!("Mirror became locked during transfer, cancelling");
                            token.cancel();
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => debug!("Lock probe failed: {}", e),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stop the poller and wait for its thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Lock poller thread panicked");
        }
    }
}

impl Drop for LockPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_token_check() {
        let token = CancelToken::new();
        assert!(token.check("download").is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check("download"), Err(Error::Cancelled(_))));
    }

    #[test]
    fn test_poller_cancels_when_locked() {
        let token = CancelToken::new();
        let probes = Arc::new(AtomicUsize::new(0));
        let counter = probes.clone();

        let poller = LockPoller::spawn(token.clone(), Duration::from_millis(5), move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2)
        });

        for _ in 0..200 {
            if token.is_cancelled() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        poller.stop();
        assert!(token.is_cancelled());
        assert!(probes.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_poller_stops_on_drop() {
        let token = CancelToken::new();
        {
            let _poller = LockPoller::spawn(token.clone(), Duration::from_secs(60), || Ok(true));
        }
        // dropped before the first probe fired
        assert!(!token.is_cancelled());
    }
}
