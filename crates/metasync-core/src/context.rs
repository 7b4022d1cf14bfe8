//! Per-cycle cancellation context
//!
//! Every external call a source or target makes goes through
//! [`SyncContext::run`], which races the call against the cycle deadline and
//! the process-wide shutdown signal.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline and shutdown signal for one reconciliation cycle
#[derive(Debug, Clone)]
pub struct SyncContext {
    deadline: Option<Instant>,
    shutdown: watch::Receiver<bool>,
}

impl SyncContext {
    /// Context bound to a shutdown channel; `true` on the channel cancels
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            deadline: None,
            shutdown,
        }
    }

    /// Context that is never cancelled and has no deadline
    pub fn background() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender leaves the last value (false) readable forever
        drop(tx);
        Self::new(rx)
    }

    /// Same shutdown signal, with a deadline `timeout` from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolve once shutdown is signalled; pends forever if it never is
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            if shutdown.changed().await.is_err() {
                // Sender gone without signalling
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless shutdown or the deadline comes first
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = fut => result,
            _ = self.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
        }
    }
}
