// Per-request context: correlation id, deadline and cancellation signal

use std::{future::Future, time::Duration};

use tokio::{sync::watch, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    DeadlineExceeded,
}

/// Owned by the caller; dropping it or calling `cancel` interrupts every
/// context created from it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Cancels once `signal` fires. If the signal cannot be listened for, the
    /// handle is kept alive so the request is not cancelled by the drop.
    pub async fn cancel_on<F, E>(self, signal: F)
    where
        F: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        match signal.await {
            Ok(()) => {
                tracing::warn!("interrupt received, cancelling request");
                self.cancel();
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for interrupts");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(format!("req-{:08x}", rand::random::<u32>()))
    }
}

impl RequestContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            deadline: None,
            cancel: None,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Non-blocking check used before starting new work.
    pub fn interruption(&self) -> Option<Interruption> {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() || rx.has_changed().is_err() {
                return Some(Interruption::Cancelled);
            }
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interruption::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes. Never
    /// resolves for a context with neither.
    pub async fn interrupted(&self) -> Interruption {
        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    // sender dropped counts as cancellation
                    if rx.changed().await.is_err() {
                        return;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        };

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancelled => Interruption::Cancelled,
            _ = expired => Interruption::DeadlineExceeded,
        }
    }
}
