//! Composite interruptors.
//!
//! An interruptor is a set of cancellation signals. It fires when the first of
//! them fires, which is how "the caller gave up OR the peer died OR the
//! component is draining" is expressed at every suspension point.

use std::future::Future;

use futures::future::{pending, select_all};
use tokio_util::sync::CancellationToken;

use crate::error::Interrupted;

/// Fires when any of its signals fires.
#[derive(Debug, Clone, Default)]
pub struct Interruptor {
    signals: Vec<CancellationToken>,
}

impl Interruptor {
    /// An interruptor that never fires.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            signals: Vec::new(),
        }
    }

    /// An interruptor driven by a single signal.
    #[must_use]
    pub fn new(signal: CancellationToken) -> Self {
        Self {
            signals: vec![signal],
        }
    }

    /// Adds a signal.
    #[must_use]
    pub fn with(mut self, signal: CancellationToken) -> Self {
        self.signals.push(signal);
        self
    }

    /// Returns an interruptor firing when either `self` or `other` fires.
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        let mut signals = self.signals.clone();
        signals.extend(other.signals.iter().cloned());
        Self { signals }
    }

    /// Returns true if any signal has fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.signals.iter().any(CancellationToken::is_cancelled)
    }

    /// Resolves once the first signal fires. Never resolves for `never()`.
    pub async fn fired(&self) {
        if self.signals.is_empty() {
            pending::<()>().await;
        }
        let waits = self.signals.iter().map(|s| Box::pin(s.cancelled()));
        let _ = select_all(waits).await;
    }

    /// Runs `fut` until it completes or the interruptor fires.
    ///
    /// If both are ready at once the interruptor wins, so an interrupted
    /// caller never observes a completed effect.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if a signal fired first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        if self.is_fired() {
            return Err(Interrupted);
        }
        tokio::select! {
            biased;
            () = self.fired() => Err(Interrupted),
            out = fut => Ok(out),
        }
    }

    /// Sleeps for `duration` unless interrupted first.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if a signal fired before the timer.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }
}

impl From<CancellationToken> for Interruptor {
    fn from(signal: CancellationToken) -> Self {
        Self::new(signal)
    }
}
