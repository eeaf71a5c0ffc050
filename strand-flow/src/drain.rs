//! Drain locks.
//!
//! Every task working on behalf of a component holds a [`DrainToken`]. When
//! the component is torn down, [`DrainLock::drain`] fires the draining signal
//! (which in-flight tasks observe through their interruptors), stops handing
//! out new tokens, and waits until every outstanding token has been dropped.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{FlowError, FlowResult};

/// Tracks in-flight work so teardown can wait for it.
pub struct DrainLock {
    draining: CancellationToken,
    drained: CancellationToken,
    keepalive: Mutex<Option<mpsc::Sender<()>>>,
    waiter: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl DrainLock {
    /// Creates an idle drain lock.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            draining: CancellationToken::new(),
            drained: CancellationToken::new(),
            keepalive: Mutex::new(Some(tx)),
            waiter: tokio::sync::Mutex::new(Some(rx)),
        }
    }

    /// Hands out a keep-alive token.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::Draining` once draining has begun.
    pub fn lock(&self) -> FlowResult<DrainToken> {
        let keepalive = self.keepalive.lock().expect("drain lock poisoned");
        match keepalive.as_ref() {
            Some(tx) if !self.draining.is_cancelled() => Ok(DrainToken {
                _keepalive: tx.clone(),
                draining: self.draining.clone(),
            }),
            _ => Err(FlowError::Draining),
        }
    }

    /// Returns the signal fired when draining begins.
    #[must_use]
    pub fn draining_signal(&self) -> CancellationToken {
        self.draining.clone()
    }

    /// Returns true once draining has begun.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    /// Returns true once every token has been dropped after draining began.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.drained.is_cancelled()
    }

    /// Begins draining and waits for all outstanding tokens to drop.
    ///
    /// Safe to call more than once and from several tasks; every caller
    /// returns once draining is complete.
    pub async fn drain(&self) {
        self.draining.cancel();
        drop(self.keepalive.lock().expect("drain lock poisoned").take());

        let mut waiter = self.waiter.lock().await;
        if let Some(mut rx) = waiter.take() {
            // Resolves to None once the last sender is gone.
            while rx.recv().await.is_some() {}
            self.drained.cancel();
        }
        drop(waiter);
        self.drained.cancelled().await;
    }
}

impl Default for DrainLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DrainLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainLock")
            .field("draining", &self.is_draining())
            .field("drained", &self.is_drained())
            .finish()
    }
}

/// Keeps its drain lock from completing a drain while held.
#[derive(Clone)]
pub struct DrainToken {
    _keepalive: mpsc::Sender<()>,
    draining: CancellationToken,
}

impl DrainToken {
    /// Returns the signal fired when the owning lock starts draining.
    #[must_use]
    pub fn draining_signal(&self) -> CancellationToken {
        self.draining.clone()
    }
}

impl fmt::Debug for DrainToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainToken")
            .field("draining", &self.draining.is_cancelled())
            .finish()
    }
}
