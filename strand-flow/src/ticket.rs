//! Admission tickets.
//!
//! A ticket pool is a credit counter bounding how many requests a client may
//! have outstanding against one primary. The primary grants credit; each
//! request consumes one ticket and returns it when its reply arrives. When the
//! pool is empty, acquirers queue and are served strictly in arrival order.
//!
//! The primary may also reclaim credit to shed load. Reclaimed credit is taken
//! from the available balance first; the remainder becomes a debt paid off by
//! tickets as they come back. Every unit of credit actually handed back is
//! reported on the relinquish channel.
//!
//! A pool created with [`TicketPool::unbounded`] never blocks: admission
//! control is structurally present but numerically unlimited.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{FlowError, FlowResult};
use crate::interruptor::Interruptor;

/// Available credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Credit {
    Unbounded,
    Limited(u64),
}

#[derive(Debug)]
struct PoolState {
    credit: Credit,
    /// Credit owed back to the primary.
    debt: u64,
    /// Tickets currently held by callers.
    outstanding: u64,
    /// Queued acquirers, oldest first.
    waiters: VecDeque<oneshot::Sender<()>>,
    /// Where relinquished credit is reported.
    relinquish: Option<mpsc::UnboundedSender<u64>>,
    closed: bool,
}

impl PoolState {
    fn try_take(&mut self) -> bool {
        match &mut self.credit {
            Credit::Unbounded => true,
            Credit::Limited(0) => false,
            Credit::Limited(n) => {
                *n -= 1;
                true
            }
        }
    }

    fn put_back(&mut self, count: u64) {
        if let Credit::Limited(n) = &mut self.credit {
            *n = n.saturating_add(count);
        }
    }

    /// Hands available credit to queued acquirers, oldest first.
    fn dispatch(&mut self) {
        while !self.waiters.is_empty() && self.try_take() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.send(()).is_ok() {
                self.outstanding += 1;
            } else {
                // The acquirer gave up; keep the credit for the next one.
                self.put_back(1);
            }
        }
    }

    fn report_relinquished(&self, count: u64) {
        if count == 0 {
            return;
        }
        if let Some(tx) = &self.relinquish {
            let _ = tx.send(count);
        }
    }
}

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketPoolStats {
    /// Tickets immediately available, `None` if unbounded.
    pub available: Option<u64>,
    /// Tickets held by callers.
    pub outstanding: u64,
    /// Acquirers waiting for a ticket.
    pub waiting: usize,
    /// Credit still owed to the primary.
    pub debt: u64,
}

/// A credit-counted concurrency limiter with a FIFO wait queue.
#[derive(Clone)]
pub struct TicketPool {
    state: Arc<Mutex<PoolState>>,
}

impl TicketPool {
    /// Creates a pool holding `credit` tickets.
    #[must_use]
    pub fn with_credit(credit: u64) -> Self {
        Self::from_credit(Credit::Limited(credit))
    }

    /// Creates a pool that never runs out of tickets.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::from_credit(Credit::Unbounded)
    }

    fn from_credit(credit: Credit) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                credit,
                debt: 0,
                outstanding: 0,
                waiters: VecDeque::new(),
                relinquish: None,
                closed: false,
            })),
        }
    }

    /// Sets the channel on which relinquished credit is reported.
    #[must_use]
    pub fn with_relinquish(self, tx: mpsc::UnboundedSender<u64>) -> Self {
        self.lock().relinquish = Some(tx);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("ticket pool lock poisoned")
    }

    /// Takes one ticket, waiting in line if none is available.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::Interrupted` if the interruptor fires while
    /// waiting, or `FlowError::Closed` if the pool is closed.
    pub async fn acquire(&self, interruptor: &Interruptor) -> FlowResult<Ticket> {
        let mut rx = {
            let mut state = self.lock();
            if state.closed {
                return Err(FlowError::Closed);
            }
            if state.waiters.is_empty() && state.try_take() {
                state.outstanding += 1;
                return Ok(self.ticket());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        match interruptor.run(&mut rx).await {
            Ok(Ok(())) => Ok(self.ticket()),
            Ok(Err(_)) => Err(FlowError::Closed),
            Err(interrupted) => {
                // A grant may have raced with the interruption.
                rx.close();
                if rx.try_recv().is_ok() {
                    self.release();
                }
                Err(interrupted.into())
            }
        }
    }

    /// Takes a ticket only if one is available and nobody is waiting.
    #[must_use]
    pub fn try_acquire(&self) -> Option<Ticket> {
        let mut state = self.lock();
        if state.closed || !state.waiters.is_empty() || !state.try_take() {
            return None;
        }
        state.outstanding += 1;
        drop(state);
        Some(self.ticket())
    }

    /// Adds credit granted by the primary.
    pub fn grant(&self, count: u64) {
        let mut state = self.lock();
        if state.credit == Credit::Unbounded {
            return;
        }
        let paid = count.min(state.debt);
        state.debt -= paid;
        state.report_relinquished(paid);
        state.put_back(count - paid);
        state.dispatch();
    }

    /// Removes credit at the primary's request.
    ///
    /// Available credit is relinquished immediately; the remainder is owed
    /// and paid off as outstanding tickets return.
    pub fn reclaim(&self, count: u64) {
        let mut state = self.lock();
        let Credit::Limited(available) = state.credit else {
            debug!(count, "Ignoring reclaim on unbounded ticket pool");
            return;
        };
        let taken = count.min(available);
        state.credit = Credit::Limited(available - taken);
        state.debt += count - taken;
        state.report_relinquished(taken);
        debug!(count, taken, debt = state.debt, "Reclaimed tickets");
    }

    /// Closes the pool, failing queued and future acquirers.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.waiters.clear();
    }

    /// Returns a snapshot of the pool's counters.
    #[must_use]
    pub fn stats(&self) -> TicketPoolStats {
        let state = self.lock();
        TicketPoolStats {
            available: match state.credit {
                Credit::Unbounded => None,
                Credit::Limited(n) => Some(n),
            },
            outstanding: state.outstanding,
            waiting: state.waiters.len(),
            debt: state.debt,
        }
    }

    fn ticket(&self) -> Ticket {
        Ticket { pool: self.clone() }
    }

    fn release(&self) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.debt > 0 {
            state.debt -= 1;
            state.report_relinquished(1);
        } else {
            state.put_back(1);
            state.dispatch();
        }
    }
}

impl fmt::Debug for TicketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketPool").field("stats", &self.stats()).finish()
    }
}

/// One unit of admission credit. Returned to the pool on drop.
#[must_use = "dropping a ticket returns it immediately"]
pub struct Ticket {
    pool: TicketPool,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.pool.release();
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ticket")
    }
}
