//! FIFO ordering tokens.
//!
//! A [`FifoSource`] issues tokens carrying a monotonically increasing sequence
//! number. Its [`FifoSink`] admits token holders strictly in issuance order,
//! even when they arrive concurrently and out of order. Reads and writes share
//! one sequence, so submission order equals issuance order for both.
//!
//! A holder is admitted when every earlier sequence number has either exited
//! (via [`FifoExit::end`] or by dropping the exit guard) or been abandoned.
//! A token is abandoned when it is dropped without entering the sink, or when
//! its holder is interrupted while waiting. Abandonment keeps a caller that
//! gave up from stalling everyone queued behind it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{FlowError, FlowResult};
use crate::interruptor::Interruptor;

/// Source IDs only need to be unique within the process.
static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Admission state of a sink.
#[derive(Debug, Default)]
struct SinkState {
    /// Sequence number allowed to enter next.
    next: u64,
    /// Sequence numbers that will never enter.
    abandoned: BTreeSet<u64>,
}

impl SinkState {
    /// Skips over abandoned sequence numbers at the head.
    fn settle(&mut self) {
        while self.abandoned.remove(&self.next) {
            self.next += 1;
        }
    }
}

struct Shared {
    source_id: u64,
    issued: AtomicU64,
    state: watch::Sender<SinkState>,
}

impl Shared {
    fn abandon(&self, sequence: u64) {
        self.state.send_modify(|state| {
            state.abandoned.insert(sequence);
            state.settle();
        });
    }

    fn exit(&self, sequence: u64) {
        self.state.send_modify(|state| {
            debug_assert_eq!(state.next, sequence, "exit out of order");
            state.next += 1;
            state.settle();
        });
    }
}

/// Issues ordering tokens.
pub struct FifoSource {
    shared: Arc<Shared>,
}

impl FifoSource {
    /// Creates a new source with an empty sink.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(SinkState::default());
        Self {
            shared: Arc::new(Shared {
                source_id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
                issued: AtomicU64::new(0),
                state,
            }),
        }
    }

    /// Returns the sink admitting this source's tokens.
    #[must_use]
    pub fn sink(&self) -> FifoSink {
        FifoSink {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Issues a token for a read.
    pub fn new_read_token(&self) -> ReadToken {
        ReadToken(self.issue())
    }

    /// Issues a token for a write.
    pub fn new_write_token(&self) -> WriteToken {
        WriteToken(self.issue())
    }

    /// Returns the number of tokens issued so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.shared.issued.load(Ordering::Acquire)
    }

    /// Returns the identifier stamped into this source's tokens.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.source_id
    }

    fn issue(&self) -> OrderToken {
        let sequence = self.shared.issued.fetch_add(1, Ordering::AcqRel);
        OrderToken {
            shared: Arc::clone(&self.shared),
            sequence,
            consumed: false,
        }
    }
}

impl Default for FifoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FifoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoSource")
            .field("source_id", &self.shared.source_id)
            .field("issued", &self.issued())
            .finish()
    }
}

/// A position in a source's issuance order.
///
/// Dropping a token that never entered its sink abandons its position.
#[must_use = "dropping an ordering token abandons its position"]
pub struct OrderToken {
    shared: Arc<Shared>,
    sequence: u64,
    consumed: bool,
}

impl OrderToken {
    /// Returns the token's sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the identifier of the issuing source.
    #[must_use]
    pub fn source_id(&self) -> u64 {
        self.shared.source_id
    }
}

impl Drop for OrderToken {
    fn drop(&mut self) {
        if !self.consumed {
            self.shared.abandon(self.sequence);
        }
    }
}

impl fmt::Debug for OrderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderToken({}:{})", self.shared.source_id, self.sequence)
    }
}

/// An ordering token for a read.
#[derive(Debug)]
#[must_use = "dropping an ordering token abandons its position"]
pub struct ReadToken(OrderToken);

/// An ordering token for a write.
#[derive(Debug)]
#[must_use = "dropping an ordering token abandons its position"]
pub struct WriteToken(OrderToken);

impl ReadToken {
    /// Returns the token's sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.0.sequence
    }
}

impl WriteToken {
    /// Returns the token's sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.0.sequence
    }
}

impl From<ReadToken> for OrderToken {
    fn from(token: ReadToken) -> Self {
        token.0
    }
}

impl From<WriteToken> for OrderToken {
    fn from(token: WriteToken) -> Self {
        token.0
    }
}

/// Admits token holders in issuance order.
#[derive(Clone)]
pub struct FifoSink {
    shared: Arc<Shared>,
}

impl FifoSink {
    /// Waits until `token` is next in line, then admits it.
    ///
    /// The returned guard must be ended (or dropped) promptly after the
    /// admitted work has been handed off; later tokens wait until then.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::Interrupted` if the interruptor fires first (the
    /// token's position is abandoned), or `FlowError::ForeignToken` if the
    /// token was issued by another source.
    pub async fn enter(
        &self,
        token: impl Into<OrderToken>,
        interruptor: &Interruptor,
    ) -> FlowResult<FifoExit> {
        let mut token = token.into();
        if !Arc::ptr_eq(&token.shared, &self.shared) {
            return Err(FlowError::ForeignToken {
                token_source: token.shared.source_id,
                sink_source: self.shared.source_id,
            });
        }

        let sequence = token.sequence;
        let mut rx = self.shared.state.subscribe();
        let admitted = interruptor
            .run(async move { rx.wait_for(|state| state.next == sequence).await.is_ok() })
            .await?;
        if !admitted {
            // The sender lives in `shared`, which we hold.
            return Err(FlowError::Closed);
        }

        token.consumed = true;
        Ok(FifoExit {
            shared: Arc::clone(&self.shared),
            sequence,
            exited: false,
        })
    }

    /// Returns the sequence number that will be admitted next.
    #[must_use]
    pub fn next_admitted(&self) -> u64 {
        self.shared.state.borrow().next
    }
}

impl fmt::Debug for FifoSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoSink")
            .field("source_id", &self.shared.source_id)
            .field("next", &self.next_admitted())
            .finish()
    }
}

/// Held by an admitted token holder; ending it admits the next token.
#[must_use = "the next token is admitted when this guard ends"]
pub struct FifoExit {
    shared: Arc<Shared>,
    sequence: u64,
    exited: bool,
}

impl FifoExit {
    /// Returns the admitted sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Releases the sink to the next token.
    pub fn end(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.exited {
            self.exited = true;
            self.shared.exit(self.sequence);
        }
    }
}

impl Drop for FifoExit {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for FifoExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FifoExit({}:{})", self.shared.source_id, self.sequence)
    }
}
