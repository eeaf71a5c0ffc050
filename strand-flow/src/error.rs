//! Flow primitive error types.

/// The caller's interruptor fired before the operation completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation interrupted")]
pub struct Interrupted;

/// Flow primitive error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// The interruptor fired while waiting.
    #[error("operation interrupted")]
    Interrupted,

    /// An ordering token was presented to a sink it was not issued for.
    #[error("token from source {token_source} presented to sink of source {sink_source}")]
    ForeignToken {
        /// Source that issued the token.
        token_source: u64,
        /// Source the sink belongs to.
        sink_source: u64,
    },

    /// The ticket pool was closed.
    #[error("ticket pool closed")]
    Closed,

    /// The drain lock is draining and no longer hands out tokens.
    #[error("draining in progress")]
    Draining,
}

impl From<Interrupted> for FlowError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Result type for flow primitives.
pub type FlowResult<T> = Result<T, FlowError>;
