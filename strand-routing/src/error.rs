//! Error types for access handles and dispatch.

use strand_core::Region;
use strand_flow::{FlowError, Interrupted};

/// What is known about a failed operation's effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryState {
    /// The operation provably did not take effect. Safe to retry.
    Failed,
    /// The operation may or may not have taken effect.
    Indeterminate,
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

/// Errors from a single request to one replica.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// The caller's interruptor fired.
    #[error("interrupted")]
    Interrupted,

    /// The connection to the replica died before a reply arrived.
    #[error("lost contact with replica")]
    ResourceLost,

    /// The replica rejected the request.
    #[error("replica rejected request ({state}): {reason}")]
    QueryFailed {
        /// Reason given by the replica.
        reason: String,
        /// Whether the replica applied any part of it.
        state: QueryState,
    },
}

impl From<Interrupted> for AccessError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

impl From<FlowError> for AccessError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Interrupted => Self::Interrupted,
            FlowError::Closed | FlowError::Draining => Self::ResourceLost,
            FlowError::ForeignToken { .. } => Self::QueryFailed {
                reason: err.to_string(),
                state: QueryState::Failed,
            },
        }
    }
}

/// Errors from a dispatched query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The caller's interruptor fired.
    #[error("interrupted")]
    Interrupted,

    /// At least one shard failed.
    #[error("cannot perform query ({state}): {reason}")]
    CannotPerformQuery {
        /// Description of the first failure of the reported kind.
        reason: String,
        /// Aggregated effect across shards.
        state: QueryState,
    },

    /// No primary is known for part of the query.
    #[error("no primary replica for region {region}")]
    NoPrimaryForRegion {
        /// Region with no primary.
        region: Region,
    },

    /// More than one primary claims part of the query.
    #[error("{count} primaries claim region {region}")]
    AmbiguousPrimaryForRegion {
        /// Region with competing primaries.
        region: Region,
        /// Number of primaries found.
        count: usize,
    },

    /// No replica can serve an outdated read for part of the query.
    #[error("no replica for region {region}")]
    NoReplicaForRegion {
        /// Region with no replica.
        region: Region,
    },

    /// The primaries do not partition the key space.
    #[error("sharding scheme unavailable: {reason}")]
    SchemeUnavailable {
        /// Why no scheme could be derived.
        reason: String,
    },
}

impl QueryError {
    /// Returns what is known about the operation's effect.
    ///
    /// Routing failures are detected before anything is sent, so they are
    /// always `Failed`. An interrupted query may have reached some shards.
    #[must_use]
    pub const fn state(&self) -> QueryState {
        match self {
            Self::Interrupted => QueryState::Indeterminate,
            Self::CannotPerformQuery { state, .. } => *state,
            Self::NoPrimaryForRegion { .. }
            | Self::AmbiguousPrimaryForRegion { .. }
            | Self::NoReplicaForRegion { .. }
            | Self::SchemeUnavailable { .. } => QueryState::Failed,
        }
    }

    /// Returns true if the operation may have taken effect.
    #[must_use]
    pub const fn is_indeterminate(&self) -> bool {
        matches!(self.state(), QueryState::Indeterminate)
    }
}

impl From<Interrupted> for QueryError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Result type for dispatched queries.
pub type QueryResult<T> = Result<T, QueryError>;
