//! Replica access traits.
//!
//! The dispatcher talks to replicas only through these traits. The runtime
//! provides mailbox-backed implementations; tests provide scripted ones.

use async_trait::async_trait;
use strand_flow::{Interruptor, ReadToken, WriteToken};

use crate::error::AccessError;
use crate::query::{ReadQuery, ReadResponse, WriteQuery, WriteResponse};

/// Ordered, throttled access to one primary replica.
///
/// # Implementation Notes
///
/// Requests are submitted to the primary in the order their tokens were
/// issued by this handle. Tokens must come from the same handle they are
/// presented to.
#[async_trait]
pub trait PrimaryAccess: Send + Sync + 'static {
    /// Issues an ordering token for a read.
    fn new_read_token(&self) -> ReadToken;

    /// Issues an ordering token for a write.
    fn new_write_token(&self) -> WriteToken;

    /// Performs a read with primary-level consistency.
    ///
    /// # Errors
    ///
    /// Returns `AccessError::Interrupted` if the interruptor fires,
    /// `AccessError::ResourceLost` if the primary goes away before replying,
    /// or `AccessError::QueryFailed` if the primary rejects the read.
    async fn read(
        &self,
        query: ReadQuery,
        token: ReadToken,
        interruptor: &Interruptor,
    ) -> Result<ReadResponse, AccessError>;

    /// Performs a write.
    ///
    /// # Errors
    ///
    /// Same as [`PrimaryAccess::read`].
    async fn write(
        &self,
        query: WriteQuery,
        token: WriteToken,
        interruptor: &Interruptor,
    ) -> Result<WriteResponse, AccessError>;
}

/// Unordered read access to any replica, primary or secondary.
#[async_trait]
pub trait StaleReadAccess: Send + Sync + 'static {
    /// Performs a read that may observe outdated data.
    ///
    /// # Errors
    ///
    /// Same as [`PrimaryAccess::read`].
    async fn read_outdated(
        &self,
        query: ReadQuery,
        interruptor: &Interruptor,
    ) -> Result<ReadResponse, AccessError>;
}
