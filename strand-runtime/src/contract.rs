//! Replica-facing contract.
//!
//! A replica advertises its endpoints as business cards: mailbox senders a
//! client uses to reach it. Every request carries a single-shot reply channel,
//! answered at most once. A dropped reply sender means the replica went away
//! without answering.

use strand_core::ClientId;
use strand_routing::{QueryState, ReadQuery, ReadResponse, WriteQuery, WriteResponse};
use tokio::sync::{mpsc, oneshot};

/// An explicit refusal from a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Why the replica refused.
    pub reason: String,
    /// Whether the replica applied any part of the request.
    pub state: QueryState,
}

/// Reply to a request: a response or a rejection.
pub type Reply<T> = Result<T, Rejection>;

/// A request to a primary.
#[derive(Debug)]
pub enum PrimaryRequest {
    /// A read with primary-level consistency.
    Read {
        /// The read.
        query: ReadQuery,
        /// Client that submitted it.
        client: ClientId,
        /// Ordering sequence number, echoed for order verification.
        sequence: u64,
        /// Channel to send the reply.
        reply: oneshot::Sender<Reply<ReadResponse>>,
    },
    /// A write.
    Write {
        /// The write.
        query: WriteQuery,
        /// Client that submitted it.
        client: ClientId,
        /// Ordering sequence number, echoed for order verification.
        sequence: u64,
        /// Channel to send the reply.
        reply: oneshot::Sender<Reply<WriteResponse>>,
    },
}

impl PrimaryRequest {
    /// Returns the submitting client.
    #[must_use]
    pub const fn client(&self) -> ClientId {
        match self {
            Self::Read { client, .. } | Self::Write { client, .. } => *client,
        }
    }

    /// Returns the ordering sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        match self {
            Self::Read { sequence, .. } | Self::Write { sequence, .. } => *sequence,
        }
    }
}

/// A read that may observe outdated data. Carries no ordering token.
#[derive(Debug)]
pub struct StaleReadRequest {
    /// The read.
    pub query: ReadQuery,
    /// Channel to send the reply.
    pub reply: oneshot::Sender<Reply<ReadResponse>>,
}

/// Credit granted by a primary's admission-control server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketGrant {
    /// Admission is not limited.
    Unlimited,
    /// This many more tickets.
    Tickets(u64),
}

/// Sent by a client to a primary's admission-control server.
///
/// The server answers with an initial [`TicketGrant`] on `give_tickets`, may
/// later grant more or send reclaim requests, and receives the credit the
/// client hands back on `relinquish`.
#[derive(Debug)]
pub struct AdmissionRegistration {
    /// Client registering.
    pub client: ClientId,
    /// Where the server sends credit grants.
    pub give_tickets: mpsc::UnboundedSender<TicketGrant>,
    /// Where the server sends reclaim requests.
    pub reclaim_tickets: mpsc::UnboundedSender<u64>,
    /// Credit handed back by the client.
    pub relinquish: mpsc::UnboundedReceiver<u64>,
}

/// Endpoints of a primary replica.
#[derive(Debug, Clone)]
pub struct PrimaryCard {
    /// Mailbox for reads and writes.
    pub requests: mpsc::UnboundedSender<PrimaryRequest>,
    /// Mailbox for admission-control registrations.
    pub admission: mpsc::UnboundedSender<AdmissionRegistration>,
}

impl PrimaryCard {
    /// Returns true if both cards address the same endpoints.
    #[must_use]
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.requests.same_channel(&other.requests) && self.admission.same_channel(&other.admission)
    }
}

/// Endpoint of a replica accepting outdated reads.
#[derive(Debug, Clone)]
pub struct StaleReadCard {
    /// Mailbox for outdated reads.
    pub requests: mpsc::UnboundedSender<StaleReadRequest>,
}

impl StaleReadCard {
    /// Returns true if both cards address the same endpoint.
    #[must_use]
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.requests.same_channel(&other.requests)
    }
}
