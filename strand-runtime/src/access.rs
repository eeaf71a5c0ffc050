//! Access handles for remote replicas.
//!
//! [`MasterAccess`] is one client's ordered, throttled channel to one
//! primary. A request goes through three gates before it is sent:
//!
//! 1. the FIFO sink admits its ordering token (submission order),
//! 2. the ticket pool hands out one admission ticket (backpressure),
//! 3. the request is pushed to the primary's mailbox and the sink released.
//!
//! The sink is released as soon as the request is handed off, so ordering
//! fixes submission order without serializing round trips. The ticket is held
//! until the reply arrives.
//!
//! [`ReplicaAccess`] is the unordered outdated-read channel to any replica.

use std::fmt;

use async_trait::async_trait;
use strand_core::{ClientId, PeerId};
use strand_flow::{
    CancellationToken, FifoSink, FifoSource, FlowError, Interrupted, Interruptor, OrderToken,
    ReadToken, TicketPool, TicketPoolStats, WriteToken,
};
use strand_routing::{
    AccessError, PrimaryAccess, ReadQuery, ReadResponse, StaleReadAccess, WriteQuery,
    WriteResponse,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::AccessConfig;
use crate::contract::{
    AdmissionRegistration, PrimaryCard, PrimaryRequest, Reply, StaleReadCard, StaleReadRequest,
    TicketGrant,
};
use crate::error::{ConnectError, ConnectResult};

/// Ordered, throttled channel to one primary.
pub struct MasterAccess {
    client: ClientId,
    peer: PeerId,
    requests: mpsc::UnboundedSender<PrimaryRequest>,
    source: FifoSource,
    sink: FifoSink,
    tickets: TicketPool,
    /// Fires when the connection to the primary drops.
    lost: CancellationToken,
    /// Stops the admission loop when this handle is dropped.
    stop: CancellationToken,
}

impl MasterAccess {
    /// Registers with the primary's admission control.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError::ConnectionLost` if the primary goes away before
    /// granting its initial credit, `ConnectError::HandshakeTimeout` if it
    /// does not answer in time, or `ConnectError::Interrupted` if the
    /// interruptor fires.
    pub async fn connect(
        client: ClientId,
        peer: PeerId,
        card: &PrimaryCard,
        lost: CancellationToken,
        config: &AccessConfig,
        interruptor: &Interruptor,
    ) -> ConnectResult<Self> {
        if lost.is_cancelled() {
            return Err(ConnectError::ConnectionLost);
        }

        let (give_tx, mut give_rx) = mpsc::unbounded_channel();
        let (reclaim_tx, reclaim_rx) = mpsc::unbounded_channel();
        let (relinquish_tx, relinquish_rx) = mpsc::unbounded_channel();
        card.admission
            .send(AdmissionRegistration {
                client,
                give_tickets: give_tx,
                reclaim_tickets: reclaim_tx,
                relinquish: relinquish_rx,
            })
            .map_err(|_| ConnectError::ConnectionLost)?;

        let handshake = interruptor.clone().with(lost.clone());
        let timeout = config.handshake_timeout;
        let initial = match handshake
            .run(tokio::time::timeout(timeout, give_rx.recv()))
            .await
        {
            Ok(Ok(Some(grant))) => grant,
            Ok(Ok(None)) => return Err(ConnectError::ConnectionLost),
            Ok(Err(_elapsed)) => return Err(ConnectError::HandshakeTimeout { timeout }),
            Err(Interrupted) if interruptor.is_fired() => return Err(ConnectError::Interrupted),
            Err(Interrupted) => return Err(ConnectError::ConnectionLost),
        };

        let tickets = match initial {
            TicketGrant::Unlimited => TicketPool::unbounded(),
            TicketGrant::Tickets(n) => TicketPool::with_credit(n),
        }
        .with_relinquish(relinquish_tx);

        let stop = CancellationToken::new();
        tokio::spawn(admission_loop(
            peer,
            tickets.clone(),
            give_rx,
            reclaim_rx,
            lost.clone(),
            stop.clone(),
        ));

        info!(client = %client, peer = %peer, grant = ?initial, "Registered with primary");
        let source = FifoSource::new();
        let sink = source.sink();
        Ok(Self {
            client,
            peer,
            requests: card.requests.clone(),
            source,
            sink,
            tickets,
            lost,
            stop,
        })
    }

    /// Returns the client id this handle registered as.
    #[must_use]
    pub const fn client(&self) -> ClientId {
        self.client
    }

    /// Returns the connection this handle runs over.
    #[must_use]
    pub const fn peer(&self) -> PeerId {
        self.peer
    }

    /// Returns true once the connection to the primary has dropped.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Returns the admission ticket counters.
    #[must_use]
    pub fn ticket_stats(&self) -> TicketPoolStats {
        self.tickets.stats()
    }

    async fn submit<R: Send + 'static>(
        &self,
        token: impl Into<OrderToken> + Send,
        interruptor: &Interruptor,
        build: impl FnOnce(u64, oneshot::Sender<Reply<R>>) -> PrimaryRequest + Send,
    ) -> Result<R, AccessError> {
        let guarded = interruptor.clone().with(self.lost.clone());

        let exit = self
            .sink
            .enter(token, &guarded)
            .await
            .map_err(|err| classify(err, interruptor))?;
        let ticket = self
            .tickets
            .acquire(&guarded)
            .await
            .map_err(|err| classify(err, interruptor))?;

        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.requests
            .send(build(exit.sequence(), reply_tx))
            .map_err(|_| AccessError::ResourceLost)?;
        exit.end();

        let outcome = guarded.run(&mut reply_rx).await;
        match outcome {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(rejection))) => Err(AccessError::QueryFailed {
                reason: rejection.reason,
                state: rejection.state,
            }),
            Ok(Err(_)) => Err(AccessError::ResourceLost),
            Err(Interrupted) => {
                // Still in flight; the ticket stays taken until it settles.
                let lost = self.lost.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = reply_rx => {}
                        () = lost.cancelled() => {}
                    }
                    drop(ticket);
                });
                if interruptor.is_fired() {
                    Err(AccessError::Interrupted)
                } else {
                    Err(AccessError::ResourceLost)
                }
            }
        }
    }
}

/// Maps a flow failure to what the caller should see.
///
/// An interruption the caller did not ask for came from the lost signal.
fn classify(err: FlowError, interruptor: &Interruptor) -> AccessError {
    match err {
        FlowError::Interrupted if interruptor.is_fired() => AccessError::Interrupted,
        FlowError::Interrupted => AccessError::ResourceLost,
        other => other.into(),
    }
}

/// Applies grants and reclaims from the primary until the handle goes away.
async fn admission_loop(
    peer: PeerId,
    tickets: TicketPool,
    mut give_rx: mpsc::UnboundedReceiver<TicketGrant>,
    mut reclaim_rx: mpsc::UnboundedReceiver<u64>,
    lost: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = lost.cancelled() => break,
            grant = give_rx.recv() => match grant {
                Some(TicketGrant::Tickets(count)) => tickets.grant(count),
                Some(TicketGrant::Unlimited) => {
                    debug!(peer = %peer, "Ignoring unlimited grant after handshake");
                }
                None => break,
            },
            reclaim = reclaim_rx.recv() => match reclaim {
                Some(count) => tickets.reclaim(count),
                None => break,
            },
        }
    }
    tickets.close();
    debug!(peer = %peer, "Admission loop stopped");
}

#[async_trait]
impl PrimaryAccess for MasterAccess {
    fn new_read_token(&self) -> ReadToken {
        self.source.new_read_token()
    }

    fn new_write_token(&self) -> WriteToken {
        self.source.new_write_token()
    }

    async fn read(
        &self,
        query: ReadQuery,
        token: ReadToken,
        interruptor: &Interruptor,
    ) -> Result<ReadResponse, AccessError> {
        let client = self.client;
        self.submit(token, interruptor, move |sequence, reply| PrimaryRequest::Read {
            query,
            client,
            sequence,
            reply,
        })
        .await
    }

    async fn write(
        &self,
        query: WriteQuery,
        token: WriteToken,
        interruptor: &Interruptor,
    ) -> Result<WriteResponse, AccessError> {
        let client = self.client;
        self.submit(token, interruptor, move |sequence, reply| PrimaryRequest::Write {
            query,
            client,
            sequence,
            reply,
        })
        .await
    }
}

impl Drop for MasterAccess {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl fmt::Debug for MasterAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterAccess")
            .field("client", &self.client)
            .field("peer", &self.peer)
            .field("issued", &self.source.issued())
            .field("tickets", &self.tickets.stats())
            .finish()
    }
}

/// Outdated-read channel to one replica.
pub struct ReplicaAccess {
    peer: PeerId,
    requests: mpsc::UnboundedSender<StaleReadRequest>,
    lost: CancellationToken,
}

impl ReplicaAccess {
    /// Creates a handle to the replica behind `card`.
    #[must_use]
    pub fn new(peer: PeerId, card: &StaleReadCard, lost: CancellationToken) -> Self {
        Self {
            peer,
            requests: card.requests.clone(),
            lost,
        }
    }

    /// Returns the connection this handle runs over.
    #[must_use]
    pub const fn peer(&self) -> PeerId {
        self.peer
    }
}

#[async_trait]
impl StaleReadAccess for ReplicaAccess {
    async fn read_outdated(
        &self,
        query: ReadQuery,
        interruptor: &Interruptor,
    ) -> Result<ReadResponse, AccessError> {
        let guarded = interruptor.clone().with(self.lost.clone());
        if guarded.is_fired() {
            return Err(classify(FlowError::Interrupted, interruptor));
        }

        let (reply, rx) = oneshot::channel();
        self.requests
            .send(StaleReadRequest { query, reply })
            .map_err(|_| AccessError::ResourceLost)?;

        match guarded.run(rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(rejection))) => Err(AccessError::QueryFailed {
                reason: rejection.reason,
                state: rejection.state,
            }),
            Ok(Err(_)) => Err(AccessError::ResourceLost),
            Err(Interrupted) => Err(classify(FlowError::Interrupted, interruptor)),
        }
    }
}

impl fmt::Debug for ReplicaAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaAccess")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use strand_core::Region;
    use strand_routing::QueryState;

    use super::*;
    use crate::contract::Rejection;

    /// A primary that answers every request immediately, logging sequences.
    struct FakePrimary {
        card: PrimaryCard,
        log: Arc<Mutex<Vec<u64>>>,
    }

    fn spawn_primary(grant: Option<TicketGrant>, reject: bool) -> FakePrimary {
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel::<PrimaryRequest>();
        let (admission_tx, mut admission_rx) = mpsc::unbounded_channel::<AdmissionRegistration>();
        let log = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(async move {
            let mut registrations = Vec::new();
            while let Some(registration) = admission_rx.recv().await {
                if let Some(grant) = grant {
                    registration.give_tickets.send(grant).unwrap();
                }
                registrations.push(registration);
            }
        });

        let served = Arc::clone(&log);
        tokio::spawn(async move {
            while let Some(request) = requests_rx.recv().await {
                served.lock().unwrap().push(request.sequence());
                let rejection = Rejection {
                    reason: "read-only".to_string(),
                    state: QueryState::Failed,
                };
                match request {
                    PrimaryRequest::Read { reply, .. } => {
                        let _ = reply.send(Ok(ReadResponse::Count { count: 0 }));
                    }
                    PrimaryRequest::Write { query, reply, .. } => {
                        let response = if reject {
                            Err(rejection)
                        } else {
                            let written = match query {
                                WriteQuery::Set { pairs } => pairs.len() as u64,
                                WriteQuery::Delete { .. } => 0,
                            };
                            Ok(WriteResponse::Set { written })
                        };
                        let _ = reply.send(response);
                    }
                }
            }
        });

        FakePrimary {
            card: PrimaryCard {
                requests: requests_tx,
                admission: admission_tx,
            },
            log,
        }
    }

    async fn connect(primary: &FakePrimary, lost: CancellationToken) -> ConnectResult<MasterAccess> {
        MasterAccess::connect(
            ClientId::new(1),
            PeerId::new(1),
            &primary.card,
            lost,
            &AccessConfig::fast_for_testing(),
            &Interruptor::never(),
        )
        .await
    }

    #[tokio::test]
    async fn test_read_and_write() {
        let primary = spawn_primary(Some(TicketGrant::Unlimited), false);
        let access = connect(&primary, CancellationToken::new()).await.unwrap();
        assert_eq!(access.ticket_stats().available, None);

        let token = access.new_read_token();
        let read = access
            .read(ReadQuery::count(Region::universe()), token, &Interruptor::never())
            .await;
        assert_eq!(read, Ok(ReadResponse::Count { count: 0 }));

        let token = access.new_write_token();
        let write = access
            .write(WriteQuery::set("k", "v"), token, &Interruptor::never())
            .await;
        assert_eq!(write, Ok(WriteResponse::Set { written: 1 }));
        assert_eq!(*primary.log.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_rejection_is_query_failed() {
        let primary = spawn_primary(Some(TicketGrant::Tickets(4)), true);
        let access = connect(&primary, CancellationToken::new()).await.unwrap();

        let token = access.new_write_token();
        let err = access
            .write(WriteQuery::set("k", "v"), token, &Interruptor::never())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AccessError::QueryFailed {
                reason: "read-only".to_string(),
                state: QueryState::Failed,
            }
        );
        // The ticket came back with the reply.
        assert_eq!(access.ticket_stats().available, Some(4));
    }

    #[tokio::test]
    async fn test_connect_to_gone_primary() {
        let primary = spawn_primary(Some(TicketGrant::Unlimited), false);
        let lost = CancellationToken::new();
        lost.cancel();
        assert_eq!(
            connect(&primary, lost).await.map(drop),
            Err(ConnectError::ConnectionLost)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let primary = spawn_primary(None, false);
        assert!(matches!(
            connect(&primary, CancellationToken::new()).await,
            Err(ConnectError::HandshakeTimeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_during_handshake() {
        let primary = spawn_primary(None, false);
        let lost = CancellationToken::new();
        let trigger = lost.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        assert_eq!(
            connect(&primary, lost).await.map(drop),
            Err(ConnectError::ConnectionLost)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_mid_request() {
        // A primary that registers clients but never answers requests.
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel::<PrimaryRequest>();
        let (admission_tx, mut admission_rx) = mpsc::unbounded_channel::<AdmissionRegistration>();
        tokio::spawn(async move {
            let registration = admission_rx.recv().await.unwrap();
            registration.give_tickets.send(TicketGrant::Unlimited).unwrap();
            let mut held = Vec::new();
            while let Some(request) = requests_rx.recv().await {
                held.push(request);
            }
            drop(registration);
        });
        let card = PrimaryCard {
            requests: requests_tx,
            admission: admission_tx,
        };

        let lost = CancellationToken::new();
        let access = Arc::new(
            MasterAccess::connect(
                ClientId::new(1),
                PeerId::new(1),
                &card,
                lost.clone(),
                &AccessConfig::fast_for_testing(),
                &Interruptor::never(),
            )
            .await
            .unwrap(),
        );

        let pending = {
            let access = Arc::clone(&access);
            tokio::spawn(async move {
                let token = access.new_write_token();
                access
                    .write(WriteQuery::set("k", "v"), token, &Interruptor::never())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        lost.cancel();

        assert_eq!(pending.await.unwrap(), Err(AccessError::ResourceLost));
        assert!(access.is_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_follows_token_order() {
        let primary = spawn_primary(Some(TicketGrant::Tickets(3)), false);
        let access = Arc::new(connect(&primary, CancellationToken::new()).await.unwrap());

        let tokens: Vec<WriteToken> = (0..10).map(|_| access.new_write_token()).collect();
        let mut handles = Vec::new();
        for token in tokens.into_iter().rev() {
            let access = Arc::clone(&access);
            handles.push(tokio::spawn(async move {
                access
                    .write(WriteQuery::set("k", "v"), token, &Interruptor::never())
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*primary.log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }
}
