//! In-memory replica server.
//!
//! A [`ReplicaServer`] hosts one region of an in-memory store and serves the
//! replica-facing contract: a primary mailbox for ordered reads and writes,
//! an admission-control mailbox, and an outdated-read mailbox.
//!
//! Requests take effect the moment they are received. Replies can be held
//! back with [`ReplicaServer::hold_replies`], which lets tests put a request
//! "in flight" after its effect is applied.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use strand_core::{ClientId, Key, Region};
use strand_routing::{QueryState, ReadQuery, ReadResponse, WriteQuery, WriteResponse};
use strand_runtime::{
    AdmissionRegistration, PrimaryCard, PrimaryRequest, Rejection, Reply, Role, StaleReadCard,
    StaleReadRequest, TicketGrant,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Configuration for one replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Keys the replica serves.
    pub region: Region,
    /// Role of the replica.
    pub role: Role,
    /// Whether the replica accepts outdated reads.
    pub stale_reads: bool,
    /// Credit granted to every client that registers.
    pub initial_grant: TicketGrant,
}

impl ReplicaConfig {
    /// Creates a primary with unlimited admission and outdated reads.
    #[must_use]
    pub const fn primary(region: Region) -> Self {
        Self {
            region,
            role: Role::Primary,
            stale_reads: true,
            initial_grant: TicketGrant::Unlimited,
        }
    }

    /// Creates a secondary serving outdated reads only.
    #[must_use]
    pub const fn secondary(region: Region) -> Self {
        Self {
            region,
            role: Role::Secondary,
            stale_reads: true,
            initial_grant: TicketGrant::Unlimited,
        }
    }

    /// Limits every client to `tickets` outstanding requests.
    #[must_use]
    pub const fn with_tickets(mut self, tickets: u64) -> Self {
        self.initial_grant = TicketGrant::Tickets(tickets);
        self
    }
}

/// A request as the primary received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    /// Submitting client.
    pub client: ClientId,
    /// Ordering sequence number carried by the request.
    pub sequence: u64,
    /// True for writes.
    pub write: bool,
}

struct Session {
    client: ClientId,
    give_tickets: mpsc::UnboundedSender<TicketGrant>,
    reclaim_tickets: mpsc::UnboundedSender<u64>,
}

struct ReplicaInner {
    config: ReplicaConfig,
    store: Mutex<BTreeMap<Key, Bytes>>,
    observed: Mutex<Vec<Observed>>,
    sessions: Mutex<Vec<Session>>,
    relinquished: AtomicU64,
    /// Replies are sent while this is true.
    replies_open: watch::Sender<bool>,
    /// Writes are refused with this state while set.
    refusing: Mutex<Option<QueryState>>,
}

/// An in-memory replica serving one region.
#[derive(Clone)]
pub struct ReplicaServer {
    inner: Arc<ReplicaInner>,
    primary: Option<PrimaryCard>,
    stale_reader: Option<StaleReadCard>,
}

impl ReplicaServer {
    /// Starts serving.
    ///
    /// Must be called from within a tokio runtime. The serving tasks exit
    /// once every clone of the replica's cards is dropped.
    #[must_use]
    pub fn start(config: ReplicaConfig) -> Self {
        let (replies_open, _) = watch::channel(true);
        let inner = Arc::new(ReplicaInner {
            config,
            store: Mutex::new(BTreeMap::new()),
            observed: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            relinquished: AtomicU64::new(0),
            replies_open,
            refusing: Mutex::new(None),
        });

        let primary = (inner.config.role == Role::Primary).then(|| {
            let (requests, requests_rx) = mpsc::unbounded_channel();
            let (admission, admission_rx) = mpsc::unbounded_channel();
            tokio::spawn(serve_primary(Arc::clone(&inner), requests_rx));
            tokio::spawn(serve_admission(Arc::clone(&inner), admission_rx));
            PrimaryCard {
                requests,
                admission,
            }
        });
        let stale_reader = inner.config.stale_reads.then(|| {
            let (requests, requests_rx) = mpsc::unbounded_channel();
            tokio::spawn(serve_stale_reads(Arc::clone(&inner), requests_rx));
            StaleReadCard { requests }
        });

        Self {
            inner,
            primary,
            stale_reader,
        }
    }

    /// Returns the served region.
    #[must_use]
    pub fn region(&self) -> &Region {
        &self.inner.config.region
    }

    /// Returns the replica's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.config.role
    }

    /// Returns the primary endpoints, if this is a primary.
    #[must_use]
    pub const fn primary_card(&self) -> Option<&PrimaryCard> {
        self.primary.as_ref()
    }

    /// Returns the outdated-read endpoint, if offered.
    #[must_use]
    pub const fn stale_read_card(&self) -> Option<&StaleReadCard> {
        self.stale_reader.as_ref()
    }

    /// Holds every reply until [`ReplicaServer::release_replies`].
    pub fn hold_replies(&self) {
        self.inner.replies_open.send_replace(false);
    }

    /// Sends every held reply and stops holding new ones.
    pub fn release_replies(&self) {
        self.inner.replies_open.send_replace(true);
    }

    /// Refuses writes with `state` until called with `None`.
    pub fn refuse_writes(&self, state: Option<QueryState>) {
        *self.inner.refusing.lock().expect("refusal lock poisoned") = state;
    }

    /// Returns every primary request received, in arrival order.
    #[must_use]
    pub fn observed(&self) -> Vec<Observed> {
        self.inner.observed().clone()
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn value(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.store().get(key).cloned()
    }

    /// Returns a copy of the stored data.
    #[must_use]
    pub fn data(&self) -> BTreeMap<Key, Bytes> {
        self.inner.store().clone()
    }

    /// Returns the number of admission registrations received.
    #[must_use]
    pub fn sessions(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Returns the credit clients have handed back.
    #[must_use]
    pub fn relinquished(&self) -> u64 {
        self.inner.relinquished.load(Ordering::Relaxed)
    }

    /// Grants `tickets` more credit to every registered client.
    pub fn grant(&self, tickets: u64) {
        for session in self.inner.sessions().iter() {
            let _ = session.give_tickets.send(TicketGrant::Tickets(tickets));
        }
    }

    /// Asks every registered client to hand back `tickets` credit.
    pub fn reclaim(&self, tickets: u64) {
        for session in self.inner.sessions().iter() {
            debug!(client = %session.client, tickets, "Reclaiming tickets");
            let _ = session.reclaim_tickets.send(tickets);
        }
    }
}

impl std::fmt::Debug for ReplicaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaServer")
            .field("region", &self.inner.config.region)
            .field("role", &self.inner.config.role)
            .finish_non_exhaustive()
    }
}

impl ReplicaInner {
    fn store(&self) -> MutexGuard<'_, BTreeMap<Key, Bytes>> {
        self.store.lock().expect("store lock poisoned")
    }

    fn observed(&self) -> MutexGuard<'_, Vec<Observed>> {
        self.observed.lock().expect("observation lock poisoned")
    }

    fn sessions(&self) -> MutexGuard<'_, Vec<Session>> {
        self.sessions.lock().expect("session lock poisoned")
    }

    fn read(&self, query: &ReadQuery) -> Reply<ReadResponse> {
        let served = &self.config.region;
        let inside = match query {
            ReadQuery::Get { key } => served.contains_key(key),
            ReadQuery::Scan { region, .. } | ReadQuery::Count { region } => served.contains(region),
        };
        if !inside {
            return Err(misrouted(served));
        }
        Ok(execute_read(&self.store(), query))
    }

    fn write(&self, query: &WriteQuery) -> Reply<WriteResponse> {
        if let Some(state) = *self.refusing.lock().expect("refusal lock poisoned") {
            return Err(Rejection {
                reason: "writes refused".to_string(),
                state,
            });
        }
        let served = &self.config.region;
        if !write_keys(query).iter().all(|key| served.contains_key(key)) {
            return Err(misrouted(served));
        }
        Ok(execute_write(&mut self.store(), query))
    }

    /// Sends `reply` once replies are released.
    fn reply_when_open<T: Send + 'static>(&self, reply: oneshot::Sender<Reply<T>>, response: Reply<T>) {
        let mut open = self.replies_open.subscribe();
        tokio::spawn(async move {
            if open.wait_for(|open| *open).await.is_ok() {
                let _ = reply.send(response);
            }
        });
    }
}

fn misrouted(region: &Region) -> Rejection {
    Rejection {
        reason: format!("request outside served region {region}"),
        state: QueryState::Failed,
    }
}

fn write_keys(query: &WriteQuery) -> Vec<&Key> {
    match query {
        WriteQuery::Set { pairs } => pairs.iter().map(|(key, _)| key).collect(),
        WriteQuery::Delete { keys } => keys.iter().collect(),
    }
}

/// Executes a read against `store`.
#[must_use]
pub fn execute_read(store: &BTreeMap<Key, Bytes>, query: &ReadQuery) -> ReadResponse {
    match query {
        ReadQuery::Get { key } => ReadResponse::Get {
            value: store.get(key).cloned(),
        },
        ReadQuery::Scan { region, limit } => {
            let mut pairs: Vec<(Key, Bytes)> = store
                .iter()
                .filter(|(key, _)| region.contains_key(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            let mut truncated = false;
            if let Some(limit) = *limit {
                if pairs.len() > limit {
                    pairs.truncate(limit);
                    truncated = true;
                }
            }
            ReadResponse::Scan { pairs, truncated }
        }
        ReadQuery::Count { region } => ReadResponse::Count {
            count: store.keys().filter(|key| region.contains_key(key)).count() as u64,
        },
    }
}

/// Applies a write to `store`.
pub fn execute_write(store: &mut BTreeMap<Key, Bytes>, query: &WriteQuery) -> WriteResponse {
    match query {
        WriteQuery::Set { pairs } => {
            for (key, value) in pairs {
                store.insert(key.clone(), value.clone());
            }
            WriteResponse::Set {
                written: pairs.len() as u64,
            }
        }
        WriteQuery::Delete { keys } => WriteResponse::Delete {
            deleted: keys.iter().filter(|key| store.remove(*key).is_some()).count() as u64,
        },
    }
}

async fn serve_primary(inner: Arc<ReplicaInner>, mut requests: mpsc::UnboundedReceiver<PrimaryRequest>) {
    while let Some(request) = requests.recv().await {
        inner.observed().push(Observed {
            client: request.client(),
            sequence: request.sequence(),
            write: matches!(request, PrimaryRequest::Write { .. }),
        });
        match request {
            PrimaryRequest::Read { query, reply, .. } => {
                let response = inner.read(&query);
                inner.reply_when_open(reply, response);
            }
            PrimaryRequest::Write { query, reply, .. } => {
                let response = inner.write(&query);
                inner.reply_when_open(reply, response);
            }
        }
    }
}

async fn serve_admission(
    inner: Arc<ReplicaInner>,
    mut registrations: mpsc::UnboundedReceiver<AdmissionRegistration>,
) {
    while let Some(registration) = registrations.recv().await {
        let AdmissionRegistration {
            client,
            give_tickets,
            reclaim_tickets,
            mut relinquish,
        } = registration;
        debug!(client = %client, grant = ?inner.config.initial_grant, "Client registered");
        let _ = give_tickets.send(inner.config.initial_grant);
        inner.sessions().push(Session {
            client,
            give_tickets,
            reclaim_tickets,
        });

        let returned = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(tickets) = relinquish.recv().await {
                returned.relinquished.fetch_add(tickets, Ordering::Relaxed);
            }
        });
    }
}

async fn serve_stale_reads(
    inner: Arc<ReplicaInner>,
    mut requests: mpsc::UnboundedReceiver<StaleReadRequest>,
) {
    while let Some(StaleReadRequest { query, reply }) = requests.recv().await {
        let _ = reply.send(inner.read(&query));
    }
}
