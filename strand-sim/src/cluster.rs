//! Simulated cluster harness.
//!
//! [`SimCluster`] plays the network: it knows which servers exist, the
//! replicas each hosts, and whether a server is reachable. Connecting to a
//! server records the connection in the shared [`ConnectivityMap`] and
//! advertises its replicas in the [`Directory`] under the new connection;
//! disconnecting withdraws them again.
//!
//! [`ClientNode`] wires a relationship manager, auto-reconnector and sharding
//! dispatcher to a cluster, the way one strand server would.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use strand_core::{ActivityId, ClientId, PeerId, ServerId};
use strand_routing::{RelationshipRegistry, ShardingDispatcher};
use strand_runtime::{
    Activity, AutoReconnector, ConnectError, ConnectResult, Connector, ConnectivityMap, Directory,
    LivenessMap, RelationshipManager, RuntimeConfig,
};
use tokio::time::Instant;
use tracing::info;

use crate::replica::{ReplicaConfig, ReplicaServer};

/// Errors from the simulated cluster.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    /// The server was never added.
    #[error("unknown server {server}")]
    UnknownServer {
        /// The missing server.
        server: ServerId,
    },
}

struct SimServer {
    addr: String,
    reachable: bool,
    peer: Option<PeerId>,
    replicas: Vec<(ActivityId, ReplicaServer)>,
}

/// The simulated network and the replicas on it.
pub struct SimCluster {
    connectivity: Arc<ConnectivityMap>,
    liveness: Arc<LivenessMap>,
    directory: Arc<Directory>,
    servers: Mutex<BTreeMap<ServerId, SimServer>>,
    next_activity: AtomicU64,
}

impl SimCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connectivity: Arc::new(ConnectivityMap::new()),
            liveness: Arc::new(LivenessMap::new()),
            directory: Arc::new(Directory::new()),
            servers: Mutex::new(BTreeMap::new()),
            next_activity: AtomicU64::new(1),
        })
    }

    /// Returns the connectivity map.
    #[must_use]
    pub fn connectivity(&self) -> Arc<ConnectivityMap> {
        Arc::clone(&self.connectivity)
    }

    /// Returns the liveness map.
    #[must_use]
    pub fn liveness(&self) -> Arc<LivenessMap> {
        Arc::clone(&self.liveness)
    }

    /// Returns the directory.
    #[must_use]
    pub fn directory(&self) -> Arc<Directory> {
        Arc::clone(&self.directory)
    }

    /// Adds a reachable, not yet connected server.
    pub fn add_server(&self, server: ServerId, addr: impl Into<String>) {
        self.lock().insert(
            server,
            SimServer {
                addr: addr.into(),
                reachable: true,
                peer: None,
                replicas: Vec::new(),
            },
        );
    }

    /// Starts a replica on `server`.
    ///
    /// The replica is advertised immediately if the server is connected.
    ///
    /// # Errors
    ///
    /// Returns `SimError::UnknownServer` if the server was never added.
    pub fn add_replica(
        &self,
        server: ServerId,
        config: ReplicaConfig,
    ) -> Result<ReplicaServer, SimError> {
        let mut servers = self.lock();
        let entry = servers
            .get_mut(&server)
            .ok_or(SimError::UnknownServer { server })?;

        let id = ActivityId::new(self.next_activity.fetch_add(1, Ordering::Relaxed));
        let replica = ReplicaServer::start(config);
        if let Some(peer) = entry.peer {
            self.directory.advertise(id, activity(peer, &replica));
        }
        entry.replicas.push((id, replica.clone()));
        Ok(replica)
    }

    /// Connects to `server` at its current address.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError::Refused` if the server is unknown or
    /// unreachable.
    pub fn connect(&self, server: ServerId) -> ConnectResult<PeerId> {
        let addr = self
            .lock()
            .get(&server)
            .map(|entry| entry.addr.clone())
            .unwrap_or_default();
        self.connect_at(server, &addr)
    }

    /// Connects to `server` at `addr`.
    ///
    /// Connecting to an already connected server returns the existing
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError::Refused` if nothing reachable listens there.
    pub fn connect_at(&self, server: ServerId, addr: &str) -> ConnectResult<PeerId> {
        let mut servers = self.lock();
        let refused = || ConnectError::Refused {
            server,
            addr: addr.to_string(),
        };
        let entry = servers.get_mut(&server).ok_or_else(refused)?;
        if !entry.reachable || entry.addr != addr {
            return Err(refused());
        }
        if let Some(peer) = entry.peer {
            return Ok(peer);
        }

        let peer = self.connectivity.connect(server, addr);
        entry.peer = Some(peer);
        for (id, replica) in &entry.replicas {
            self.directory.advertise(*id, activity(peer, replica));
        }
        Ok(peer)
    }

    /// Drops the connection to `server`.
    ///
    /// Returns false if it was not connected.
    pub fn disconnect(&self, server: ServerId) -> bool {
        let peer = self.lock().get_mut(&server).and_then(|entry| entry.peer.take());
        let Some(peer) = peer else {
            return false;
        };
        self.directory.withdraw_peer(peer);
        self.connectivity.disconnect(peer)
    }

    /// Makes `server` accept or refuse new connections.
    pub fn set_reachable(&self, server: ServerId, reachable: bool) {
        if let Some(entry) = self.lock().get_mut(&server) {
            entry.reachable = reachable;
        }
    }

    /// Moves `server` to a new address. Existing connections stay up.
    pub fn move_server(&self, server: ServerId, addr: impl Into<String>) {
        if let Some(entry) = self.lock().get_mut(&server) {
            entry.addr = addr.into();
        }
    }

    /// Declares `server` permanently dead.
    pub fn declare_dead(&self, server: ServerId) {
        self.liveness.declare_dead(server);
    }

    /// Returns the current connection to `server`.
    #[must_use]
    pub fn peer(&self, server: ServerId) -> Option<PeerId> {
        self.lock().get(&server).and_then(|entry| entry.peer)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ServerId, SimServer>> {
        self.servers.lock().expect("server table lock poisoned")
    }
}

impl std::fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCluster")
            .field("servers", &self.lock().len())
            .finish_non_exhaustive()
    }
}

fn activity(peer: PeerId, replica: &ReplicaServer) -> Activity {
    Activity {
        peer,
        region: replica.region().clone(),
        role: replica.role(),
        primary: replica.primary_card().cloned(),
        stale_reader: replica.stale_read_card().cloned(),
    }
}

/// One connection attempt made through a [`SimConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// Server the attempt targeted.
    pub server: ServerId,
    /// Address tried.
    pub addr: String,
    /// When the attempt was made.
    pub at: Instant,
}

/// Connects through a [`SimCluster`], recording every attempt.
#[derive(Debug)]
pub struct SimConnector {
    cluster: Arc<SimCluster>,
    attempts: Mutex<Vec<Attempt>>,
}

impl SimConnector {
    /// Creates a connector for `cluster`.
    #[must_use]
    pub fn new(cluster: Arc<SimCluster>) -> Self {
        Self {
            cluster,
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Returns every attempt so far.
    #[must_use]
    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().expect("attempt log lock poisoned").clone()
    }

    /// Returns the attempts made to `server`.
    #[must_use]
    pub fn attempts_to(&self, server: ServerId) -> Vec<Attempt> {
        self.attempts()
            .into_iter()
            .filter(|attempt| attempt.server == server)
            .collect()
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, server: ServerId, addr: &str) -> ConnectResult<()> {
        self.attempts
            .lock()
            .expect("attempt log lock poisoned")
            .push(Attempt {
                server,
                addr: addr.to_string(),
                at: Instant::now(),
            });
        self.cluster.connect_at(server, addr).map(|_| ())
    }
}

/// The routing stack of one strand server.
pub struct ClientNode {
    client: ClientId,
    dispatcher: Arc<ShardingDispatcher>,
    manager: RelationshipManager,
    reconnector: AutoReconnector,
    connector: Arc<SimConnector>,
}

impl ClientNode {
    /// Starts a node watching `cluster`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(cluster: &Arc<SimCluster>, config: &RuntimeConfig, client: ClientId) -> Self {
        let registry = RelationshipRegistry::new();
        let manager = RelationshipManager::start(
            config.clone(),
            client,
            cluster.directory(),
            cluster.connectivity(),
            Arc::clone(&registry),
        );
        let connector = Arc::new(SimConnector::new(Arc::clone(cluster)));
        let reconnector = AutoReconnector::start(
            config.reconnect.clone(),
            cluster.connectivity(),
            cluster.liveness(),
            connector.clone(),
        );
        let dispatcher = Arc::new(ShardingDispatcher::new(registry, config.dispatcher.clone()));
        info!(server = %config.server_id, client = %client, "Client node started");

        Self {
            client,
            dispatcher,
            manager,
            reconnector,
            connector,
        }
    }

    /// Returns the client id this node registers as.
    #[must_use]
    pub const fn client(&self) -> ClientId {
        self.client
    }

    /// Returns the dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<ShardingDispatcher> {
        &self.dispatcher
    }

    /// Returns the relationship manager.
    #[must_use]
    pub const fn manager(&self) -> &RelationshipManager {
        &self.manager
    }

    /// Returns the auto-reconnector.
    #[must_use]
    pub const fn reconnector(&self) -> &AutoReconnector {
        &self.reconnector
    }

    /// Returns the connector the reconnector uses.
    #[must_use]
    pub const fn connector(&self) -> &Arc<SimConnector> {
        &self.connector
    }

    /// Stops reconnecting and retires every relationship.
    pub async fn shutdown(&self) {
        self.reconnector.shutdown().await;
        self.manager.shutdown().await;
    }
}

impl std::fmt::Debug for ClientNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientNode")
            .field("client", &self.client)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}
