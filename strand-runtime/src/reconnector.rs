//! Automatic reconnection to lost servers.
//!
//! The reconnector remembers the last address of every logical server it has
//! seen connected. When a server disappears from the connectivity map it
//! retries that address with exponential backoff until the server comes back,
//! is declared dead, or the reconnector shuts down. It never reports failure;
//! the relationship manager observes the resulting connections on its own.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use strand_core::ServerId;
use strand_flow::{DrainLock, DrainToken};
use tracing::{debug, info};

use crate::cluster::{ConnectivityMap, Connections, LivenessMap};
use crate::config::ReconnectConfig;
use crate::error::ConnectResult;

/// Initiates raw connection attempts.
///
/// A successful attempt shows up as a new entry in the connectivity map; the
/// return value only tells whether the attempt itself was made.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Tries to connect to `server` at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt failed.
    async fn connect(&self, server: ServerId, addr: &str) -> ConnectResult<()>;
}

struct ReconnectorInner {
    config: ReconnectConfig,
    connectivity: Arc<ConnectivityMap>,
    liveness: Arc<LivenessMap>,
    connector: Arc<dyn Connector>,
    /// Last known address per logical server.
    addresses: Mutex<HashMap<ServerId, String>>,
    /// Servers with a running retry task.
    retrying: Mutex<HashSet<ServerId>>,
    drain: DrainLock,
}

/// Reconnects to servers that drop out of the connectivity map.
pub struct AutoReconnector {
    inner: Arc<ReconnectorInner>,
}

impl AutoReconnector {
    /// Starts watching the connectivity map.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        config: ReconnectConfig,
        connectivity: Arc<ConnectivityMap>,
        liveness: Arc<LivenessMap>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let inner = Arc::new(ReconnectorInner {
            config,
            connectivity,
            liveness,
            connector,
            addresses: Mutex::new(HashMap::new()),
            retrying: Mutex::new(HashSet::new()),
            drain: DrainLock::new(),
        });

        if let Ok(keepalive) = inner.drain.lock() {
            tokio::spawn(watch_connectivity(Arc::clone(&inner), keepalive));
        }
        Self { inner }
    }

    /// Returns the remembered address of `server`.
    #[must_use]
    pub fn known_address(&self, server: ServerId) -> Option<String> {
        self.inner.addresses().get(&server).cloned()
    }

    /// Returns true if a retry task is running for `server`.
    #[must_use]
    pub fn is_retrying(&self, server: ServerId) -> bool {
        self.inner.retrying().contains(&server)
    }

    /// Cancels every retry task and waits for them to exit.
    pub async fn shutdown(&self) {
        info!("Auto-reconnector shutting down");
        self.inner.drain.drain().await;
    }
}

impl std::fmt::Debug for AutoReconnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoReconnector")
            .field("config", &self.inner.config)
            .field("retrying", &self.inner.retrying().len())
            .finish_non_exhaustive()
    }
}

impl ReconnectorInner {
    fn addresses(&self) -> std::sync::MutexGuard<'_, HashMap<ServerId, String>> {
        self.addresses.lock().expect("address lock poisoned")
    }

    fn retrying(&self) -> std::sync::MutexGuard<'_, HashSet<ServerId>> {
        self.retrying.lock().expect("retry set lock poisoned")
    }

    /// Spawns a retry task for `server` unless one is running or it is dead.
    fn start_retry(self: &Arc<Self>, server: ServerId) {
        if self.liveness.is_dead(server) {
            debug!(server = %server, "Lost server already declared dead, not retrying");
            self.addresses().remove(&server);
            return;
        }
        if !self.addresses().contains_key(&server) {
            return;
        }
        let Ok(keepalive) = self.drain.lock() else {
            return;
        };
        if !self.retrying().insert(server) {
            return;
        }
        tokio::spawn(retry_loop(Arc::clone(self), server, keepalive));
    }
}

/// Connected servers and their addresses.
fn connected_servers(connections: &Connections) -> BTreeMap<ServerId, String> {
    connections
        .values()
        .map(|connection| (connection.server, connection.addr.clone()))
        .collect()
}

async fn watch_connectivity(inner: Arc<ReconnectorInner>, keepalive: DrainToken) {
    let mut connections = inner.connectivity.subscribe();
    let draining = keepalive.draining_signal();
    let mut previous: BTreeMap<ServerId, String> = BTreeMap::new();

    loop {
        let current = connected_servers(&connections.borrow_and_update());

        {
            let mut addresses = inner.addresses();
            for (server, addr) in &current {
                addresses.insert(*server, addr.clone());
            }
        }
        for server in previous.keys() {
            if !current.contains_key(server) {
                info!(server = %server, "Lost connection to server");
                inner.start_retry(*server);
            }
        }
        previous = current;

        tokio::select! {
            biased;
            () = draining.cancelled() => break,
            changed = connections.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Connectivity watch stopped");
}

async fn retry_loop(inner: Arc<ReconnectorInner>, server: ServerId, keepalive: DrainToken) {
    let mut connections = inner.connectivity.subscribe();
    let mut dead = inner.liveness.subscribe();
    let draining = keepalive.draining_signal();
    let mut backoff = inner.config.initial_backoff;
    let mut attempt: u32 = 0;
    let mut session = inner.connectivity.latest_connection(server).map(|(peer, _)| peer);

    loop {
        // The server may have come and gone since the last attempt without
        // the watch showing it. That is a new episode at a possibly new address.
        if let Some((peer, addr)) = inner.connectivity.latest_connection(server) {
            if session != Some(peer) {
                debug!(server = %server, addr = %addr, "Server reappeared since last attempt, resetting backoff");
                session = Some(peer);
                backoff = inner.config.initial_backoff;
                attempt = 0;
                inner.addresses().insert(server, addr);
            }
        }
        let Some(addr) = inner.addresses().get(&server).cloned() else {
            break;
        };

        attempt += 1;
        debug!(server = %server, addr = %addr, attempt, "Attempting reconnect");
        let outcome = tokio::select! {
            biased;
            () = draining.cancelled() => break,
            outcome = inner.connector.connect(server, &addr) => outcome,
        };
        if let Err(err) = outcome {
            debug!(server = %server, attempt, error = %err, "Reconnect attempt failed");
        }

        let reconnected = async {
            connections
                .wait_for(|connections| connections.values().any(|c| c.server == server))
                .await
                .is_ok()
        };
        let declared_dead = async { dead.wait_for(|dead| dead.contains(&server)).await.is_ok() };

        tokio::select! {
            biased;
            () = draining.cancelled() => break,
            true = declared_dead => {
                info!(server = %server, "Server declared dead, giving up");
                inner.addresses().remove(&server);
                break;
            }
            true = reconnected => {
                info!(server = %server, attempt, "Reconnected to server");
                break;
            }
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = inner.config.next_backoff(backoff);
    }

    inner.retrying().remove(&server);
    // Lost again before this task exited.
    if !draining.is_cancelled() && inner.connectivity.peer_for(server).is_none() {
        inner.start_retry(server);
    }
}
