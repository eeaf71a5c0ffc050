//! Watchable cluster metadata.
//!
//! Three maps describe the cluster as seen from one server:
//!
//! - [`ConnectivityMap`]: live connections, keyed by connection identity,
//!   each naming the logical server behind it.
//! - [`LivenessMap`]: logical servers administratively declared dead.
//! - [`Directory`]: replica activities advertised by connected peers.
//!
//! Each is a `watch` channel over an immutable snapshot, so readers never see
//! a half-applied update and writers never block on readers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use strand_core::{ActivityId, PeerId, Region, ServerId};
use strand_flow::CancellationToken;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::contract::{PrimaryCard, StaleReadCard};

/// One live connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Logical server behind the connection.
    pub server: ServerId,
    /// Network address the connection was made to.
    pub addr: String,
    /// Fires when the connection drops.
    pub disconnected: CancellationToken,
}

/// Snapshot of live connections.
pub type Connections = Arc<BTreeMap<PeerId, Connection>>;

/// Connection identity to logical identity map.
#[derive(Debug)]
pub struct ConnectivityMap {
    next_peer: AtomicU64,
    connections: watch::Sender<Connections>,
    /// Most recent connection per server, kept after it drops.
    latest: Mutex<HashMap<ServerId, (PeerId, String)>>,
}

impl ConnectivityMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        let (connections, _) = watch::channel(Arc::new(BTreeMap::new()));
        Self {
            next_peer: AtomicU64::new(1),
            connections,
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Records a new connection to `server` and returns its identity.
    pub fn connect(&self, server: ServerId, addr: impl Into<String>) -> PeerId {
        let peer = PeerId::new(self.next_peer.fetch_add(1, Ordering::Relaxed));
        let addr = addr.into();
        info!(peer = %peer, server = %server, addr = %addr, "Peer connected");
        self.latest
            .lock()
            .expect("connection history lock poisoned")
            .insert(server, (peer, addr.clone()));
        self.connections.send_modify(|connections| {
            Arc::make_mut(connections).insert(
                peer,
                Connection {
                    server,
                    addr,
                    disconnected: CancellationToken::new(),
                },
            );
        });
        peer
    }

    /// Drops a connection, firing its disconnect signal.
    ///
    /// Returns false if the connection was unknown.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        let mut removed = None;
        self.connections.send_if_modified(|connections| {
            removed = Arc::make_mut(connections).remove(&peer);
            removed.is_some()
        });
        let Some(connection) = removed else {
            return false;
        };
        connection.disconnected.cancel();
        info!(peer = %peer, server = %connection.server, "Peer disconnected");
        true
    }

    /// Returns the connection for `peer`.
    #[must_use]
    pub fn connection(&self, peer: PeerId) -> Option<Connection> {
        self.connections.borrow().get(&peer).cloned()
    }

    /// Returns the current connection to `server`, if any.
    #[must_use]
    pub fn peer_for(&self, server: ServerId) -> Option<PeerId> {
        self.connections
            .borrow()
            .iter()
            .find(|(_, connection)| connection.server == server)
            .map(|(peer, _)| *peer)
    }

    /// Returns the most recent connection ever made to `server` and its
    /// address, whether or not it is still live.
    ///
    /// Unlike a snapshot, this sees a connection that came and went between
    /// two reads of the watch channel.
    #[must_use]
    pub fn latest_connection(&self, server: ServerId) -> Option<(PeerId, String)> {
        self.latest
            .lock()
            .expect("connection history lock poisoned")
            .get(&server)
            .cloned()
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Connections {
        Arc::clone(&self.connections.borrow())
    }

    /// Returns a receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Connections> {
        self.connections.subscribe()
    }
}

impl Default for ConnectivityMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of servers declared dead.
pub type DeadServers = Arc<BTreeSet<ServerId>>;

/// Administrative liveness metadata.
#[derive(Debug)]
pub struct LivenessMap {
    dead: watch::Sender<DeadServers>,
}

impl LivenessMap {
    /// Creates a map where every server is alive.
    #[must_use]
    pub fn new() -> Self {
        let (dead, _) = watch::channel(Arc::new(BTreeSet::new()));
        Self { dead }
    }

    /// Declares `server` permanently dead.
    pub fn declare_dead(&self, server: ServerId) {
        self.dead.send_if_modified(|dead| Arc::make_mut(dead).insert(server));
        info!(server = %server, "Server declared dead");
    }

    /// Returns true if `server` has been declared dead.
    #[must_use]
    pub fn is_dead(&self, server: ServerId) -> bool {
        self.dead.borrow().contains(&server)
    }

    /// Returns a receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DeadServers> {
        self.dead.subscribe()
    }
}

impl Default for LivenessMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Role of a replica activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Authoritative for the region's writes.
    Primary,
    /// Follows a primary.
    Secondary,
}

/// A replica activity advertised in the directory.
#[derive(Debug, Clone)]
pub struct Activity {
    /// Connection hosting the replica.
    pub peer: PeerId,
    /// Keys the replica serves.
    pub region: Region,
    /// Role of the replica.
    pub role: Role,
    /// Primary endpoints. Present only for primaries.
    pub primary: Option<PrimaryCard>,
    /// Outdated-read endpoint, if offered.
    pub stale_reader: Option<StaleReadCard>,
}

impl Activity {
    /// Returns true if both records describe the same running replica.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.peer == other.peer
            && self.region == other.region
            && self.role == other.role
            && match (&self.primary, &other.primary) {
                (Some(a), Some(b)) => a.same_endpoint(b),
                (None, None) => true,
                _ => false,
            }
            && match (&self.stale_reader, &other.stale_reader) {
                (Some(a), Some(b)) => a.same_endpoint(b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// Snapshot of advertised activities.
pub type Activities = Arc<BTreeMap<ActivityId, Activity>>;

/// Watchable map of advertised replica activities.
#[derive(Debug)]
pub struct Directory {
    activities: watch::Sender<Activities>,
}

impl Directory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        let (activities, _) = watch::channel(Arc::new(BTreeMap::new()));
        Self { activities }
    }

    /// Adds or replaces an activity.
    pub fn advertise(&self, id: ActivityId, activity: Activity) {
        debug!(activity = %id, peer = %activity.peer, region = %activity.region, "Activity advertised");
        self.activities.send_modify(|activities| {
            Arc::make_mut(activities).insert(id, activity);
        });
    }

    /// Removes an activity.
    pub fn withdraw(&self, id: ActivityId) {
        let removed = self
            .activities
            .send_if_modified(|activities| Arc::make_mut(activities).remove(&id).is_some());
        if removed {
            debug!(activity = %id, "Activity withdrawn");
        }
    }

    /// Removes every activity hosted by `peer`.
    pub fn withdraw_peer(&self, peer: PeerId) {
        self.activities.send_if_modified(|activities| {
            let before = activities.len();
            Arc::make_mut(activities).retain(|_, activity| activity.peer != peer);
            activities.len() != before
        });
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Activities {
        Arc::clone(&self.activities.borrow())
    }

    /// Returns a receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Activities> {
        self.activities.subscribe()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_disconnect() {
        let map = ConnectivityMap::new();
        let server = ServerId::new(7);

        let peer = map.connect(server, "10.0.0.7:29015");
        let connection = map.connection(peer).unwrap();
        assert_eq!(connection.server, server);
        assert_eq!(map.peer_for(server), Some(peer));

        assert!(map.disconnect(peer));
        assert!(connection.disconnected.is_cancelled());
        assert!(map.peer_for(server).is_none());
        assert!(!map.disconnect(peer));
    }

    #[test]
    fn test_reconnect_gets_new_identity() {
        let map = ConnectivityMap::new();
        let server = ServerId::new(1);

        let first = map.connect(server, "a:1");
        map.disconnect(first);
        let second = map.connect(server, "a:1");
        assert_ne!(first, second);
    }

    #[test]
    fn test_liveness() {
        let liveness = LivenessMap::new();
        let rx = liveness.subscribe();

        liveness.declare_dead(ServerId::new(3));
        assert!(liveness.is_dead(ServerId::new(3)));
        assert!(!liveness.is_dead(ServerId::new(4)));
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_directory_withdraw_peer() {
        let directory = Directory::new();
        let activity = |peer| Activity {
            peer: PeerId::new(peer),
            region: Region::universe(),
            role: Role::Secondary,
            primary: None,
            stale_reader: None,
        };
        directory.advertise(ActivityId::new(1), activity(1));
        directory.advertise(ActivityId::new(2), activity(2));

        directory.withdraw_peer(PeerId::new(1));
        let snapshot = directory.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&ActivityId::new(2)));
    }

    #[test]
    fn test_activity_identity() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let card = StaleReadCard { requests: tx };
        let a = Activity {
            peer: PeerId::new(1),
            region: Region::universe(),
            role: Role::Secondary,
            primary: None,
            stale_reader: Some(card.clone()),
        };
        let same = a.clone();
        let moved = Activity {
            peer: PeerId::new(2),
            ..a.clone()
        };
        assert!(a.same_as(&same));
        assert!(!a.same_as(&moved));
    }
}
