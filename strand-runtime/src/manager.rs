//! Relationship lifecycle manager.
//!
//! The manager watches the directory and runs one lifecycle task per
//! advertised activity. Each task moves through three states:
//!
//! - **Starting**: builds the access handles (registering with admission
//!   control for primaries). Failure goes straight to Retiring, which holds
//!   the activity for a backoff delay before it may be started again.
//! - **Active**: the relationship is registered and visible to dispatch until
//!   the activity changes, its peer disconnects, or the manager shuts down.
//! - **Retiring**: deregisters first, waits for in-flight dispatches through
//!   the relationship's drain lock, removes its bookkeeping, and re-examines
//!   the directory in case the peer came back while it was retiring.
//!
//! A task for an activity id is only started when no task for that id exists,
//! so an activity is never represented by two relationships at once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use strand_core::{ActivityId, ClientId};
use strand_flow::{CancellationToken, DrainLock, DrainToken, Interruptor};
use strand_routing::{Relationship, RelationshipRegistry};
use tracing::{debug, info, warn};

use crate::access::{MasterAccess, ReplicaAccess};
use crate::cluster::{Activity, Connection, ConnectivityMap, Directory, Role};
use crate::config::RuntimeConfig;
use crate::error::ConnectResult;

/// State of one lifecycle task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Building access handles.
    Starting,
    /// Registered and serving dispatch.
    Active,
    /// Tearing down.
    Retiring,
}

struct Lifecycle {
    /// The record the task was started for.
    activity: Activity,
    /// Fires when the record changes or disappears.
    retire: CancellationToken,
    state: LifecycleState,
}

struct ManagerInner {
    config: RuntimeConfig,
    client: ClientId,
    directory: Arc<Directory>,
    connectivity: Arc<ConnectivityMap>,
    registry: Arc<RelationshipRegistry>,
    lifecycles: Mutex<HashMap<ActivityId, Lifecycle>>,
    /// Delay before the next start of an activity whose last start failed.
    failures: Mutex<HashMap<ActivityId, Duration>>,
    drain: DrainLock,
}

/// Keeps the relationship registry in step with the directory.
pub struct RelationshipManager {
    inner: Arc<ManagerInner>,
}

impl RelationshipManager {
    /// Starts watching the directory.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        config: RuntimeConfig,
        client: ClientId,
        directory: Arc<Directory>,
        connectivity: Arc<ConnectivityMap>,
        registry: Arc<RelationshipRegistry>,
    ) -> Self {
        let inner = Arc::new(ManagerInner {
            config,
            client,
            directory,
            connectivity,
            registry,
            lifecycles: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            drain: DrainLock::new(),
        });

        if let Ok(keepalive) = inner.drain.lock() {
            tokio::spawn(watch_directory(Arc::clone(&inner), keepalive));
        }
        info!(server = %inner.config.server_id, client = %client, "Relationship manager started");
        Self { inner }
    }

    /// Returns the registry this manager maintains.
    #[must_use]
    pub fn registry(&self) -> &Arc<RelationshipRegistry> {
        &self.inner.registry
    }

    /// Returns the state of every lifecycle task.
    #[must_use]
    pub fn lifecycles(&self) -> BTreeMap<ActivityId, LifecycleState> {
        self.inner
            .lock()
            .iter()
            .map(|(id, lifecycle)| (*id, lifecycle.state))
            .collect()
    }

    /// Stops watching, retires every relationship and waits for all tasks.
    pub async fn shutdown(&self) {
        info!(server = %self.inner.config.server_id, "Relationship manager shutting down");
        self.inner.drain.drain().await;
    }
}

impl std::fmt::Debug for RelationshipManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipManager")
            .field("server", &self.inner.config.server_id)
            .field("lifecycles", &self.lifecycles())
            .finish()
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<ActivityId, Lifecycle>> {
        self.lifecycles.lock().expect("lifecycle lock poisoned")
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<ActivityId, Duration>> {
        self.failures.lock().expect("failure lock poisoned")
    }

    fn set_state(&self, id: ActivityId, state: LifecycleState) {
        if let Some(lifecycle) = self.lock().get_mut(&id) {
            lifecycle.state = state;
        }
    }

    /// Retires tasks whose activity changed and starts tasks for new ones.
    fn reconcile(self: &Arc<Self>) {
        if self.drain.is_draining() {
            return;
        }
        let activities = self.directory.snapshot();
        let mut lifecycles = self.lock();

        for (id, lifecycle) in lifecycles.iter() {
            let current = activities.get(id);
            let changed = !matches!(current, Some(activity) if activity.same_as(&lifecycle.activity));
            if changed && !lifecycle.retire.is_cancelled() {
                debug!(activity = %id, "Activity changed, retiring relationship");
                lifecycle.retire.cancel();
            }
        }

        for (id, activity) in activities.iter() {
            if lifecycles.contains_key(id) {
                continue;
            }
            let Some(connection) = self.connectivity.connection(activity.peer) else {
                debug!(activity = %id, peer = %activity.peer, "Peer not connected yet");
                continue;
            };
            let Ok(keepalive) = self.drain.lock() else {
                return;
            };

            let retire = CancellationToken::new();
            lifecycles.insert(
                *id,
                Lifecycle {
                    activity: activity.clone(),
                    retire: retire.clone(),
                    state: LifecycleState::Starting,
                },
            );
            tokio::spawn(run_lifecycle(
                Arc::clone(self),
                *id,
                activity.clone(),
                connection,
                retire,
                keepalive,
            ));
        }
    }

    async fn build_relationship(
        &self,
        activity: &Activity,
        connection: &Connection,
        interruptor: &Interruptor,
    ) -> ConnectResult<Relationship> {
        let is_local = connection.server == self.config.server_id;
        let mut relationship = Relationship::new(activity.region.clone(), is_local);

        if let (Role::Primary, Some(card)) = (activity.role, &activity.primary) {
            let access = MasterAccess::connect(
                self.client,
                activity.peer,
                card,
                connection.disconnected.clone(),
                &self.config.access,
                interruptor,
            )
            .await?;
            relationship = relationship.with_primary(Arc::new(access));
        }
        if let Some(card) = &activity.stale_reader {
            let access = ReplicaAccess::new(activity.peer, card, connection.disconnected.clone());
            relationship = relationship.with_stale_reader(Arc::new(access));
        }
        Ok(relationship)
    }
}

async fn watch_directory(inner: Arc<ManagerInner>, _keepalive: DrainToken) {
    let mut activities = inner.directory.subscribe();
    let mut connections = inner.connectivity.subscribe();
    let draining = inner.drain.draining_signal();

    loop {
        inner.reconcile();
        tokio::select! {
            biased;
            () = draining.cancelled() => break,
            changed = activities.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = connections.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Directory watch stopped");
}

async fn run_lifecycle(
    inner: Arc<ManagerInner>,
    id: ActivityId,
    activity: Activity,
    connection: Connection,
    retire: CancellationToken,
    keepalive: DrainToken,
) {
    let stop = Interruptor::new(retire)
        .with(connection.disconnected.clone())
        .with(keepalive.draining_signal());
    info!(
        activity = %id,
        peer = %activity.peer,
        region = %activity.region,
        role = ?activity.role,
        "Starting relationship"
    );

    match inner.build_relationship(&activity, &connection, &stop).await {
        Ok(relationship) => {
            inner.failures().remove(&id);
            let registration = inner.registry.register(relationship);
            inner.set_state(id, LifecycleState::Active);

            stop.fired().await;

            inner.set_state(id, LifecycleState::Retiring);
            let drain = Arc::clone(&registration.relationship().drain);
            drop(registration);
            drain.drain().await;
        }
        Err(err) => {
            inner.set_state(id, LifecycleState::Retiring);
            let backoff = inner
                .failures()
                .get(&id)
                .copied()
                .unwrap_or(inner.config.reconnect.initial_backoff);
            warn!(
                activity = %id,
                peer = %activity.peer,
                error = %err,
                retry_in = ?backoff,
                "Failed to start relationship"
            );
            inner
                .failures()
                .insert(id, inner.config.reconnect.next_backoff(backoff));
            // The slot stays taken until the delay passes, so the same record
            // is not restarted right away. A changed record restarts at once.
            if stop.sleep(backoff).await.is_err() {
                inner.failures().remove(&id);
            }
        }
    }

    inner.lock().remove(&id);
    info!(activity = %id, "Relationship retired");
    if !keepalive.draining_signal().is_cancelled() {
        inner.reconcile();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strand_core::{PeerId, Region, ServerId};
    use tokio::sync::mpsc;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::contract::{AdmissionRegistration, PrimaryCard, StaleReadCard, TicketGrant};

    struct Harness {
        directory: Arc<Directory>,
        connectivity: Arc<ConnectivityMap>,
        manager: RelationshipManager,
    }

    fn harness() -> Harness {
        let directory = Arc::new(Directory::new());
        let connectivity = Arc::new(ConnectivityMap::new());
        let manager = RelationshipManager::start(
            RuntimeConfig::fast_for_testing(ServerId::new(1)),
            ClientId::new(1),
            Arc::clone(&directory),
            Arc::clone(&connectivity),
            RelationshipRegistry::new(),
        );
        Harness {
            directory,
            connectivity,
            manager,
        }
    }

    fn secondary(peer: PeerId, region: Region) -> Activity {
        let (tx, _rx) = mpsc::unbounded_channel();
        Activity {
            peer,
            region,
            role: Role::Secondary,
            primary: None,
            stale_reader: Some(StaleReadCard { requests: tx }),
        }
    }

    /// A primary whose admission server drops registrations until `accept`
    /// is set. Returns the activity and the number of registrations seen.
    fn flaky_primary(peer: PeerId, accept: Arc<AtomicBool>) -> (Activity, Arc<AtomicUsize>) {
        let (requests, mut requests_rx) = mpsc::unbounded_channel();
        let (admission, mut admission_rx) = mpsc::unbounded_channel::<AdmissionRegistration>();
        let registrations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&registrations);
        tokio::spawn(async move {
            let mut accepted = Vec::new();
            while let Some(registration) = admission_rx.recv().await {
                seen.fetch_add(1, Ordering::SeqCst);
                if accept.load(Ordering::SeqCst) {
                    let _ = registration.give_tickets.send(TicketGrant::Unlimited);
                    accepted.push(registration);
                }
            }
            requests_rx.close();
        });
        let activity = Activity {
            peer,
            region: Region::universe(),
            role: Role::Primary,
            primary: Some(PrimaryCard {
                requests,
                admission,
            }),
            stale_reader: None,
        };
        (activity, registrations)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_becomes_relationship() {
        let h = harness();
        let peer = h.connectivity.connect(ServerId::new(2), "b:1");
        h.directory.advertise(ActivityId::new(1), secondary(peer, Region::universe()));
        settle().await;

        let registry = h.manager.registry();
        assert_eq!(registry.len(), 1);
        let (_, relationship) = &registry.snapshot()[0];
        assert!(relationship.stale_reader.is_some());
        assert!(!relationship.is_local);
        assert_eq!(
            h.manager.lifecycles().get(&ActivityId::new(1)),
            Some(&LifecycleState::Active)
        );

        h.directory.withdraw(ActivityId::new(1));
        settle().await;
        assert!(registry.is_empty());
        assert!(h.manager.lifecycles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_replica_is_marked_local() {
        let h = harness();
        let peer = h.connectivity.connect(ServerId::new(1), "self:1");
        h.directory.advertise(ActivityId::new(1), secondary(peer, Region::universe()));
        settle().await;

        let snapshot = h.manager.registry().snapshot();
        assert!(snapshot[0].1.is_local);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_connection() {
        let h = harness();
        // Advertised by a peer this server has no connection to yet.
        let peer = PeerId::new(99);
        h.directory.advertise(ActivityId::new(1), secondary(peer, Region::universe()));
        settle().await;
        assert!(h.manager.registry().is_empty());
        assert!(h.manager.lifecycles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_removes_relationship() {
        let h = harness();
        let peer = h.connectivity.connect(ServerId::new(2), "b:1");
        h.directory.advertise(ActivityId::new(1), secondary(peer, Region::universe()));
        settle().await;
        assert_eq!(h.manager.registry().len(), 1);

        h.connectivity.disconnect(peer);
        settle().await;
        assert!(h.manager.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_reconnect_keeps_one_relationship() {
        let h = harness();
        let server = ServerId::new(2);
        let first = h.connectivity.connect(server, "b:1");
        h.directory.advertise(ActivityId::new(1), secondary(first, Region::universe()));
        settle().await;

        // Reconnect and re-advertise without yielding in between.
        h.connectivity.disconnect(first);
        let second = h.connectivity.connect(server, "b:1");
        h.directory.advertise(ActivityId::new(1), secondary(second, Region::universe()));
        settle().await;

        let snapshot = h.manager.registry().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(h.manager.lifecycles().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_region_restarts() {
        let h = harness();
        let peer = h.connectivity.connect(ServerId::new(2), "b:1");
        h.directory.advertise(ActivityId::new(1), secondary(peer, Region::bounded("", "m")));
        settle().await;

        h.directory.advertise(ActivityId::new(1), secondary(peer, Region::universe()));
        settle().await;

        let snapshot = h.manager.registry().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].1.region, Region::universe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_retires_everything() {
        let h = harness();
        let peer = h.connectivity.connect(ServerId::new(2), "b:1");
        h.directory.advertise(ActivityId::new(1), secondary(peer, Region::bounded("", "m")));
        h.directory.advertise(ActivityId::new(2), secondary(peer, Region::from_key("m")));
        settle().await;
        assert_eq!(h.manager.registry().len(), 2);

        h.manager.shutdown().await;
        assert!(h.manager.registry().is_empty());
        assert!(h.manager.lifecycles().is_empty());

        // Nothing new starts after shutdown.
        h.directory.advertise(ActivityId::new(3), secondary(peer, Region::universe()));
        settle().await;
        assert!(h.manager.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handshake_backs_off() {
        let h = harness();
        let peer = h.connectivity.connect(ServerId::new(2), "b:1");
        let accept = Arc::new(AtomicBool::new(false));
        let (activity, registrations) = flaky_primary(peer, Arc::clone(&accept));
        h.directory.advertise(ActivityId::new(1), activity);

        // Attempts at 0, 10, 25, 47.5, 81.25, ... ms under the test schedule.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let attempts = registrations.load(Ordering::SeqCst);
        assert!((2..=12).contains(&attempts), "{attempts} registrations in 1s");
        assert!(h.manager.registry().is_empty());
        assert_eq!(
            h.manager.lifecycles().get(&ActivityId::new(1)),
            Some(&LifecycleState::Retiring)
        );

        // Once the primary answers, the next retry registers the relationship.
        accept.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.manager.registry().len(), 1);
        assert_eq!(
            h.manager.lifecycles().get(&ActivityId::new(1)),
            Some(&LifecycleState::Active)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_lifecycle_stops_on_withdraw() {
        let h = harness();
        let peer = h.connectivity.connect(ServerId::new(2), "b:1");
        let (activity, registrations) = flaky_primary(peer, Arc::new(AtomicBool::new(false)));
        h.directory.advertise(ActivityId::new(1), activity);
        settle().await;
        assert!(registrations.load(Ordering::SeqCst) >= 1);

        h.directory.withdraw(ActivityId::new(1));
        settle().await;
        assert!(h.manager.lifecycles().is_empty());
        let after = registrations.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(registrations.load(Ordering::SeqCst), after);
    }
}
