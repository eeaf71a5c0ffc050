//! Relationship registry.
//!
//! The registry maps key regions to the replica handles that currently serve
//! them. Entries are owned by whoever registered them: [`RelationshipRegistry::register`]
//! returns a guard, and the entry disappears the moment the guard is dropped.
//! Dispatch only ever sees consistent snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use strand_core::{Region, RelationshipId};
use strand_flow::DrainLock;
use tokio::sync::watch;
use tracing::debug;

use crate::access::{PrimaryAccess, StaleReadAccess};

/// The live handle set a region currently resolves to.
pub struct Relationship {
    /// Keys this relationship serves.
    pub region: Region,
    /// True if the replica lives in this process.
    pub is_local: bool,
    /// Handle to the primary, if the peer is primary for `region`.
    pub primary: Option<Arc<dyn PrimaryAccess>>,
    /// Handle for outdated reads, if the peer offers them.
    pub stale_reader: Option<Arc<dyn StaleReadAccess>>,
    /// Drained before the relationship's handles are released.
    pub drain: Arc<DrainLock>,
}

impl Relationship {
    /// Creates a relationship with no handles.
    #[must_use]
    pub fn new(region: Region, is_local: bool) -> Self {
        Self {
            region,
            is_local,
            primary: None,
            stale_reader: None,
            drain: Arc::new(DrainLock::new()),
        }
    }

    /// Sets the primary handle.
    #[must_use]
    pub fn with_primary(mut self, primary: Arc<dyn PrimaryAccess>) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Sets the outdated-read handle.
    #[must_use]
    pub fn with_stale_reader(mut self, reader: Arc<dyn StaleReadAccess>) -> Self {
        self.stale_reader = Some(reader);
        self
    }
}

impl fmt::Debug for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relationship")
            .field("region", &self.region)
            .field("is_local", &self.is_local)
            .field("primary", &self.primary.is_some())
            .field("stale_reader", &self.stale_reader.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    last_id: RelationshipId,
    entries: BTreeMap<RelationshipId, Arc<Relationship>>,
}

/// Region-keyed table of live relationships.
pub struct RelationshipRegistry {
    state: Mutex<RegistryState>,
    /// Bumped on every insert and removal.
    version: watch::Sender<u64>,
}

impl RelationshipRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (version, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            version,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("registry lock poisoned")
    }

    /// Inserts a relationship; it stays until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, relationship: Relationship) -> Registration {
        let relationship = Arc::new(relationship);
        let id = {
            let mut state = self.lock();
            let id = state.last_id.next();
            state.last_id = id;
            state.entries.insert(id, Arc::clone(&relationship));
            id
        };
        self.version.send_modify(|v| *v += 1);
        debug!(
            relationship = %id,
            region = %relationship.region,
            primary = relationship.primary.is_some(),
            "Registered relationship"
        );
        Registration {
            registry: Arc::clone(self),
            id,
            relationship,
        }
    }

    fn deregister(&self, id: RelationshipId) {
        let removed = self.lock().entries.remove(&id).is_some();
        if removed {
            self.version.send_modify(|v| *v += 1);
            debug!(relationship = %id, "Deregistered relationship");
        }
    }

    /// Returns every live relationship, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(RelationshipId, Arc<Relationship>)> {
        self.lock()
            .entries
            .iter()
            .map(|(id, rel)| (*id, Arc::clone(rel)))
            .collect()
    }

    /// Returns a receiver notified on every membership change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Returns the number of live relationships.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if no relationship is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for RelationshipRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationshipRegistry")
            .field("len", &self.len())
            .finish()
    }
}

/// Keeps a relationship registered. Dropping it deregisters.
#[must_use = "the relationship is deregistered when this guard is dropped"]
pub struct Registration {
    registry: Arc<RelationshipRegistry>,
    id: RelationshipId,
    relationship: Arc<Relationship>,
}

impl Registration {
    /// Returns the registry-assigned id.
    #[must_use]
    pub const fn id(&self) -> RelationshipId {
        self.id
    }

    /// Returns the registered relationship.
    #[must_use]
    pub const fn relationship(&self) -> &Arc<Relationship> {
        &self.relationship
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("region", &self.relationship.region)
            .finish()
    }
}
