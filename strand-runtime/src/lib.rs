//! Strand Runtime - keeps a server's view of the cluster wired to dispatch.
//!
//! This crate turns cluster metadata into live replica relationships:
//!
//! - [`RelationshipManager`]: runs one lifecycle per advertised activity and
//!   keeps the [`RelationshipRegistry`](strand_routing::RelationshipRegistry)
//!   in step with the [`Directory`]
//! - [`MasterAccess`]: ordered, ticket-throttled requests to one primary
//! - [`ReplicaAccess`]: outdated reads from any replica
//! - [`AutoReconnector`]: retries lost servers with exponential backoff
//!
//! # Example
//!
//! ```ignore
//! use strand_runtime::{ConnectivityMap, Directory, RelationshipManager, RuntimeConfig};
//! use strand_routing::{RelationshipRegistry, ShardingDispatcher};
//!
//! let registry = RelationshipRegistry::new();
//! let manager = RelationshipManager::start(
//!     RuntimeConfig::new(ServerId::new(1)),
//!     ClientId::new(1),
//!     directory,
//!     connectivity,
//!     Arc::clone(&registry),
//! );
//! let dispatcher = ShardingDispatcher::new(registry, config.dispatcher);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod access;
mod cluster;
mod config;
mod contract;
mod error;
mod manager;
mod reconnector;

pub use access::{MasterAccess, ReplicaAccess};
pub use cluster::{
    Activities, Activity, Connection, Connections, ConnectivityMap, DeadServers, Directory,
    LivenessMap, Role,
};
pub use config::{AccessConfig, ConfigError, ReconnectConfig, RuntimeConfig};
pub use contract::{
    AdmissionRegistration, PrimaryCard, PrimaryRequest, Rejection, Reply, StaleReadCard,
    StaleReadRequest, TicketGrant,
};
pub use error::{ConnectError, ConnectResult};
pub use manager::{LifecycleState, RelationshipManager};
pub use reconnector::{AutoReconnector, Connector};
