//! Strand Sim - in-process cluster simulation and scenario tests.
//!
//! This crate runs the whole routing stack against in-memory replicas. The
//! simulated network is a [`SimCluster`]; a [`ClientNode`] is the stack one
//! strand server runs on top of it.
//!
//! ## Test Organization
//!
//! **Scenario tests** (`*_tests.rs`): one module per routing property
//! - `ordering_tests`: requests reach a primary in token order
//! - `sharding_tests`: sharded queries match an unsharded reference store
//! - `lifecycle_tests`: registry membership follows the directory
//! - `reconnect_tests`: backoff schedule and dead-server handling
//! - `failure_tests`: failure classification and aggregation
//! - `admission_tests`: ticket-bounded submission
//!
//! **Support Modules**:
//! - `replica`: in-memory replica server
//! - `cluster`: simulated network, connector and client node
//! - `properties`: property checkers
//! - `scenarios`: cluster layouts and workloads
//!
//! ## Naming Conventions
//!
//! - Scenario tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cluster;
pub mod properties;
pub mod replica;
pub mod scenarios;

#[cfg(test)]
mod support;

#[cfg(test)]
mod reconnect_tests;

pub use cluster::{Attempt, ClientNode, SimCluster, SimConnector, SimError};
pub use properties::{check_single_primary, check_submission_order, PropertyViolation};
pub use replica::{execute_read, execute_write, Observed, ReplicaConfig, ReplicaServer};
pub use scenarios::{Operation, Workload, WorkloadConfig, WorkloadReport};
