//! Strand Routing - relationship registry and sharding dispatcher.
//!
//! This crate maps key regions to the replicas that currently serve them and
//! dispatches queries across those replicas.
//!
//! # Design
//!
//! - **Closed query model**: queries are tagged variants that split themselves
//!   by region and merge their pieces' responses
//! - **Scoped registration**: a relationship is visible to dispatch exactly
//!   while its registration guard lives
//! - **Check before send**: every routing inconsistency is detected before
//!   the first sub-query leaves, so such failures never leave partial effects

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod access;
mod dispatcher;
mod error;
mod query;
mod registry;

pub use access::{PrimaryAccess, StaleReadAccess};
pub use dispatcher::{
    DispatcherConfig, ReadinessLevel, ShardingDispatcher, ShardingScheme, FANOUT_MAX_DEFAULT,
};
pub use error::{AccessError, QueryError, QueryResult, QueryState};
pub use query::{ReadQuery, ReadResponse, Shardable, WriteQuery, WriteResponse};
pub use registry::{Registration, Relationship, RelationshipRegistry};
