//! Strand Core - Strongly-typed identifiers and key regions.
//!
//! This crate provides the vocabulary shared by every other strand crate:
//! identifiers for servers, connections, activities and relationships, and
//! the `Region` type describing a contiguous slice of the key space.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up a `ServerId` with a `PeerId`
//! - **Non-empty regions**: A `Region` always contains at least one key
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod region;
mod types;

pub use region::{refine, Key, Region, RegionJoinError, RightBound};
pub use types::{ActivityId, ClientId, PeerId, RelationshipId, ServerId};
