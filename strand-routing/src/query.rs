//! Query model.
//!
//! Queries are a closed set of tagged variants. Each knows how to restrict
//! itself to a region (`shard`) and how to merge the responses of its
//! per-region pieces back into one (`unshard`). Both are pure functions.

use bytes::Bytes;
use strand_core::{Key, Region};

/// An operation that can be split by region and merged back.
pub trait Shardable: Sized {
    /// Response produced by executing the operation.
    type Response;

    /// Restricts the operation to `region`.
    ///
    /// Returns `None` if the operation has nothing to do in `region`.
    fn shard(&self, region: &Region) -> Option<Self>;

    /// Merges the responses of this operation's pieces.
    ///
    /// The responses may arrive in any order.
    fn unshard(&self, responses: Vec<Self::Response>) -> Self::Response;
}

/// A read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadQuery {
    /// Point lookup.
    Get {
        /// Key to look up.
        key: Key,
    },
    /// Ordered range scan.
    Scan {
        /// Keys to scan.
        region: Region,
        /// Maximum number of pairs to return.
        limit: Option<usize>,
    },
    /// Number of keys in a range.
    Count {
        /// Keys to count.
        region: Region,
    },
}

/// Response to a [`ReadQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResponse {
    /// Result of a point lookup.
    Get {
        /// Value, if the key is present.
        value: Option<Bytes>,
    },
    /// Result of a range scan, sorted by key.
    Scan {
        /// Matching pairs.
        pairs: Vec<(Key, Bytes)>,
        /// True if the limit cut the scan short.
        truncated: bool,
    },
    /// Result of a count.
    Count {
        /// Number of keys.
        count: u64,
    },
}

impl ReadQuery {
    /// Creates a point lookup.
    #[must_use]
    pub fn get(key: impl Into<Key>) -> Self {
        Self::Get { key: key.into() }
    }

    /// Creates an unlimited scan.
    #[must_use]
    pub const fn scan(region: Region) -> Self {
        Self::Scan {
            region,
            limit: None,
        }
    }

    /// Creates a count.
    #[must_use]
    pub const fn count(region: Region) -> Self {
        Self::Count { region }
    }
}

impl Shardable for ReadQuery {
    type Response = ReadResponse;

    fn shard(&self, region: &Region) -> Option<Self> {
        match self {
            Self::Get { key } => region.contains_key(key).then(|| self.clone()),
            Self::Scan { region: scanned, limit } => {
                scanned.intersection(region).map(|region| Self::Scan {
                    region,
                    limit: *limit,
                })
            }
            Self::Count { region: counted } => {
                counted.intersection(region).map(|region| Self::Count { region })
            }
        }
    }

    fn unshard(&self, responses: Vec<ReadResponse>) -> ReadResponse {
        match self {
            Self::Get { .. } => {
                let value = responses.into_iter().find_map(|response| match response {
                    ReadResponse::Get { value } => value,
                    _ => None,
                });
                ReadResponse::Get { value }
            }
            Self::Scan { limit, .. } => {
                let mut pairs = Vec::new();
                let mut truncated = false;
                for response in responses {
                    if let ReadResponse::Scan {
                        pairs: mut piece,
                        truncated: piece_truncated,
                    } = response
                    {
                        pairs.append(&mut piece);
                        truncated |= piece_truncated;
                    }
                }
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                if let Some(limit) = *limit {
                    if pairs.len() > limit {
                        pairs.truncate(limit);
                        truncated = true;
                    }
                }
                ReadResponse::Scan { pairs, truncated }
            }
            Self::Count { .. } => {
                let count = responses
                    .into_iter()
                    .map(|response| match response {
                        ReadResponse::Count { count } => count,
                        _ => 0,
                    })
                    .sum();
                ReadResponse::Count { count }
            }
        }
    }
}

/// A write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteQuery {
    /// Inserts or overwrites pairs.
    Set {
        /// Pairs to store.
        pairs: Vec<(Key, Bytes)>,
    },
    /// Removes keys.
    Delete {
        /// Keys to remove.
        keys: Vec<Key>,
    },
}

/// Response to a [`WriteQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResponse {
    /// Result of a set.
    Set {
        /// Number of pairs written.
        written: u64,
    },
    /// Result of a delete.
    Delete {
        /// Number of keys that existed and were removed.
        deleted: u64,
    },
}

impl WriteQuery {
    /// Creates a single-key set.
    #[must_use]
    pub fn set(key: impl Into<Key>, value: impl Into<Bytes>) -> Self {
        Self::Set {
            pairs: vec![(key.into(), value.into())],
        }
    }

    /// Creates a single-key delete.
    #[must_use]
    pub fn delete(key: impl Into<Key>) -> Self {
        Self::Delete {
            keys: vec![key.into()],
        }
    }
}

impl Shardable for WriteQuery {
    type Response = WriteResponse;

    fn shard(&self, region: &Region) -> Option<Self> {
        match self {
            Self::Set { pairs } => {
                let pairs: Vec<_> = pairs
                    .iter()
                    .filter(|(key, _)| region.contains_key(key))
                    .cloned()
                    .collect();
                (!pairs.is_empty()).then_some(Self::Set { pairs })
            }
            Self::Delete { keys } => {
                let keys: Vec<_> = keys
                    .iter()
                    .filter(|key| region.contains_key(key))
                    .cloned()
                    .collect();
                (!keys.is_empty()).then_some(Self::Delete { keys })
            }
        }
    }

    fn unshard(&self, responses: Vec<WriteResponse>) -> WriteResponse {
        match self {
            Self::Set { .. } => WriteResponse::Set {
                written: responses
                    .iter()
                    .map(|response| match response {
                        WriteResponse::Set { written } => *written,
                        WriteResponse::Delete { .. } => 0,
                    })
                    .sum(),
            },
            Self::Delete { .. } => WriteResponse::Delete {
                deleted: responses
                    .iter()
                    .map(|response| match response {
                        WriteResponse::Delete { deleted } => *deleted,
                        WriteResponse::Set { .. } => 0,
                    })
                    .sum(),
            },
        }
    }
}
