//! Regions - contiguous, half-open ranges of the key space.
//!
//! A table is split into regions (shards). Each region is `[start, end)`
//! where `end` may be unbounded. Regions are never empty: constructing one
//! with `start >= end` panics, and operations that could produce an empty
//! region return `Option`.

use std::cmp::{max, min};
use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;

/// A key in the key space. Keys order lexicographically by bytes.
pub type Key = Bytes;

/// Exclusive right edge of a region.
///
/// `Unbounded` orders after every key, so the derived ordering is the
/// ordering of right edges along the key space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RightBound {
    /// The region ends just before this key.
    Key(Key),
    /// The region extends to the end of the key space.
    Unbounded,
}

impl RightBound {
    /// Returns true if `key` lies strictly left of this bound.
    #[must_use]
    pub fn admits(&self, key: &[u8]) -> bool {
        match self {
            Self::Key(end) => key < end.as_ref(),
            Self::Unbounded => true,
        }
    }

    fn at(key: &Key) -> Self {
        Self::Key(key.clone())
    }
}

/// A non-empty half-open key range `[start, end)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Region {
    /// First key of the region (inclusive).
    start: Key,
    /// Right edge of the region (exclusive).
    end: RightBound,
}

impl Region {
    /// Creates a new region.
    ///
    /// # Panics
    ///
    /// Panics if the region would be empty (start >= end).
    #[must_use]
    pub fn new(start: impl Into<Key>, end: RightBound) -> Self {
        let start = start.into();
        assert!(
            end > RightBound::at(&start),
            "region start must be < end"
        );
        Self { start, end }
    }

    /// Creates the bounded region `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if start >= end.
    #[must_use]
    pub fn bounded(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self::new(start, RightBound::Key(end.into()))
    }

    /// Creates the region `[start, +inf)`.
    #[must_use]
    pub fn from_key(start: impl Into<Key>) -> Self {
        Self {
            start: start.into(),
            end: RightBound::Unbounded,
        }
    }

    /// Returns the region covering the whole key space.
    #[must_use]
    pub const fn universe() -> Self {
        Self {
            start: Bytes::new(),
            end: RightBound::Unbounded,
        }
    }

    /// Returns the first key of the region.
    #[must_use]
    pub const fn start(&self) -> &Key {
        &self.start
    }

    /// Returns the right edge of the region.
    #[must_use]
    pub const fn end(&self) -> &RightBound {
        &self.end
    }

    /// Returns true if this region is the whole key space.
    #[must_use]
    pub fn is_universe(&self) -> bool {
        self.start.is_empty() && self.end == RightBound::Unbounded
    }

    /// Returns true if the region contains the given key.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start.as_ref() && self.end.admits(key)
    }

    /// Returns true if `other` lies entirely inside this region.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Returns true if the two regions share at least one key.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.intersection(other).is_some()
    }

    /// Returns the keys common to both regions, or `None` if they are disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let start = max(&self.start, &other.start).clone();
        let end = min(&self.end, &other.end).clone();
        if end > RightBound::at(&start) {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Joins regions into the single region they tile.
    ///
    /// The inputs may arrive in any order but must be pairwise disjoint and
    /// leave no gap between their smallest start and largest end.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is empty, overlaps, or has a gap.
    pub fn join(regions: impl IntoIterator<Item = Self>) -> Result<Self, RegionJoinError> {
        let mut sorted: Vec<Self> = regions.into_iter().collect();
        sorted.sort();

        let mut iter = sorted.into_iter();
        let mut joined = iter.next().ok_or(RegionJoinError::Empty)?;

        for next in iter {
            let next_start = RightBound::at(&next.start);
            if joined.end == next_start {
                joined.end = next.end;
            } else if joined.end > next_start {
                return Err(RegionJoinError::Overlap {
                    left: joined,
                    right: next,
                });
            } else {
                return Err(RegionJoinError::Gap {
                    left: joined,
                    right: next,
                });
            }
        }

        Ok(joined)
    }
}

/// Returns the coarsest partition of the universe that respects the edges of
/// every input region.
///
/// Every input region is exactly the union of some of the returned pieces,
/// and pieces not covered by any input are returned too. Pieces are sorted.
pub fn refine<'a>(regions: impl IntoIterator<Item = &'a Region>) -> Vec<Region> {
    let mut edges: BTreeSet<Key> = BTreeSet::new();
    edges.insert(Bytes::new());
    for region in regions {
        edges.insert(region.start.clone());
        if let RightBound::Key(end) = &region.end {
            edges.insert(end.clone());
        }
    }

    let edges: Vec<Key> = edges.into_iter().collect();
    let mut pieces = Vec::with_capacity(edges.len());
    for window in edges.windows(2) {
        pieces.push(Region::bounded(window[0].clone(), window[1].clone()));
    }
    if let Some(last) = edges.last() {
        pieces.push(Region::from_key(last.clone()));
    }
    pieces
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[\"{}\", ", self.start.escape_ascii())?;
        match &self.end {
            RightBound::Key(end) => write!(f, "\"{}\")", end.escape_ascii()),
            RightBound::Unbounded => write!(f, "+inf)"),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Errors from joining regions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionJoinError {
    /// Nothing to join.
    #[error("cannot join an empty set of regions")]
    Empty,
    /// Two regions share keys.
    #[error("regions {left} and {right} overlap")]
    Overlap {
        /// The region joined so far.
        left: Region,
        /// The region overlapping it.
        right: Region,
    },
    /// Some keys between two regions are covered by neither.
    #[error("gap between {left} and {right}")]
    Gap {
        /// The region joined so far.
        left: Region,
        /// The next region to the right.
        right: Region,
    },
}
