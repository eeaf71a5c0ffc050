//! Strongly-typed identifiers for strand entities.
//!
//! A server has one stable logical identity (`ServerId`) and a new connection
//! identity (`PeerId`) every time it reconnects. Mixing the two up is the
//! classic way to resurrect a stale peer, so they are distinct types.

use std::fmt;

/// Declares u64-backed identifier newtypes.
///
/// Every id prints as `prefix-N` and debugs as `prefix(N)`.
macro_rules! ids {
    ($($(#[$meta:meta])* $name:ident => $prefix:literal;)+) => {$(
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the id allocated after this one.
            ///
            /// # Panics
            /// Panics if the id space is exhausted.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    )+};
}

ids! {
    /// Logical identity of a server, stable across reconnections.
    ServerId => "server";
    /// Connection identity of a server, replaced on every reconnection.
    PeerId => "peer";
    /// One advertised replica activity in the directory.
    ActivityId => "activity";
    /// Identity a dispatcher presents when registering with a primary.
    ClientId => "client";
    /// Handle of an entry in the relationship registry.
    RelationshipId => "rel";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let server = ServerId::new(7);
        assert_eq!(format!("{server}"), "server-7");
        assert_eq!(format!("{server:?}"), "server(7)");

        let peer = PeerId::new(3);
        assert_eq!(format!("{peer}"), "peer-3");
    }

    #[test]
    fn test_id_next() {
        let id = RelationshipId::new(0);
        assert_eq!(id.next().get(), 1);
        assert_eq!(id.next().next().get(), 2);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let id = ActivityId::new(u64::MAX);
        let _ = id.next();
    }

    #[test]
    fn test_id_ordering() {
        let a = ClientId::new(1);
        let b = ClientId::new(2);
        assert!(a < b);
        assert_eq!(a, ClientId::from(1));
    }
}
