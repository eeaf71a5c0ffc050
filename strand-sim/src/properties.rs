//! Property checkers for simulation runs.

use std::collections::BTreeMap;

use strand_core::{ClientId, Region, RelationshipId};
use strand_routing::RelationshipRegistry;

use crate::replica::Observed;

/// A violated routing property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// A primary received a client's requests out of token order.
    OutOfOrder {
        /// The client whose requests were reordered.
        client: ClientId,
        /// Sequence that should have come next.
        expected: u64,
        /// Sequence that arrived.
        observed: u64,
    },
    /// Two registered relationships offer primaries for overlapping regions.
    OverlappingPrimaries {
        /// First relationship.
        first: RelationshipId,
        /// Second relationship.
        second: RelationshipId,
        /// Where they overlap.
        region: Region,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfOrder {
                client,
                expected,
                observed,
            } => write!(f, "{client}: expected sequence {expected}, observed {observed}"),
            Self::OverlappingPrimaries {
                first,
                second,
                region,
            } => write!(f, "{first} and {second} are both primary for {region}"),
        }
    }
}

impl std::error::Error for PropertyViolation {}

/// Checks that each client's requests arrived in issuance order with no gaps.
///
/// Sequences start at zero for every client, so this holds for the requests
/// of one connection.
///
/// # Errors
///
/// Returns the first out-of-order arrival.
pub fn check_submission_order(observed: &[Observed]) -> Result<(), PropertyViolation> {
    let mut next: BTreeMap<ClientId, u64> = BTreeMap::new();
    for request in observed {
        let expected = next.entry(request.client).or_insert(0);
        if request.sequence != *expected {
            return Err(PropertyViolation::OutOfOrder {
                client: request.client,
                expected: *expected,
                observed: request.sequence,
            });
        }
        *expected += 1;
    }
    Ok(())
}

/// Checks that no two registered primaries overlap.
///
/// # Errors
///
/// Returns the first overlapping pair.
pub fn check_single_primary(registry: &RelationshipRegistry) -> Result<(), PropertyViolation> {
    let primaries: Vec<_> = registry
        .snapshot()
        .into_iter()
        .filter(|(_, relationship)| relationship.primary.is_some())
        .collect();
    for (i, (first, a)) in primaries.iter().enumerate() {
        for (second, b) in &primaries[i + 1..] {
            if let Some(region) = a.region.intersection(&b.region) {
                return Err(PropertyViolation::OverlappingPrimaries {
                    first: *first,
                    second: *second,
                    region,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(client: u64, sequence: u64) -> Observed {
        Observed {
            client: ClientId::new(client),
            sequence,
            write: true,
        }
    }

    #[test]
    fn test_interleaved_clients_in_order() {
        let log = [request(1, 0), request(2, 0), request(1, 1), request(2, 1)];
        assert!(check_submission_order(&log).is_ok());
    }

    #[test]
    fn test_swap_detected() {
        let log = [request(1, 0), request(1, 2), request(1, 1)];
        assert_eq!(
            check_submission_order(&log),
            Err(PropertyViolation::OutOfOrder {
                client: ClientId::new(1),
                expected: 1,
                observed: 2,
            })
        );
    }
}
