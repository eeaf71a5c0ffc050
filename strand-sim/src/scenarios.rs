//! Reusable cluster layouts and workloads.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use rand::Rng;
use strand_core::{Key, Region, RightBound, ServerId};
use strand_flow::Interruptor;
use strand_routing::{QueryError, ReadQuery, ReadResponse, ShardingDispatcher, WriteQuery};
use tracing::{debug, warn};

use crate::cluster::{SimCluster, SimError};
use crate::replica::{ReplicaConfig, ReplicaServer};

/// Returns the `index`-th workload key.
#[must_use]
pub fn key(index: usize) -> Key {
    Bytes::from(format!("key-{index:06}"))
}

/// Splits the key space into `shards` regions holding roughly `keys / shards`
/// workload keys each.
///
/// # Panics
///
/// Panics if `shards` is zero.
#[must_use]
pub fn even_partition(shards: usize, keys: usize) -> Vec<Region> {
    assert!(shards > 0, "shards must be > 0");
    let mut bounds: Vec<Key> = (1..shards).map(|i| key(i * keys / shards)).collect();
    bounds.dedup();

    let mut regions = Vec::with_capacity(bounds.len() + 1);
    let mut start = Key::new();
    for bound in bounds {
        regions.push(Region::new(start, RightBound::Key(bound.clone())));
        start = bound;
    }
    regions.push(Region::new(start, RightBound::Unbounded));
    regions
}

/// One primary per region, each on its own server, all connected.
///
/// Servers are numbered from `first_server`.
///
/// # Errors
///
/// Propagates cluster errors; a freshly added server never fails.
pub fn sharded_primaries(
    cluster: &SimCluster,
    regions: &[Region],
    first_server: u64,
    tickets: Option<u64>,
) -> Result<Vec<(ServerId, ReplicaServer)>, SimError> {
    let mut replicas = Vec::with_capacity(regions.len());
    for (offset, region) in (0u64..).zip(regions) {
        let server = ServerId::new(first_server + offset);
        cluster.add_server(server, format!("replica-{}:29015", server.get()));
        let mut config = ReplicaConfig::primary(region.clone());
        if let Some(tickets) = tickets {
            config = config.with_tickets(tickets);
        }
        let replica = cluster.add_replica(server, config)?;
        let _ = cluster.connect(server);
        replicas.push((server, replica));
    }
    Ok(replicas)
}

/// A single workload step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Set a key.
    Set {
        /// Key written.
        key: Key,
        /// Value written.
        value: Bytes,
    },
    /// Read a key from its primary.
    Get {
        /// Key read.
        key: Key,
    },
    /// Read a key from any replica.
    GetOutdated {
        /// Key read.
        key: Key,
    },
    /// Count every key.
    Count,
}

/// Workload shape.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Number of distinct keys.
    pub keys: usize,
    /// Number of operations.
    pub operations: usize,
    /// Fraction of operations that are writes.
    pub write_ratio: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            keys: 100,
            operations: 1_000,
            write_ratio: 0.5,
        }
    }
}

/// Outcome counts of a workload run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadReport {
    /// Operations that completed.
    pub succeeded: u64,
    /// Operations that provably had no effect.
    pub failed: u64,
    /// Operations whose effect is unknown.
    pub indeterminate: u64,
    /// Primary reads that disagreed with the reference model.
    pub mismatches: u64,
}

/// A sequence of operations checked against a reference model.
#[derive(Debug, Clone)]
pub struct Workload {
    operations: Vec<Operation>,
}

impl Workload {
    /// Generates a random workload.
    pub fn generate(config: &WorkloadConfig, rng: &mut impl Rng) -> Self {
        let keys = config.keys.max(1);
        let operations = (0..config.operations)
            .map(|step| {
                let key = key(rng.gen_range(0..keys));
                if rng.gen_bool(config.write_ratio.clamp(0.0, 1.0)) {
                    Operation::Set {
                        key,
                        value: Bytes::from(format!("value-{step}")),
                    }
                } else {
                    match rng.gen_range(0..10) {
                        0 => Operation::Count,
                        1..=3 => Operation::GetOutdated { key },
                        _ => Operation::Get { key },
                    }
                }
            })
            .collect();
        Self { operations }
    }

    /// Returns the operations in order.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Runs every operation in order through `dispatcher`.
    ///
    /// Keys touched by an indeterminate write are no longer checked.
    pub async fn run(&self, dispatcher: &ShardingDispatcher, interruptor: &Interruptor) -> WorkloadReport {
        let mut report = WorkloadReport::default();
        let mut model: BTreeMap<Key, Bytes> = BTreeMap::new();
        let mut uncertain: BTreeSet<Key> = BTreeSet::new();

        for operation in &self.operations {
            match operation {
                Operation::Set { key, value } => {
                    let outcome = dispatcher
                        .write(WriteQuery::set(key.clone(), value.clone()), interruptor)
                        .await;
                    match outcome {
                        Ok(_) => {
                            model.insert(key.clone(), value.clone());
                            report.succeeded += 1;
                        }
                        Err(err) => {
                            if err.is_indeterminate() {
                                uncertain.insert(key.clone());
                            }
                            record_failure(&mut report, &err);
                        }
                    }
                }
                Operation::Get { key } => {
                    match dispatcher.read(ReadQuery::get(key.clone()), interruptor).await {
                        Ok(ReadResponse::Get { value }) => {
                            report.succeeded += 1;
                            if !uncertain.contains(key) && value.as_ref() != model.get(key) {
                                warn!(key = ?key, "Read disagrees with reference model");
                                report.mismatches += 1;
                            }
                        }
                        Ok(_) => report.mismatches += 1,
                        Err(err) => record_failure(&mut report, &err),
                    }
                }
                Operation::GetOutdated { key } => {
                    match dispatcher
                        .read_outdated(ReadQuery::get(key.clone()), interruptor)
                        .await
                    {
                        Ok(_) => report.succeeded += 1,
                        Err(err) => record_failure(&mut report, &err),
                    }
                }
                Operation::Count => {
                    match dispatcher.read(ReadQuery::count(Region::universe()), interruptor).await {
                        Ok(ReadResponse::Count { count }) => {
                            report.succeeded += 1;
                            if uncertain.is_empty() && count != model.len() as u64 {
                                report.mismatches += 1;
                            }
                        }
                        Ok(_) => report.mismatches += 1,
                        Err(err) => record_failure(&mut report, &err),
                    }
                }
            }
        }
        report
    }
}

fn record_failure(report: &mut WorkloadReport, err: &QueryError) {
    debug!(error = %err, "Operation did not succeed");
    if err.is_indeterminate() {
        report.indeterminate += 1;
    } else {
        report.failed += 1;
    }
}
