//! Sharding dispatcher - fans queries out to the replicas that own them.
//!
//! A dispatch goes through four phases:
//!
//! 1. **Plan**: snapshot the registry, refine the candidates' regions into
//!    disjoint pieces, and pick exactly one relationship for every piece the
//!    query touches. Consistency failures (no primary, two primaries) are
//!    detected here, before anything is sent.
//! 2. **Issue**: take one ordering token per target, in the caller's task, so
//!    per-primary submission order follows dispatch order.
//! 3. **Fan out**: run every sub-query concurrently, each interrupted by the
//!    caller or by its relationship draining.
//! 4. **Aggregate**: any indeterminate shard makes the whole query
//!    indeterminate; otherwise any failed shard makes it failed; otherwise the
//!    responses are merged.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use rand::Rng;
use strand_core::{refine, Region, RelationshipId, RightBound};
use strand_flow::{DrainLock, DrainToken, Interrupted, Interruptor};
use tracing::{debug, warn};

use crate::access::{PrimaryAccess, StaleReadAccess};
use crate::error::{AccessError, QueryError, QueryResult, QueryState};
use crate::query::{ReadQuery, ReadResponse, Shardable, WriteQuery, WriteResponse};
use crate::registry::{Relationship, RelationshipRegistry};

/// Default bound on concurrently running sub-queries.
pub const FANOUT_MAX_DEFAULT: usize = 64;

/// Configuration for the sharding dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum sub-queries in flight per dispatch.
    pub fanout_max: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fanout_max: FANOUT_MAX_DEFAULT,
        }
    }
}

/// How much of the table must be reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadinessLevel {
    /// Every key has at least one replica accepting outdated reads.
    OutdatedReads,
    /// The primaries partition the key space.
    Reads,
    /// The primaries partition the key space.
    Writes,
}

/// The current partition of the key space among primaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingScheme {
    /// Sorted, disjoint regions whose union is the universe.
    regions: Vec<Region>,
}

impl ShardingScheme {
    /// Returns the regions in key order.
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Returns the number of shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns true if there are no shards. Never true for a valid scheme.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Returns the shard holding `key`.
    #[must_use]
    pub fn region_for_key(&self, key: &[u8]) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains_key(key))
    }
}

/// A relationship offering a particular kind of handle.
struct Candidate<H: ?Sized> {
    id: RelationshipId,
    region: Region,
    is_local: bool,
    drain: Arc<DrainLock>,
    handle: Arc<H>,
}

/// One sub-query bound to the relationship that will run it.
struct Target<H: ?Sized, Q> {
    id: RelationshipId,
    handle: Arc<H>,
    query: Q,
    keepalive: DrainToken,
}

/// Splits queries by region and dispatches them to replicas.
pub struct ShardingDispatcher {
    registry: Arc<RelationshipRegistry>,
    config: DispatcherConfig,
}

impl ShardingDispatcher {
    /// Creates a dispatcher over `registry`.
    ///
    /// # Panics
    ///
    /// Panics if `config.fanout_max` is zero.
    #[must_use]
    pub fn new(registry: Arc<RelationshipRegistry>, config: DispatcherConfig) -> Self {
        assert!(config.fanout_max > 0, "fanout_max must be > 0");
        Self { registry, config }
    }

    /// Returns the registry this dispatcher reads.
    #[must_use]
    pub const fn registry(&self) -> &Arc<RelationshipRegistry> {
        &self.registry
    }

    /// Performs a read against the primaries.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Interrupted` if the interruptor fires, a routing
    /// error if some touched region lacks exactly one primary, or
    /// `QueryError::CannotPerformQuery` if a shard fails.
    pub async fn read(&self, query: ReadQuery, interruptor: &Interruptor) -> QueryResult<ReadResponse> {
        let targets = self.plan(&query, self.primaries(), choose_primary)?;
        let calls: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let token = target.handle.new_read_token();
                let sub = interruptor.clone().with(target.keepalive.draining_signal());
                async move {
                    let _keepalive = target.keepalive;
                    let outcome = target.handle.read(target.query, token, &sub).await;
                    (target.id, outcome)
                }
            })
            .collect();

        let outcomes = self.fan_out(calls).await;
        aggregate(&query, outcomes, interruptor, QueryState::Failed)
    }

    /// Performs a write against the primaries.
    ///
    /// # Errors
    ///
    /// Same as [`ShardingDispatcher::read`]. A shard whose primary goes away
    /// mid-request makes the whole write `Indeterminate`.
    pub async fn write(&self, query: WriteQuery, interruptor: &Interruptor) -> QueryResult<WriteResponse> {
        let targets = self.plan(&query, self.primaries(), choose_primary)?;
        let calls: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let token = target.handle.new_write_token();
                let sub = interruptor.clone().with(target.keepalive.draining_signal());
                async move {
                    let _keepalive = target.keepalive;
                    let outcome = target.handle.write(target.query, token, &sub).await;
                    (target.id, outcome)
                }
            })
            .collect();

        let outcomes = self.fan_out(calls).await;
        aggregate(&query, outcomes, interruptor, QueryState::Indeterminate)
    }

    /// Performs a read that may observe outdated data.
    ///
    /// A replica in this process is preferred; otherwise one is picked at
    /// random per region.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Interrupted` if the interruptor fires,
    /// `QueryError::NoReplicaForRegion` if some touched region has no
    /// replica, or `QueryError::CannotPerformQuery` if a shard fails.
    pub async fn read_outdated(
        &self,
        query: ReadQuery,
        interruptor: &Interruptor,
    ) -> QueryResult<ReadResponse> {
        let targets = self.plan(&query, self.stale_readers(), choose_stale_reader)?;
        let calls: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let sub = interruptor.clone().with(target.keepalive.draining_signal());
                async move {
                    let _keepalive = target.keepalive;
                    let outcome = target.handle.read_outdated(target.query, &sub).await;
                    (target.id, outcome)
                }
            })
            .collect();

        let outcomes = self.fan_out(calls).await;
        aggregate(&query, outcomes, interruptor, QueryState::Failed)
    }

    /// Returns the current partition of the key space among primaries.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::SchemeUnavailable` unless the primaries' regions
    /// cover the universe exactly once.
    pub fn get_sharding_scheme(&self) -> QueryResult<ShardingScheme> {
        let mut regions: Vec<Region> = self
            .primaries()
            .into_iter()
            .map(|candidate| candidate.region)
            .collect();
        regions.sort();

        match Region::join(regions.iter().cloned()) {
            Ok(joined) if joined.is_universe() => Ok(ShardingScheme { regions }),
            Ok(joined) => Err(QueryError::SchemeUnavailable {
                reason: format!("primaries only cover {joined}"),
            }),
            Err(err) => Err(QueryError::SchemeUnavailable {
                reason: err.to_string(),
            }),
        }
    }

    /// Returns true if `level` is currently reached.
    #[must_use]
    pub fn is_ready(&self, level: ReadinessLevel) -> bool {
        match level {
            ReadinessLevel::OutdatedReads => {
                let regions: Vec<Region> = self
                    .stale_readers()
                    .into_iter()
                    .map(|candidate| candidate.region)
                    .collect();
                refine(&regions)
                    .iter()
                    .all(|piece| regions.iter().any(|region| region.contains(piece)))
            }
            ReadinessLevel::Reads | ReadinessLevel::Writes => self.get_sharding_scheme().is_ok(),
        }
    }

    /// Waits until `level` is reached.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if the interruptor fires first.
    pub async fn check_readiness(
        &self,
        level: ReadinessLevel,
        interruptor: &Interruptor,
    ) -> Result<(), Interrupted> {
        let mut changes = self.registry.subscribe();
        loop {
            if self.is_ready(level) {
                return Ok(());
            }
            if interruptor.run(changes.changed()).await?.is_err() {
                // The registry is gone; nothing will ever change again.
                interruptor.fired().await;
                return Err(Interrupted);
            }
        }
    }

    fn primaries(&self) -> Vec<Candidate<dyn PrimaryAccess>> {
        self.registry
            .snapshot()
            .into_iter()
            .filter_map(|(id, rel)| {
                let handle = Arc::clone(rel.primary.as_ref()?);
                Some(candidate(id, &rel, handle))
            })
            .collect()
    }

    fn stale_readers(&self) -> Vec<Candidate<dyn StaleReadAccess>> {
        self.registry
            .snapshot()
            .into_iter()
            .filter_map(|(id, rel)| {
                let handle = Arc::clone(rel.stale_reader.as_ref()?);
                Some(candidate(id, &rel, handle))
            })
            .collect()
    }

    /// Binds every piece of `query` to one candidate.
    ///
    /// Adjacent pieces bound to the same candidate are merged so that each
    /// relationship receives at most one sub-query per contiguous run.
    fn plan<H: ?Sized, Q: Shardable>(
        &self,
        query: &Q,
        candidates: Vec<Candidate<H>>,
        mut choose: impl FnMut(&Region, &[&Candidate<H>]) -> QueryResult<usize>,
    ) -> QueryResult<Vec<Target<H, Q>>> {
        let pieces = refine(candidates.iter().map(|c| &c.region));

        let mut runs: Vec<(usize, Region)> = Vec::new();
        for piece in pieces {
            if query.shard(&piece).is_none() {
                continue;
            }
            let covering: Vec<&Candidate<H>> = candidates
                .iter()
                .filter(|c| c.region.contains(&piece))
                .collect();
            let chosen = choose(&piece, &covering)?;
            let index = candidates
                .iter()
                .position(|c| c.id == covering[chosen].id)
                .unwrap_or_default();

            let adjacent = matches!(
                runs.last(),
                Some((last, region))
                    if *last == index && *region.end() == RightBound::Key(piece.start().clone())
            );
            if adjacent {
                if let Some((_, region)) = runs.last_mut() {
                    *region = Region::new(region.start().clone(), piece.end().clone());
                }
            } else {
                runs.push((index, piece));
            }
        }

        let mut targets = Vec::with_capacity(runs.len());
        for (index, region) in runs {
            let candidate = &candidates[index];
            let Some(sub) = query.shard(&region) else {
                continue;
            };
            let keepalive = candidate
                .drain
                .lock()
                .map_err(|_| QueryError::CannotPerformQuery {
                    reason: format!("relationship {} for {region} is shutting down", candidate.id),
                    state: QueryState::Failed,
                })?;
            targets.push(Target {
                id: candidate.id,
                handle: Arc::clone(&candidate.handle),
                query: sub,
                keepalive,
            });
        }
        debug!(targets = targets.len(), "Planned dispatch");
        Ok(targets)
    }

    async fn fan_out<R, F>(&self, calls: Vec<F>) -> Vec<(RelationshipId, Result<R, AccessError>)>
    where
        F: Future<Output = (RelationshipId, Result<R, AccessError>)>,
    {
        let mut outcomes: Vec<(usize, (RelationshipId, Result<R, AccessError>))> =
            stream::iter(
                calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, call)| async move { (i, call.await) }),
            )
            .buffer_unordered(self.config.fanout_max)
            .collect()
            .await;
        outcomes.sort_by_key(|(i, _)| *i);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

impl std::fmt::Debug for ShardingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardingDispatcher")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

fn candidate<H: ?Sized>(id: RelationshipId, rel: &Relationship, handle: Arc<H>) -> Candidate<H> {
    Candidate {
        id,
        region: rel.region.clone(),
        is_local: rel.is_local,
        drain: Arc::clone(&rel.drain),
        handle,
    }
}

fn choose_primary(
    piece: &Region,
    covering: &[&Candidate<dyn PrimaryAccess>],
) -> QueryResult<usize> {
    match covering.len() {
        0 => Err(QueryError::NoPrimaryForRegion {
            region: piece.clone(),
        }),
        1 => Ok(0),
        count => {
            warn!(region = %piece, count, "Multiple primaries claim region");
            Err(QueryError::AmbiguousPrimaryForRegion {
                region: piece.clone(),
                count,
            })
        }
    }
}

fn choose_stale_reader(
    piece: &Region,
    covering: &[&Candidate<dyn StaleReadAccess>],
) -> QueryResult<usize> {
    if covering.is_empty() {
        return Err(QueryError::NoReplicaForRegion {
            region: piece.clone(),
        });
    }
    if let Some(local) = covering.iter().position(|c| c.is_local) {
        return Ok(local);
    }
    Ok(rand::thread_rng().gen_range(0..covering.len()))
}

/// Classifies per-shard outcomes and merges the successes.
///
/// `lost` is the state assigned to a shard whose replica went away
/// mid-request: indeterminate for writes, failed for reads.
fn aggregate<Q: Shardable>(
    query: &Q,
    outcomes: Vec<(RelationshipId, Result<Q::Response, AccessError>)>,
    interruptor: &Interruptor,
    lost: QueryState,
) -> QueryResult<Q::Response> {
    if interruptor.is_fired() {
        return Err(QueryError::Interrupted);
    }

    let mut responses = Vec::with_capacity(outcomes.len());
    let mut failed: Option<String> = None;
    let mut indeterminate: Option<String> = None;
    for (id, outcome) in outcomes {
        match outcome {
            Ok(response) => responses.push(response),
            Err(err) => {
                let state = match &err {
                    AccessError::QueryFailed { state, .. } => *state,
                    AccessError::Interrupted | AccessError::ResourceLost => lost,
                };
                debug!(relationship = %id, %state, error = %err, "Shard failed");
                let slot = match state {
                    QueryState::Failed => &mut failed,
                    QueryState::Indeterminate => &mut indeterminate,
                };
                slot.get_or_insert_with(|| format!("{id}: {err}"));
            }
        }
    }

    if let Some(reason) = indeterminate {
        return Err(QueryError::CannotPerformQuery {
            reason,
            state: QueryState::Indeterminate,
        });
    }
    if let Some(reason) = failed {
        return Err(QueryError::CannotPerformQuery {
            reason,
            state: QueryState::Failed,
        });
    }
    Ok(query.unshard(responses))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use strand_core::Key;
    use strand_flow::{CancellationToken, FifoSource, ReadToken, WriteToken};

    use super::*;
    use crate::registry::Registration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Script {
        Succeed,
        Reject(QueryState),
        Lose,
        /// Waits until interrupted.
        Hang,
    }

    struct MockReplica {
        source: FifoSource,
        script: Script,
        writes: Mutex<Vec<WriteQuery>>,
        reads: AtomicU64,
    }

    impl MockReplica {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                source: FifoSource::new(),
                script,
                writes: Mutex::new(Vec::new()),
                reads: AtomicU64::new(0),
            })
        }

        async fn outcome<R>(&self, ok: R, interruptor: &Interruptor) -> Result<R, AccessError> {
            match self.script {
                Script::Succeed => Ok(ok),
                Script::Reject(state) => Err(AccessError::QueryFailed {
                    reason: "rejected".to_string(),
                    state,
                }),
                Script::Lose => Err(AccessError::ResourceLost),
                Script::Hang => {
                    interruptor.fired().await;
                    Err(AccessError::Interrupted)
                }
            }
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PrimaryAccess for MockReplica {
        fn new_read_token(&self) -> ReadToken {
            self.source.new_read_token()
        }

        fn new_write_token(&self) -> WriteToken {
            self.source.new_write_token()
        }

        async fn read(
            &self,
            query: ReadQuery,
            token: ReadToken,
            interruptor: &Interruptor,
        ) -> Result<ReadResponse, AccessError> {
            self.source.sink().enter(token, interruptor).await?.end();
            self.read_outdated(query, interruptor).await
        }

        async fn write(
            &self,
            query: WriteQuery,
            token: WriteToken,
            interruptor: &Interruptor,
        ) -> Result<WriteResponse, AccessError> {
            self.source.sink().enter(token, interruptor).await?.end();
            let written = match &query {
                WriteQuery::Set { pairs } => pairs.len() as u64,
                WriteQuery::Delete { .. } => 0,
            };
            self.writes.lock().unwrap().push(query);
            self.outcome(WriteResponse::Set { written }, interruptor).await
        }
    }

    #[async_trait]
    impl StaleReadAccess for MockReplica {
        async fn read_outdated(
            &self,
            _query: ReadQuery,
            interruptor: &Interruptor,
        ) -> Result<ReadResponse, AccessError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.outcome(ReadResponse::Count { count: 1 }, interruptor).await
        }
    }

    fn primary(
        registry: &Arc<RelationshipRegistry>,
        region: Region,
        replica: &Arc<MockReplica>,
    ) -> Registration {
        let handle: Arc<dyn PrimaryAccess> = Arc::clone(replica) as _;
        registry.register(Relationship::new(region, false).with_primary(handle))
    }

    fn stale(
        registry: &Arc<RelationshipRegistry>,
        region: Region,
        is_local: bool,
        replica: &Arc<MockReplica>,
    ) -> Registration {
        let handle: Arc<dyn StaleReadAccess> = Arc::clone(replica) as _;
        registry.register(Relationship::new(region, is_local).with_stale_reader(handle))
    }

    fn three_way_write() -> WriteQuery {
        WriteQuery::Set {
            pairs: vec![
                (Key::from("a"), Bytes::from("1")),
                (Key::from("k"), Bytes::from("2")),
                (Key::from("x"), Bytes::from("3")),
            ],
        }
    }

    fn three_shards() -> [Region; 3] {
        [
            Region::bounded("", "h"),
            Region::bounded("h", "p"),
            Region::from_key("p"),
        ]
    }

    async fn write_with_scripts(scripts: [Script; 3]) -> QueryResult<WriteResponse> {
        let registry = RelationshipRegistry::new();
        let replicas: Vec<_> = scripts.iter().map(|s| MockReplica::new(*s)).collect();
        let _guards: Vec<_> = three_shards()
            .into_iter()
            .zip(&replicas)
            .map(|(region, replica)| primary(&registry, region, replica))
            .collect();

        let dispatcher = ShardingDispatcher::new(registry, DispatcherConfig::default());
        dispatcher.write(three_way_write(), &Interruptor::never()).await
    }

    #[tokio::test]
    async fn test_aggregation_precedence() {
        use Script::{Lose, Reject, Succeed};

        let all_ok = write_with_scripts([Succeed, Succeed, Succeed]).await;
        assert_eq!(all_ok, Ok(WriteResponse::Set { written: 3 }));

        let one_failed = write_with_scripts([Succeed, Succeed, Reject(QueryState::Failed)]).await;
        assert_eq!(one_failed.unwrap_err().state(), QueryState::Failed);

        for scripts in [
            [Succeed, Reject(QueryState::Failed), Lose],
            [Lose, Succeed, Reject(QueryState::Failed)],
            [Reject(QueryState::Failed), Reject(QueryState::Indeterminate), Succeed],
        ] {
            let err = write_with_scripts(scripts).await.unwrap_err();
            assert_eq!(err.state(), QueryState::Indeterminate, "scripts {scripts:?}");
        }
    }

    #[tokio::test]
    async fn test_lost_read_is_failed() {
        let registry = RelationshipRegistry::new();
        let replica = MockReplica::new(Script::Lose);
        let _guard = primary(&registry, Region::universe(), &replica);
        let dispatcher = ShardingDispatcher::new(registry, DispatcherConfig::default());

        let err = dispatcher
            .read(ReadQuery::count(Region::universe()), &Interruptor::never())
            .await
            .unwrap_err();
        assert_eq!(err.state(), QueryState::Failed);
    }

    #[tokio::test]
    async fn test_missing_primary_fails_before_sending() {
        let registry = RelationshipRegistry::new();
        let left = MockReplica::new(Script::Succeed);
        let _guard = primary(&registry, Region::bounded("", "m"), &left);
        let dispatcher = ShardingDispatcher::new(registry, DispatcherConfig::default());

        let err = dispatcher
            .write(three_way_write(), &Interruptor::never())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::NoPrimaryForRegion {
                region: Region::from_key("m")
            }
        );
        assert_eq!(err.state(), QueryState::Failed);
        assert_eq!(left.write_count(), 0);

        // A write confined to the covered region still goes through.
        let ok = dispatcher
            .write(WriteQuery::set("b", "v"), &Interruptor::never())
            .await;
        assert_eq!(ok, Ok(WriteResponse::Set { written: 1 }));
    }

    #[tokio::test]
    async fn test_ambiguous_primary() {
        let registry = RelationshipRegistry::new();
        let a = MockReplica::new(Script::Succeed);
        let b = MockReplica::new(Script::Succeed);
        let _ga = primary(&registry, Region::bounded("", "m"), &a);
        let _gb = primary(&registry, Region::bounded("f", "z"), &b);
        let dispatcher = ShardingDispatcher::new(registry, DispatcherConfig::default());

        let err = dispatcher
            .write(WriteQuery::set("g", "v"), &Interruptor::never())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::AmbiguousPrimaryForRegion {
                region: Region::bounded("f", "m"),
                count: 2,
            }
        );
        assert_eq!(a.write_count() + b.write_count(), 0);

        // Keys outside the overlap are unaffected.
        assert!(dispatcher
            .write(WriteQuery::set("b", "v"), &Interruptor::never())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_pieces_merge_into_one_sub_query() {
        let registry = RelationshipRegistry::new();
        let wide = MockReplica::new(Script::Succeed);
        let reader = MockReplica::new(Script::Succeed);
        let _gw = primary(&registry, Region::universe(), &wide);
        // Adds an edge at "m" without adding a primary.
        let _gr = stale(&registry, Region::bounded("a", "m"), false, &reader);
        let dispatcher = ShardingDispatcher::new(registry, DispatcherConfig::default());

        dispatcher
            .write(three_way_write(), &Interruptor::never())
            .await
            .unwrap();
        assert_eq!(wide.write_count(), 1);
    }

    #[tokio::test]
    async fn test_sharding_scheme() {
        let registry = RelationshipRegistry::new();
        let replica = MockReplica::new(Script::Succeed);
        let dispatcher = ShardingDispatcher::new(Arc::clone(&registry), DispatcherConfig::default());

        assert!(dispatcher.get_sharding_scheme().is_err());

        let left = primary(&registry, Region::bounded("", "m"), &replica);
        assert!(matches!(
            dispatcher.get_sharding_scheme(),
            Err(QueryError::SchemeUnavailable { .. })
        ));

        let _right = primary(&registry, Region::from_key("m"), &replica);
        let scheme = dispatcher.get_sharding_scheme().unwrap();
        assert_eq!(scheme.len(), 2);
        assert_eq!(scheme.region_for_key(b"q"), Some(&Region::from_key("m")));
        assert!(dispatcher.is_ready(ReadinessLevel::Writes));

        let _overlap = primary(&registry, Region::bounded("a", "c"), &replica);
        assert!(dispatcher.get_sharding_scheme().is_err());

        drop(left);
        assert!(!dispatcher.is_ready(ReadinessLevel::Reads));
    }

    #[tokio::test]
    async fn test_outdated_read_prefers_local() {
        let registry = RelationshipRegistry::new();
        let remote = MockReplica::new(Script::Succeed);
        let local = MockReplica::new(Script::Succeed);
        let _gr = stale(&registry, Region::universe(), false, &remote);
        let _gl = stale(&registry, Region::universe(), true, &local);
        let dispatcher = ShardingDispatcher::new(registry, DispatcherConfig::default());

        for _ in 0..10 {
            dispatcher
                .read_outdated(ReadQuery::get("k"), &Interruptor::never())
                .await
                .unwrap();
        }
        assert_eq!(local.reads.load(Ordering::SeqCst), 10);
        assert_eq!(remote.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_outdated_read_spreads_over_remotes() {
        let registry = RelationshipRegistry::new();
        let first = MockReplica::new(Script::Succeed);
        let second = MockReplica::new(Script::Succeed);
        let _g1 = stale(&registry, Region::universe(), false, &first);
        let _g2 = stale(&registry, Region::universe(), false, &second);
        let dispatcher = ShardingDispatcher::new(registry, DispatcherConfig::default());

        for _ in 0..64 {
            dispatcher
                .read_outdated(ReadQuery::get("k"), &Interruptor::never())
                .await
                .unwrap();
        }
        let (a, b) = (
            first.reads.load(Ordering::SeqCst),
            second.reads.load(Ordering::SeqCst),
        );
        assert_eq!(a + b, 64);
        assert!(a > 0 && b > 0, "reads split {a}/{b}");
    }

    #[tokio::test]
    async fn test_outdated_read_without_replica() {
        let registry = RelationshipRegistry::new();
        let replica = MockReplica::new(Script::Succeed);
        let _guard = stale(&registry, Region::bounded("", "m"), false, &replica);
        let dispatcher = ShardingDispatcher::new(registry, DispatcherConfig::default());

        assert!(!dispatcher.is_ready(ReadinessLevel::OutdatedReads));
        let err = dispatcher
            .read_outdated(ReadQuery::count(Region::universe()), &Interruptor::never())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::NoReplicaForRegion { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_draining_relationship_makes_write_indeterminate() {
        let registry = RelationshipRegistry::new();
        let replica = MockReplica::new(Script::Hang);
        let guard = primary(&registry, Region::universe(), &replica);
        let drain = Arc::clone(&guard.relationship().drain);
        let dispatcher = Arc::new(ShardingDispatcher::new(registry, DispatcherConfig::default()));

        let write = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .write(WriteQuery::set("k", "v"), &Interruptor::never())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        drop(guard);
        drain.drain().await;
        let err = write.await.unwrap().unwrap_err();
        assert!(err.is_indeterminate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_interrupt() {
        let registry = RelationshipRegistry::new();
        let replica = MockReplica::new(Script::Hang);
        let _guard = primary(&registry, Region::universe(), &replica);
        let dispatcher = Arc::new(ShardingDispatcher::new(registry, DispatcherConfig::default()));

        let signal = CancellationToken::new();
        let read = {
            let dispatcher = Arc::clone(&dispatcher);
            let interruptor = Interruptor::new(signal.clone());
            tokio::spawn(async move { dispatcher.read(ReadQuery::get("k"), &interruptor).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        signal.cancel();
        assert_eq!(read.await.unwrap(), Err(QueryError::Interrupted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_readiness_waits_for_registration() {
        let registry = RelationshipRegistry::new();
        let replica = MockReplica::new(Script::Succeed);
        let dispatcher = Arc::new(ShardingDispatcher::new(
            Arc::clone(&registry),
            DispatcherConfig::default(),
        ));

        let waiter = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .check_readiness(ReadinessLevel::Writes, &Interruptor::never())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        let _guard = primary(&registry, Region::universe(), &replica);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }
}
