use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use substrate::{IsolationUnit, Substrate, UnitConfig};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Lifecycle state of a pooled unit. A unit is in exactly one state at a
/// time; `Dirty` never transitions back to `Warm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Creation in flight; the slot is reserved against the node ceiling.
    Cold,
    /// Provisioned and idle, ready for immediate acquisition.
    Warm,
    /// Leased to one execution.
    Acquired,
    /// Returned unclean; queued for destruction.
    Dirty,
    /// Being torn down.
    Destroying,
}

/// How a unit comes back from an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Process exited normally, no policy violation, overlay torn down.
    Clean,
    /// Anything else. The unit is destroyed, never reused.
    Dirty,
}

/// Sizing and staleness bounds for one node's pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_units: usize,
    pub warm_idle_ttl: Duration,
    pub max_unit_age: Duration,
}

/// Exclusive lease on one unit, handed out by [`UnitPool::acquire`].
///
/// Must be passed to exactly one [`UnitPool::release`] call. Move
/// semantics make double release impossible; dropping a lease without
/// releasing it routes the unit to destruction on the next maintenance
/// pass and logs the leak.
pub struct UnitLease {
    id: Uuid,
    runtime: String,
    cold: bool,
    created_at: Instant,
    unit: Option<Box<dyn IsolationUnit>>,
    leaked: Arc<StdMutex<Vec<Box<dyn IsolationUnit>>>>,
}

impl std::fmt::Debug for UnitLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitLease")
            .field("id", &self.id)
            .field("runtime", &self.runtime)
            .field("cold", &self.cold)
            .field("created_at", &self.created_at)
            .field("released", &self.unit.is_none())
            .finish()
    }
}

impl UnitLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// The unit was cold-provisioned for this acquisition.
    pub fn is_cold(&self) -> bool {
        self.cold
    }

    pub fn unit(&self) -> &dyn IsolationUnit {
        match &self.unit {
            Some(unit) => unit.as_ref(),
            None => unreachable!("lease used after release"),
        }
    }
}

impl Drop for UnitLease {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            warn!(unit = %self.id, "unit lease dropped without release; scheduling destruction");
            if let Ok(mut leaked) = self.leaked.lock() {
                leaked.push(unit);
            }
        }
    }
}

struct WarmUnit {
    unit: Box<dyn IsolationUnit>,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState {
    units: HashMap<Uuid, UnitState>,
    /// Per-runtime FIFO of warm units, oldest first, to bound idle age.
    free: HashMap<String, VecDeque<WarmUnit>>,
    /// All known units, including reserved in-flight creations.
    total: usize,
}

/// Pool counts for scheduling decisions and tests.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub warm: HashMap<String, usize>,
    pub total: usize,
    pub in_use: usize,
    pub max_units: usize,
}

/// One node's pool of isolation units. All mutation goes through
/// `acquire`/`release`/`prewarm`/`maintain`, serialized by a single lock;
/// pools on different nodes act independently.
pub struct UnitPool {
    node_id: String,
    substrate: Arc<dyn Substrate>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    leaked: Arc<StdMutex<Vec<Box<dyn IsolationUnit>>>>,
}

enum AcquireStep {
    Reuse(WarmUnit),
    Create(Uuid),
    Evict(Box<dyn IsolationUnit>),
}

impl UnitPool {
    pub fn new(node_id: String, substrate: Arc<dyn Substrate>, settings: PoolSettings) -> Self {
        Self {
            node_id,
            substrate,
            settings,
            state: Mutex::new(PoolState {
                units: HashMap::new(),
                free: HashMap::new(),
                total: 0,
            }),
            leaked: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Lease a unit for `runtime`: a warm one when available (FIFO),
    /// otherwise a cold-provisioned one. The caller suspends on cold
    /// provisioning. Fails with [`EngineError::PoolExhausted`] when the
    /// node is at its unit ceiling and nothing can be freed.
    pub async fn acquire(&self, runtime: &str) -> EngineResult<UnitLease> {
        loop {
            let step = {
                let mut state = self.state.lock().await;
                if let Some(warm) = state
                    .free
                    .get_mut(runtime)
                    .and_then(|queue| queue.pop_front())
                {
                    let id = warm.unit.id();
                    if let Some(unit_state) = state.units.get_mut(&id) {
                        *unit_state = UnitState::Acquired;
                    }
                    AcquireStep::Reuse(warm)
                } else if state.total < self.settings.max_units {
                    let id = Uuid::new_v4();
                    state.total += 1;
                    state.units.insert(id, UnitState::Cold);
                    AcquireStep::Create(id)
                } else if let Some(victim) = pop_oldest_warm(&mut state) {
                    AcquireStep::Evict(victim)
                } else {
                    return Err(EngineError::PoolExhausted);
                }
            };

            match step {
                AcquireStep::Reuse(warm) => {
                    debug!(node = %self.node_id, unit = %warm.unit.id(), runtime, "warm unit acquired");
                    return Ok(self.lease(warm.unit, false, warm.created_at));
                }
                AcquireStep::Create(id) => return self.cold_create(id, runtime).await,
                AcquireStep::Evict(victim) => {
                    info!(node = %self.node_id, unit = %victim.id(), "evicting idle unit to free capacity");
                    self.destroy_unit(victim, UnitState::Destroying).await;
                }
            }
        }
    }

    async fn cold_create(&self, id: Uuid, runtime: &str) -> EngineResult<UnitLease> {
        let created = self
            .substrate
            .create(UnitConfig {
                id,
                runtime: runtime.to_string(),
            })
            .await;

        let mut state = self.state.lock().await;
        match created {
            Ok(unit) => {
                if let Some(unit_state) = state.units.get_mut(&id) {
                    *unit_state = UnitState::Acquired;
                }
                drop(state);
                debug!(node = %self.node_id, unit = %id, runtime, "cold unit acquired");
                Ok(self.lease(unit, true, Instant::now()))
            }
            Err(e) => {
                state.units.remove(&id);
                state.total -= 1;
                drop(state);
                warn!(node = %self.node_id, runtime, error = %e, "cold provisioning failed");
                Err(EngineError::Substrate(e))
            }
        }
    }

    fn lease(&self, unit: Box<dyn IsolationUnit>, cold: bool, created_at: Instant) -> UnitLease {
        UnitLease {
            id: unit.id(),
            runtime: unit.runtime().to_string(),
            cold,
            created_at,
            unit: Some(unit),
            leaked: Arc::clone(&self.leaked),
        }
    }

    /// Return a leased unit. Clean outcomes within the age bound go back
    /// to the warm list; everything else is destroyed and the slot freed.
    pub async fn release(&self, mut lease: UnitLease, outcome: ReleaseOutcome) {
        let Some(unit) = lease.unit.take() else {
            return;
        };
        let id = lease.id;
        let now = Instant::now();
        let expired = lease.created_at.elapsed() >= self.settings.max_unit_age;
        let reusable = matches!(outcome, ReleaseOutcome::Clean) && !expired;

        let to_destroy = {
            let mut state = self.state.lock().await;
            if reusable {
                if let Some(unit_state) = state.units.get_mut(&id) {
                    *unit_state = UnitState::Warm;
                }
                state
                    .free
                    .entry(lease.runtime.clone())
                    .or_default()
                    .push_back(WarmUnit {
                        unit,
                        created_at: lease.created_at,
                        idle_since: now,
                    });
                None
            } else {
                Some(unit)
            }
        };

        if let Some(unit) = to_destroy {
            let terminal = if matches!(outcome, ReleaseOutcome::Dirty) {
                UnitState::Dirty
            } else {
                UnitState::Destroying
            };
            info!(node = %self.node_id, unit = %id, ?outcome, expired, "unit destroyed on release");
            self.destroy_unit(unit, terminal).await;
        } else {
            debug!(node = %self.node_id, unit = %id, "unit returned warm");
        }
    }

    /// Mark the unit's terminal state, destroy it on the substrate, then
    /// free its slot against the node ceiling.
    async fn destroy_unit(&self, unit: Box<dyn IsolationUnit>, terminal: UnitState) {
        let id = unit.id();
        {
            let mut state = self.state.lock().await;
            if let Some(unit_state) = state.units.get_mut(&id) {
                *unit_state = terminal;
            }
        }
        self.substrate.destroy(unit).await;
        let mut state = self.state.lock().await;
        if state.units.remove(&id).is_some() {
            state.total -= 1;
        }
    }

    /// Converge the warm count for `runtime` toward `target`, bounded by
    /// the node ceiling. Creates missing units one at a time and destroys
    /// surplus ones oldest-first.
    pub async fn prewarm(&self, runtime: &str, target: usize) {
        loop {
            enum Step {
                Create(Uuid),
                Destroy(Box<dyn IsolationUnit>),
            }

            let step = {
                let mut state = self.state.lock().await;
                let warm = state.free.get(runtime).map_or(0, VecDeque::len);
                if warm < target && state.total < self.settings.max_units {
                    let id = Uuid::new_v4();
                    state.total += 1;
                    state.units.insert(id, UnitState::Cold);
                    Step::Create(id)
                } else if warm > target {
                    match state
                        .free
                        .get_mut(runtime)
                        .and_then(|queue| queue.pop_front())
                    {
                        Some(surplus) => Step::Destroy(surplus.unit),
                        None => break,
                    }
                } else {
                    break;
                }
            };

            match step {
                Step::Create(id) => {
                    let created = self
                        .substrate
                        .create(UnitConfig {
                            id,
                            runtime: runtime.to_string(),
                        })
                        .await;
                    let mut state = self.state.lock().await;
                    match created {
                        Ok(unit) => {
                            if let Some(unit_state) = state.units.get_mut(&id) {
                                *unit_state = UnitState::Warm;
                            }
                            state
                                .free
                                .entry(runtime.to_string())
                                .or_default()
                                .push_back(WarmUnit {
                                    unit,
                                    created_at: Instant::now(),
                                    idle_since: Instant::now(),
                                });
                            debug!(node = %self.node_id, unit = %id, runtime, "unit prewarmed");
                        }
                        Err(e) => {
                            state.units.remove(&id);
                            state.total -= 1;
                            drop(state);
                            warn!(node = %self.node_id, runtime, error = %e, "prewarm create failed");
                            break;
                        }
                    }
                }
                Step::Destroy(unit) => {
                    debug!(node = %self.node_id, unit = %unit.id(), runtime, "destroying surplus warm unit");
                    self.destroy_unit(unit, UnitState::Destroying).await;
                }
            }
        }
    }

    /// Periodic upkeep: destroy leaked units and expire stale warm ones.
    pub async fn maintain(&self) {
        let leaked: Vec<Box<dyn IsolationUnit>> = match self.leaked.lock() {
            Ok(mut list) => list.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for unit in leaked {
            warn!(node = %self.node_id, unit = %unit.id(), "destroying leaked unit");
            self.destroy_unit(unit, UnitState::Dirty).await;
        }

        let expired = {
            let mut state = self.state.lock().await;
            let mut expired = Vec::new();
            let ttl = self.settings.warm_idle_ttl;
            let max_age = self.settings.max_unit_age;
            for queue in state.free.values_mut() {
                while let Some(front) = queue.front() {
                    if front.idle_since.elapsed() >= ttl || front.created_at.elapsed() >= max_age {
                        if let Some(stale) = queue.pop_front() {
                            expired.push(stale.unit);
                        }
                    } else {
                        break;
                    }
                }
            }
            expired
        };

        for unit in expired {
            info!(node = %self.node_id, unit = %unit.id(), "destroying stale warm unit");
            self.destroy_unit(unit, UnitState::Destroying).await;
        }
    }

    /// Destroy every warm unit. Leased units drain through their releases.
    pub async fn drain(&self) {
        let warm = {
            let mut state = self.state.lock().await;
            let mut warm = Vec::new();
            for queue in state.free.values_mut() {
                warm.extend(queue.drain(..).map(|w| w.unit));
            }
            warm
        };
        for unit in warm {
            self.destroy_unit(unit, UnitState::Destroying).await;
        }
        self.maintain().await;
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().await;
        let warm: HashMap<String, usize> = state
            .free
            .iter()
            .map(|(runtime, queue)| (runtime.clone(), queue.len()))
            .collect();
        let warm_total: usize = warm.values().sum();
        PoolSnapshot {
            warm,
            total: state.total,
            in_use: state.total.saturating_sub(warm_total),
            max_units: self.settings.max_units,
        }
    }

    /// Current lifecycle state of a unit, if the pool still knows it.
    pub async fn unit_state(&self, id: Uuid) -> Option<UnitState> {
        self.state.lock().await.units.get(&id).copied()
    }

    pub fn max_units(&self) -> usize {
        self.settings.max_units
    }
}

/// Pop the globally oldest idle warm unit. The caller destroys it and
/// frees its slot.
fn pop_oldest_warm(state: &mut PoolState) -> Option<Box<dyn IsolationUnit>> {
    let oldest_runtime = state
        .free
        .iter()
        .filter_map(|(runtime, queue)| queue.front().map(|w| (runtime.clone(), w.idle_since)))
        .min_by_key(|(_, idle_since)| *idle_since)
        .map(|(runtime, _)| runtime)?;
    let warm = state.free.get_mut(&oldest_runtime)?.pop_front()?;
    Some(warm.unit)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::testutil::MockSubstrate;

    use super::*;

    fn settings(max_units: usize) -> PoolSettings {
        PoolSettings {
            max_units,
            warm_idle_ttl: Duration::from_secs(300),
            max_unit_age: Duration::from_secs(3600),
        }
    }

    fn pool_with(substrate: Arc<MockSubstrate>, max_units: usize) -> UnitPool {
        UnitPool::new("test-node".into(), substrate, settings(max_units))
    }

    #[tokio::test]
    async fn acquire_prefers_warm_units_fifo() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = pool_with(Arc::clone(&substrate), 4);

        pool.prewarm("python", 2).await;
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.warm.get("python"), Some(&2));

        let first = pool.acquire("python").await.unwrap();
        assert!(!first.is_cold());
        assert_eq!(
            pool.unit_state(first.id()).await,
            Some(UnitState::Acquired)
        );

        // FIFO: the oldest warm unit goes out first.
        let second = pool.acquire("python").await.unwrap();
        assert!(!second.is_cold());
        assert_ne!(first.id(), second.id());

        pool.release(first, ReleaseOutcome::Clean).await;
        pool.release(second, ReleaseOutcome::Clean).await;
    }

    #[tokio::test]
    async fn acquire_cold_provisions_when_no_warm_unit() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = pool_with(Arc::clone(&substrate), 4);

        let lease = pool.acquire("python").await.unwrap();
        assert!(lease.is_cold());
        assert_eq!(substrate.created_count(), 1);
        pool.release(lease, ReleaseOutcome::Clean).await;
    }

    #[tokio::test]
    async fn clean_release_reinserts_for_reuse() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = pool_with(Arc::clone(&substrate), 4);

        let lease = pool.acquire("python").await.unwrap();
        let id = lease.id();
        pool.release(lease, ReleaseOutcome::Clean).await;
        assert_eq!(pool.unit_state(id).await, Some(UnitState::Warm));

        let again = pool.acquire("python").await.unwrap();
        assert_eq!(again.id(), id);
        assert!(!again.is_cold());
        pool.release(again, ReleaseOutcome::Clean).await;
    }

    #[tokio::test]
    async fn dirty_release_destroys_and_never_reuses() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = pool_with(Arc::clone(&substrate), 4);

        let lease = pool.acquire("python").await.unwrap();
        let dirty_id = lease.id();
        pool.release(lease, ReleaseOutcome::Dirty).await;

        assert!(substrate.destroyed_ids().contains(&dirty_id));
        assert_eq!(pool.unit_state(dirty_id).await, None);

        let next = pool.acquire("python").await.unwrap();
        assert_ne!(next.id(), dirty_id);
        assert!(next.is_cold());
        pool.release(next, ReleaseOutcome::Clean).await;
    }

    #[tokio::test]
    async fn pool_exhausted_when_all_units_leased() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = pool_with(Arc::clone(&substrate), 2);

        let a = pool.acquire("python").await.unwrap();
        let b = pool.acquire("python").await.unwrap();

        let err = pool.acquire("python").await.unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted));

        pool.release(a, ReleaseOutcome::Clean).await;
        pool.release(b, ReleaseOutcome::Clean).await;
    }

    #[tokio::test]
    async fn at_capacity_an_idle_other_runtime_unit_is_evicted() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = pool_with(Arc::clone(&substrate), 2);

        pool.prewarm("node", 2).await;
        let lease = pool.acquire("python").await.unwrap();
        assert!(lease.is_cold());

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.warm.get("node").copied().unwrap_or(0), 1);
        pool.release(lease, ReleaseOutcome::Clean).await;
    }

    #[tokio::test]
    async fn concurrent_acquires_never_share_a_unit() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = Arc::new(pool_with(Arc::clone(&substrate), 16));
        pool.prewarm("python", 4).await;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..12 {
            let pool = Arc::clone(&pool);
            tasks.spawn(async move {
                let lease = pool.acquire("python").await.unwrap();
                let id = lease.id();
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.release(lease, ReleaseOutcome::Clean).await;
                id
            });
        }

        let mut completions = 0;
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
            completions += 1;
        }
        assert_eq!(completions, 12);

        // Ownership transfer makes aliasing impossible; what remains
        // observable is that every lease came back.
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.in_use, 0);
        assert!(snapshot.total <= 16);
    }

    #[tokio::test]
    async fn prewarm_converges_down_as_well_as_up() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = pool_with(Arc::clone(&substrate), 8);

        pool.prewarm("python", 4).await;
        assert_eq!(pool.snapshot().await.warm["python"], 4);

        pool.prewarm("python", 1).await;
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.warm["python"], 1);
        assert_eq!(snapshot.total, 1);
        assert_eq!(substrate.destroyed_ids().len(), 3);
    }

    #[tokio::test]
    async fn prewarm_respects_the_node_ceiling() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = pool_with(Arc::clone(&substrate), 3);

        pool.prewarm("python", 10).await;
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.warm["python"], 3);
        assert_eq!(snapshot.total, 3);
    }

    #[tokio::test]
    async fn maintain_expires_idle_units() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = UnitPool::new(
            "test-node".into(),
            substrate.clone(),
            PoolSettings {
                max_units: 4,
                warm_idle_ttl: Duration::from_millis(20),
                max_unit_age: Duration::from_secs(3600),
            },
        );

        pool.prewarm("python", 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.maintain().await;

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.warm.get("python").copied().unwrap_or(0), 0);
        assert_eq!(snapshot.total, 0);
        assert_eq!(substrate.destroyed_ids().len(), 2);
    }

    #[tokio::test]
    async fn aged_out_units_are_destroyed_on_clean_release() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = UnitPool::new(
            "test-node".into(),
            substrate.clone(),
            PoolSettings {
                max_units: 4,
                warm_idle_ttl: Duration::from_secs(300),
                max_unit_age: Duration::from_millis(10),
            },
        );

        let lease = pool.acquire("python").await.unwrap();
        let id = lease.id();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.release(lease, ReleaseOutcome::Clean).await;

        assert!(substrate.destroyed_ids().contains(&id));
        assert_eq!(pool.snapshot().await.total, 0);
    }

    #[tokio::test]
    async fn dropped_lease_is_reclaimed_by_maintain() {
        let substrate = Arc::new(MockSubstrate::new());
        let pool = pool_with(Arc::clone(&substrate), 4);

        let lease = pool.acquire("python").await.unwrap();
        let id = lease.id();
        drop(lease);

        pool.maintain().await;
        assert!(substrate.destroyed_ids().contains(&id));
        assert_eq!(pool.snapshot().await.total, 0);
    }

    #[tokio::test]
    async fn failed_cold_creation_frees_the_reserved_slot() {
        let substrate = Arc::new(MockSubstrate::new());
        substrate.fail_next_creates(1);
        let pool = pool_with(Arc::clone(&substrate), 1);

        let err = pool.acquire("python").await.unwrap_err();
        assert!(matches!(err, EngineError::Substrate(_)));

        // The slot is free again.
        let lease = pool.acquire("python").await.unwrap();
        pool.release(lease, ReleaseOutcome::Clean).await;
    }
}
