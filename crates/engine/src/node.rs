use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use substrate::{Substrate, UnitConfig};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{HealthConfig, NodeConfig, PoolConfig};
use crate::pool::{PoolSettings, UnitPool};

/// One schedulable node: its unit pool plus live health and load state.
pub struct Node {
    pub id: String,
    pub pool: UnitPool,
    pub health: NodeHealth,
    substrate: Arc<dyn Substrate>,
    active: AtomicUsize,
}

impl Node {
    pub fn new(
        config: &NodeConfig,
        pool_config: &PoolConfig,
        health_config: &HealthConfig,
        substrate: Arc<dyn Substrate>,
    ) -> Self {
        let settings = PoolSettings {
            max_units: config.max_units.unwrap_or(pool_config.max_units_per_node),
            warm_idle_ttl: Duration::from_millis(pool_config.warm_idle_ttl_ms),
            max_unit_age: Duration::from_millis(pool_config.max_unit_age_ms),
        };
        Self {
            id: config.id.clone(),
            pool: UnitPool::new(config.id.clone(), Arc::clone(&substrate), settings),
            health: NodeHealth::new(health_config),
            substrate,
            active: AtomicUsize::new(0),
        }
    }

    /// Executions currently placed on this node.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn begin_execution(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_execution(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Create-and-destroy round trip against the substrate. Clears the
    /// degraded flag on success.
    pub async fn probe(&self) {
        let config = UnitConfig {
            id: Uuid::new_v4(),
            runtime: "health-probe".into(),
        };
        match self.substrate.create(config).await {
            Ok(unit) => {
                self.substrate.destroy(unit).await;
                if self.health.is_degraded() {
                    info!(node = %self.id, "health probe passed, clearing degraded state");
                }
                self.health.probe_succeeded();
            }
            Err(e) => {
                warn!(node = %self.id, error = %e, "health probe failed");
            }
        }
    }
}

/// Failure tracking for one node: an EWMA failure rate feeding the
/// scheduler score, and a setup-failure window that flips the node into
/// a degraded state excluded from scheduling until a probe clears it.
pub struct NodeHealth {
    alpha: f64,
    threshold: u32,
    window: Duration,
    failure_ewma: StdMutex<f64>,
    setup_failures: StdMutex<VecDeque<Instant>>,
    degraded: AtomicBool,
}

impl NodeHealth {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            alpha: config.failure_ewma_alpha,
            threshold: config.setup_failure_threshold,
            window: Duration::from_millis(config.failure_window_ms),
            failure_ewma: StdMutex::new(0.0),
            setup_failures: StdMutex::new(VecDeque::new()),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut ewma) = self.failure_ewma.lock() {
            *ewma *= 1.0 - self.alpha;
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut ewma) = self.failure_ewma.lock() {
            *ewma = *ewma * (1.0 - self.alpha) + self.alpha;
        }
    }

    /// A sandbox layer failed to apply on this node. Enough of these in
    /// the window marks the node degraded.
    pub fn record_setup_failure(&self) {
        self.record_failure();
        let now = Instant::now();
        let Ok(mut failures) = self.setup_failures.lock() else {
            return;
        };
        failures.push_back(now);
        while let Some(front) = failures.front() {
            if now.duration_since(*front) > self.window {
                failures.pop_front();
            } else {
                break;
            }
        }
        if failures.len() >= self.threshold as usize
            && !self.degraded.swap(true, Ordering::SeqCst)
        {
            warn!(
                failures = failures.len(),
                "node marked degraded after repeated sandbox setup failures"
            );
        }
    }

    pub fn probe_succeeded(&self) {
        self.degraded.store(false, Ordering::SeqCst);
        if let Ok(mut failures) = self.setup_failures.lock() {
            failures.clear();
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Recent failure rate in [0, 1].
    pub fn failure_rate(&self) -> f64 {
        self.failure_ewma.lock().map(|e| *e).unwrap_or(0.0)
    }
}
