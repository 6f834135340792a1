use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::error::{EngineError, EngineResult};
use crate::node::Node;
use crate::pool::{PoolSnapshot, UnitLease};

/// The scheduler's decision for one request: the chosen node and the
/// unit leased from it. Consumed once.
pub struct Placement {
    pub node: Arc<Node>,
    pub lease: UnitLease,
}

impl std::fmt::Debug for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Placement")
            .field("node", &self.node.id)
            .field("lease", &self.lease)
            .finish()
    }
}

/// Scores nodes from their live state (warm availability, headroom,
/// failure rate, affinity) and acquires a unit from the winner, with one
/// rescheduling attempt against the remaining candidates.
pub struct Scheduler {
    nodes: Vec<Arc<Node>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(nodes: Vec<Arc<Node>>, config: SchedulerConfig) -> Self {
        Self { nodes, config }
    }

    pub async fn place(&self, runtime: &str, affinity: Option<&str>) -> EngineResult<Placement> {
        let candidates = self.rank(runtime, affinity).await;
        if candidates.is_empty() {
            return Err(EngineError::NoAvailableCapacity);
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.scheduling_timeout_ms);
        let mut all_exhausted = true;

        // The best candidate plus one rescheduling attempt. Acquisition
        // runs as a task so an abandoned attempt still finishes and its
        // unit flows back to the pool instead of leaking.
        for (attempt, node) in candidates.iter().take(2).enumerate() {
            let task_node = Arc::clone(node);
            let task_runtime = runtime.to_string();
            let mut task = tokio::spawn(async move {
                let acquired = task_node.pool.acquire(&task_runtime).await;
                (acquired, task_node)
            });

            match tokio::time::timeout_at(deadline, &mut task).await {
                Err(_) => {
                    tokio::spawn(async move {
                        if let Ok((Ok(lease), orphan_node)) = task.await {
                            debug!(node = %orphan_node.id, "acquisition outlived its request, returning unit");
                            orphan_node
                                .pool
                                .release(lease, crate::pool::ReleaseOutcome::Clean)
                                .await;
                        }
                    });
                    return Err(EngineError::SchedulingTimeout);
                }
                Ok(Ok((Ok(lease), _))) => {
                    debug!(node = %node.id, runtime, attempt, cold = lease.is_cold(), "request placed");
                    return Ok(Placement {
                        node: Arc::clone(node),
                        lease,
                    });
                }
                Ok(Ok((Err(EngineError::PoolExhausted), _))) => {
                    debug!(node = %node.id, attempt, "node pool exhausted");
                }
                Ok(Ok((Err(e), _))) => {
                    all_exhausted = false;
                    node.health.record_failure();
                    warn!(node = %node.id, attempt, error = %e, "unit acquisition failed, rescheduling");
                }
                Ok(Err(e)) => {
                    all_exhausted = false;
                    warn!(node = %node.id, attempt, error = %e, "acquisition task failed");
                }
            }
        }

        if all_exhausted {
            Err(EngineError::PoolExhausted)
        } else {
            Err(EngineError::NoAvailableCapacity)
        }
    }

    /// Candidate nodes, best first. Degraded nodes are excluded; scores
    /// within `tie_epsilon` of the leader are reordered by current load.
    async fn rank(&self, runtime: &str, affinity: Option<&str>) -> Vec<Arc<Node>> {
        let mut scored: Vec<(f64, usize, Arc<Node>)> = Vec::new();
        for node in &self.nodes {
            if node.health.is_degraded() {
                continue;
            }
            let snapshot = node.pool.snapshot().await;
            let score = self.score(node, &snapshot, runtime, affinity);
            scored.push((score, node.active(), Arc::clone(node)));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(best) = scored.first().map(|(score, _, _)| *score) {
            let tied = scored
                .iter()
                .take_while(|(score, _, _)| best - score <= self.config.tie_epsilon)
                .count();
            scored[..tied].sort_by_key(|(_, active, _)| *active);
        }

        scored.into_iter().map(|(_, _, node)| node).collect()
    }

    fn score(
        &self,
        node: &Node,
        snapshot: &PoolSnapshot,
        runtime: &str,
        affinity: Option<&str>,
    ) -> f64 {
        let max = snapshot.max_units.max(1) as f64;
        let warm = snapshot.warm.get(runtime).copied().unwrap_or(0) as f64;
        let warm_score = if warm > 0.0 {
            0.5 + 0.5 * (warm / max).min(1.0)
        } else {
            0.0
        };
        let headroom = 1.0 - (snapshot.total as f64 / max).min(1.0);
        let reliability = 1.0 - node.health.failure_rate();
        let affinity_score = if affinity == Some(node.id.as_str()) {
            1.0
        } else {
            0.0
        };

        self.config.warm_weight * warm_score
            + self.config.headroom_weight * headroom
            + self.config.failure_weight * reliability
            + self.config.affinity_weight * affinity_score
    }
}
