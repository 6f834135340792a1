use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use substrate::Substrate;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::isolation::{self, StagingLimits};
use crate::node::Node;
use crate::pool::ReleaseOutcome;
use crate::predictor::DemandEstimator;
use crate::scheduler::Scheduler;
use crate::supervisor;
use crate::telemetry::{
    PhaseClock, TelemetryCollector, TelemetryRecord, TelemetrySink, timestamp,
};
use crate::types::{ExecutionMetrics, ExecutionRequest, ExecutionResult, ExecutionStatus};
use crate::workspace::WorkspaceService;

/// The engine: accepts execution requests, produces exactly one
/// `ExecutionResult` (or typed failure) and exactly one telemetry record
/// per request, and runs the prewarm and node-health control loops.
pub struct Engine {
    core: Arc<EngineCore>,
    background: Vec<JoinHandle<()>>,
    telemetry_drain: JoinHandle<()>,
    shutdown: CancellationToken,
}

struct EngineCore {
    config: EngineConfig,
    nodes: Vec<Arc<Node>>,
    scheduler: Scheduler,
    workspace: Arc<dyn WorkspaceService>,
    telemetry: TelemetryCollector,
    predictor: DemandEstimator,
    active: tokio::sync::Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Engine {
    /// Build an engine over one substrate per configured node and start
    /// its control loops.
    pub fn start(
        config: EngineConfig,
        substrates: Vec<Arc<dyn Substrate>>,
        workspace: Arc<dyn WorkspaceService>,
        sink: Arc<dyn TelemetrySink>,
    ) -> EngineResult<Self> {
        config.validate()?;
        if substrates.len() != config.nodes.len() {
            return Err(EngineError::Internal(format!(
                "{} substrates for {} configured nodes",
                substrates.len(),
                config.nodes.len()
            )));
        }

        let nodes: Vec<Arc<Node>> = config
            .nodes
            .iter()
            .zip(substrates)
            .map(|(node_config, substrate)| {
                Arc::new(Node::new(
                    node_config,
                    &config.pool,
                    &config.health,
                    substrate,
                ))
            })
            .collect();

        let scheduler = Scheduler::new(nodes.clone(), config.scheduler.clone());
        let (telemetry, telemetry_drain) = TelemetryCollector::new(sink, config.telemetry.buffer);
        let predictor = DemandEstimator::new(config.pool.ewma_alpha);

        let core = Arc::new(EngineCore {
            config,
            nodes,
            scheduler,
            workspace,
            telemetry,
            predictor,
            active: tokio::sync::Mutex::new(HashMap::new()),
        });

        let shutdown = CancellationToken::new();
        let background = vec![
            spawn_prewarm_loop(Arc::clone(&core), shutdown.clone()),
            spawn_health_loop(Arc::clone(&core), shutdown.clone()),
        ];

        info!(nodes = core.nodes.len(), "engine started");
        Ok(Self {
            core,
            background,
            telemetry_drain,
            shutdown,
        })
    }

    /// Run one request to completion. Exactly one result (or typed
    /// failure) and one telemetry record come out of every call.
    pub async fn submit(&self, request: ExecutionRequest) -> EngineResult<ExecutionResult> {
        self.core.submit(request).await
    }

    /// Cancel a request by id. A running guest is force-terminated and
    /// reported as `Killed`. Returns false for unknown/finished requests.
    pub async fn cancel(&self, request_id: Uuid) -> bool {
        let active = self.core.active.lock().await;
        match active.get(&request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.core.nodes
    }

    /// Stop control loops, drain warm pools, and flush telemetry.
    pub async fn shutdown(self) {
        let Self {
            core,
            background,
            telemetry_drain,
            shutdown,
        } = self;

        shutdown.cancel();
        for task in background {
            let _ = task.await;
        }
        for node in &core.nodes {
            node.pool.drain().await;
        }

        // Dropping the collector closes the channel so the drain task
        // can finish flushing.
        match Arc::try_unwrap(core) {
            Ok(core) => drop(core),
            Err(_) => warn!("engine core still referenced at shutdown"),
        }
        let _ = telemetry_drain.await;
        info!("engine stopped");
    }
}

impl EngineCore {
    async fn submit(&self, request: ExecutionRequest) -> EngineResult<ExecutionResult> {
        let mut clock = PhaseClock::new();
        info!(
            request = %request.id,
            tenant = %request.tenant_id,
            runtime = %request.runtime,
            "execution request accepted"
        );
        self.predictor.record(&request.runtime);

        let cancel = CancellationToken::new();
        self.active.lock().await.insert(request.id, cancel.clone());
        let outcome = self.execute(&request, &mut clock, &cancel).await;
        self.active.lock().await.remove(&request.id);

        let (label, node_id, metrics) = match &outcome {
            Ok(result) => (
                result.status.label().to_string(),
                Some(result.node_id.clone()),
                result.metrics.clone(),
            ),
            Err(e) => (
                failure_label(e).to_string(),
                None,
                ExecutionMetrics {
                    phases: clock.phases(),
                    recorded_at: timestamp(),
                    ..Default::default()
                },
            ),
        };
        self.telemetry.emit(TelemetryRecord {
            request_id: request.id,
            tenant_id: request.tenant_id.clone(),
            runtime: request.runtime.clone(),
            node_id,
            outcome: label,
            metrics,
        });

        outcome
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        clock: &mut PhaseClock,
        cancel: &CancellationToken,
    ) -> EngineResult<ExecutionResult> {
        let runtime_command = self.config.runtimes.get(&request.runtime).ok_or_else(|| {
            EngineError::ConstraintViolation(format!("unsupported runtime: {}", request.runtime))
        })?;

        let tier = match self.workspace.tier_profile(request.workspace_type).await {
            Ok(tier) => tier,
            Err(e) => {
                warn!(request = %request.id, error = %e, "tier fetch failed, using built-in defaults");
                self.config.tiers.for_type(request.workspace_type).clone()
            }
        };
        let grant = allocator::resolve(request, &tier, &self.config.limits)?;
        let snapshot = self.workspace.fetch_snapshot(&request.workspace_id).await?;

        let staging = StagingLimits {
            timeout: Duration::from_millis(self.config.limits.staging_timeout_ms),
            max_output_bytes: grant.max_output_bytes,
        };
        let policy = isolation::build_policy(&grant);
        let command = runtime_command.command_for(&request.entry_point, &request.args);
        let stdin = request.stdin.as_ref().map(|s| s.as_bytes().to_vec());

        let mut rescheduled = false;
        loop {
            clock.begin_acquire();
            let placement = self
                .scheduler
                .place(&request.runtime, request.affinity.as_deref())
                .await?;
            clock.end_acquire();
            let node = placement.node;
            let lease = placement.lease;
            let cold = lease.is_cold();
            node.begin_execution();

            if let Err(e) = isolation::prepare(
                lease.unit(),
                &policy,
                request,
                snapshot.as_deref(),
                &staging,
            )
            .await
            {
                node.health.record_setup_failure();
                node.pool.release(lease, ReleaseOutcome::Dirty).await;
                node.end_execution();
                if !rescheduled {
                    rescheduled = true;
                    warn!(request = %request.id, node = %node.id, error = %e, "sandbox setup failed, retrying on another unit");
                    continue;
                }
                return Err(e);
            }
            clock.end_setup();

            let run = supervisor::supervise(
                lease.unit(),
                &command,
                stdin.as_deref(),
                &grant,
                cancel,
            )
            .await;
            clock.end_run();

            let run = match run {
                Ok(run) => run,
                Err(e) => {
                    node.health.record_failure();
                    node.pool.release(lease, ReleaseOutcome::Dirty).await;
                    node.end_execution();
                    return Err(e);
                }
            };

            let artifacts = supervisor::collect_artifacts(lease.unit(), &request.outputs).await;
            let stdout = String::from_utf8_lossy(&run.stdout).into_owned();
            let test_results = if run.status == ExecutionStatus::Completed {
                supervisor::evaluate_tests(&request.test_cases, run.exit_code, &stdout, &artifacts)
            } else {
                Vec::new()
            };

            let teardown_ok = isolation::teardown(lease.unit()).await.is_ok();
            let clean = run.status == ExecutionStatus::Completed
                && run.violations.is_empty()
                && teardown_ok;
            let release_outcome = if clean {
                ReleaseOutcome::Clean
            } else {
                ReleaseOutcome::Dirty
            };
            node.pool.release(lease, release_outcome).await;
            node.health.record_success();
            node.end_execution();
            clock.end_cleanup();

            let metrics = ExecutionMetrics {
                phases: clock.phases(),
                cold_start: cold,
                cpu_ms: run.usage.cpu_ms,
                peak_memory_bytes: run.usage.peak_memory_bytes,
                disk_bytes_written: run.usage.disk_bytes_written,
                network_bytes: run.usage.network_bytes,
                context_switches: run.usage.context_switches,
                page_faults: run.usage.page_faults,
                policy_violations: run.violations.len() as u32,
                recorded_at: timestamp(),
            };

            info!(
                request = %request.id,
                node = %node.id,
                status = run.status.label(),
                cold,
                "execution finished"
            );

            return Ok(ExecutionResult {
                request_id: request.id,
                node_id: node.id.clone(),
                status: run.status,
                exit_code: run.exit_code,
                stdout,
                stderr: String::from_utf8_lossy(&run.stderr).into_owned(),
                stdout_truncated: run.stdout_truncated,
                stderr_truncated: run.stderr_truncated,
                artifacts,
                test_results,
                metrics,
            });
        }
    }
}

fn failure_label(error: &EngineError) -> &'static str {
    match error {
        EngineError::ConstraintViolation(_) => "rejected:constraint",
        EngineError::SchedulingTimeout => "failed:schedulingTimeout",
        EngineError::NoAvailableCapacity => "failed:noCapacity",
        EngineError::PoolExhausted => "failed:poolExhausted",
        EngineError::SandboxSetupFailed(_) => "failed:sandboxSetup",
        EngineError::Workspace(_) => "failed:workspace",
        EngineError::Substrate(_) => "failed:substrate",
        EngineError::Io(_) => "failed:io",
        EngineError::Internal(_) => "failed:internal",
    }
}

fn spawn_prewarm_loop(core: Arc<EngineCore>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(core.config.pool.prewarm_interval_ms.max(100));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let estimates = core.predictor.tick();
                    let node_count = core.nodes.len().max(1) as f64;
                    for node in &core.nodes {
                        node.pool.maintain().await;
                        for (runtime, estimate) in &estimates {
                            let target = ((estimate * core.config.pool.safety_factor) / node_count)
                                .ceil() as usize;
                            node.pool
                                .prewarm(runtime, target.min(node.pool.max_units()))
                                .await;
                        }
                    }
                }
            }
        }
    })
}

fn spawn_health_loop(core: Arc<EngineCore>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(core.config.health.probe_interval_ms.max(100));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    for node in &core.nodes {
                        if node.health.is_degraded() {
                            node.probe().await;
                        }
                    }
                }
            }
        }
    })
}
