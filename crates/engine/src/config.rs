use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::WorkspaceType;

pub(crate) const DEFAULT_MAX_UNITS: usize = 8;
pub(crate) const DEFAULT_SCHEDULING_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub nodes: Vec<NodeConfig>,
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub limits: PlatformLimits,
    pub tiers: TierProfiles,
    pub runtimes: HashMap<String, RuntimeCommand>,
    pub telemetry: TelemetryConfig,
    pub health: HealthConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nodes: vec![NodeConfig {
                id: "local".into(),
                max_units: None,
            }],
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            limits: PlatformLimits::default(),
            tiers: TierProfiles::default(),
            runtimes: default_runtimes(),
            telemetry: TelemetryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    /// Per-node unit ceiling. Falls back to `pool.max_units_per_node`.
    #[serde(default)]
    pub max_units: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_units_per_node: usize,
    /// Idle TTL for warm units; exceeding it forces destruction.
    pub warm_idle_ttl_ms: u64,
    /// Absolute unit age ceiling, clean or not.
    pub max_unit_age_ms: u64,
    /// Prewarm control-loop period.
    pub prewarm_interval_ms: u64,
    /// Warm-target multiplier absorbing demand bursts. Must be >= 1.
    pub safety_factor: f64,
    /// Smoothing factor of the per-runtime demand estimator.
    pub ewma_alpha: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_units_per_node: DEFAULT_MAX_UNITS,
            warm_idle_ttl_ms: 120_000,
            max_unit_age_ms: 900_000,
            prewarm_interval_ms: 2_000,
            safety_factor: 1.5,
            ewma_alpha: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub scheduling_timeout_ms: u64,
    pub warm_weight: f64,
    pub headroom_weight: f64,
    pub failure_weight: f64,
    pub affinity_weight: f64,
    /// Scores within this distance count as tied; ties break toward the
    /// node with fewer in-flight executions.
    pub tie_epsilon: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduling_timeout_ms: DEFAULT_SCHEDULING_TIMEOUT_MS,
            warm_weight: 4.0,
            headroom_weight: 2.0,
            failure_weight: 3.0,
            affinity_weight: 1.0,
            tie_epsilon: 0.01,
        }
    }
}

/// Platform-enforced maxima. Requests declaring more are rejected before
/// scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformLimits {
    pub max_timeout_ms: u64,
    pub max_memory_mb: u32,
    pub max_cpu_millis: u32,
    pub max_disk_mb: u32,
    pub max_processes: u32,
    /// Per-stream stdout/stderr capture cap.
    pub max_output_bytes: usize,
    /// Wall-clock budget for staging steps (snapshot unpack, git clone).
    pub staging_timeout_ms: u64,
}

impl Default for PlatformLimits {
    fn default() -> Self {
        Self {
            max_timeout_ms: 300_000,
            max_memory_mb: 8192,
            max_cpu_millis: 4000,
            max_disk_mb: 10_240,
            max_processes: 256,
            max_output_bytes: 1 << 20,
            staging_timeout_ms: 60_000,
        }
    }
}

/// Workspace-tier default limits, increasing across the four tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierProfiles {
    pub ephemeral: TierProfile,
    pub session: TierProfile,
    pub persistent: TierProfile,
    pub collaborative: TierProfile,
}

impl TierProfiles {
    pub fn for_type(&self, workspace_type: WorkspaceType) -> &TierProfile {
        match workspace_type {
            WorkspaceType::Ephemeral => &self.ephemeral,
            WorkspaceType::Session => &self.session,
            WorkspaceType::Persistent => &self.persistent,
            WorkspaceType::Collaborative => &self.collaborative,
        }
    }
}

impl Default for TierProfiles {
    fn default() -> Self {
        Self {
            ephemeral: TierProfile {
                timeout_ms: 30_000,
                memory_mb: 512,
                cpu_millis: 1000,
                disk_mb: 512,
                max_processes: 16,
            },
            session: TierProfile {
                timeout_ms: 60_000,
                memory_mb: 1024,
                cpu_millis: 2000,
                disk_mb: 1024,
                max_processes: 32,
            },
            persistent: TierProfile {
                timeout_ms: 120_000,
                memory_mb: 2048,
                cpu_millis: 2000,
                disk_mb: 4096,
                max_processes: 64,
            },
            collaborative: TierProfile {
                timeout_ms: 300_000,
                memory_mb: 4096,
                cpu_millis: 4000,
                disk_mb: 8192,
                max_processes: 128,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierProfile {
    pub timeout_ms: u64,
    pub memory_mb: u32,
    pub cpu_millis: u32,
    pub disk_mb: u32,
    pub max_processes: u32,
}

/// Command template for one runtime. `{entry}` expands to the request's
/// entry point; request args are appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl RuntimeCommand {
    pub fn command_for(&self, entry_point: &str, extra_args: &[String]) -> Vec<String> {
        let mut command = Vec::with_capacity(1 + self.args.len() + extra_args.len());
        command.push(self.program.clone());
        for arg in &self.args {
            command.push(arg.replace("{entry}", entry_point));
        }
        command.extend(extra_args.iter().cloned());
        command
    }
}

fn default_runtimes() -> HashMap<String, RuntimeCommand> {
    HashMap::from([
        (
            "python".into(),
            RuntimeCommand {
                program: "python3".into(),
                args: vec!["{entry}".into()],
            },
        ),
        (
            "node".into(),
            RuntimeCommand {
                program: "node".into(),
                args: vec!["{entry}".into()],
            },
        ),
        (
            "shell".into(),
            RuntimeCommand {
                program: "/bin/sh".into(),
                args: vec!["{entry}".into()],
            },
        ),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Bounded local buffer between the request path and the sink task.
    pub buffer: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { buffer: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Setup failures within the window that mark a node degraded.
    pub setup_failure_threshold: u32,
    pub failure_window_ms: u64,
    pub probe_interval_ms: u64,
    /// Smoothing factor of the per-node failure-rate estimator.
    pub failure_ewma_alpha: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            setup_failure_threshold: 3,
            failure_window_ms: 60_000,
            probe_interval_ms: 30_000,
            failure_ewma_alpha: 0.2,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::Internal("config: no nodes defined".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(EngineError::Internal(format!(
                    "config: duplicate node id {}",
                    node.id
                )));
            }
            if node.max_units == Some(0) {
                return Err(EngineError::Internal(format!(
                    "config: node {} has zero max_units",
                    node.id
                )));
            }
        }
        if self.pool.max_units_per_node == 0 {
            return Err(EngineError::Internal(
                "config: max_units_per_node must be positive".into(),
            ));
        }
        if self.pool.safety_factor < 1.0 {
            return Err(EngineError::Internal(
                "config: safety_factor must be >= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pool.ewma_alpha) {
            return Err(EngineError::Internal(
                "config: ewma_alpha must be in [0, 1]".into(),
            ));
        }
        if self.runtimes.is_empty() {
            return Err(EngineError::Internal(
                "config: no runtimes configured".into(),
            ));
        }
        Ok(())
    }
}

/// Load and validate an engine config from a YAML file.
pub async fn load(path: &Path) -> EngineResult<EngineConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Internal(format!("read {}: {e}", path.display())))?;
    let config: EngineConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| EngineError::Internal(format!("parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Write a config as YAML to `path`.
pub async fn generate(config: &EngineConfig, path: &Path) -> EngineResult<()> {
    let content = serde_yaml_ng::to_string(config)
        .map_err(|e| EngineError::Internal(format!("serialize config: {e}")))?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| EngineError::Internal(format!("write {}: {e}", path.display())))?;
    Ok(())
}
