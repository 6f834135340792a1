use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One request to run untrusted code. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub tenant_id: String,
    pub workspace_id: String,
    pub workspace_type: WorkspaceType,
    /// Runtime profile name (must match a configured runtime command).
    pub runtime: String,
    pub source: SourcePayload,
    /// Path of the file handed to the runtime command, relative to the
    /// sandbox scratch root.
    pub entry_point: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub constraints: ExecutionConstraints,
    /// Artifact paths to read back from the scratch area after the run.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    /// Locality hint: preferred node id.
    #[serde(default)]
    pub affinity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceType {
    Ephemeral,
    Session,
    Persistent,
    Collaborative,
}

impl WorkspaceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::Session => "session",
            Self::Persistent => "persistent",
            Self::Collaborative => "collaborative",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SourcePayload {
    /// A single inline file.
    Inline { filename: String, code: String },
    /// An explicit file set.
    Files { files: Vec<SourceFile> },
    /// A gzipped tar archive unpacked into the scratch root.
    Archive { data: Vec<u8> },
    /// A repository cloned inside the unit during staging. Requires
    /// network-enabled constraints.
    GitRepository {
        url: String,
        #[serde(default)]
        reference: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// Declared limits. Unset fields fall back to the workspace tier default;
/// set fields are validated against the platform maxima.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConstraints {
    pub timeout_ms: Option<u64>,
    pub memory_mb: Option<u32>,
    /// CPU share in millicores (1000 = one core).
    pub cpu_millis: Option<u32>,
    pub disk_mb: Option<u32>,
    pub max_processes: Option<u32>,
    pub network_enabled: bool,
    /// Outbound destinations permitted when networking is enabled.
    /// Empty means any destination.
    pub network_allowlist: Vec<String>,
}

/// Pass/fail check evaluated against the captured output of a completed
/// execution. Cases do not re-run the program.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    #[serde(default)]
    pub expected_stdout: Option<String>,
    #[serde(default)]
    pub expected_exit_code: Option<i32>,
    /// Artifact that must exist among the collected outputs.
    #[serde(default)]
    pub required_artifact: Option<String>,
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    Killed,
    Crashed,
}

impl ExecutionStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timedOut",
            Self::Killed => "killed",
            Self::Crashed => "crashed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub node_id: String,
    pub status: ExecutionStatus,
    /// Present on normal exit; absent when the guest died to a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub artifacts: Vec<Artifact>,
    pub test_results: Vec<TestResult>,
    pub metrics: ExecutionMetrics,
}

/// A requested output file. `data` is `None` when the guest never
/// produced it; absence is reported, not fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub path: String,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTimings {
    pub queue_ms: u64,
    pub acquire_ms: u64,
    pub setup_ms: u64,
    pub run_ms: u64,
    pub cleanup_ms: u64,
}

/// Telemetry record for one execution, emitted exactly once per request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub phases: PhaseTimings,
    /// The serving unit was cold-provisioned for this request.
    pub cold_start: bool,
    pub cpu_ms: u64,
    pub peak_memory_bytes: u64,
    pub disk_bytes_written: u64,
    pub network_bytes: u64,
    pub context_switches: u64,
    pub page_faults: u64,
    pub policy_violations: u32,
    /// RFC3339 with millisecond precision.
    pub recorded_at: String,
}
