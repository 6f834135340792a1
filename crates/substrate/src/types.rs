use std::time::Duration;

use crate::policy::PolicyViolation;

/// One command to run inside a unit's sandbox.
pub struct ExecRequest<'a> {
    /// Program and arguments. Never interpreted by a shell.
    pub command: &'a [String],
    /// Bytes written to the process's stdin before it is closed.
    pub stdin: Option<&'a [u8]>,
    pub env: &'a [(String, String)],
    /// Wall-clock budget. The substrate kills the process tree on expiry.
    pub timeout: Duration,
    /// Per-stream capture cap. Output beyond this is discarded, not buffered.
    pub max_output_bytes: usize,
}

/// Handle to a spawned process inside a unit. Valid until the matching
/// `wait_exit` or `kill` call reaps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnHandle {
    pub pid: u32,
}

/// Terminal state of a supervised process.
#[derive(Debug)]
pub struct ProcessExit {
    /// Present on normal exit, absent when the process died to a signal.
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// The substrate killed the process tree because the exec timeout fired.
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub usage: ResourceUsage,
    /// Operations the sandbox policy denied during this execution.
    pub violations: Vec<PolicyViolation>,
}

/// Raw resource counters for one execution, best-effort per substrate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_ms: u64,
    pub peak_memory_bytes: u64,
    pub disk_bytes_written: u64,
    pub network_bytes: u64,
    pub context_switches: u64,
    pub page_faults: u64,
}
