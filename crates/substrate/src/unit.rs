use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::policy::SandboxPolicy;
use crate::types::{ExecRequest, ProcessExit, SpawnHandle};

/// One isolated execution environment (microVM, container, or host
/// process boundary), provisioned by a [`crate::Substrate`] and reused
/// across executions until destroyed.
///
/// The `Any` bound allows `Substrate::destroy()` to downcast
/// `Box<dyn IsolationUnit>` back to the concrete type for backend-specific
/// cleanup.
#[async_trait]
pub trait IsolationUnit: Send + Sync + Any {
    // -- identity --
    fn id(&self) -> uuid::Uuid;
    /// Runtime profile this unit was provisioned for.
    fn runtime(&self) -> &str;

    // -- sandbox overlay --
    /// Apply a per-execution policy. Must be called before `spawn`/`exec`;
    /// a unit with no applied policy refuses to run anything.
    async fn apply_policy(&self, policy: &SandboxPolicy) -> Result<()>;
    /// Remove the current policy and wipe the scratch area.
    async fn clear_policy(&self) -> Result<()>;

    // -- file staging --
    /// Write a file into the scratch area. `path` is relative to the
    /// scratch root; parent directories are created as needed.
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;
    /// Read a file back from the scratch area.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    // -- execution --
    /// Run a short command to completion (staging helpers, probes).
    async fn exec(&self, request: &ExecRequest<'_>) -> Result<ProcessExit>;
    /// Start the guest process and return a handle for supervision.
    async fn spawn(&self, request: &ExecRequest<'_>) -> Result<SpawnHandle>;
    /// Wait for the process to exit, up to `timeout`. On expiry the
    /// substrate kills the process tree and reports `timed_out = true`.
    async fn wait_exit(&self, handle: SpawnHandle, timeout: Duration) -> Result<ProcessExit>;
    /// Force-terminate the process tree and reap it, returning partial
    /// output collected so far.
    async fn kill(&self, handle: SpawnHandle) -> Result<ProcessExit>;
}
