use async_trait::async_trait;

use crate::config::UnitConfig;
use crate::error::Result;
use crate::unit::IsolationUnit;

/// Factory interface between the engine and the isolation backend.
/// Scheduling and supervision depend only on this trait, so the backend
/// (microVM, container, host process) is swappable.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Human-readable name for this substrate implementation (e.g. "proc").
    fn name(&self) -> &str;
    /// Content hash of all internal configuration that affects unit
    /// provisioning. Pooled units from substrates with different hashes
    /// are never interchangeable.
    fn profile_hash(&self) -> String;
    /// Initialize substrate resources. Must be called before `create()`.
    async fn startup(&mut self) -> Result<()>;
    /// Provision a new isolation unit.
    async fn create(&self, config: UnitConfig) -> Result<Box<dyn IsolationUnit>>;
    /// Tear down a unit, releasing all underlying resources.
    async fn destroy(&self, unit: Box<dyn IsolationUnit>);
    /// Release all substrate-level resources. Requires exclusive
    /// ownership — callers sharing via `Arc` must first recover it.
    async fn shutdown(&mut self);
}
