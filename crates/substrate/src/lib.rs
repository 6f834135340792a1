mod config;
mod error;
mod policy;
mod substrate;
mod types;
mod unit;

pub use config::UnitConfig;
pub use error::{Result, SubstrateError};
pub use policy::{
    NetworkPolicy, OperationClass, OperationFilter, PolicyViolation, SandboxPolicy,
};
pub use substrate::Substrate;
pub use types::{ExecRequest, ProcessExit, ResourceUsage, SpawnHandle};
pub use unit::IsolationUnit;
