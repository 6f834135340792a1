//! Process-level implementation of the isolation capability interface.
//!
//! Each unit is a scratch directory on the host; guest processes run as
//! direct children in their own process group with rlimit ceilings from
//! the applied sandbox policy. Network isolation is best-effort
//! (`unshare(CLONE_NEWNET)` when the host permits it). Intended for
//! development, tests, and single-tenant hosts; multi-tenant production
//! deployments use a microVM substrate behind the same interface.

mod config;
mod factory;
mod limits;
mod paths;
mod unit;

pub use config::ProcConfig;
pub use factory::ProcSubstrate;
