use std::collections::BTreeSet;
use std::path::PathBuf;

/// Per-execution security overlay applied to a unit before the guest
/// process starts and removed after it exits. A policy is never shared
/// between executions even when the underlying unit is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    /// Size cap for the writable scratch area, in bytes.
    pub scratch_limit_bytes: u64,
    /// Paths inside the unit that must be remounted (or enforced) read-only.
    pub readonly_paths: Vec<PathBuf>,
    pub memory_limit_bytes: u64,
    pub cpu_millis: u32,
    pub max_processes: u32,
    pub network: NetworkPolicy,
    pub operations: OperationFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPolicy {
    /// No outbound connectivity. The default.
    Deny,
    /// Outbound connectivity restricted to the listed destinations.
    Allow { destinations: Vec<String> },
}

/// Coarse operation classes for the default-deny guest filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationClass {
    FileIo,
    Memory,
    Signals,
    Clock,
    ProcessExit,
    ProcessControl,
    Network,
}

/// Default-deny allow-list over [`OperationClass`]. Anything outside the
/// set is denied by the substrate and surfaced as a [`PolicyViolation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFilter {
    allowed: BTreeSet<OperationClass>,
}

impl OperationFilter {
    /// The minimal set a process needs to run and exit: file I/O, memory
    /// management, signal handling, clock reads, and process exit.
    pub fn minimal() -> Self {
        Self {
            allowed: BTreeSet::from([
                OperationClass::FileIo,
                OperationClass::Memory,
                OperationClass::Signals,
                OperationClass::Clock,
                OperationClass::ProcessExit,
            ]),
        }
    }

    #[must_use]
    pub fn allow(mut self, class: OperationClass) -> Self {
        self.allowed.insert(class);
        self
    }

    pub fn allows(&self, class: OperationClass) -> bool {
        self.allowed.contains(&class)
    }

    pub fn allowed(&self) -> impl Iterator<Item = OperationClass> + '_ {
        self.allowed.iter().copied()
    }
}

/// A denied operation attempted by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub operation: OperationClass,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_filter_denies_network_and_process_control() {
        let filter = OperationFilter::minimal();
        assert!(filter.allows(OperationClass::FileIo));
        assert!(filter.allows(OperationClass::ProcessExit));
        assert!(!filter.allows(OperationClass::Network));
        assert!(!filter.allows(OperationClass::ProcessControl));
    }

    #[test]
    fn allow_extends_the_set() {
        let filter = OperationFilter::minimal().allow(OperationClass::Network);
        assert!(filter.allows(OperationClass::Network));
        assert!(!filter.allows(OperationClass::ProcessControl));
    }
}
