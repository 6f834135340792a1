use std::time::Duration;

use substrate::{NetworkPolicy, ResourceUsage, SandboxPolicy};

/// Resolved rlimit values applied in the child between fork and exec.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildLimits {
    pub address_space_bytes: u64,
    pub cpu_seconds: u64,
    pub file_size_bytes: u64,
    pub nproc: u64,
    pub isolate_network: bool,
}

impl ChildLimits {
    pub fn from_policy(policy: &SandboxPolicy, timeout: Duration) -> Self {
        Self {
            address_space_bytes: policy.memory_limit_bytes,
            cpu_seconds: cpu_seconds_cap(policy.cpu_millis, timeout),
            file_size_bytes: policy.scratch_limit_bytes,
            nproc: u64::from(policy.max_processes.max(1)),
            isolate_network: matches!(policy.network, NetworkPolicy::Deny),
        }
    }

    /// Apply the limits to the calling process. Runs post-fork pre-exec,
    /// so only async-signal-safe calls are allowed here.
    pub fn apply(&self) -> std::io::Result<()> {
        set_rlimit(libc::RLIMIT_AS, self.address_space_bytes)?;
        set_rlimit(libc::RLIMIT_CPU, self.cpu_seconds)?;
        set_rlimit(libc::RLIMIT_FSIZE, self.file_size_bytes)?;
        set_rlimit(libc::RLIMIT_NPROC, self.nproc)?;
        set_rlimit(libc::RLIMIT_CORE, 0)?;

        // Best-effort: an unprivileged host cannot unshare the network
        // namespace, in which case the engine-level policy still records
        // the denial but the host firewall is the actual boundary.
        if self.isolate_network {
            unsafe {
                let _ = libc::unshare(libc::CLONE_NEWNET);
            }
        }
        Ok(())
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// CPU-time ceiling derived from the millicore share and the wall-clock
/// budget, rounded up to whole seconds with one second of slack.
pub(crate) fn cpu_seconds_cap(cpu_millis: u32, timeout: Duration) -> u64 {
    let wall_secs = timeout.as_secs_f64().max(1.0);
    let share = f64::from(cpu_millis.max(1)) / 1000.0;
    (wall_secs * share).ceil() as u64 + 1
}

/// Snapshot of `getrusage(RUSAGE_CHILDREN)` counters.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RusageSnapshot {
    pub cpu_ms: u64,
    pub max_rss_bytes: u64,
    pub page_faults: u64,
    pub context_switches: u64,
}

pub(crate) fn rusage_children() -> RusageSnapshot {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };
    if rc != 0 {
        return RusageSnapshot::default();
    }
    RusageSnapshot {
        cpu_ms: timeval_ms(usage.ru_utime) + timeval_ms(usage.ru_stime),
        max_rss_bytes: (usage.ru_maxrss.max(0) as u64) * 1024,
        page_faults: (usage.ru_minflt.max(0) as u64) + (usage.ru_majflt.max(0) as u64),
        context_switches: (usage.ru_nvcsw.max(0) as u64) + (usage.ru_nivcsw.max(0) as u64),
    }
}

/// Counter deltas across one execution. `RUSAGE_CHILDREN` aggregates all
/// reaped children of this process, so deltas are approximate when
/// executions overlap.
pub(crate) fn usage_delta(before: RusageSnapshot, after: RusageSnapshot) -> ResourceUsage {
    ResourceUsage {
        cpu_ms: after.cpu_ms.saturating_sub(before.cpu_ms),
        peak_memory_bytes: after.max_rss_bytes,
        disk_bytes_written: 0,
        network_bytes: 0,
        context_switches: after.context_switches.saturating_sub(before.context_switches),
        page_faults: after.page_faults.saturating_sub(before.page_faults),
    }
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_cap_scales_with_share_and_wall_clock() {
        // Full core for 10s -> 11s cap (1s slack).
        assert_eq!(cpu_seconds_cap(1000, Duration::from_secs(10)), 11);
        // Half core for 10s -> 6s cap.
        assert_eq!(cpu_seconds_cap(500, Duration::from_secs(10)), 6);
        // Sub-second budgets round up to at least one second of CPU.
        assert_eq!(cpu_seconds_cap(1000, Duration::from_millis(200)), 2);
    }

    #[test]
    fn child_limits_follow_policy() {
        let policy = SandboxPolicy {
            scratch_limit_bytes: 1024,
            readonly_paths: vec![],
            memory_limit_bytes: 64 << 20,
            cpu_millis: 2000,
            max_processes: 4,
            network: NetworkPolicy::Deny,
            operations: substrate::OperationFilter::minimal(),
        };
        let limits = ChildLimits::from_policy(&policy, Duration::from_secs(5));
        assert_eq!(limits.address_space_bytes, 64 << 20);
        assert_eq!(limits.file_size_bytes, 1024);
        assert_eq!(limits.nproc, 4);
        assert!(limits.isolate_network);
        assert_eq!(limits.cpu_seconds, 11);
    }

    #[test]
    fn rusage_snapshot_is_monotonic_enough() {
        let a = rusage_children();
        let b = rusage_children();
        assert!(b.cpu_ms >= a.cpu_ms);
    }
}
