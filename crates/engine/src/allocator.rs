use std::time::Duration;

use substrate::NetworkPolicy;

use crate::config::{PlatformLimits, TierProfile};
use crate::error::{EngineError, EngineResult};
use crate::types::{ExecutionConstraints, ExecutionRequest, SourcePayload};

/// Fully resolved resource limits for one execution. Consumed by the
/// isolation enforcer and the execution supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGrant {
    pub timeout: Duration,
    pub memory_bytes: u64,
    pub cpu_millis: u32,
    pub disk_bytes: u64,
    pub max_processes: u32,
    pub network: NetworkPolicy,
    pub max_output_bytes: usize,
}

/// Resolve a request's declared constraints against the workspace tier
/// defaults and the platform maxima. Pure function of its inputs.
pub fn resolve(
    request: &ExecutionRequest,
    tier: &TierProfile,
    limits: &PlatformLimits,
) -> EngineResult<ResourceGrant> {
    let constraints = &request.constraints;
    check(constraints.timeout_ms, limits.max_timeout_ms, "timeout_ms")?;
    check(constraints.memory_mb, limits.max_memory_mb, "memory_mb")?;
    check(constraints.cpu_millis, limits.max_cpu_millis, "cpu_millis")?;
    check(constraints.disk_mb, limits.max_disk_mb, "disk_mb")?;
    check(
        constraints.max_processes,
        limits.max_processes,
        "max_processes",
    )?;

    if matches!(request.source, SourcePayload::GitRepository { .. }) && !constraints.network_enabled
    {
        return Err(EngineError::ConstraintViolation(
            "repository source requires network-enabled constraints".into(),
        ));
    }

    Ok(ResourceGrant {
        timeout: Duration::from_millis(constraints.timeout_ms.unwrap_or(tier.timeout_ms)),
        memory_bytes: u64::from(constraints.memory_mb.unwrap_or(tier.memory_mb)) << 20,
        cpu_millis: constraints.cpu_millis.unwrap_or(tier.cpu_millis),
        disk_bytes: u64::from(constraints.disk_mb.unwrap_or(tier.disk_mb)) << 20,
        max_processes: constraints.max_processes.unwrap_or(tier.max_processes),
        network: network_policy(constraints),
        max_output_bytes: limits.max_output_bytes,
    })
}

fn network_policy(constraints: &ExecutionConstraints) -> NetworkPolicy {
    if constraints.network_enabled {
        NetworkPolicy::Allow {
            destinations: constraints.network_allowlist.clone(),
        }
    } else {
        NetworkPolicy::Deny
    }
}

fn check<T: PartialOrd + std::fmt::Display>(
    declared: Option<T>,
    maximum: T,
    field: &str,
) -> EngineResult<()> {
    if let Some(value) = declared
        && value > maximum
    {
        return Err(EngineError::ConstraintViolation(format!(
            "{field} {value} exceeds platform maximum {maximum}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::config::TierProfiles;
    use crate::types::WorkspaceType;

    use super::*;

    fn request(constraints: ExecutionConstraints) -> ExecutionRequest {
        ExecutionRequest {
            id: Uuid::new_v4(),
            tenant_id: "t".into(),
            workspace_id: "w".into(),
            workspace_type: WorkspaceType::Session,
            runtime: "python".into(),
            source: SourcePayload::Inline {
                filename: "main.py".into(),
                code: String::new(),
            },
            entry_point: "main.py".into(),
            args: vec![],
            stdin: None,
            constraints,
            outputs: vec![],
            test_cases: vec![],
            affinity: None,
        }
    }

    fn session_tier() -> TierProfile {
        TierProfiles::default().session.clone()
    }

    #[test]
    fn unset_fields_fall_back_to_tier_defaults() {
        let tier = session_tier();
        let grant = resolve(
            &request(ExecutionConstraints::default()),
            &tier,
            &PlatformLimits::default(),
        )
        .unwrap();

        assert_eq!(grant.timeout, Duration::from_millis(tier.timeout_ms));
        assert_eq!(grant.memory_bytes, u64::from(tier.memory_mb) << 20);
        assert_eq!(grant.cpu_millis, tier.cpu_millis);
        assert_eq!(grant.max_processes, tier.max_processes);
        assert_eq!(grant.network, NetworkPolicy::Deny);
    }

    #[test]
    fn declared_fields_override_tier_defaults() {
        let grant = resolve(
            &request(ExecutionConstraints {
                timeout_ms: Some(5_000),
                memory_mb: Some(256),
                ..Default::default()
            }),
            &session_tier(),
            &PlatformLimits::default(),
        )
        .unwrap();

        assert_eq!(grant.timeout, Duration::from_secs(5));
        assert_eq!(grant.memory_bytes, 256 << 20);
    }

    #[test]
    fn memory_over_platform_ceiling_is_rejected() {
        let err = resolve(
            &request(ExecutionConstraints {
                memory_mb: Some(16_384),
                ..Default::default()
            }),
            &session_tier(),
            &PlatformLimits::default(),
        )
        .unwrap_err();

        match err {
            EngineError::ConstraintViolation(msg) => assert!(msg.contains("memory_mb")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn timeout_over_platform_ceiling_is_rejected() {
        let err = resolve(
            &request(ExecutionConstraints {
                timeout_ms: Some(600_000),
                ..Default::default()
            }),
            &session_tier(),
            &PlatformLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ConstraintViolation(_)));
    }

    #[test]
    fn network_allowlist_flows_into_the_grant() {
        let grant = resolve(
            &request(ExecutionConstraints {
                network_enabled: true,
                network_allowlist: vec!["api.example.com:443".into()],
                ..Default::default()
            }),
            &session_tier(),
            &PlatformLimits::default(),
        )
        .unwrap();

        assert_eq!(
            grant.network,
            NetworkPolicy::Allow {
                destinations: vec!["api.example.com:443".into()]
            }
        );
    }

    #[test]
    fn repository_source_requires_network() {
        let mut req = request(ExecutionConstraints::default());
        req.source = SourcePayload::GitRepository {
            url: "https://example.com/repo.git".into(),
            reference: None,
        };
        let err = resolve(&req, &session_tier(), &PlatformLimits::default()).unwrap_err();
        assert!(matches!(err, EngineError::ConstraintViolation(_)));
    }
}
