use substrate::{ExecRequest, IsolationUnit, PolicyViolation, ProcessExit, ResourceUsage};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::allocator::ResourceGrant;
use crate::error::{EngineError, EngineResult};
use crate::types::{Artifact, ExecutionStatus, TestCase, TestResult};

/// Terminal observation of one supervised guest process.
pub struct RunOutcome {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub usage: ResourceUsage,
    pub violations: Vec<PolicyViolation>,
}

/// Run the guest command inside a prepared sandbox and watch it to a
/// terminal state: `Pending → Running → {Completed, TimedOut, Killed,
/// Crashed}`.
///
/// The guest runs as an independently monitored process behind the
/// substrate interface; a dedicated deadline equal to the grant's
/// timeout fires independently of scheduler health, and `cancel`
/// force-terminates the guest into `Killed`.
pub async fn supervise(
    unit: &dyn IsolationUnit,
    command: &[String],
    stdin: Option<&[u8]>,
    grant: &ResourceGrant,
    cancel: &CancellationToken,
) -> EngineResult<RunOutcome> {
    debug!(unit = %unit.id(), ?command, "execution pending");
    let handle = unit
        .spawn(&ExecRequest {
            command,
            stdin,
            env: &[],
            timeout: grant.timeout,
            max_output_bytes: grant.max_output_bytes,
        })
        .await
        .map_err(EngineError::Substrate)?;
    debug!(unit = %unit.id(), pid = handle.pid, "execution running");

    let (exit, status) = tokio::select! {
        exit = unit.wait_exit(handle, grant.timeout) => {
            let exit = exit.map_err(EngineError::Substrate)?;
            let status = if exit.timed_out {
                ExecutionStatus::TimedOut
            } else if exit.signal.is_some() {
                ExecutionStatus::Crashed
            } else {
                ExecutionStatus::Completed
            };
            (exit, status)
        }
        () = cancel.cancelled() => {
            let exit = unit.kill(handle).await.map_err(EngineError::Substrate)?;
            (exit, ExecutionStatus::Killed)
        }
    };

    debug!(
        unit = %unit.id(),
        pid = handle.pid,
        status = status.label(),
        exit_code = exit.exit_code,
        "execution finished"
    );
    Ok(outcome(exit, status))
}

fn outcome(exit: ProcessExit, status: ExecutionStatus) -> RunOutcome {
    RunOutcome {
        status,
        exit_code: exit.exit_code,
        stdout: exit.stdout,
        stderr: exit.stderr,
        stdout_truncated: exit.stdout_truncated,
        stderr_truncated: exit.stderr_truncated,
        usage: exit.usage,
        violations: exit.violations,
    }
}

/// Read requested output files back from the scratch area before
/// teardown. A missing artifact is reported with empty data, not fatal.
pub async fn collect_artifacts(unit: &dyn IsolationUnit, outputs: &[String]) -> Vec<Artifact> {
    let mut artifacts = Vec::with_capacity(outputs.len());
    for path in outputs {
        let data = match unit.read_file(path).await {
            Ok(data) => Some(data),
            Err(e) => {
                debug!(unit = %unit.id(), path, error = %e, "requested artifact absent");
                None
            }
        };
        artifacts.push(Artifact {
            path: path.clone(),
            data,
        });
    }
    artifacts
}

/// Evaluate supplied test cases against the captured stdout, exit code,
/// and collected artifacts of a completed execution.
pub fn evaluate_tests(
    cases: &[TestCase],
    exit_code: Option<i32>,
    stdout: &str,
    artifacts: &[Artifact],
) -> Vec<TestResult> {
    cases
        .iter()
        .map(|case| {
            let mut detail = None;

            if let Some(expected) = case.expected_exit_code
                && exit_code != Some(expected)
            {
                detail = Some(format!(
                    "expected exit code {expected}, got {}",
                    exit_code.map_or_else(|| "signal".into(), |c| c.to_string())
                ));
            }

            if detail.is_none()
                && let Some(expected) = &case.expected_stdout
                && stdout.trim_end_matches('\n') != expected.trim_end_matches('\n')
            {
                detail = Some("stdout mismatch".into());
            }

            if detail.is_none()
                && let Some(required) = &case.required_artifact
                && !artifacts
                    .iter()
                    .any(|a| &a.path == required && a.data.is_some())
            {
                detail = Some(format!("missing artifact {required}"));
            }

            TestResult {
                name: case.name.clone(),
                passed: detail.is_none(),
                detail,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use substrate::{NetworkPolicy, Substrate, UnitConfig};
    use uuid::Uuid;

    use crate::isolation;
    use crate::testutil::MockSubstrate;

    use super::*;

    fn grant() -> ResourceGrant {
        ResourceGrant {
            timeout: Duration::from_millis(500),
            memory_bytes: 512 << 20,
            cpu_millis: 1000,
            disk_bytes: 256 << 20,
            max_processes: 16,
            network: NetworkPolicy::Deny,
            max_output_bytes: 1 << 20,
        }
    }

    async fn sandboxed_unit() -> Box<dyn IsolationUnit> {
        let unit = MockSubstrate::new()
            .create(UnitConfig {
                id: Uuid::new_v4(),
                runtime: "python".into(),
            })
            .await
            .unwrap();
        let policy = isolation::build_policy(&grant());
        unit.apply_policy(&policy).await.unwrap();
        unit
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn clean_exit_completes() {
        let unit = sandboxed_unit().await;
        let out = supervise(
            unit.as_ref(),
            &argv(&["echo", "hi"]),
            None,
            &grant(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(out.status, ExecutionStatus::Completed);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, b"hi\n");
    }

    #[tokio::test]
    async fn deadline_expiry_times_out() {
        let unit = sandboxed_unit().await;
        let out = supervise(
            unit.as_ref(),
            &argv(&["sleep-ms", "5000"]),
            None,
            &grant(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(out.status, ExecutionStatus::TimedOut);
        assert_eq!(out.exit_code, None);
    }

    #[tokio::test]
    async fn signal_death_is_crashed() {
        let unit = sandboxed_unit().await;
        let out = supervise(
            unit.as_ref(),
            &argv(&["crash"]),
            None,
            &grant(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(out.status, ExecutionStatus::Crashed);
        assert_eq!(out.exit_code, None);
    }

    #[tokio::test]
    async fn cancellation_kills_the_guest() {
        let unit = sandboxed_unit().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let out = supervise(
            unit.as_ref(),
            &argv(&["sleep-ms", "400"]),
            None,
            &grant(),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(out.status, ExecutionStatus::Killed);
    }

    #[tokio::test]
    async fn denied_network_attempt_is_recorded_not_fatal() {
        let unit = sandboxed_unit().await;
        let out = supervise(
            unit.as_ref(),
            &argv(&["connect", "example.com"]),
            None,
            &grant(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(out.status, ExecutionStatus::Completed);
        assert_eq!(out.violations.len(), 1);
    }

    #[tokio::test]
    async fn artifacts_report_absence() {
        let unit = sandboxed_unit().await;
        unit.write_file("out.txt", b"result").await.unwrap();

        let artifacts =
            collect_artifacts(unit.as_ref(), &["out.txt".into(), "missing.bin".into()]).await;
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].data.as_deref(), Some(b"result".as_slice()));
        assert!(artifacts[1].data.is_none());
    }

    #[test]
    fn test_evaluation_checks_each_expectation() {
        let cases = vec![
            TestCase {
                name: "exit".into(),
                expected_stdout: None,
                expected_exit_code: Some(0),
                required_artifact: None,
            },
            TestCase {
                name: "stdout".into(),
                expected_stdout: Some("42".into()),
                expected_exit_code: None,
                required_artifact: None,
            },
            TestCase {
                name: "artifact".into(),
                expected_stdout: None,
                expected_exit_code: None,
                required_artifact: Some("out.bin".into()),
            },
        ];
        let artifacts = vec![Artifact {
            path: "out.bin".into(),
            data: None,
        }];

        let results = evaluate_tests(&cases, Some(0), "42\n", &artifacts);
        assert!(results[0].passed);
        assert!(results[1].passed, "{:?}", results[1].detail);
        assert!(!results[2].passed);
    }

    #[test]
    fn stdout_comparison_tolerates_trailing_newline_only() {
        let case = TestCase {
            name: "s".into(),
            expected_stdout: Some("a\nb".into()),
            expected_exit_code: None,
            required_artifact: None,
        };
        assert!(evaluate_tests(&[case.clone()], Some(0), "a\nb\n", &[])[0].passed);
        assert!(!evaluate_tests(&[case], Some(0), "a\nb\nc", &[])[0].passed);
    }
}
