//! Shared mock substrate for engine integration tests. Units interpret a
//! tiny command vocabulary instead of running real processes:
//! `["echo", ..]`, `["exit", code]`, `["sleep-ms", n]`, `["crash"]`,
//! `["connect", host]`.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine::config::{EngineConfig, RuntimeCommand};
use engine::telemetry::{TelemetryRecord, TelemetrySink};
use substrate::{
    ExecRequest, IsolationUnit, NetworkPolicy, OperationClass, PolicyViolation, ProcessExit,
    ResourceUsage, SandboxPolicy, SpawnHandle, Substrate, SubstrateError, UnitConfig,
};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Faults {
    fail_creates: AtomicUsize,
    fail_policies: AtomicUsize,
}

pub struct MockSubstrate {
    create_delay: Duration,
    faults: Arc<Faults>,
    created: StdMutex<Vec<Uuid>>,
    destroyed: StdMutex<Vec<Uuid>>,
}

impl MockSubstrate {
    pub fn new() -> Self {
        Self::with_create_delay(Duration::ZERO)
    }

    pub fn with_create_delay(create_delay: Duration) -> Self {
        Self {
            create_delay,
            faults: Arc::new(Faults::default()),
            created: StdMutex::new(Vec::new()),
            destroyed: StdMutex::new(Vec::new()),
        }
    }

    /// Make the next `n` create calls fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.faults.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` policy applications fail (across all units).
    pub fn fail_next_policies(&self, n: usize) {
        self.faults.fail_policies.store(n, Ordering::SeqCst);
    }

    pub fn created_ids(&self) -> Vec<Uuid> {
        self.created.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn destroyed_ids(&self) -> Vec<Uuid> {
        self.destroyed.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Substrate for MockSubstrate {
    fn name(&self) -> &str {
        "mock"
    }

    fn profile_hash(&self) -> String {
        "mock".into()
    }

    async fn startup(&mut self) -> substrate::Result<()> {
        Ok(())
    }

    async fn create(&self, config: UnitConfig) -> substrate::Result<Box<dyn IsolationUnit>> {
        if take_fault(&self.faults.fail_creates) {
            return Err(SubstrateError::CreationFailed("injected failure".into()));
        }
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if let Ok(mut created) = self.created.lock() {
            created.push(config.id);
        }
        Ok(Box::new(MockUnit::new(
            config.id,
            config.runtime,
            Arc::clone(&self.faults),
        )))
    }

    async fn destroy(&self, unit: Box<dyn IsolationUnit>) {
        if let Ok(mut destroyed) = self.destroyed.lock() {
            destroyed.push(unit.id());
        }
    }

    async fn shutdown(&mut self) {}
}

pub struct MockUnit {
    id: Uuid,
    runtime: String,
    faults: Arc<Faults>,
    policy: Mutex<Option<SandboxPolicy>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    runs: Mutex<HashMap<u32, Vec<String>>>,
    next_pid: AtomicU32,
}

impl MockUnit {
    fn new(id: Uuid, runtime: String, faults: Arc<Faults>) -> Self {
        Self {
            id,
            runtime,
            faults,
            policy: Mutex::new(None),
            files: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1),
        }
    }

    async fn network_denied(&self) -> bool {
        matches!(
            self.policy.lock().await.as_ref().map(|p| p.network.clone()),
            Some(NetworkPolicy::Deny) | None
        )
    }

    async fn interpret(&self, command: &[String], timeout: Duration) -> ProcessExit {
        let mut exit = blank_exit();
        match command.first().map(String::as_str) {
            Some("echo") => {
                let mut out = command
                    .get(1..)
                    .map(|rest| rest.join(" "))
                    .unwrap_or_default();
                out.push('\n');
                exit.stdout = out.into_bytes();
            }
            Some("exit") => {
                exit.exit_code = command.get(1).and_then(|c| c.parse().ok()).or(Some(1));
            }
            Some("sleep-ms") => {
                let wanted =
                    Duration::from_millis(command.get(1).and_then(|n| n.parse().ok()).unwrap_or(0));
                if wanted > timeout {
                    tokio::time::sleep(timeout).await;
                    exit.exit_code = None;
                    exit.signal = Some(9);
                    exit.timed_out = true;
                } else {
                    tokio::time::sleep(wanted).await;
                }
            }
            Some("crash") => {
                exit.exit_code = None;
                exit.signal = Some(11);
            }
            Some("connect") => {
                let host = command.get(1).cloned().unwrap_or_default();
                if self.network_denied().await {
                    exit.stderr = format!("connect {host}: network unreachable\n").into_bytes();
                    exit.violations.push(PolicyViolation {
                        operation: OperationClass::Network,
                        detail: format!("outbound connection to {host}"),
                    });
                } else {
                    exit.stdout = format!("connected to {host}\n").into_bytes();
                }
            }
            _ => {}
        }
        exit
    }
}

fn blank_exit() -> ProcessExit {
    ProcessExit {
        exit_code: Some(0),
        signal: None,
        timed_out: false,
        stdout: Vec::new(),
        stderr: Vec::new(),
        stdout_truncated: false,
        stderr_truncated: false,
        usage: ResourceUsage {
            cpu_ms: 1,
            peak_memory_bytes: 1 << 20,
            ..Default::default()
        },
        violations: Vec::new(),
    }
}

#[async_trait]
impl IsolationUnit for MockUnit {
    fn id(&self) -> Uuid {
        self.id
    }

    fn runtime(&self) -> &str {
        &self.runtime
    }

    async fn apply_policy(&self, policy: &SandboxPolicy) -> substrate::Result<()> {
        if take_fault(&self.faults.fail_policies) {
            return Err(SubstrateError::PolicyFailed("injected failure".into()));
        }
        let mut guard = self.policy.lock().await;
        if guard.is_some() {
            return Err(SubstrateError::PolicyFailed(
                "a policy is already applied".into(),
            ));
        }
        *guard = Some(policy.clone());
        Ok(())
    }

    async fn clear_policy(&self) -> substrate::Result<()> {
        *self.policy.lock().await = None;
        self.files.lock().await.clear();
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> substrate::Result<()> {
        self.files
            .lock()
            .await
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> substrate::Result<Vec<u8>> {
        self.files.lock().await.get(path).cloned().ok_or_else(|| {
            SubstrateError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.to_string(),
            ))
        })
    }

    async fn exec(&self, request: &ExecRequest<'_>) -> substrate::Result<ProcessExit> {
        let handle = self.spawn(request).await?;
        self.wait_exit(handle, request.timeout).await
    }

    async fn spawn(&self, request: &ExecRequest<'_>) -> substrate::Result<SpawnHandle> {
        if self.policy.lock().await.is_none() {
            return Err(SubstrateError::ExecFailed(
                "no sandbox policy applied".into(),
            ));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.runs.lock().await.insert(pid, request.command.to_vec());
        Ok(SpawnHandle { pid })
    }

    async fn wait_exit(
        &self,
        handle: SpawnHandle,
        timeout: Duration,
    ) -> substrate::Result<ProcessExit> {
        let command = self
            .runs
            .lock()
            .await
            .get(&handle.pid)
            .cloned()
            .ok_or(SubstrateError::UnknownProcess(handle.pid))?;
        let exit = self.interpret(&command, timeout).await;
        self.runs.lock().await.remove(&handle.pid);
        Ok(exit)
    }

    async fn kill(&self, handle: SpawnHandle) -> substrate::Result<ProcessExit> {
        self.runs
            .lock()
            .await
            .remove(&handle.pid)
            .ok_or(SubstrateError::UnknownProcess(handle.pid))?;
        let mut exit = blank_exit();
        exit.exit_code = None;
        exit.signal = Some(9);
        Ok(exit)
    }
}

/// Captures telemetry records for assertions.
#[derive(Default)]
pub struct CaptureSink {
    records: StdMutex<Vec<TelemetryRecord>>,
}

#[async_trait]
impl TelemetrySink for CaptureSink {
    async fn push(&self, record: &TelemetryRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

impl CaptureSink {
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

/// Engine config whose runtimes map straight onto the mock command
/// vocabulary; request args supply operands.
pub fn mock_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    // Keep the prewarm control loop quiet unless a test tunes it down.
    config.pool.prewarm_interval_ms = 60_000;
    config.runtimes = [
        ("echo", "echo"),
        ("sleep", "sleep-ms"),
        ("crash", "crash"),
        ("netcheck", "connect"),
    ]
    .into_iter()
    .map(|(name, program)| {
        (
            name.to_string(),
            RuntimeCommand {
                program: program.to_string(),
                args: vec![],
            },
        )
    })
    .collect();
    config
}
