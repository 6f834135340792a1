use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use substrate::{
    ExecRequest, IsolationUnit, ProcessExit, Result, SandboxPolicy, SpawnHandle, SubstrateError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use crate::limits::{self, ChildLimits};
use crate::paths::UnitPaths;

pub(crate) struct ProcUnit {
    id: uuid::Uuid,
    runtime: String,
    paths: UnitPaths,
    policy: Mutex<Option<SandboxPolicy>>,
    procs: Mutex<HashMap<u32, RunningProc>>,
}

struct RunningProc {
    pgid: i32,
    done: watch::Receiver<bool>,
    exit: Arc<Mutex<Option<ProcessExit>>>,
}

impl ProcUnit {
    pub(crate) fn new(id: uuid::Uuid, runtime: String, paths: UnitPaths) -> Self {
        Self {
            id,
            runtime,
            paths,
            policy: Mutex::new(None),
            procs: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn paths(&self) -> &UnitPaths {
        &self.paths
    }

    /// Kill every process group still tracked by this unit.
    pub(crate) async fn terminate(&self) {
        let mut procs = self.procs.lock().await;
        for running in procs.values() {
            kill_group(running.pgid);
        }
        procs.clear();
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        let escapes = rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir));
        if escapes {
            return Err(SubstrateError::InvalidConfig(format!(
                "path escapes scratch area: {path}"
            )));
        }
        Ok(self.paths.scratch().join(rel))
    }

    async fn tracked(
        &self,
        pid: u32,
    ) -> Result<(watch::Receiver<bool>, Arc<Mutex<Option<ProcessExit>>>, i32)> {
        let procs = self.procs.lock().await;
        let running = procs
            .get(&pid)
            .ok_or(SubstrateError::UnknownProcess(pid))?;
        Ok((running.done.clone(), Arc::clone(&running.exit), running.pgid))
    }

    async fn reap(
        &self,
        pid: u32,
        timed_out: bool,
        slot: Arc<Mutex<Option<ProcessExit>>>,
    ) -> Result<ProcessExit> {
        self.procs.lock().await.remove(&pid);
        let mut exit = slot
            .lock()
            .await
            .take()
            .ok_or(SubstrateError::UnknownProcess(pid))?;
        exit.timed_out = timed_out;
        Ok(exit)
    }
}

#[async_trait]
impl IsolationUnit for ProcUnit {
    fn id(&self) -> uuid::Uuid {
        self.id
    }

    fn runtime(&self) -> &str {
        &self.runtime
    }

    async fn apply_policy(&self, policy: &SandboxPolicy) -> Result<()> {
        let mut guard = self.policy.lock().await;
        if guard.is_some() {
            return Err(SubstrateError::PolicyFailed(
                "a policy is already applied".into(),
            ));
        }
        tokio::fs::create_dir_all(self.paths.tmp())
            .await
            .map_err(|e| SubstrateError::PolicyFailed(format!("scratch setup: {e}")))?;
        *guard = Some(policy.clone());
        debug!(unit = %self.id, "policy applied");
        Ok(())
    }

    async fn clear_policy(&self) -> Result<()> {
        self.terminate().await;
        *self.policy.lock().await = None;

        let scratch = self.paths.scratch();
        if tokio::fs::try_exists(&scratch).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&scratch)
                .await
                .map_err(|e| SubstrateError::PolicyFailed(format!("scratch wipe: {e}")))?;
        }
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| SubstrateError::PolicyFailed(format!("scratch recreate: {e}")))?;
        debug!(unit = %self.id, "policy cleared");
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::read(&target).await?)
    }

    async fn exec(&self, request: &ExecRequest<'_>) -> Result<ProcessExit> {
        let handle = self.spawn(request).await?;
        self.wait_exit(handle, request.timeout).await
    }

    async fn spawn(&self, request: &ExecRequest<'_>) -> Result<SpawnHandle> {
        let policy = self
            .policy
            .lock()
            .await
            .clone()
            .ok_or_else(|| SubstrateError::ExecFailed("no sandbox policy applied".into()))?;
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| SubstrateError::ExecFailed("empty command".into()))?;

        let scratch = self.paths.scratch();
        let child_limits = ChildLimits::from_policy(&policy, request.timeout);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&scratch)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", &scratch)
            .env("TMPDIR", self.paths.tmp())
            .env("LANG", "C.UTF-8")
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);
        unsafe {
            cmd.pre_exec(move || child_limits.apply());
        }

        let rusage_before = limits::rusage_children();
        let mut child = cmd
            .spawn()
            .map_err(|e| SubstrateError::ExecFailed(format!("spawn {program}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| SubstrateError::ExecFailed("spawned process has no pid".into()))?;
        let pgid = i32::try_from(pid)
            .map_err(|_| SubstrateError::ExecFailed(format!("pid out of range: {pid}")))?;

        if let (Some(mut sink), Some(bytes)) = (child.stdin.take(), request.stdin) {
            let bytes = bytes.to_vec();
            tokio::spawn(async move {
                let _ = sink.write_all(&bytes).await;
                let _ = sink.shutdown().await;
            });
        }

        let cap = request.max_output_bytes;
        let stdout_task = child.stdout.take().map(|r| tokio::spawn(capture(r, cap)));
        let stderr_task = child.stderr.take().map(|r| tokio::spawn(capture(r, cap)));

        let (done_tx, done_rx) = watch::channel(false);
        let exit_slot = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&exit_slot);

        tokio::spawn(async move {
            let status = child.wait().await;
            let (stdout, stdout_truncated) = join_capture(stdout_task).await;
            let (stderr, stderr_truncated) = join_capture(stderr_task).await;
            let usage = limits::usage_delta(rusage_before, limits::rusage_children());

            let (exit_code, signal) = match status {
                Ok(st) => {
                    use std::os::unix::process::ExitStatusExt;
                    (st.code(), st.signal())
                }
                Err(e) => {
                    warn!(pid, error = %e, "wait on child failed");
                    (None, None)
                }
            };

            *slot.lock().await = Some(ProcessExit {
                exit_code,
                signal,
                timed_out: false,
                stdout,
                stderr,
                stdout_truncated,
                stderr_truncated,
                usage,
                violations: Vec::new(),
            });
            let _ = done_tx.send(true);
        });

        self.procs.lock().await.insert(
            pid,
            RunningProc {
                pgid,
                done: done_rx,
                exit: exit_slot,
            },
        );
        debug!(unit = %self.id, pid, "process spawned");
        Ok(SpawnHandle { pid })
    }

    async fn wait_exit(&self, handle: SpawnHandle, timeout: Duration) -> Result<ProcessExit> {
        let (mut done, slot, pgid) = self.tracked(handle.pid).await?;

        let timed_out = tokio::time::timeout(timeout, done.wait_for(|v| *v))
            .await
            .is_err();
        if timed_out {
            kill_group(pgid);
            let _ = done.wait_for(|v| *v).await;
        }
        self.reap(handle.pid, timed_out, slot).await
    }

    async fn kill(&self, handle: SpawnHandle) -> Result<ProcessExit> {
        let (mut done, slot, pgid) = self.tracked(handle.pid).await?;
        kill_group(pgid);
        let _ = done.wait_for(|v| *v).await;
        self.reap(handle.pid, false, slot).await
    }
}

fn kill_group(pgid: i32) {
    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
}

/// Read a stream to EOF, keeping at most `cap` bytes. The stream is
/// always drained so the child never blocks on a full pipe.
async fn capture<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buf.len());
                let take = n.min(room);
                if take > 0 {
                    buf.extend_from_slice(&chunk[..take]);
                }
                if take < n {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (buf, truncated)
}

async fn join_capture(task: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>) -> (Vec<u8>, bool) {
    match task {
        Some(t) => t.await.unwrap_or_default(),
        None => (Vec::new(), false),
    }
}
