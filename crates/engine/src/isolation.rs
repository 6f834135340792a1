use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use substrate::{IsolationUnit, NetworkPolicy, OperationClass, OperationFilter, SandboxPolicy};
use tracing::debug;

use crate::allocator::ResourceGrant;
use crate::error::{EngineError, EngineResult};
use crate::types::{ExecutionRequest, SourcePayload};

/// Wall-clock and output bounds for staging steps (archive unpack,
/// repository clone) run before the guest process starts.
pub struct StagingLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// System paths enforced read-only inside every sandbox.
const READONLY_ROOTS: &[&str] = &["/usr", "/bin", "/lib", "/etc"];

/// Build the per-execution sandbox policy from the resolved grant:
/// size-capped scratch, read-only system roots, resource ceilings, the
/// request's network policy, and a default-deny operation filter opened
/// only as far as the grant requires.
pub fn build_policy(grant: &ResourceGrant) -> SandboxPolicy {
    let mut operations = OperationFilter::minimal();
    if matches!(grant.network, NetworkPolicy::Allow { .. }) {
        operations = operations.allow(OperationClass::Network);
    }
    if grant.max_processes > 1 {
        operations = operations.allow(OperationClass::ProcessControl);
    }

    SandboxPolicy {
        scratch_limit_bytes: grant.disk_bytes,
        readonly_paths: READONLY_ROOTS.iter().map(PathBuf::from).collect(),
        memory_limit_bytes: grant.memory_bytes,
        cpu_millis: grant.cpu_millis,
        max_processes: grant.max_processes,
        network: grant.network.clone(),
        operations,
    }
}

/// Apply the sandbox to a unit and stage the workspace snapshot plus the
/// request's source payload into its scratch area. Any failing layer is
/// fatal for this execution; the caller releases the unit dirty.
pub async fn prepare(
    unit: &dyn IsolationUnit,
    policy: &SandboxPolicy,
    request: &ExecutionRequest,
    snapshot: Option<&[u8]>,
    staging: &StagingLimits,
) -> EngineResult<()> {
    unit.apply_policy(policy)
        .await
        .map_err(|e| EngineError::SandboxSetupFailed(format!("apply policy: {e}")))?;

    if let Some(archive) = snapshot {
        unpack_archive(unit, archive)
            .await
            .map_err(|e| EngineError::SandboxSetupFailed(format!("workspace snapshot: {e}")))?;
    }

    stage_source(unit, request, staging).await?;
    debug!(unit = %unit.id(), request = %request.id, "sandbox prepared");
    Ok(())
}

/// Remove the sandbox overlay after the execution. Failure here means
/// the unit's state is suspect; the caller must release it dirty.
pub async fn teardown(unit: &dyn IsolationUnit) -> EngineResult<()> {
    unit.clear_policy().await.map_err(EngineError::Substrate)
}

async fn stage_source(
    unit: &dyn IsolationUnit,
    request: &ExecutionRequest,
    staging: &StagingLimits,
) -> EngineResult<()> {
    match &request.source {
        SourcePayload::Inline { filename, code } => unit
            .write_file(filename, code.as_bytes())
            .await
            .map_err(|e| EngineError::SandboxSetupFailed(format!("stage {filename}: {e}"))),
        SourcePayload::Files { files } => {
            for file in files {
                unit.write_file(&file.path, file.content.as_bytes())
                    .await
                    .map_err(|e| {
                        EngineError::SandboxSetupFailed(format!("stage {}: {e}", file.path))
                    })?;
            }
            Ok(())
        }
        SourcePayload::Archive { data } => unpack_archive(unit, data)
            .await
            .map_err(|e| EngineError::SandboxSetupFailed(format!("source archive: {e}"))),
        SourcePayload::GitRepository { url, reference } => {
            clone_repository(unit, url, reference.as_deref(), staging).await
        }
    }
}

async fn clone_repository(
    unit: &dyn IsolationUnit,
    url: &str,
    reference: Option<&str>,
    staging: &StagingLimits,
) -> EngineResult<()> {
    let mut command: Vec<String> = vec![
        "git".into(),
        "clone".into(),
        "--depth".into(),
        "1".into(),
    ];
    if let Some(reference) = reference {
        command.push("--branch".into());
        command.push(reference.to_string());
    }
    command.push(url.to_string());
    command.push(".".into());

    let exit = unit
        .exec(&substrate::ExecRequest {
            command: &command,
            stdin: None,
            env: &[],
            timeout: staging.timeout,
            max_output_bytes: staging.max_output_bytes,
        })
        .await
        .map_err(|e| EngineError::SandboxSetupFailed(format!("git clone: {e}")))?;

    if exit.exit_code != Some(0) {
        return Err(EngineError::SandboxSetupFailed(format!(
            "git clone {url}: {}",
            String::from_utf8_lossy(&exit.stderr)
        )));
    }
    Ok(())
}

/// Unpack a gzipped tar into the unit's scratch area. Decoded fully
/// before any write so a malformed archive stages nothing.
async fn unpack_archive(unit: &dyn IsolationUnit, data: &[u8]) -> EngineResult<()> {
    let mut entries = Vec::new();
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    for entry in archive
        .entries()
        .map_err(|e| EngineError::Internal(format!("read archive: {e}")))?
    {
        let mut entry = entry.map_err(|e| EngineError::Internal(format!("read entry: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| EngineError::Internal(format!("entry path: {e}")))?
            .to_string_lossy()
            .into_owned();
        if escapes_scratch(Path::new(&path)) {
            return Err(EngineError::Internal(format!(
                "archive entry escapes scratch area: {path}"
            )));
        }
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| EngineError::Internal(format!("read {path}: {e}")))?;
        entries.push((path, content));
    }

    for (path, content) in entries {
        unit.write_file(&path, &content)
            .await
            .map_err(|e| EngineError::Internal(format!("write {path}: {e}")))?;
    }
    Ok(())
}

fn escapes_scratch(path: &Path) -> bool {
    path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
}
