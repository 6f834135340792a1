use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use engine::config::{self, EngineConfig};
use engine::telemetry::LogSink;
use engine::types::{
    ExecutionConstraints, ExecutionRequest, ExecutionStatus, SourcePayload, WorkspaceType,
};
use engine::workspace::StaticWorkspace;
use engine::{Engine, EngineError, EngineResult};
use substrate::Substrate;
use substrate_proc::{ProcConfig, ProcSubstrate};
use tracing::info;
use uuid::Uuid;

#[derive(Args)]
pub struct RunArgs {
    /// Source file to execute
    #[arg(long)]
    file: PathBuf,
    /// Runtime profile (must exist in the engine config)
    #[arg(long, default_value = "python")]
    runtime: String,
    /// Entry point inside the sandbox; defaults to the file name
    #[arg(long)]
    entry: Option<String>,
    /// Arguments appended to the runtime command
    #[arg(long = "arg")]
    args: Vec<String>,
    /// Engine config YAML; built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// Base directory for unit scratch areas; a temp dir when omitted
    #[arg(long)]
    base_dir: Option<PathBuf>,
    /// Wall-clock limit in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Memory ceiling in MiB
    #[arg(long)]
    memory_mb: Option<u32>,
    /// CPU share in millicores
    #[arg(long)]
    cpu_millis: Option<u32>,
    /// Allow outbound network access
    #[arg(long)]
    network: bool,
    /// Artifact paths to read back after the run
    #[arg(long = "output")]
    outputs: Vec<String>,
}

pub async fn run(args: RunArgs) -> EngineResult<ExitCode> {
    let config = match &args.config {
        Some(path) => config::load(path).await?,
        None => EngineConfig::default(),
    };

    let code = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(|e| EngineError::Internal(format!("read {}: {e}", args.file.display())))?;
    let entry = match &args.entry {
        Some(entry) => entry.clone(),
        None => args
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EngineError::Internal("source path has no file name".into()))?,
    };

    // Keep the tempdir guard alive for the whole run.
    let (base_dir, _guard) = match &args.base_dir {
        Some(dir) => (dir.clone(), None),
        None => {
            let tmp = tempfile::tempdir()
                .map_err(|e| EngineError::Internal(format!("temp dir: {e}")))?;
            (tmp.path().to_path_buf(), Some(tmp))
        }
    };

    let mut substrates: Vec<Arc<dyn Substrate>> = Vec::with_capacity(config.nodes.len());
    for node in &config.nodes {
        let mut substrate = ProcSubstrate::new(ProcConfig {
            base_dir: base_dir.join(&node.id),
        });
        substrate.startup().await?;
        substrates.push(Arc::new(substrate));
    }

    let workspace = Arc::new(StaticWorkspace::new(config.tiers.clone()));
    let engine = Engine::start(config, substrates, workspace, Arc::new(LogSink))?;

    let request = ExecutionRequest {
        id: Uuid::new_v4(),
        tenant_id: "cli".into(),
        workspace_id: "cli".into(),
        workspace_type: WorkspaceType::Ephemeral,
        runtime: args.runtime.clone(),
        source: SourcePayload::Inline {
            filename: entry.clone(),
            code,
        },
        entry_point: entry,
        args: args.args.clone(),
        stdin: None,
        constraints: ExecutionConstraints {
            timeout_ms: args.timeout_ms,
            memory_mb: args.memory_mb,
            cpu_millis: args.cpu_millis,
            network_enabled: args.network,
            ..Default::default()
        },
        outputs: args.outputs.clone(),
        test_cases: vec![],
        affinity: None,
    };

    info!(request = %request.id, runtime = %request.runtime, "submitting");
    let result = engine.submit(request).await;
    engine.shutdown().await;

    let result = result?;
    let rendered = serde_json::to_string_pretty(&result)
        .map_err(|e| EngineError::Internal(format!("render result: {e}")))?;
    println!("{rendered}");

    let success = result.status == ExecutionStatus::Completed && result.exit_code == Some(0);
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
