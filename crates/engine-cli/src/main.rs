mod run;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "engine-cli", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a local source file through an in-process engine backed by
    /// the process substrate
    Run(Box<run::RunArgs>),
    /// Write a default engine.yaml
    Config(ConfigArgs),
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// Output path
    #[arg(long, default_value = "engine.yaml")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => run::run(*args).await,
        Command::Config(args) => write_config(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn write_config(args: ConfigArgs) -> engine::EngineResult<ExitCode> {
    let config = engine::config::EngineConfig::default();
    engine::config::generate(&config, &args.output).await?;
    eprintln!("wrote {}", args.output.display());
    Ok(ExitCode::SUCCESS)
}
