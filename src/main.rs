use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use schoold::config::{self, Overrides};
use schoold::{sidecar, AppState};

#[derive(Debug, Parser)]
#[command(name = "schoold", version, about = "School administration service")]
struct Cli {
    /// TOML config file (defaults to ./schoold.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the database file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API (default)
    Serve {
        /// Listen address, e.g. 0.0.0.0:5080
        #[arg(long)]
        bind: Option<String>,
    },
    /// Answer newline-delimited JSON requests on stdin
    Ipc,
}

fn init_tracing() {
    // stderr keeps stdout free for sidecar responses.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let command = cli.command.unwrap_or(Command::Serve { bind: None });
    let overrides = Overrides {
        config_path: cli.config,
        data_dir: cli.data_dir,
        bind: match &command {
            Command::Serve { bind } => bind.clone(),
            Command::Ipc => None,
        },
    };
    let cfg = config::load(&overrides)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), data_dir = %cfg.data_dir.display(), "starting schoold");

    match command {
        Command::Serve { .. } => {
            let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
            runtime.block_on(schoold::http::serve(cfg))
        }
        Command::Ipc => {
            let mut state = AppState::open(&cfg)?;
            let stdin = std::io::stdin();
            sidecar::serve(&mut state, stdin.lock(), std::io::stdout().lock())?;
            tracing::info!("stdin closed; exiting");
            Ok(())
        }
    }
}
