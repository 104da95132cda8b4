//! Rotation orchestrator CLI
//!
//! Usage:
//!   # Hourly rotation (debug: every 5 minutes) until interrupted
//!   ticklog-rotate run
//!
//!   # Rotate now, keeping the previous target for inspection
//!   ticklog-rotate once --stream btc
//!
//!   # Check backend, targets and signals without rotating
//!   ticklog-rotate preflight

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use ticklog_backend::archive::{resolve_export_dir, JsonlExporter};
use ticklog_backend::clock::system_clock;
use ticklog_backend::config::AppConfig;
use ticklog_backend::models::StreamId;
use ticklog_backend::rotation::RotationOrchestrator;
use ticklog_backend::signal::FileSignalChannel;
use ticklog_backend::storage::SqliteBackend;

#[derive(Parser, Debug)]
#[command(name = "ticklog-rotate")]
#[command(about = "Rotate, archive and drop stream targets")]
struct Args {
    /// TOML config file
    #[arg(long, env = "TICKLOG_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long)]
    db: Option<String>,

    /// Directory holding rotation flag files
    #[arg(long)]
    signal_dir: Option<PathBuf>,

    /// Archive directory
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// Five-minute schedule with debug file names
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rotate on the schedule until interrupted
    Run,

    /// Rotate immediately and exit
    Once {
        /// Only this stream; all configured streams when omitted
        #[arg(long)]
        stream: Option<String>,

        /// Drop the previous target after a verified export
        #[arg(long)]
        no_preserve: bool,
    },

    /// Check backend, targets and signals
    Preflight,
}

#[tokio::main]
async fn main() -> Result<()> {
    ticklog_backend::init_tracing("ticklog_backend=info,ticklog_rotate=info");
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(db) = &args.db {
        config.storage.db_path = db.clone();
    }
    if let Some(dir) = &args.signal_dir {
        config.signal.dir = dir.clone();
    }
    if let Some(dir) = &args.export_dir {
        config.rotation.export_dir = dir.clone();
    }
    if args.debug {
        config.rotation.debug_mode = true;
    }
    config.validate()?;
    let streams = config.stream_ids()?;

    let export_dir = resolve_export_dir(
        &config.rotation.export_dir,
        &config.rotation.fallback_export_dirs,
    )?;
    let backend = Arc::new(
        SqliteBackend::open(&config.storage.db_path, config.storage.busy_timeout())
            .context("Failed to open storage backend")?,
    );
    let signal = Arc::new(FileSignalChannel::new(config.signal.dir.clone()));
    let exporter = Arc::new(JsonlExporter::new(export_dir.clone()));

    info!(
        db = %config.storage.db_path,
        export_dir = %export_dir.display(),
        debug_mode = config.rotation.debug_mode,
        "starting ticklog rotator"
    );

    let mut orchestrator =
        RotationOrchestrator::new(backend, signal, exporter, system_clock(), config.rotation.clone());

    match args.command {
        Commands::Preflight => {
            let report = orchestrator.preflight(&streams).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Once { stream, no_preserve } => {
            let selected = match stream {
                Some(raw) => vec![StreamId::parse(&raw)?],
                None => streams,
            };
            orchestrator.set_preserve_previous(!no_preserve);
            orchestrator.preflight(&selected).await?;

            let outcomes = orchestrator.run_cycle(&selected).await;
            let failed = outcomes.iter().filter(|(_, o)| !o.is_success()).count();
            for (stream, outcome) in &outcomes {
                println!("{}: {}", stream, serde_json::to_string(outcome)?);
            }
            if failed > 0 {
                bail!("{} of {} rotations did not complete", failed, outcomes.len());
            }
        }
        Commands::Run => {
            orchestrator.preflight(&streams).await?;
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received");
                    let _ = tx.send(true);
                }
            });
            orchestrator.run_scheduled(&streams, rx).await;
        }
    }

    Ok(())
}
