//! Ticklog inspector
//!
//! Usage:
//!   ticklog-inspect status
//!   ticklog-inspect exports --stream btc --limit 20

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ticklog_backend::config::AppConfig;
use ticklog_backend::models::{MessageKind, StreamId};
use ticklog_backend::signal::{FileSignalChannel, SignalChannel};
use ticklog_backend::storage::{SqliteBackend, StorageBackend};

#[derive(Parser, Debug)]
#[command(name = "ticklog-inspect")]
#[command(about = "Show target, signal and export state")]
struct Args {
    /// TOML config file
    #[arg(long, env = "TICKLOG_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Row counts, generations and rotation flags per stream
    Status,

    /// Recent entries of the export log
    Exports {
        #[arg(long)]
        stream: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    ticklog_backend::init_tracing("warn");
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(db) = &args.db {
        config.storage.db_path = db.clone();
    }
    let backend = SqliteBackend::open(&config.storage.db_path, config.storage.busy_timeout())
        .with_context(|| format!("Failed to open database: {}", config.storage.db_path))?;

    match args.command {
        Commands::Status => {
            let signal = FileSignalChannel::new(config.signal.dir.clone());
            print_status(&config.storage.db_path, &backend, &signal, &config.stream_ids()?).await?;
        }
        Commands::Exports { stream, limit } => {
            let stream = stream.as_deref().map(StreamId::parse).transpose()?;
            print_exports(&backend, stream.as_ref(), limit)?;
        }
    }
    Ok(())
}

async fn print_status(
    db_path: &str,
    backend: &SqliteBackend,
    signal: &FileSignalChannel,
    streams: &[StreamId],
) -> Result<()> {
    println!("Database: {} ({})", db_path, backend_label(backend));
    println!();

    for stream in streams {
        println!("[{}]", stream);
        let targets = stream.targets();
        for (label, target) in [("current", &targets.current), ("previous", &targets.previous)] {
            match backend.generation(target)? {
                None => println!("  {:<9} -", label),
                Some(generation) => {
                    let summary = backend.summary(target)?;
                    let kinds = MessageKind::ALL
                        .iter()
                        .map(|k| format!("{}={}", k.code(), summary.kind_count(*k)))
                        .collect::<Vec<_>>()
                        .join(" ");
                    println!(
                        "  {:<9} g{} rows={} span={}s {}",
                        label,
                        generation,
                        summary.rows,
                        summary.span().num_seconds(),
                        kinds
                    );
                }
            }
        }
        match signal.status(stream).await? {
            Some(flag) => println!("  signal    raised at {}", flag.raised_at.to_rfc3339()),
            None => println!("  signal    clear"),
        }
        if let Some(last) = backend.list_exports(Some(stream), 1)?.first() {
            println!(
                "  last export g{} rows={} at {} -> {}",
                last.generation,
                last.rows,
                last.exported_at.to_rfc3339(),
                last.file_path
            );
        }
        println!();
    }
    Ok(())
}

fn print_exports(backend: &SqliteBackend, stream: Option<&StreamId>, limit: usize) -> Result<()> {
    let records = backend.list_exports(stream, limit)?;
    if records.is_empty() {
        println!("No exports recorded");
        return Ok(());
    }
    println!(
        "{:<8} {:>6} {:>10} {:>10} {:<20} {:<6} FILE",
        "STREAM", "GEN", "ROWS", "BYTES", "PERIOD", "KEPT"
    );
    for r in records {
        println!(
            "{:<8} {:>6} {:>10} {:>10} {:<20} {:<6} {}",
            r.stream.as_str(),
            r.generation,
            r.rows,
            r.bytes,
            r.period_start.format("%Y-%m-%d %H:%M"),
            r.previous_kept,
            r.file_path
        );
    }
    Ok(())
}

fn backend_label(backend: &SqliteBackend) -> String {
    match backend.ping() {
        Ok(()) => "reachable".to_string(),
        Err(e) => format!("unreachable ({})", e),
    }
}
