//! Ticklog stream writer
//!
//! Reads JSON Lines messages from a file or stdin and appends them to the
//! current target of each configured stream, riding through backend outages
//! and target rotations.
//!
//! Usage:
//!   ticklog --config ticklog.toml --input feed.jsonl
//!   some-feed | ticklog --streams btc,eth

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use ticklog_backend::clock::system_clock;
use ticklog_backend::config::AppConfig;
use ticklog_backend::feed::{JsonLinesSource, MessageSource};
use ticklog_backend::signal::{FileSignalChannel, SignalChannel};
use ticklog_backend::storage::{SqliteBackend, StorageBackend};
use ticklog_backend::writer::{IngestExit, WriterSet};

/// Replay passes attempted on the way out.
const FLUSH_PASSES: usize = 200;

#[derive(Parser, Debug)]
#[command(name = "ticklog")]
#[command(about = "Write stream messages into rotating storage targets")]
struct Args {
    /// TOML config file
    #[arg(long, env = "TICKLOG_CONFIG")]
    config: Option<PathBuf>,

    /// JSON Lines feed; stdin when omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// Streams to write, comma separated
    #[arg(long, value_delimiter = ',')]
    streams: Vec<String>,

    /// SQLite database path
    #[arg(long)]
    db: Option<String>,

    /// Directory holding rotation flag files
    #[arg(long)]
    signal_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    ticklog_backend::init_tracing("ticklog_backend=info,ticklog=info");
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if !args.streams.is_empty() {
        config.streams = args.streams.clone();
    }
    if let Some(db) = &args.db {
        config.storage.db_path = db.clone();
    }
    if let Some(dir) = &args.signal_dir {
        config.signal.dir = dir.clone();
    }
    config.validate()?;
    let streams = config.stream_ids()?;

    info!(
        streams = %streams.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(","),
        db = %config.storage.db_path,
        signal_dir = %config.signal.dir.display(),
        "starting ticklog writer"
    );

    let backend: Arc<dyn StorageBackend> = Arc::new(
        SqliteBackend::open(&config.storage.db_path, config.storage.busy_timeout())
            .context("Failed to open storage backend")?,
    );
    let signal: Arc<dyn SignalChannel> = Arc::new(FileSignalChannel::new(config.signal.dir.clone()));

    let writers = WriterSet::new(&streams, backend, system_clock(), &config.writer);
    writers.startup(signal.as_ref()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = writers.spawn_background(signal.clone(), shutdown_rx.clone());

    let mut source: Box<dyn MessageSource> = match &args.input {
        Some(path) => Box::new(JsonLinesSource::open(path, writers.default_stream()).await?),
        None => Box::new(JsonLinesSource::stdin(writers.default_stream())),
    };

    let exit = tokio::select! {
        result = writers.run(source.as_mut(), shutdown_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            Ok(IngestExit::Shutdown)
        }
    };

    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    let left = writers.flush(FLUSH_PASSES);
    writers.log_stats();

    match exit {
        Ok(reason) => {
            info!(?reason, unflushed = left, feed_errors = writers.errors(), "ticklog writer stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), unflushed = left, "ticklog writer aborted");
            Err(e)
        }
    }
}
