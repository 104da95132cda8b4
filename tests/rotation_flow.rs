//! Integration tests for a writer and the orchestrator sharing one SQLite
//! database and one flag directory.
//!
//! Every message must end up exactly once in either the archive of the
//! rotated-out generation or the fresh current target.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use ticklog_backend::archive::{ArchiveExporter, ExportReceipt, JsonlExporter};
use ticklog_backend::clock::system_clock;
use ticklog_backend::config::{RotationConfig, WriterConfig};
use ticklog_backend::feed::{ChannelSource, FeedItem};
use ticklog_backend::models::{Message, MessageKind, StreamId};
use ticklog_backend::rotation::{RotationOrchestrator, RotationOutcome, RotationStep};
use ticklog_backend::signal::{FileSignalChannel, SignalChannel};
use ticklog_backend::storage::{SqliteBackend, StorageBackend};
use ticklog_backend::writer::{IngestExit, RouteDecision, SignalObservation, StreamWriter, WriterSet};

struct Env {
    _dir: tempfile::TempDir,
    backend: Arc<SqliteBackend>,
    signal: Arc<FileSignalChannel>,
    exporter: Arc<JsonlExporter>,
}

fn env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(
        SqliteBackend::open(
            dir.path().join("ticklog.db").to_str().unwrap(),
            Duration::from_millis(200),
        )
        .unwrap(),
    );
    let signal = Arc::new(FileSignalChannel::new(dir.path().join("flags")));
    std::fs::create_dir_all(dir.path().join("flags")).unwrap();
    let exporter = Arc::new(JsonlExporter::new(dir.path().join("exports")));
    Env {
        _dir: dir,
        backend,
        signal,
        exporter,
    }
}

fn btc() -> StreamId {
    StreamId::parse("btc").unwrap()
}

fn writer_config() -> WriterConfig {
    WriterConfig {
        signal_poll_interval_ms: 10,
        reconnect_poll_interval_ms: 5,
        replay_drain_interval_ms: 10,
        rotation_wait_timeout_ms: 2_000,
        ..WriterConfig::default()
    }
}

fn rotation_config(settle_ms: u64) -> RotationConfig {
    RotationConfig {
        settle_ms,
        grace_ms: 50,
        ..RotationConfig::default()
    }
}

fn orchestrator(env: &Env, exporter: Arc<dyn ArchiveExporter>, config: RotationConfig) -> RotationOrchestrator {
    RotationOrchestrator::new(
        env.backend.clone(),
        env.signal.clone(),
        exporter,
        system_clock(),
        config,
    )
}

fn msg(i: usize) -> Message {
    Message::new(Utc::now(), MessageKind::Deal, format!("m{:05}", i))
}

fn payloads(rows: &[Message]) -> Vec<String> {
    rows.iter()
        .map(|m| String::from_utf8(m.payload.clone()).unwrap())
        .collect()
}

#[tokio::test]
async fn writer_buffers_during_rotation_and_lands_in_fresh_target() {
    let env = env();
    let writer = Arc::new(StreamWriter::new(
        btc(),
        env.backend.clone(),
        system_clock(),
        writer_config(),
    ));
    writer.startup(None).unwrap();

    for i in 0..10 {
        assert_eq!(writer.submit(msg(i)), RouteDecision::Direct);
    }

    let orch = Arc::new(orchestrator(&env, env.exporter.clone(), rotation_config(300)));
    let rotation = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.rotate(&btc()).await })
    };

    // Wait for the flag, then act on it the way the poll loop would
    let signal = loop {
        if let Some(signal) = env.signal.status(&btc()).await.unwrap() {
            break signal;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(matches!(writer.observe(Some(&signal)), SignalObservation::Entered(_)));

    for i in 10..15 {
        assert_eq!(writer.submit(msg(i)), RouteDecision::Rotation);
    }
    let drain = writer.complete_rotation().await;
    assert_eq!(drain.written, 5);
    assert!(!drain.timed_out);
    assert!(!writer.in_rotation());

    let outcome = rotation.await.unwrap();
    let RotationOutcome::Completed(report) = outcome else {
        panic!("rotation did not complete: {:?}", outcome);
    };
    assert_eq!(report.rows, 10);

    let archived = env.exporter.read_back(report.archive.as_ref().unwrap()).unwrap();
    let expected: Vec<String> = (0..10).map(|i| format!("m{:05}", i)).collect();
    assert_eq!(payloads(&archived), expected);

    let current = env.backend.fetch_all(&btc().targets().current).unwrap();
    let expected: Vec<String> = (10..15).map(|i| format!("m{:05}", i)).collect();
    assert_eq!(payloads(&current), expected);

    assert!(!env.backend.exists(&btc().targets().previous).unwrap());
    assert!(!env.signal.is_raised(&btc()).await.unwrap());

    // A later poll of the cleared channel does not start a new episode
    assert_eq!(writer.poll_signal(env.signal.as_ref()).await, SignalObservation::Idle);
}

/// Exporter that fails its next `n` exports.
struct FailingExporter {
    inner: JsonlExporter,
    failures: AtomicU32,
}

impl ArchiveExporter for FailingExporter {
    fn destination(
        &self,
        stream: &StreamId,
        generation: u64,
        period_start: DateTime<Utc>,
        debug: bool,
    ) -> std::path::PathBuf {
        self.inner.destination(stream, generation, period_start, debug)
    }

    fn export(&self, rows: &[Message], destination: &Path) -> Result<ExportReceipt> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("export destination unavailable"));
        }
        self.inner.export(rows, destination)
    }

    fn verify(&self, receipt: &ExportReceipt) -> Result<u64> {
        self.inner.verify(receipt)
    }

    fn read_back(&self, path: &Path) -> Result<Vec<Message>> {
        self.inner.read_back(path)
    }
}

#[tokio::test]
async fn failed_export_keeps_data_until_next_cycle() {
    let env = env();
    let current = btc().targets().current;
    env.backend.ensure(&current).unwrap();
    let rows: Vec<Message> = (0..40).map(msg).collect();
    env.backend.insert(&current, &rows).unwrap();

    let exporter = Arc::new(FailingExporter {
        inner: JsonlExporter::new(env.exporter.dir().to_path_buf()),
        failures: AtomicU32::new(1),
    });
    let orch = orchestrator(&env, exporter.clone(), rotation_config(20));

    let RotationOutcome::Failed(failure) = orch.rotate(&btc()).await else {
        panic!("first cycle should fail");
    };
    assert_eq!(failure.step, RotationStep::Export);
    assert!(failure.previous_retained);
    assert_eq!(env.backend.summary(&btc().targets().previous).unwrap().rows, 40);
    assert!(env.signal.is_raised(&btc()).await.unwrap());

    // New rows keep landing in the fresh current target meanwhile
    env.backend.insert(&current, &[msg(40)]).unwrap();

    let RotationOutcome::Completed(report) = orch.rotate(&btc()).await else {
        panic!("second cycle should complete");
    };
    assert!(report.resumed);
    assert_eq!(report.rows, 40);
    assert_eq!(exporter.read_back(report.archive.as_ref().unwrap()).unwrap().len(), 40);
    assert_eq!(env.backend.summary(&current).unwrap().rows, 1);
    assert!(!env.backend.exists(&btc().targets().previous).unwrap());
    assert!(!env.signal.is_raised(&btc()).await.unwrap());

    let log = env.backend.list_exports(Some(&btc()), 10).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].rows, 40);
}

#[tokio::test]
async fn continuous_feed_through_rotation_loses_nothing() {
    const TOTAL: usize = 400;

    let env = env();
    let streams = vec![btc()];
    let writers = Arc::new(WriterSet::new(
        &streams,
        env.backend.clone(),
        system_clock(),
        &writer_config(),
    ));
    writers.startup(env.signal.as_ref()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = writers.spawn_background(env.signal.clone(), shutdown_rx.clone());

    let (tx, mut source) = ChannelSource::channel(64);
    let producer = tokio::spawn(async move {
        for i in 0..TOTAL {
            tx.send(FeedItem { stream: btc(), message: msg(i) }).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    let ingest = {
        let writers = writers.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { writers.run(&mut source, rx).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let orch = orchestrator(&env, env.exporter.clone(), rotation_config(100));
    let outcome = orch.rotate(&btc()).await;
    let RotationOutcome::Completed(report) = outcome else {
        panic!("rotation did not complete: {:?}", outcome);
    };

    producer.await.unwrap();
    assert_eq!(ingest.await.unwrap().unwrap(), IngestExit::FeedEnded);

    // Let an in-flight episode finish before stopping the loops
    let writer = writers.get(&btc()).unwrap().clone();
    for _ in 0..200 {
        if !writer.in_rotation() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let _ = shutdown_tx.send(true);
    for handle in background {
        handle.await.unwrap();
    }
    assert_eq!(writers.flush(50), 0);

    let archived = payloads(&env.exporter.read_back(report.archive.as_ref().unwrap()).unwrap());
    let current = payloads(&env.backend.fetch_all(&btc().targets().current).unwrap());
    assert_eq!(archived.len() as u64, report.rows);
    assert_eq!(archived.len() + current.len(), TOTAL);

    let mut seen = HashSet::new();
    for p in archived.iter().chain(current.iter()) {
        assert!(seen.insert(p.clone()), "duplicate {}", p);
    }

    // Each side keeps arrival order
    let mut sorted = archived.clone();
    sorted.sort();
    assert_eq!(archived, sorted);
    let mut sorted = current.clone();
    sorted.sort();
    assert_eq!(current, sorted);
    assert_eq!(writer.stats().lost(), 0);
}
