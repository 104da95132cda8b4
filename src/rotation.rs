//! Rotation Orchestrator
//!
//! Drives one stream's rotation end to end:
//!
//! ```text
//! snapshot → raise signal → settle → swap → grace → fetch previous
//!          → export → verify → record → drop previous → clear signal
//! ```
//!
//! Streams rotate in parallel; a stream never has two rotations in flight.
//! The previous target is only dropped after its archive verified. A cycle
//! that fails after the swap keeps the previous target and the signal, and
//! the next cycle picks up at the export step without renaming again.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveExporter, CompositionReport, ExportReceipt};
use crate::clock::SharedClock;
use crate::config::{RotationConfig, MAX_SECS};
use crate::models::{Message, StreamId};
use crate::signal::SignalChannel;
use crate::storage::{ExportRecord, StorageBackend, TargetSummary};

/// Consecutive rows further apart than this are reported as gaps.
pub const GAP_THRESHOLD_SECS: i64 = 5;

// =============================================================================
// SCHEDULE
// =============================================================================

/// Periodic trigger aligned to UTC interval boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: chrono::Duration,
    /// Delay past each boundary before a cycle starts.
    pub offset: chrono::Duration,
    pub jitter: Duration,
}

impl Schedule {
    /// Hourly, one minute past the hour.
    pub fn hourly() -> Self {
        Self {
            interval: chrono::Duration::hours(1),
            offset: chrono::Duration::minutes(1),
            jitter: Duration::ZERO,
        }
    }

    /// Every five minutes, thirty seconds past the boundary.
    pub fn debug() -> Self {
        Self {
            interval: chrono::Duration::minutes(5),
            offset: chrono::Duration::seconds(30),
            jitter: Duration::ZERO,
        }
    }

    pub fn from_config(config: &RotationConfig) -> Self {
        let (interval, offset) = if config.debug_mode {
            (config.debug_interval_secs, config.debug_offset_secs)
        } else {
            (config.interval_secs, config.offset_secs)
        };
        Self {
            interval: chrono::Duration::seconds(interval.clamp(1, MAX_SECS) as i64),
            offset: chrono::Duration::seconds(offset.min(MAX_SECS) as i64),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Start of the interval containing `ts`.
    pub fn period_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let interval_ms = self.interval.num_milliseconds().max(1);
        let floored = ts.timestamp_millis().div_euclid(interval_ms) * interval_ms;
        Utc.timestamp_millis_opt(floored).single().unwrap_or(ts)
    }

    /// The last complete interval before `now`.
    pub fn previous_period(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self.period_start(now);
        (end - self.interval, end)
    }

    /// First trigger strictly after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let candidate = self.period_start(now) + self.offset;
        if candidate > now {
            candidate
        } else {
            candidate + self.interval
        }
    }

    /// Sleep duration until the next trigger, jitter included.
    pub fn delay_until_next(&self, now: DateTime<Utc>) -> Duration {
        let base = (self.next_run_after(now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStep {
    Inspect,
    RaiseSignal,
    Swap,
    Fetch,
    Export,
    Verify,
    RecordExport,
    DropPrevious,
    ClearSignal,
}

impl std::fmt::Display for RotationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inspect => write!(f, "inspect"),
            Self::RaiseSignal => write!(f, "raise_signal"),
            Self::Swap => write!(f, "swap"),
            Self::Fetch => write!(f, "fetch"),
            Self::Export => write!(f, "export"),
            Self::Verify => write!(f, "verify"),
            Self::RecordExport => write!(f, "record_export"),
            Self::DropPrevious => write!(f, "drop_previous"),
            Self::ClearSignal => write!(f, "clear_signal"),
        }
    }
}

/// A rotation that stopped before finishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationFailure {
    pub step: RotationStep,
    pub error: String,
    /// The previous target is still in the backend.
    pub previous_retained: bool,
    /// The signal was left raised for the next cycle.
    pub signal_raised: bool,
}

/// What a completed rotation did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationReport {
    pub run_id: String,
    pub stream: StreamId,
    /// Generation that was rotated out and archived.
    pub generation: Option<u64>,
    /// Generation of the fresh current target, if a swap happened.
    pub new_generation: Option<u64>,
    pub rows: u64,
    pub archive: Option<PathBuf>,
    pub period_start: DateTime<Utc>,
    /// Picked up a previous target left by an earlier failed cycle.
    pub resumed: bool,
    pub previous_kept: bool,
    pub composition: Option<CompositionReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RotationOutcome {
    Completed(RotationReport),
    /// Another rotation of the same stream was already running, here or in
    /// another process holding the signal.
    Skipped,
    Failed(RotationFailure),
}

impl RotationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Result of the orchestrator's startup checks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightReport {
    pub created_targets: Vec<String>,
    pub pending_previous: Vec<String>,
    pub raised_signals: Vec<String>,
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<StreamId>>,
    stream: StreamId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.stream);
    }
}

/// Where a cycle starts from.
enum Start {
    /// Normal cycle: raise, settle, swap.
    Fresh,
    /// A previous target that never verified is waiting; skip to export.
    Resume { generation: u64 },
}

pub struct RotationOrchestrator {
    backend: Arc<dyn StorageBackend>,
    signal: Arc<dyn SignalChannel>,
    exporter: Arc<dyn ArchiveExporter>,
    clock: SharedClock,
    config: RotationConfig,
    schedule: Schedule,
    in_flight: Mutex<HashSet<StreamId>>,
    /// `raised_at` of signals this orchestrator left raised after a failure.
    left_raised: Mutex<HashMap<StreamId, DateTime<Utc>>>,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("blocking task failed: {}", e))?
}

impl RotationOrchestrator {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        signal: Arc<dyn SignalChannel>,
        exporter: Arc<dyn ArchiveExporter>,
        clock: SharedClock,
        config: RotationConfig,
    ) -> Self {
        let schedule = Schedule::from_config(&config);
        Self {
            backend,
            signal,
            exporter,
            clock,
            config,
            schedule,
            in_flight: Mutex::new(HashSet::new()),
            left_raised: Mutex::new(HashMap::new()),
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn preserve_previous(&self) -> bool {
        self.config.preserve_previous
    }

    pub fn set_preserve_previous(&mut self, preserve: bool) {
        self.config.preserve_previous = preserve;
    }

    fn claim(&self, stream: &StreamId) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock();
        if !set.insert(stream.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            stream: stream.clone(),
        })
    }

    /// Check the backend, create missing current targets, and report
    /// leftovers from earlier cycles.
    pub async fn preflight(&self, streams: &[StreamId]) -> Result<PreflightReport> {
        self.backend.ping().context("backend unreachable")?;
        let mut report = PreflightReport::default();

        for stream in streams {
            let targets = stream.targets();
            if !self.backend.exists(&targets.current)? {
                let generation = self.backend.create(&targets.current)?;
                info!(stream = %stream, generation, "created missing current target");
                report.created_targets.push(targets.current.clone());
            }
            if self.backend.exists(&targets.previous)? {
                warn!(stream = %stream, table = %targets.previous, "previous target pending from an earlier cycle");
                report.pending_previous.push(targets.previous.clone());
            }
            if self.signal.is_raised(stream).await? {
                warn!(stream = %stream, "rotation signal already raised");
                report.raised_signals.push(stream.to_string());
            }
        }

        info!(
            streams = streams.len(),
            created = report.created_targets.len(),
            pending = report.pending_previous.len(),
            "preflight passed"
        );
        Ok(report)
    }

    /// Rotate one stream. A second call while one is running is skipped.
    pub async fn rotate(&self, stream: &StreamId) -> RotationOutcome {
        let Some(_guard) = self.claim(stream) else {
            info!(stream = %stream, "rotation already in flight, skipping");
            return RotationOutcome::Skipped;
        };

        let start = match self.decide_start(stream).await {
            Ok(Some(start)) => Ok(start),
            Ok(None) => return RotationOutcome::Skipped,
            Err(e) => Err(failure(RotationStep::Inspect, e, false, false)),
        };

        let run_id = Uuid::new_v4().to_string();
        info!(stream = %stream, run_id = %run_id, "rotation_started");

        let result = match start {
            Ok(start) => self.run(stream, &run_id, start).await,
            Err(failure) => Err(failure),
        };
        match result {
            Ok(report) => {
                self.left_raised.lock().remove(stream);
                info!(
                    stream = %stream,
                    run_id = %run_id,
                    rows = report.rows,
                    generation = ?report.generation,
                    resumed = report.resumed,
                    "rotation_completed"
                );
                RotationOutcome::Completed(report)
            }
            Err(failure) => {
                error!(
                    stream = %stream,
                    run_id = %run_id,
                    step = %failure.step,
                    error = %failure.error,
                    previous_retained = failure.previous_retained,
                    signal_raised = failure.signal_raised,
                    "rotation_failed"
                );
                if failure.signal_raised {
                    self.remember_raised(stream).await;
                } else if failure.step != RotationStep::Inspect {
                    self.left_raised.lock().remove(stream);
                }
                RotationOutcome::Failed(failure)
            }
        }
    }

    /// Rotate all streams in parallel.
    pub async fn run_cycle(&self, streams: &[StreamId]) -> Vec<(StreamId, RotationOutcome)> {
        let outcomes = join_all(streams.iter().map(|s| self.rotate(s))).await;
        let ok = outcomes.iter().filter(|o| o.is_success()).count();
        info!(streams = streams.len(), succeeded = ok, "rotation_cycle_finished");
        streams.iter().cloned().zip(outcomes).collect()
    }

    /// Run cycles on the schedule until shutdown.
    pub async fn run_scheduled(&self, streams: &[StreamId], mut shutdown: watch::Receiver<bool>) {
        loop {
            let now = self.clock.now();
            let delay = self.schedule.delay_until_next(now);
            info!(
                next_run = %self.schedule.next_run_after(now),
                wait_secs = delay.as_secs(),
                "waiting for next rotation"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    self.run_cycle(streams).await;
                }
                _ = shutdown.changed() => {
                    info!("rotation scheduler stopping");
                    break;
                }
            }
        }
    }

    // =========================================================================
    // CYCLE
    // =========================================================================

    async fn run(
        &self,
        stream: &StreamId,
        run_id: &str,
        start: Start,
    ) -> std::result::Result<RotationReport, RotationFailure> {
        let targets = stream.targets();
        let (generation, new_generation, resumed) = match start {
            Start::Resume { generation } => {
                warn!(stream = %stream, generation, "resuming retained previous target at export");
                (Some(generation), None, true)
            }
            Start::Fresh => {
                let (generation, new_generation) = self.raise_and_swap(stream).await?;
                (generation, Some(new_generation), false)
            }
        };

        // From here on the previous target holds the rotated-out rows
        let rows = {
            let backend = self.backend.clone();
            let previous = targets.previous.clone();
            blocking(move || backend.fetch_all(&previous))
                .await
                .map_err(|e| failure(RotationStep::Fetch, e, true, true))?
        };

        if rows.is_empty() {
            info!(stream = %stream, "previous target empty, nothing to export");
            self.drop_previous(stream)
                .await
                .map_err(|e| failure(RotationStep::DropPrevious, e, true, true))?;
            self.signal
                .clear(stream)
                .await
                .map_err(|e| failure(RotationStep::ClearSignal, e, false, true))?;
            return Ok(RotationReport {
                run_id: run_id.to_string(),
                stream: stream.clone(),
                generation,
                new_generation,
                rows: 0,
                archive: None,
                period_start: self.schedule.previous_period(self.clock.now()).0,
                resumed,
                previous_kept: false,
                composition: None,
            });
        }

        let composition =
            CompositionReport::analyze(&rows, chrono::Duration::seconds(GAP_THRESHOLD_SECS));
        info!(
            stream = %stream,
            rows = composition.rows,
            kinds = %composition.kinds_summary(),
            gaps = composition.gaps,
            max_gap_ms = composition.max_gap_ms,
            "export_composition"
        );
        if composition.gaps > 0 {
            warn!(stream = %stream, gaps = composition.gaps, threshold_secs = GAP_THRESHOLD_SECS, "timestamp gaps in rotated data");
        }

        // Named after the period its oldest row falls in, so a resumed export
        // keeps the name it would have had
        let period_start = composition
            .first_ts
            .map(|ts| self.schedule.period_start(ts))
            .unwrap_or_else(|| self.schedule.previous_period(self.clock.now()).0);

        let rows = Arc::new(rows);
        let export_generation = generation.unwrap_or(0);
        let destination =
            self.exporter
                .destination(stream, export_generation, period_start, self.config.debug_mode);

        let receipt = {
            let exporter = self.exporter.clone();
            let rows = rows.clone();
            blocking(move || exporter.export(&rows, &destination))
                .await
                .map_err(|e| failure(RotationStep::Export, e, true, true))?
        };

        self.verify(&receipt, rows.len() as u64)
            .await
            .map_err(|e| failure(RotationStep::Verify, e, true, true))?;

        let preserve = self.config.preserve_previous;
        let record = ExportRecord {
            run_id: run_id.to_string(),
            stream: stream.clone(),
            generation: export_generation,
            period_start,
            file_path: receipt.path.display().to_string(),
            rows: receipt.rows_written,
            bytes: receipt.bytes,
            sha256: receipt.sha256.clone(),
            exported_at: self.clock.now(),
            previous_kept: preserve,
        };
        {
            let backend = self.backend.clone();
            blocking(move || backend.record_export(&record))
                .await
                .map_err(|e| failure(RotationStep::RecordExport, e, true, true))?;
        }

        if preserve {
            self.cross_check(stream, &receipt, &rows).await;
        } else {
            self.drop_previous(stream)
                .await
                .map_err(|e| failure(RotationStep::DropPrevious, e, true, true))?;
            debug!(stream = %stream, table = %targets.previous, "previous target dropped");
        }

        self.signal
            .clear(stream)
            .await
            .map_err(|e| failure(RotationStep::ClearSignal, e, preserve, true))?;

        Ok(RotationReport {
            run_id: run_id.to_string(),
            stream: stream.clone(),
            generation,
            new_generation,
            rows: rows.len() as u64,
            archive: Some(receipt.path),
            period_start,
            resumed,
            previous_kept: preserve,
            composition: Some(composition),
        })
    }

    /// Resume a retained previous target or drop one that was already
    /// exported. `None` when another orchestrator raised the signal recently
    /// and may still be mid-cycle.
    async fn decide_start(&self, stream: &StreamId) -> Result<Option<Start>> {
        if let Some(signal) = self.signal.status(stream).await? {
            let owned = self.left_raised.lock().get(stream) == Some(&signal.raised_at);
            if !owned {
                let age = self.clock.now() - signal.raised_at;
                if age < self.config.stale_signal_after() {
                    info!(
                        stream = %stream,
                        raised_at = %signal.raised_at,
                        age_ms = age.num_milliseconds(),
                        "rotation signal held by another orchestrator, skipping"
                    );
                    return Ok(None);
                }
                warn!(
                    stream = %stream,
                    raised_at = %signal.raised_at,
                    age_secs = age.num_seconds(),
                    "stale rotation signal, taking over"
                );
            }
        }

        let generation = {
            let backend = self.backend.clone();
            let previous = stream.targets().previous;
            blocking(move || backend.generation(&previous)).await?
        };
        let Some(generation) = generation else {
            return Ok(Some(Start::Fresh));
        };

        let archived = {
            let backend = self.backend.clone();
            let stream = stream.clone();
            blocking(move || backend.find_export(&stream, generation)).await?
        };
        if archived.is_some() {
            info!(stream = %stream, generation, "previous target already archived, dropping");
            self.drop_previous(stream).await?;
            return Ok(Some(Start::Fresh));
        }

        Ok(Some(Start::Resume { generation }))
    }

    async fn drop_previous(&self, stream: &StreamId) -> Result<()> {
        let backend = self.backend.clone();
        let previous = stream.targets().previous;
        blocking(move || backend.drop_target(&previous)).await
    }

    async fn remember_raised(&self, stream: &StreamId) {
        match self.signal.status(stream).await {
            Ok(Some(signal)) => {
                self.left_raised.lock().insert(stream.clone(), signal.raised_at);
            }
            Ok(None) => {
                self.left_raised.lock().remove(stream);
            }
            Err(e) => warn!(stream = %stream, error = %e, "could not read back signal left raised"),
        }
    }

    /// Raise, settle, swap, grace. Returns (rotated-out, fresh) generations.
    async fn raise_and_swap(
        &self,
        stream: &StreamId,
    ) -> std::result::Result<(Option<u64>, u64), RotationFailure> {
        let targets = stream.targets();

        if let Some(before) = self.snapshot(&targets.current).await {
            log_activity(stream, "before_swap", &before);
        }

        self.signal
            .raise(stream, self.clock.now())
            .await
            .map_err(|e| failure(RotationStep::RaiseSignal, e, false, false))?;

        tokio::time::sleep(self.config.settle()).await;

        let swapped = {
            let backend = self.backend.clone();
            let targets = targets.clone();
            blocking(move || {
                let generation = backend.generation(&targets.current).ok().flatten();
                backend
                    .swap(&targets.current, &targets.previous)
                    .map(|fresh| (generation, fresh))
            })
            .await
        };
        let (generation, new_generation) = match swapped {
            Ok(pair) => pair,
            Err(e) => {
                // Nothing moved: release the writer
                let cleared = self.signal.clear(stream).await;
                if let Err(clear_err) = &cleared {
                    warn!(stream = %stream, error = %clear_err, "failed to clear signal after swap failure");
                }
                return Err(failure(RotationStep::Swap, e, false, cleared.is_err()));
            }
        };
        info!(
            stream = %stream,
            rotated_out = ?generation,
            fresh = new_generation,
            "targets_swapped"
        );

        tokio::time::sleep(self.config.grace()).await;

        if let Some(after) = self.snapshot(&targets.current).await {
            log_activity(stream, "after_grace", &after);
        }
        Ok((generation, new_generation))
    }

    async fn verify(&self, receipt: &ExportReceipt, expected: u64) -> Result<()> {
        let exporter = self.exporter.clone();
        let check = receipt.clone();
        let counted = blocking(move || exporter.verify(&check)).await?;
        if counted != expected || receipt.rows_written != expected {
            return Err(anyhow!(
                "row count mismatch: fetched {}, written {}, re-read {}",
                expected,
                receipt.rows_written,
                counted
            ));
        }
        debug!(path = %receipt.path.display(), rows = counted, "archive verified");
        Ok(())
    }

    /// Compare the archive with the kept previous target. Reports only.
    async fn cross_check(&self, stream: &StreamId, receipt: &ExportReceipt, rows: &[Message]) {
        let exporter = self.exporter.clone();
        let path = receipt.path.clone();
        let archived = match blocking(move || exporter.read_back(&path)).await {
            Ok(messages) => TargetSummary::from_messages(&messages),
            Err(e) => {
                warn!(stream = %stream, error = %e, "cross-check could not read archive");
                return;
            }
        };
        let stored = {
            let backend = self.backend.clone();
            let previous = stream.targets().previous;
            blocking(move || backend.summary(&previous)).await
        };
        let stored = match stored {
            Ok(summary) => summary,
            Err(e) => {
                warn!(stream = %stream, error = %e, "cross-check could not summarise previous target");
                return;
            }
        };

        if archived.rows == stored.rows && archived.kinds == stored.kinds {
            info!(
                stream = %stream,
                rows = stored.rows,
                fetched = rows.len(),
                "preserved previous target matches archive"
            );
        } else {
            warn!(
                stream = %stream,
                archived_rows = archived.rows,
                stored_rows = stored.rows,
                "preserved previous target differs from archive"
            );
        }
    }

    async fn snapshot(&self, target: &str) -> Option<TargetSummary> {
        let backend = self.backend.clone();
        let table = target.to_string();
        match blocking(move || backend.summary(&table)).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                debug!(table = target, error = %e, "activity snapshot unavailable");
                None
            }
        }
    }
}

fn failure(
    step: RotationStep,
    error: anyhow::Error,
    previous_retained: bool,
    signal_raised: bool,
) -> RotationFailure {
    RotationFailure {
        step,
        error: format!("{:#}", error),
        previous_retained,
        signal_raised,
    }
}

fn log_activity(stream: &StreamId, phase: &str, summary: &TargetSummary) {
    info!(
        stream = %stream,
        phase,
        rows = summary.rows,
        span_secs = summary.span().num_seconds(),
        rate_per_sec = summary.rate_per_sec(),
        kinds = summary.distinct_kinds(),
        "activity_snapshot"
    );
}
