//! Stream Writer
//!
//! Routes each message for one stream to exactly one of:
//! - the rotation buffer, while a rotation episode is open
//! - the replay buffer, while the circuit is not healthy or after a failed write
//! - a direct write to the current target
//!
//! Background loops (probe, replay drain, signal poll, stats) run per stream
//! and touch shared state only through short `parking_lot` critical sections.

use std::collections::HashMap;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::clock::SharedClock;
use crate::config::WriterConfig;
use crate::feed::MessageSource;
use crate::models::{BufferedEntry, Message, StreamId, StreamTargets};
use crate::reliability::{
    CircuitState, DrainReport, HealthConfig, HealthMonitor, LossReason, ReplayBuffer,
    RotationBuffer, StreamStats,
};
use crate::signal::{RotationSignal, SignalChannel};
use crate::storage::StorageBackend;

/// Where a submitted message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Direct,
    Replay,
    Rotation,
}

/// What the writer made of one signal poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalObservation {
    /// No signal raised.
    Idle,
    /// A new episode was opened; writes now go to the rotation buffer.
    Entered(DateTime<Utc>),
    /// The current episode is still being handled.
    InProgress,
    /// The raised signal belongs to an episode already resolved here.
    Resolved,
}

/// Outcome of draining the rotation buffer after a swap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationDrain {
    pub written: usize,
    pub moved_to_replay: usize,
    pub rejected: usize,
    /// Entries evicted from the replay buffer while moving.
    pub overflowed: usize,
    /// The fresh current target was not seen before the wait ran out.
    pub timed_out: bool,
}

/// Reads of the current target's generation when an episode opens.
const BASELINE_READ_ATTEMPTS: u32 = 3;

/// Generation of the current target when the open episode began.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Baseline {
    /// No episode open yet.
    #[default]
    Unset,
    Known(Option<u64>),
    /// The read failed, so a changed generation cannot be told apart from
    /// the old one. The episode stays open until the wait runs out.
    Unknown,
}

#[derive(Debug, Default)]
struct EpisodeState {
    /// `raised_at` of the last episode fully handled by this writer.
    last_resolved: Option<DateTime<Utc>>,
    baseline: Baseline,
}

// =============================================================================
// STREAM WRITER
// =============================================================================

pub struct StreamWriter {
    stream: StreamId,
    targets: StreamTargets,
    backend: Arc<dyn StorageBackend>,
    clock: SharedClock,
    config: WriterConfig,
    health: HealthMonitor,
    replay: ReplayBuffer,
    rotation: RotationBuffer,
    stats: StreamStats,
    next_seq: AtomicU64,
    episode: Mutex<EpisodeState>,
}

impl StreamWriter {
    pub fn new(
        stream: StreamId,
        backend: Arc<dyn StorageBackend>,
        clock: SharedClock,
        config: WriterConfig,
    ) -> Self {
        let health = HealthMonitor::new(
            stream.as_str(),
            HealthConfig {
                failure_threshold: config.failure_threshold,
                healthy_probe_interval: Duration::from_millis(config.healthy_probe_interval_ms),
                down_probe_interval: Duration::from_millis(config.down_probe_interval_ms),
            },
            clock.clone(),
        );
        let replay = ReplayBuffer::new(config.replay_capacity, config.replay_ttl());

        Self {
            targets: stream.targets(),
            stream,
            backend,
            clock,
            config,
            health,
            replay,
            rotation: RotationBuffer::new(),
            stats: StreamStats::new(),
            next_seq: AtomicU64::new(0),
            episode: Mutex::new(EpisodeState::default()),
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.health.current_state()
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    pub fn rotation_len(&self) -> usize {
        self.rotation.len()
    }

    pub fn in_rotation(&self) -> bool {
        self.rotation.is_active()
    }

    /// Make sure the current target exists and adopt an already-raised signal
    /// as resolved: its swap, if any, predates this process.
    pub fn startup(&self, existing_signal: Option<&RotationSignal>) -> Result<()> {
        let generation = self.backend.ensure(&self.targets.current)?;
        info!(stream = %self.stream, table = %self.targets.current, generation, "writer ready");

        if let Some(signal) = existing_signal {
            self.episode.lock().last_resolved = Some(signal.raised_at);
            warn!(
                stream = %self.stream,
                raised_at = %signal.raised_at,
                "rotation signal already raised at startup, treating as observed with empty buffer"
            );
        }
        Ok(())
    }

    // =========================================================================
    // ROUTING
    // =========================================================================

    pub fn submit(&self, message: Message) -> RouteDecision {
        self.stats.record_received(message.kind);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = BufferedEntry::new(message, self.clock.now(), seq);

        let entry = match self.rotation.try_push(entry) {
            Ok(()) => {
                self.stats.record_rotation_buffered();
                return RouteDecision::Rotation;
            }
            Err(entry) => entry,
        };

        if !self.health.current_state().is_healthy() {
            self.enqueue_replay(entry);
            return RouteDecision::Replay;
        }

        match self
            .backend
            .insert(&self.targets.current, slice::from_ref(&entry.message))
        {
            Ok(_) => {
                self.health.record_result(true);
                self.stats.record_direct_writes(1);
                trace!(stream = %self.stream, seq, "direct write");
                RouteDecision::Direct
            }
            Err(e) => {
                self.health.record_result(false);
                self.stats.record_write_failure();
                debug!(stream = %self.stream, seq, error = %e, "direct write failed, buffering");
                self.enqueue_replay(entry);
                RouteDecision::Replay
            }
        }
    }

    fn enqueue_replay(&self, entry: BufferedEntry) {
        self.stats.record_replay_enqueued(1);
        if let Some(evicted) = self.replay.enqueue(entry) {
            self.stats.record_lost(LossReason::Overflow, 1);
            warn!(
                stream = %self.stream,
                seq = evicted.seq,
                reason = %LossReason::Overflow,
                "record_lost"
            );
        }
    }

    // =========================================================================
    // HEALTH AND REPLAY
    // =========================================================================

    /// One health probe against the backend.
    pub fn probe(&self) -> bool {
        self.health
            .check_health(|| self.backend.ping().map(|_| true))
    }

    /// One replay drain pass; a no-op unless the circuit is healthy.
    pub fn drain_replay(&self) -> DrainReport {
        if !self.health.current_state().is_healthy() || self.replay.is_empty() {
            return DrainReport::default();
        }

        let report = self
            .replay
            .drain(self.config.replay_batch_size, self.clock.now(), |entry| {
                self.backend
                    .insert(&self.targets.current, slice::from_ref(&entry.message))
                    .map(|_| ())
            });

        self.stats.record_replay_drained(report.written as u64);
        self.stats.record_lost(LossReason::Expired, report.expired as u64);
        self.stats.record_lost(LossReason::Overflow, report.overflowed as u64);

        if report.expired > 0 {
            warn!(
                stream = %self.stream,
                count = report.expired,
                reason = %LossReason::Expired,
                "record_lost"
            );
        }
        if report.halted {
            self.health.record_result(false);
            debug!(stream = %self.stream, written = report.written, "replay drain halted");
        } else if report.written > 0 {
            self.health.record_result(true);
            debug!(
                stream = %self.stream,
                written = report.written,
                remaining = self.replay.len(),
                "replay drained"
            );
        }
        report
    }

    // =========================================================================
    // ROTATION PROTOCOL
    // =========================================================================

    /// Act on the latest signal status.
    pub fn observe(&self, signal: Option<&RotationSignal>) -> SignalObservation {
        let mut episode = self.episode.lock();

        let Some(signal) = signal else {
            // Cleared: the next raise is a new episode whatever its timestamp
            episode.last_resolved = None;
            return if self.rotation.is_active() {
                SignalObservation::InProgress
            } else {
                SignalObservation::Idle
            };
        };

        if self.rotation.is_active() {
            return SignalObservation::InProgress;
        }
        if episode.last_resolved == Some(signal.raised_at) {
            return SignalObservation::Resolved;
        }

        // Activate first so no write slips past while the generation is read
        self.rotation.activate(signal.raised_at);
        episode.baseline = self.read_baseline();
        self.stats.record_rotation_episode();
        info!(
            stream = %self.stream,
            raised_at = %signal.raised_at,
            baseline = ?episode.baseline,
            "rotation_buffer_activated"
        );
        SignalObservation::Entered(signal.raised_at)
    }

    fn read_baseline(&self) -> Baseline {
        for attempt in 1..=BASELINE_READ_ATTEMPTS {
            match self.backend.generation(&self.targets.current) {
                Ok(generation) => return Baseline::Known(generation),
                Err(e) => debug!(
                    stream = %self.stream,
                    attempt,
                    error = %e,
                    "baseline generation read failed"
                ),
            }
        }
        warn!(
            stream = %self.stream,
            "baseline generation unknown, holding rotation buffer until the wait runs out"
        );
        Baseline::Unknown
    }

    /// Wait for the fresh current target, then drain the rotation buffer into
    /// it and close the episode.
    pub async fn complete_rotation(self: &Arc<Self>) -> RotationDrain {
        let Some(raised_at) = self.rotation.episode() else {
            return RotationDrain::default();
        };
        let baseline = self.episode.lock().baseline;

        let timed_out = !self.wait_for_fresh_target(baseline).await;
        if timed_out {
            warn!(
                stream = %self.stream,
                waited_ms = self.config.rotation_wait_timeout_ms,
                "fresh target not observed, proceeding anyway"
            );
        }

        let mut drain = self
            .off_runtime(|writer| writer.drain_rotation_buffer())
            .await
            .unwrap_or_default();
        drain.timed_out = timed_out;

        self.episode.lock().last_resolved = Some(raised_at);
        info!(
            stream = %self.stream,
            written = drain.written,
            moved_to_replay = drain.moved_to_replay,
            rejected = drain.rejected,
            "rotation_buffer_drained"
        );
        drain
    }

    async fn wait_for_fresh_target(self: &Arc<Self>, baseline: Baseline) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.rotation_wait_timeout();
        loop {
            if let Baseline::Known(base) = baseline {
                let current = self
                    .off_runtime(|writer| writer.backend.generation(&writer.targets.current))
                    .await;
                match current {
                    Some(Ok(Some(generation))) if Some(generation) != base => {
                        debug!(stream = %self.stream, generation, "fresh target observed");
                        return true;
                    }
                    Some(Ok(_)) | None => {}
                    Some(Err(e)) => {
                        debug!(stream = %self.stream, error = %e, "generation check failed")
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.reconnect_poll_interval()).await;
        }
    }

    /// Drain until the buffer is empty and the episode closes.
    fn drain_rotation_buffer(&self) -> RotationDrain {
        let mut drain = RotationDrain::default();

        loop {
            let batch = self.rotation.take_all();
            if batch.is_empty() {
                if self.rotation.deactivate_if_empty() {
                    break;
                }
                continue;
            }

            if !self.health.current_state().is_healthy() {
                self.move_to_replay(batch, &mut drain);
                continue;
            }

            let messages: Vec<Message> = batch.iter().map(|e| e.message.clone()).collect();
            match self.backend.insert(&self.targets.current, &messages) {
                Ok(n) => {
                    self.health.record_result(true);
                    self.stats.record_rotation_drained(n as u64);
                    drain.written += n;
                }
                Err(e) => {
                    warn!(
                        stream = %self.stream,
                        entries = batch.len(),
                        error = %e,
                        "batch drain failed, falling back to single inserts"
                    );
                    self.drain_one_by_one(batch, &mut drain);
                }
            }
        }

        drain
    }

    fn drain_one_by_one(&self, batch: Vec<BufferedEntry>, drain: &mut RotationDrain) {
        let mut remaining = batch.into_iter();
        while let Some(entry) = remaining.next() {
            match self
                .backend
                .insert(&self.targets.current, slice::from_ref(&entry.message))
            {
                Ok(_) => {
                    self.stats.record_rotation_drained(1);
                    drain.written += 1;
                }
                Err(e) => {
                    if self.probe() {
                        // Backend is up and still refuses this entry
                        self.stats.record_lost(LossReason::Rejected, 1);
                        drain.rejected += 1;
                        warn!(
                            stream = %self.stream,
                            seq = entry.seq,
                            kind = %entry.message.kind,
                            error = %e,
                            reason = %LossReason::Rejected,
                            "record_lost"
                        );
                    } else {
                        let rest: Vec<BufferedEntry> =
                            std::iter::once(entry).chain(remaining).collect();
                        warn!(
                            stream = %self.stream,
                            entries = rest.len(),
                            "backend unreachable during drain, moving to replay buffer"
                        );
                        self.move_to_replay(rest, drain);
                        return;
                    }
                }
            }
        }
    }

    fn move_to_replay(&self, entries: Vec<BufferedEntry>, drain: &mut RotationDrain) {
        let count = entries.len();
        self.stats.record_replay_enqueued(count as u64);
        let evicted = self.replay.enqueue_all(entries);
        self.stats.record_lost(LossReason::Overflow, evicted as u64);
        if evicted > 0 {
            warn!(
                stream = %self.stream,
                count = evicted,
                reason = %LossReason::Overflow,
                "record_lost"
            );
        }
        drain.moved_to_replay += count;
        drain.overflowed += evicted;
    }

    /// Poll the channel once and, on a new episode, see it through.
    pub async fn poll_signal(self: &Arc<Self>, channel: &dyn SignalChannel) -> SignalObservation {
        let status = match channel.status(&self.stream).await {
            Ok(status) => status,
            Err(e) => {
                warn!(stream = %self.stream, error = %e, "signal poll failed");
                return SignalObservation::Idle;
            }
        };

        let Some(observation) = self
            .off_runtime(move |writer| writer.observe(status.as_ref()))
            .await
        else {
            return SignalObservation::Idle;
        };
        if let SignalObservation::Entered(_) = observation {
            self.complete_rotation().await;
        }
        observation
    }

    // =========================================================================
    // HOUSEKEEPING
    // =========================================================================

    pub fn log_stats(&self) {
        let rows = self
            .backend
            .summary(&self.targets.current)
            .map(|s| s.rows as i64)
            .unwrap_or(-1);
        info!(
            stream = %self.stream,
            circuit = %self.health.current_state(),
            replay_len = self.replay.len(),
            rotation_len = self.rotation.len(),
            current_rows = rows,
            summary = %self.stats.summary(),
            "writer_stats"
        );
    }

    /// Best-effort flush of the replay buffer before exit. Returns how many
    /// entries are still buffered.
    pub fn flush(&self, max_passes: usize) -> usize {
        for _ in 0..max_passes {
            if self.replay.is_empty() {
                break;
            }
            if !self.health.current_state().is_healthy() && !self.probe() {
                break;
            }
            if self.drain_replay().halted {
                break;
            }
        }
        let left = self.replay.len() + self.rotation.len();
        if left > 0 {
            warn!(stream = %self.stream, buffered = left, "exiting with buffered records");
        }
        left
    }

    /// Run a backend-touching step on the blocking pool.
    async fn off_runtime<T, F>(self: &Arc<Self>, f: F) -> Option<T>
    where
        F: FnOnce(&StreamWriter) -> T + Send + 'static,
        T: Send + 'static,
    {
        let writer = Arc::clone(self);
        match tokio::task::spawn_blocking(move || f(&writer)).await {
            Ok(value) => Some(value),
            Err(e) => {
                error!(stream = %self.stream, error = %e, "blocking writer task failed");
                None
            }
        }
    }

    /// Spawn the probe, replay-drain, signal-poll and stats loops.
    pub fn spawn_background(
        self: &Arc<Self>,
        signal: Arc<dyn SignalChannel>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(4);

        let writer = Arc::clone(self);
        let mut stop = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let delay = writer.health.probe_interval();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        writer.off_runtime(|w| w.probe()).await;
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        let writer = Arc::clone(self);
        let mut stop = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let delay = writer.config.replay_drain_interval();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        writer.off_runtime(|w| w.drain_replay()).await;
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        let writer = Arc::clone(self);
        let mut stop = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let delay = writer.config.signal_poll_interval();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        writer.poll_signal(signal.as_ref()).await;
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        let writer = Arc::clone(self);
        let mut stop = shutdown;
        handles.push(tokio::spawn(async move {
            let delay = writer.config.stats_interval();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        writer.off_runtime(|w| w.log_stats()).await;
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        handles
    }
}

// =============================================================================
// MULTI-STREAM INGESTION
// =============================================================================

/// Why the ingestion loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestExit {
    FeedEnded,
    Shutdown,
}

/// All stream writers of one process plus the feed-level error valve.
pub struct WriterSet {
    writers: HashMap<StreamId, Arc<StreamWriter>>,
    default_stream: Option<StreamId>,
    errors: AtomicU64,
    max_error_count: u64,
}

impl WriterSet {
    pub fn new(
        streams: &[StreamId],
        backend: Arc<dyn StorageBackend>,
        clock: SharedClock,
        config: &WriterConfig,
    ) -> Self {
        let writers = streams
            .iter()
            .map(|id| {
                let writer = StreamWriter::new(id.clone(), backend.clone(), clock.clone(), config.clone());
                (id.clone(), Arc::new(writer))
            })
            .collect();

        Self {
            writers,
            default_stream: if streams.len() == 1 { streams.first().cloned() } else { None },
            errors: AtomicU64::new(0),
            max_error_count: config.max_error_count,
        }
    }

    /// Stream assumed for feed records that name none.
    pub fn default_stream(&self) -> Option<StreamId> {
        self.default_stream.clone()
    }

    pub fn get(&self, stream: &StreamId) -> Option<&Arc<StreamWriter>> {
        self.writers.get(stream)
    }

    pub fn writers(&self) -> impl Iterator<Item = &Arc<StreamWriter>> {
        self.writers.values()
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Run startup checks for every stream.
    pub async fn startup(&self, signal: &dyn SignalChannel) -> Result<()> {
        for writer in self.writers.values() {
            let existing = signal.status(writer.stream()).await?;
            writer.startup(existing.as_ref())?;
        }
        Ok(())
    }

    pub fn spawn_background(
        &self,
        signal: Arc<dyn SignalChannel>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.writers
            .values()
            .flat_map(|w| w.spawn_background(signal.clone(), shutdown.clone()))
            .collect()
    }

    fn record_error(&self, reason: &str) -> Result<()> {
        let count = self.errors.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_error_count > 0 && count >= self.max_error_count {
            error!(errors = count, max = self.max_error_count, last = reason, "max error count reached");
            bail!("max error count {} reached", self.max_error_count);
        }
        Ok(())
    }

    /// Route one item; unknown streams count as errors.
    pub fn route(&self, stream: &StreamId, message: Message) -> Result<Option<RouteDecision>> {
        match self.writers.get(stream) {
            Some(writer) => Ok(Some(writer.submit(message))),
            None => {
                debug!(stream = %stream, "message for unconfigured stream");
                self.record_error("unknown stream")?;
                Ok(None)
            }
        }
    }

    /// Pull from `source` until it ends, shutdown is signalled, or the error
    /// valve trips.
    pub async fn run<S: MessageSource + ?Sized>(
        &self,
        source: &mut S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<IngestExit> {
        loop {
            tokio::select! {
                item = source.next_item() => match item {
                    Ok(Some(item)) => {
                        self.route(&item.stream, item.message)?;
                    }
                    Ok(None) => {
                        info!("feed ended");
                        return Ok(IngestExit::FeedEnded);
                    }
                    Err(e) => {
                        warn!(error = %format!("{:#}", e), "bad feed record");
                        self.record_error("bad feed record")?;
                    }
                },
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    return Ok(IngestExit::Shutdown);
                }
            }
        }
    }

    pub fn flush(&self, max_passes: usize) -> usize {
        self.writers.values().map(|w| w.flush(max_passes)).sum()
    }

    pub fn log_stats(&self) {
        for writer in self.writers.values() {
            writer.log_stats();
        }
    }
}
