//! Per-stream writer counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::MessageKind;

/// Why a message was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// Evicted from a full replay buffer.
    Overflow,
    /// Sat in the replay buffer past its TTL.
    Expired,
    /// Refused by a reachable backend.
    Rejected,
}

impl std::fmt::Display for LossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overflow => write!(f, "overflow"),
            Self::Expired => write!(f, "expired"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Lock-free counters owned by one stream writer.
#[derive(Debug, Default)]
pub struct StreamStats {
    pub received: AtomicU64,
    pub direct_writes: AtomicU64,
    pub write_failures: AtomicU64,

    pub replay_enqueued: AtomicU64,
    pub replay_drained: AtomicU64,

    pub rotation_buffered: AtomicU64,
    pub rotation_drained: AtomicU64,
    pub rotation_episodes: AtomicU64,

    pub lost_records: AtomicU64,
    pub lost_overflow: AtomicU64,
    pub lost_expired: AtomicU64,
    pub lost_rejected: AtomicU64,

    by_kind: [AtomicU64; 4],
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_received(&self, kind: MessageKind) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_direct_writes(&self, count: u64) {
        self.direct_writes.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_replay_enqueued(&self, count: u64) {
        self.replay_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_replay_drained(&self, count: u64) {
        self.replay_drained.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rotation_buffered(&self) {
        self.rotation_buffered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rotation_drained(&self, count: u64) {
        self.rotation_drained.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rotation_episode(&self) {
        self.rotation_episodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self, reason: LossReason, count: u64) {
        if count == 0 {
            return;
        }
        self.lost_records.fetch_add(count, Ordering::Relaxed);
        let bucket = match reason {
            LossReason::Overflow => &self.lost_overflow,
            LossReason::Expired => &self.lost_expired,
            LossReason::Rejected => &self.lost_rejected,
        };
        bucket.fetch_add(count, Ordering::Relaxed);
    }

    pub fn kind_count(&self, kind: MessageKind) -> u64 {
        self.by_kind[kind.index()].load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost_records.load(Ordering::Relaxed)
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "received={} direct={} replay_in={} replay_out={} rot_in={} rot_out={} episodes={} lost={} (overflow={} expired={} rejected={}) write_failures={} kinds=t:{}/d:{}/dp:{}/dl:{}",
            self.received.load(Ordering::Relaxed),
            self.direct_writes.load(Ordering::Relaxed),
            self.replay_enqueued.load(Ordering::Relaxed),
            self.replay_drained.load(Ordering::Relaxed),
            self.rotation_buffered.load(Ordering::Relaxed),
            self.rotation_drained.load(Ordering::Relaxed),
            self.rotation_episodes.load(Ordering::Relaxed),
            self.lost_records.load(Ordering::Relaxed),
            self.lost_overflow.load(Ordering::Relaxed),
            self.lost_expired.load(Ordering::Relaxed),
            self.lost_rejected.load(Ordering::Relaxed),
            self.write_failures.load(Ordering::Relaxed),
            self.kind_count(MessageKind::Ticker),
            self.kind_count(MessageKind::Deal),
            self.kind_count(MessageKind::Depth),
            self.kind_count(MessageKind::DeadLetter),
        )
    }
}
