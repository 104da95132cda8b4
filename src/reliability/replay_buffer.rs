//! Replay Buffer
//!
//! Bounded FIFO for writes the circuit breaker diverted. Drained in arrival
//! order only while the backend is healthy; a failed write stops the pass and
//! goes back to the front so nothing skips ahead of it.

use std::collections::VecDeque;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::models::BufferedEntry;

pub const DEFAULT_REPLAY_CAPACITY: usize = 10_000;
pub const DEFAULT_REPLAY_TTL_SECS: i64 = 30;
pub const DEFAULT_REPLAY_BATCH: usize = 50;

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub written: usize,
    /// Dropped for exceeding the TTL.
    pub expired: usize,
    /// Dropped because the failed entry could not be put back.
    pub overflowed: usize,
    /// The pass stopped on a write failure.
    pub halted: bool,
}

#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    ttl: chrono::Duration,
    queue: Mutex<VecDeque<BufferedEntry>>,
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(
            DEFAULT_REPLAY_CAPACITY,
            chrono::Duration::seconds(DEFAULT_REPLAY_TTL_SECS),
        )
    }
}

impl ReplayBuffer {
    pub fn new(capacity: usize, ttl: chrono::Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ttl,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Append at the back. Returns the entry evicted to make room, if any.
    pub fn enqueue(&self, entry: BufferedEntry) -> Option<BufferedEntry> {
        let mut queue = self.queue.lock();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(entry);
        evicted
    }

    /// Append a run of entries in order. Returns how many were evicted.
    pub fn enqueue_all(&self, entries: impl IntoIterator<Item = BufferedEntry>) -> usize {
        let mut queue = self.queue.lock();
        let mut evicted = 0;
        for entry in entries {
            if queue.len() >= self.capacity {
                queue.pop_front();
                evicted += 1;
            }
            queue.push_back(entry);
        }
        evicted
    }

    /// Drain up to `batch_size` entries through `write`.
    ///
    /// The lock is held only to pop and push back, never across `write`.
    pub fn drain<F>(&self, batch_size: usize, now: DateTime<Utc>, mut write: F) -> DrainReport
    where
        F: FnMut(&BufferedEntry) -> Result<()>,
    {
        let mut report = DrainReport::default();
        let mut attempted = 0;

        while attempted < batch_size {
            let Some(entry) = self.queue.lock().pop_front() else {
                break;
            };

            if entry.age(now) > self.ttl {
                report.expired += 1;
                continue;
            }

            attempted += 1;
            if write(&entry).is_ok() {
                report.written += 1;
                continue;
            }

            report.halted = true;
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                // The failed entry is the oldest; it is the one evicted.
                report.overflowed += 1;
            } else {
                queue.push_front(entry);
            }
            break;
        }

        report
    }

    /// Oldest entry's sequence number, if any.
    pub fn front_seq(&self) -> Option<u64> {
        self.queue.lock().front().map(|e| e.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, MessageKind};
    use anyhow::bail;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn entry(seq: u64, at: DateTime<Utc>) -> BufferedEntry {
        let msg = Message::new(at, MessageKind::Deal, format!("p{}", seq).into_bytes());
        BufferedEntry::new(msg, at, seq)
    }

    #[test]
    fn test_capacity_eviction_drops_oldest() {
        let buf = ReplayBuffer::new(3, chrono::Duration::seconds(30));
        for seq in 0..3 {
            assert!(buf.enqueue(entry(seq, t0())).is_none());
        }
        let evicted = buf.enqueue(entry(3, t0())).unwrap();
        assert_eq!(evicted.seq, 0);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.front_seq(), Some(1));
    }

    #[test]
    fn test_capacity_10k_with_12k_arrivals() {
        let buf = ReplayBuffer::default();
        let mut lost = 0;
        for seq in 0..12_000 {
            if buf.enqueue(entry(seq, t0())).is_some() {
                lost += 1;
            }
        }
        assert_eq!(lost, 2_000);
        assert_eq!(buf.len(), 10_000);
        assert_eq!(buf.front_seq(), Some(2_000));

        let mut written = Vec::new();
        loop {
            let report = buf.drain(DEFAULT_REPLAY_BATCH, t0(), |e| {
                written.push(e.seq);
                Ok(())
            });
            if report.written == 0 {
                break;
            }
        }
        assert_eq!(written, (2_000..12_000).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain_respects_batch_and_order() {
        let buf = ReplayBuffer::default();
        for seq in 0..120 {
            buf.enqueue(entry(seq, t0()));
        }
        let mut written = Vec::new();
        let report = buf.drain(50, t0(), |e| {
            written.push(e.seq);
            Ok(())
        });
        assert_eq!(report.written, 50);
        assert!(!report.halted);
        assert_eq!(written, (0..50).collect::<Vec<_>>());
        assert_eq!(buf.len(), 70);
    }

    #[test]
    fn test_failure_halts_and_restores_front() {
        let buf = ReplayBuffer::default();
        for seq in 0..10 {
            buf.enqueue(entry(seq, t0()));
        }

        let mut written = Vec::new();
        let report = buf.drain(50, t0(), |e| {
            if e.seq == 4 {
                bail!("backend went away");
            }
            written.push(e.seq);
            Ok(())
        });
        assert!(report.halted);
        assert_eq!(report.written, 4);
        assert_eq!(buf.front_seq(), Some(4));

        // Next pass resumes at the failed entry
        let report = buf.drain(50, t0(), |e| {
            written.push(e.seq);
            Ok(())
        });
        assert_eq!(report.written, 6);
        assert_eq!(written, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let buf = ReplayBuffer::new(100, chrono::Duration::seconds(30));
        buf.enqueue(entry(0, t0()));
        buf.enqueue(entry(1, t0() + chrono::Duration::seconds(20)));

        let now = t0() + chrono::Duration::seconds(45);
        let mut written = Vec::new();
        let report = buf.drain(50, now, |e| {
            written.push(e.seq);
            Ok(())
        });
        assert_eq!(report.expired, 1);
        assert_eq!(report.written, 1);
        assert_eq!(written, vec![1]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_failed_entry_lost_when_refilled_to_capacity() {
        let buf = Arc::new(ReplayBuffer::new(2, chrono::Duration::seconds(30)));
        buf.enqueue(entry(0, t0()));

        let refill = buf.clone();
        let report = buf.drain(10, t0(), move |_| {
            // Buffer fills up while the write is outstanding
            refill.enqueue(entry(1, t0()));
            refill.enqueue(entry(2, t0()));
            bail!("timeout")
        });
        assert!(report.halted);
        assert_eq!(report.overflowed, 1);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.front_seq(), Some(1));
    }
}
