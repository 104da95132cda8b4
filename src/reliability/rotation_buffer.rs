//! Rotation Buffer
//!
//! Holds writes issued while a rotation episode is open for the stream. The
//! active flag and the queue share one lock, so a message either lands in the
//! buffer or is told the buffer is closed; there is no window where it does
//! both or neither.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::models::BufferedEntry;

#[derive(Debug, Default)]
struct Inner {
    active: bool,
    /// `raised_at` of the signal that opened the episode.
    episode: Option<DateTime<Utc>>,
    entries: Vec<BufferedEntry>,
}

#[derive(Debug, Default)]
pub struct RotationBuffer {
    inner: Mutex<Inner>,
}

impl RotationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an episode. Returns `false` if one is already open.
    pub fn activate(&self, episode: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        if inner.active {
            return false;
        }
        inner.active = true;
        inner.episode = Some(episode);
        true
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn episode(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().episode
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Buffer the entry if an episode is open; hand it back otherwise.
    pub fn try_push(&self, entry: BufferedEntry) -> Result<(), BufferedEntry> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Err(entry);
        }
        inner.entries.push(entry);
        Ok(())
    }

    /// Take everything buffered so far, ordered by arrival sequence. The
    /// episode stays open and keeps accepting writes.
    pub fn take_all(&self) -> Vec<BufferedEntry> {
        let mut entries = std::mem::take(&mut self.inner.lock().entries);
        // Stable: equal seqs (never produced by one writer) keep push order
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Close the episode, but only if nothing is waiting. Returns whether the
    /// episode was closed.
    pub fn deactivate_if_empty(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.entries.is_empty() {
            return false;
        }
        inner.active = false;
        inner.episode = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, MessageKind};
    use chrono::TimeZone;

    fn entry(seq: u64) -> BufferedEntry {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        BufferedEntry::new(Message::new(at, MessageKind::Ticker, vec![seq as u8]), at, seq)
    }

    #[test]
    fn test_inactive_buffer_hands_entry_back() {
        let buf = RotationBuffer::new();
        let back = buf.try_push(entry(1)).unwrap_err();
        assert_eq!(back.seq, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_single_activation_per_episode() {
        let buf = RotationBuffer::new();
        let raised = Utc::now();
        assert!(buf.activate(raised));
        assert!(!buf.activate(raised));
        assert_eq!(buf.episode(), Some(raised));
    }

    #[test]
    fn test_take_all_sorts_by_seq_not_timestamp() {
        let buf = RotationBuffer::new();
        buf.activate(Utc::now());

        // Later timestamp, earlier arrival
        let mut first = entry(1);
        first.message.timestamp = first.message.timestamp + chrono::Duration::seconds(5);
        buf.try_push(entry(3)).unwrap();
        buf.try_push(first).unwrap();
        buf.try_push(entry(2)).unwrap();

        let seqs: Vec<u64> = buf.take_all().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(buf.is_active());
    }

    #[test]
    fn test_deactivate_only_when_empty() {
        let buf = RotationBuffer::new();
        buf.activate(Utc::now());
        buf.try_push(entry(1)).unwrap();

        assert!(!buf.deactivate_if_empty());
        assert!(buf.is_active());

        assert_eq!(buf.take_all().len(), 1);
        assert!(buf.deactivate_if_empty());
        assert!(!buf.is_active());
        assert_eq!(buf.episode(), None);
        assert!(buf.try_push(entry(2)).is_err());
    }
}
