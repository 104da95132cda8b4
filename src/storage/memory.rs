//! In-memory backend with fault injection, for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use anyhow::{bail, Result};
use parking_lot::Mutex;

use super::{validate_target_name, ExportRecord, StorageBackend, TargetSummary};
use crate::models::{Message, StreamId};

#[derive(Debug, Default)]
struct Target {
    generation: u64,
    rows: Vec<Message>,
}

#[derive(Debug, Default)]
struct State {
    targets: HashMap<String, Target>,
    next_generation: u64,
    exports: Vec<ExportRecord>,
}

impl State {
    fn create(&mut self, target: &str) -> Result<u64> {
        if self.targets.contains_key(target) {
            bail!("target {} already exists", target);
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.targets.insert(
            target.to_string(),
            Target {
                generation,
                rows: Vec::new(),
            },
        );
        Ok(generation)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        if self.targets.contains_key(to) {
            bail!("target {} already exists", to);
        }
        let Some(moved) = self.targets.remove(from) else {
            bail!("target {} does not exist", from);
        };
        self.targets.insert(to.to_string(), moved);
        Ok(())
    }
}

/// Backend that keeps everything in a map.
///
/// Faults: [`set_available`](Self::set_available) fails every call,
/// [`fail_next_inserts`](Self::fail_next_inserts) fails a number of inserts,
/// [`reject_payload`](Self::reject_payload) makes any insert carrying that
/// payload fail while the backend stays reachable.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
    available: AtomicBool,
    insert_failures: AtomicU32,
    fail_swap: AtomicBool,
    fail_exports: AtomicBool,
    rejected: Mutex<Vec<Vec<u8>>>,
    insert_calls: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            insert_failures: AtomicU32::new(0),
            fail_swap: AtomicBool::new(false),
            fail_exports: AtomicBool::new(false),
            rejected: Mutex::new(Vec::new()),
            insert_calls: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_next_inserts(&self, count: u32) {
        self.insert_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_swaps(&self, fail: bool) {
        self.fail_swap.store(fail, Ordering::SeqCst);
    }

    pub fn fail_export_log(&self, fail: bool) {
        self.fail_exports.store(fail, Ordering::SeqCst);
    }

    pub fn reject_payload(&self, payload: impl Into<Vec<u8>>) {
        self.rejected.lock().push(payload.into());
    }

    /// Number of `insert` calls, successful or not.
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Rows of a target, or empty if it does not exist.
    pub fn rows(&self, target: &str) -> Vec<Message> {
        self.state
            .lock()
            .targets
            .get(target)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            bail!("backend unavailable");
        }
        Ok(())
    }

    fn take_insert_failure(&self) -> bool {
        self.insert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl StorageBackend for MemoryBackend {
    fn ping(&self) -> Result<()> {
        self.check_available()
    }

    fn exists(&self, target: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.lock().targets.contains_key(target))
    }

    fn generation(&self, target: &str) -> Result<Option<u64>> {
        self.check_available()?;
        Ok(self.state.lock().targets.get(target).map(|t| t.generation))
    }

    fn create(&self, target: &str) -> Result<u64> {
        self.check_available()?;
        validate_target_name(target)?;
        self.state.lock().create(target)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.check_available()?;
        validate_target_name(to)?;
        self.state.lock().rename(from, to)
    }

    fn swap(&self, current: &str, previous: &str) -> Result<u64> {
        self.check_available()?;
        if self.fail_swap.load(Ordering::SeqCst) {
            bail!("swap refused");
        }
        validate_target_name(previous)?;
        let mut state = self.state.lock();
        state.rename(current, previous)?;
        state.create(current)
    }

    fn drop_target(&self, target: &str) -> Result<()> {
        self.check_available()?;
        self.state.lock().targets.remove(target);
        Ok(())
    }

    fn insert(&self, target: &str, messages: &[Message]) -> Result<usize> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if messages.is_empty() {
            return Ok(0);
        }
        if self.take_insert_failure() {
            bail!("injected insert failure");
        }
        {
            let rejected = self.rejected.lock();
            if messages.iter().any(|m| rejected.contains(&m.payload)) {
                bail!("constraint violation");
            }
        }
        let mut state = self.state.lock();
        let Some(t) = state.targets.get_mut(target) else {
            bail!("no such target: {}", target);
        };
        t.rows.extend_from_slice(messages);
        Ok(messages.len())
    }

    fn fetch_all(&self, target: &str) -> Result<Vec<Message>> {
        self.check_available()?;
        let state = self.state.lock();
        let Some(t) = state.targets.get(target) else {
            bail!("no such target: {}", target);
        };
        Ok(t.rows.clone())
    }

    fn summary(&self, target: &str) -> Result<TargetSummary> {
        self.check_available()?;
        let state = self.state.lock();
        let Some(t) = state.targets.get(target) else {
            bail!("no such target: {}", target);
        };
        Ok(TargetSummary::from_messages(&t.rows))
    }

    fn record_export(&self, record: &ExportRecord) -> Result<()> {
        self.check_available()?;
        if self.fail_exports.load(Ordering::SeqCst) {
            bail!("export log unavailable");
        }
        let mut state = self.state.lock();
        state
            .exports
            .retain(|r| !(r.stream == record.stream && r.generation == record.generation));
        state.exports.push(record.clone());
        Ok(())
    }

    fn find_export(&self, stream: &StreamId, generation: u64) -> Result<Option<ExportRecord>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .exports
            .iter()
            .find(|r| &r.stream == stream && r.generation == generation)
            .cloned())
    }

    fn list_exports(&self, stream: Option<&StreamId>, limit: usize) -> Result<Vec<ExportRecord>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .exports
            .iter()
            .rev()
            .filter(|r| stream.map_or(true, |s| &r.stream == s))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;

    fn msg(payload: &str) -> Message {
        Message::at_millis(1_000, MessageKind::Deal, payload.as_bytes().to_vec())
    }

    #[test]
    fn test_unavailable_fails_everything() {
        let db = MemoryBackend::new();
        db.create("btc_current").unwrap();
        db.set_available(false);
        assert!(db.ping().is_err());
        assert!(db.insert("btc_current", &[msg("a")]).is_err());
        db.set_available(true);
        assert_eq!(db.insert("btc_current", &[msg("a")]).unwrap(), 1);
    }

    #[test]
    fn test_failure_budget_is_consumed() {
        let db = MemoryBackend::new();
        db.create("btc_current").unwrap();
        db.fail_next_inserts(2);
        assert!(db.insert("btc_current", &[msg("a")]).is_err());
        assert!(db.insert("btc_current", &[msg("a")]).is_err());
        assert!(db.insert("btc_current", &[msg("a")]).is_ok());
        assert_eq!(db.insert_calls(), 3);
    }

    #[test]
    fn test_rejected_payload_fails_whole_batch() {
        let db = MemoryBackend::new();
        db.create("btc_current").unwrap();
        db.reject_payload("bad");
        assert!(db.insert("btc_current", &[msg("ok"), msg("bad")]).is_err());
        assert!(db.rows("btc_current").is_empty());
        assert!(db.ping().is_ok());
    }

    #[test]
    fn test_swap_moves_generation() {
        let db = MemoryBackend::new();
        let g1 = db.create("btc_current").unwrap();
        db.insert("btc_current", &[msg("a")]).unwrap();
        let g2 = db.swap("btc_current", "btc_previous").unwrap();
        assert_eq!(db.generation("btc_previous").unwrap(), Some(g1));
        assert_eq!(db.generation("btc_current").unwrap(), Some(g2));
        assert_eq!(db.rows("btc_previous").len(), 1);

        // Previous still there: swap refused, nothing moved
        assert!(db.swap("btc_current", "btc_previous").is_err());
        assert_eq!(db.generation("btc_current").unwrap(), Some(g2));
    }
}
