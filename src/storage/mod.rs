//! Storage backend interface.
//!
//! A backend stores rows for named targets (`<stream>_current`,
//! `<stream>_previous`) and keeps a log of verified exports. Every target
//! incarnation carries a generation assigned at creation; a rename keeps it.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageKind, StreamId};

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Row statistics for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub rows: u64,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
    pub kinds: BTreeMap<MessageKind, u64>,
}

impl TargetSummary {
    pub fn from_messages(messages: &[Message]) -> Self {
        let mut summary = Self::default();
        for msg in messages {
            summary.rows += 1;
            *summary.kinds.entry(msg.kind).or_insert(0) += 1;
            summary.first_ts = Some(match summary.first_ts {
                Some(ts) => ts.min(msg.timestamp),
                None => msg.timestamp,
            });
            summary.last_ts = Some(match summary.last_ts {
                Some(ts) => ts.max(msg.timestamp),
                None => msg.timestamp,
            });
        }
        summary
    }

    pub fn span(&self) -> chrono::Duration {
        match (self.first_ts, self.last_ts) {
            (Some(first), Some(last)) => last - first,
            _ => chrono::Duration::zero(),
        }
    }

    /// Rows per second over the covered span.
    pub fn rate_per_sec(&self) -> f64 {
        let secs = self.span().num_milliseconds() as f64 / 1_000.0;
        if secs <= 0.0 {
            return 0.0;
        }
        self.rows as f64 / secs
    }

    pub fn distinct_kinds(&self) -> usize {
        self.kinds.values().filter(|&&n| n > 0).count()
    }

    pub fn kind_count(&self, kind: MessageKind) -> u64 {
        self.kinds.get(&kind).copied().unwrap_or(0)
    }
}

/// One verified export, as stored in the export log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub run_id: String,
    pub stream: StreamId,
    pub generation: u64,
    /// Start of the schedule period the file is named after.
    pub period_start: DateTime<Utc>,
    pub file_path: String,
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
    pub exported_at: DateTime<Utc>,
    /// The previous target was kept after the export.
    pub previous_kept: bool,
}

/// Operations the writer and the orchestrator need from a backend.
///
/// Calls are blocking and bounded by the backend's own timeout; async callers
/// keep them short or move them to a blocking thread.
pub trait StorageBackend: Send + Sync {
    /// Cheap reachability check.
    fn ping(&self) -> Result<()>;

    fn exists(&self, target: &str) -> Result<bool>;

    /// Generation of the live target with this name.
    fn generation(&self, target: &str) -> Result<Option<u64>>;

    /// Create an empty target. Fails if it already exists.
    fn create(&self, target: &str) -> Result<u64>;

    /// Rename a target, keeping its rows and generation. Fails if `to` exists.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Move `current` to `previous` and create a fresh `current`, returning the
    /// new generation. Backends that can do this atomically override it.
    fn swap(&self, current: &str, previous: &str) -> Result<u64> {
        self.rename(current, previous)?;
        self.create(current)
    }

    /// Drop a target. Dropping a missing target is not an error.
    fn drop_target(&self, target: &str) -> Result<()>;

    /// Insert all messages or none of them.
    fn insert(&self, target: &str, messages: &[Message]) -> Result<usize>;

    /// All rows in the order they were stored.
    fn fetch_all(&self, target: &str) -> Result<Vec<Message>>;

    fn summary(&self, target: &str) -> Result<TargetSummary>;

    /// Record (or replace) the export of one generation.
    fn record_export(&self, record: &ExportRecord) -> Result<()>;

    fn find_export(&self, stream: &StreamId, generation: u64) -> Result<Option<ExportRecord>>;

    /// Most recent exports first.
    fn list_exports(&self, stream: Option<&StreamId>, limit: usize) -> Result<Vec<ExportRecord>>;

    /// Create the target unless it is already there.
    fn ensure(&self, target: &str) -> Result<u64> {
        match self.generation(target)? {
            Some(generation) => Ok(generation),
            None => self.create(target),
        }
    }
}

/// Target names end up in SQL identifiers and file names.
pub fn validate_target_name(target: &str) -> Result<()> {
    let valid = !target.is_empty()
        && target.len() <= 64
        && target
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        bail!("invalid target name {:?}", target);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_summary_from_messages() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let messages = vec![
            Message::new(t0, MessageKind::Deal, b"a".to_vec()),
            Message::new(t0 + chrono::Duration::seconds(10), MessageKind::Deal, b"b".to_vec()),
            Message::new(t0 + chrono::Duration::seconds(4), MessageKind::Depth, b"c".to_vec()),
        ];
        let summary = TargetSummary::from_messages(&messages);
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.first_ts, Some(t0));
        assert_eq!(summary.span(), chrono::Duration::seconds(10));
        assert!((summary.rate_per_sec() - 0.3).abs() < 1e-9);
        assert_eq!(summary.distinct_kinds(), 2);
        assert_eq!(summary.kind_count(MessageKind::Deal), 2);
    }

    #[test]
    fn test_target_name_validation() {
        assert!(validate_target_name("btc_current").is_ok());
        assert!(validate_target_name("btc\"; DROP").is_err());
        assert!(validate_target_name("").is_err());
    }
}
