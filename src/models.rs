//! Shared data types: streams, messages and buffered entries.

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// STREAM IDENTITY
// =============================================================================

/// Maximum length of a stream id (it becomes part of a table name).
const MAX_STREAM_ID_LEN: usize = 32;

/// One logical asset's ingestion pipeline, e.g. `btc`.
///
/// Stream ids are used verbatim in target names and flag-file names, so they
/// are restricted to lowercase ASCII letters, digits and `_`, starting with a
/// letter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

impl StreamId {
    pub fn parse(raw: &str) -> Result<Self> {
        let id = raw.trim().to_ascii_lowercase();
        if id.is_empty() || id.len() > MAX_STREAM_ID_LEN {
            bail!("stream id must be 1..={} characters: {:?}", MAX_STREAM_ID_LEN, raw);
        }
        let first_ok = id
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase())
            .unwrap_or(false);
        let body_ok = id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !first_ok || !body_ok {
            bail!("invalid stream id {:?} (expected [a-z][a-z0-9_]*)", raw);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Names of the live and rotated-out targets for this stream.
    pub fn targets(&self) -> StreamTargets {
        StreamTargets {
            current: format!("{}_current", self.0),
            previous: format!("{}_previous", self.0),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StreamId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StreamId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

/// Write destinations of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTargets {
    pub current: String,
    pub previous: String,
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Message kind tag. The core only routes and counts by kind; the payload is
/// opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Ticker,
    Deal,
    Depth,
    #[serde(alias = "dead_letter")]
    DeadLetter,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::Ticker,
        MessageKind::Deal,
        MessageKind::Depth,
        MessageKind::DeadLetter,
    ];

    /// Compact storage code.
    pub fn code(self) -> &'static str {
        match self {
            Self::Ticker => "t",
            Self::Deal => "d",
            Self::Depth => "dp",
            Self::DeadLetter => "dl",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "t" => Some(Self::Ticker),
            "d" => Some(Self::Deal),
            "dp" => Some(Self::Depth),
            "dl" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Ticker => 0,
            Self::Deal => 1,
            Self::Depth => 2,
            Self::DeadLetter => 3,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ticker => write!(f, "ticker"),
            Self::Deal => write!(f, "deal"),
            Self::Depth => write!(f, "depth"),
            Self::DeadLetter => write!(f, "deadletter"),
        }
    }
}

/// A parsed market-data message. Immutable once created.
///
/// Timestamps are kept at millisecond precision, the precision the backend
/// stores, and may collide at high frequency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(timestamp: DateTime<Utc>, kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        let millis = timestamp.timestamp_millis();
        Self::at_millis(millis, kind, payload)
    }

    pub fn at_millis(ts_ms: i64, kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        let timestamp = Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .unwrap_or_default();
        Self {
            timestamp,
            kind,
            payload: payload.into(),
        }
    }

    #[inline]
    pub fn ts_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// A message held by exactly one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEntry {
    pub message: Message,
    pub enqueued_at: DateTime<Utc>,
    /// Writer-local arrival sequence; the only ordering key used on drain.
    pub seq: u64,
}

impl BufferedEntry {
    pub fn new(message: Message, enqueued_at: DateTime<Utc>, seq: u64) -> Self {
        Self {
            message,
            enqueued_at,
            seq,
        }
    }

    /// Age relative to `now`; zero if the clock moved backwards.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.enqueued_at).max(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_validation() {
        assert_eq!(StreamId::parse("BTC").unwrap().as_str(), "btc");
        assert!(StreamId::parse("eth_perp").is_ok());
        assert!(StreamId::parse("").is_err());
        assert!(StreamId::parse("1btc").is_err());
        assert!(StreamId::parse("btc;drop").is_err());
        assert!(StreamId::parse(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_stream_targets() {
        let targets = StreamId::parse("sol").unwrap().targets();
        assert_eq!(targets.current, "sol_current");
        assert_eq!(targets.previous, "sol_previous");
    }

    #[test]
    fn test_kind_codes() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(MessageKind::from_code("x"), None);
    }

    #[test]
    fn test_kind_serde_aliases() {
        let kind: MessageKind = serde_json::from_str("\"deadletter\"").unwrap();
        assert_eq!(kind, MessageKind::DeadLetter);
        let kind: MessageKind = serde_json::from_str("\"depth\"").unwrap();
        assert_eq!(kind, MessageKind::Depth);
    }

    #[test]
    fn test_message_millisecond_precision() {
        let ts = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let msg = Message::new(ts, MessageKind::Deal, b"1|2|1".to_vec());
        assert_eq!(msg.ts_millis(), 1_700_000_000_123);
    }
}
