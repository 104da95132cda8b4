//! Rotation Signal Channel
//!
//! The orchestrator raises a per-stream flag before touching targets and clears
//! it once the rotated-out data is safely archived. The writer polls it. The
//! two processes share nothing else except the backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::StreamId;

/// A live rotation flag. Its existence means a rotation is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSignal {
    pub stream: StreamId,
    pub raised_at: DateTime<Utc>,
}

#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Raise (or re-raise) the flag. Re-raising replaces `raised_at`.
    async fn raise(&self, stream: &StreamId, raised_at: DateTime<Utc>) -> Result<RotationSignal>;

    async fn status(&self, stream: &StreamId) -> Result<Option<RotationSignal>>;

    async fn is_raised(&self, stream: &StreamId) -> Result<bool> {
        Ok(self.status(stream).await?.is_some())
    }

    /// Clear the flag. Clearing an absent flag is not an error.
    async fn clear(&self, stream: &StreamId) -> Result<()>;
}

// =============================================================================
// FLAG FILES
// =============================================================================

/// Flag files at `<dir>/<stream>_rotate` holding the RFC 3339 raise time.
#[derive(Debug, Clone)]
pub struct FileSignalChannel {
    dir: PathBuf,
}

impl FileSignalChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn flag_path(&self, stream: &StreamId) -> PathBuf {
        self.dir.join(format!("{}_rotate", stream))
    }

    fn staging_path(&self, stream: &StreamId) -> PathBuf {
        self.dir.join(format!(".{}_rotate.tmp", stream))
    }
}

#[async_trait]
impl SignalChannel for FileSignalChannel {
    async fn raise(&self, stream: &StreamId, raised_at: DateTime<Utc>) -> Result<RotationSignal> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create signal dir {}", self.dir.display()))?;

        // Write then rename so a poller never reads a half-written flag
        let staging = self.staging_path(stream);
        let flag = self.flag_path(stream);
        let body = raised_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        tokio::fs::write(&staging, body.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &flag)
            .await
            .with_context(|| format!("Failed to raise {}", flag.display()))?;

        info!(stream = %stream, path = %flag.display(), raised_at = %body, "rotation_signal_raised");
        Ok(RotationSignal {
            stream: stream.clone(),
            raised_at,
        })
    }

    async fn status(&self, stream: &StreamId) -> Result<Option<RotationSignal>> {
        let flag = self.flag_path(stream);
        let body = match tokio::fs::read_to_string(&flag).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", flag.display()))
            }
        };

        let raised_at = match DateTime::parse_from_rfc3339(body.trim()) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(_) => {
                // Flag written by hand or by an older tool: fall back to mtime
                let modified = tokio::fs::metadata(&flag)
                    .await
                    .and_then(|m| m.modified())
                    .with_context(|| format!("Failed to stat {}", flag.display()))?;
                debug!(stream = %stream, "signal body unparsable, using mtime");
                DateTime::<Utc>::from(modified)
            }
        };

        Ok(Some(RotationSignal {
            stream: stream.clone(),
            raised_at,
        }))
    }

    async fn clear(&self, stream: &StreamId) -> Result<()> {
        let flag = self.flag_path(stream);
        match tokio::fs::remove_file(&flag).await {
            Ok(()) => {
                info!(stream = %stream, "rotation_signal_cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(stream = %stream, error = %e, "failed to clear rotation signal");
                Err(e).with_context(|| format!("Failed to clear {}", flag.display()))
            }
        }
    }
}

// =============================================================================
// IN-PROCESS
// =============================================================================

/// Signal channel for a writer and orchestrator living in one process.
#[derive(Debug, Default)]
pub struct MemorySignalChannel {
    flags: Mutex<HashMap<StreamId, DateTime<Utc>>>,
}

impl MemorySignalChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalChannel for MemorySignalChannel {
    async fn raise(&self, stream: &StreamId, raised_at: DateTime<Utc>) -> Result<RotationSignal> {
        self.flags.lock().insert(stream.clone(), raised_at);
        Ok(RotationSignal {
            stream: stream.clone(),
            raised_at,
        })
    }

    async fn status(&self, stream: &StreamId) -> Result<Option<RotationSignal>> {
        Ok(self.flags.lock().get(stream).map(|&raised_at| RotationSignal {
            stream: stream.clone(),
            raised_at,
        }))
    }

    async fn clear(&self, stream: &StreamId) -> Result<()> {
        self.flags.lock().remove(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn btc() -> StreamId {
        StreamId::parse("btc").unwrap()
    }

    #[tokio::test]
    async fn test_file_signal_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileSignalChannel::new(dir.path());
        let raised = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 2).unwrap();

        assert!(!channel.is_raised(&btc()).await.unwrap());
        channel.raise(&btc(), raised).await.unwrap();

        assert!(dir.path().join("btc_rotate").exists());
        let status = channel.status(&btc()).await.unwrap().unwrap();
        assert_eq!(status.raised_at, raised);

        channel.clear(&btc()).await.unwrap();
        assert!(!channel.is_raised(&btc()).await.unwrap());
        // Idempotent
        channel.clear(&btc()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reraise_replaces_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileSignalChannel::new(dir.path());
        let first = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap();
        let second = first + chrono::Duration::minutes(60);

        channel.raise(&btc(), first).await.unwrap();
        channel.raise(&btc(), second).await.unwrap();
        assert_eq!(channel.status(&btc()).await.unwrap().unwrap().raised_at, second);
    }

    #[tokio::test]
    async fn test_unparsable_flag_falls_back_to_mtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("btc_rotate"), "1700000000.5").unwrap();
        let channel = FileSignalChannel::new(dir.path());
        assert!(channel.status(&btc()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let channel = MemorySignalChannel::new();
        let eth = StreamId::parse("eth").unwrap();
        channel.raise(&btc(), Utc::now()).await.unwrap();
        assert!(channel.is_raised(&btc()).await.unwrap());
        assert!(!channel.is_raised(&eth).await.unwrap());
    }
}
