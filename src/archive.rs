//! Archive Export
//!
//! Rotated-out rows are written to an immutable archive file before the
//! previous target may be deleted. The shipped format is JSON Lines, one row
//! per line, payload base64-encoded:
//!
//! ```text
//! {"ts":1767225600123,"kind":"deal","payload":"MTIzfDQ1Ng=="}
//! ```
//!
//! Files are written under a hidden staging name, fsynced, then renamed into
//! place, so a visible archive is always complete.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::models::{Message, MessageKind, StreamId};

/// Proof that an archive file was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub path: PathBuf,
    pub rows_written: u64,
    pub bytes: u64,
    pub sha256: String,
}

pub trait ArchiveExporter: Send + Sync {
    /// Where the archive for one rotated-out generation goes.
    fn destination(
        &self,
        stream: &StreamId,
        generation: u64,
        period_start: DateTime<Utc>,
        debug: bool,
    ) -> PathBuf;

    fn export(&self, rows: &[Message], destination: &Path) -> Result<ExportReceipt>;

    /// Re-read the archive and return how many rows it holds.
    fn verify(&self, receipt: &ExportReceipt) -> Result<u64>;

    /// Decode the archive back into messages.
    fn read_back(&self, path: &Path) -> Result<Vec<Message>>;
}

// =============================================================================
// JSON LINES
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveLine {
    ts: i64,
    kind: MessageKind,
    payload: String,
}

/// JSON Lines exporter rooted at one directory.
#[derive(Debug, Clone)]
pub struct JsonlExporter {
    dir: PathBuf,
}

impl JsonlExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a period: hourly in production, minute resolution in
    /// debug runs.
    pub fn file_name(
        stream: &StreamId,
        generation: u64,
        period_start: DateTime<Utc>,
        debug: bool,
    ) -> String {
        if debug {
            format!(
                "{}_{}_g{}_debug.jsonl",
                stream,
                period_start.format("%Y%m%d_%H%M"),
                generation
            )
        } else {
            format!(
                "{}_{}00_g{}.jsonl",
                stream,
                period_start.format("%Y%m%d_%H"),
                generation
            )
        }
    }

    fn write_staged(rows: &[Message], staging: &Path) -> Result<(u64, String)> {
        let file = File::create(staging)
            .with_context(|| format!("Failed to create {}", staging.display()))?;
        let mut writer = BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut bytes = 0u64;

        for msg in rows {
            let line = ArchiveLine {
                ts: msg.ts_millis(),
                kind: msg.kind,
                payload: BASE64.encode(&msg.payload),
            };
            let mut encoded = serde_json::to_vec(&line)?;
            encoded.push(b'\n');
            hasher.update(&encoded);
            bytes += encoded.len() as u64;
            writer.write_all(&encoded)?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to flush {}: {}", staging.display(), e.error()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", staging.display()))?;

        Ok((bytes, hex::encode(hasher.finalize())))
    }

    fn file_sha256(path: &Path) -> Result<String> {
        let mut file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// First free path derived from `destination` (`name_r1.jsonl`, ...).
    fn free_path(destination: &Path) -> PathBuf {
        let stem = destination
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = destination
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "jsonl".to_string());
        let mut attempt = 1u32;
        loop {
            let candidate = destination.with_file_name(format!("{}_r{}.{}", stem, attempt, ext));
            if !candidate.exists() {
                return candidate;
            }
            attempt += 1;
        }
    }
}

impl ArchiveExporter for JsonlExporter {
    fn destination(
        &self,
        stream: &StreamId,
        generation: u64,
        period_start: DateTime<Utc>,
        debug: bool,
    ) -> PathBuf {
        self.dir
            .join(Self::file_name(stream, generation, period_start, debug))
    }

    fn export(&self, rows: &[Message], destination: &Path) -> Result<ExportReceipt> {
        let parent = destination
            .parent()
            .ok_or_else(|| anyhow!("archive path has no parent: {}", destination.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let file_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("archive path has no file name: {}", destination.display()))?;
        let staging = parent.join(format!(".{}.partial", file_name));

        let (bytes, sha256) = match Self::write_staged(rows, &staging) {
            Ok(done) => done,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(e);
            }
        };

        let mut path = destination.to_path_buf();
        if path.exists() {
            if Self::file_sha256(&path)? == sha256 {
                // Same content already published by an earlier attempt
                fs::remove_file(&staging).ok();
                debug!(path = %path.display(), "archive already present, reusing");
                return Ok(ExportReceipt {
                    path,
                    rows_written: rows.len() as u64,
                    bytes,
                    sha256,
                });
            }
            path = Self::free_path(destination);
            warn!(
                existing = %destination.display(),
                path = %path.display(),
                "archive name taken by different content, writing alongside"
            );
        }

        fs::rename(&staging, &path)
            .with_context(|| format!("Failed to publish {}", path.display()))?;

        info!(
            path = %path.display(),
            rows = rows.len(),
            bytes,
            sha256 = %sha256,
            "archive written"
        );

        Ok(ExportReceipt {
            path,
            rows_written: rows.len() as u64,
            bytes,
            sha256,
        })
    }

    fn verify(&self, receipt: &ExportReceipt) -> Result<u64> {
        let sha256 = Self::file_sha256(&receipt.path)?;
        if sha256 != receipt.sha256 {
            bail!(
                "checksum mismatch for {}: expected {}, found {}",
                receipt.path.display(),
                receipt.sha256,
                sha256
            );
        }
        Ok(self.read_back(&receipt.path)?.len() as u64)
    }

    fn read_back(&self, path: &Path) -> Result<Vec<Message>> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut messages = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ArchiveLine = serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: malformed archive line", path.display(), idx + 1))?;
            let payload = BASE64
                .decode(parsed.payload.as_bytes())
                .with_context(|| format!("{}:{}: bad payload", path.display(), idx + 1))?;
            messages.push(Message::at_millis(parsed.ts, parsed.kind, payload));
        }
        Ok(messages)
    }
}

// =============================================================================
// EXPORT DIRECTORY
// =============================================================================

/// Check that `dir` can be created and written to.
pub fn ensure_writable(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let probe = dir.join(format!(".ticklog_write_test_{}", std::process::id()));
    fs::write(&probe, b"ok").with_context(|| format!("{} is not writable", dir.display()))?;
    fs::remove_file(&probe).ok();
    Ok(())
}

/// The first writable directory out of `primary` and then `fallbacks`.
pub fn resolve_export_dir(primary: &Path, fallbacks: &[PathBuf]) -> Result<PathBuf> {
    match ensure_writable(primary) {
        Ok(()) => return Ok(primary.to_path_buf()),
        Err(e) => warn!(dir = %primary.display(), error = %e, "export dir not writable"),
    }
    for dir in fallbacks {
        match ensure_writable(dir) {
            Ok(()) => {
                warn!(dir = %dir.display(), "using fallback export dir");
                return Ok(dir.clone());
            }
            Err(e) => debug!(dir = %dir.display(), error = %e, "fallback export dir rejected"),
        }
    }
    bail!(
        "no writable export directory (tried {} and {} fallbacks)",
        primary.display(),
        fallbacks.len()
    )
}

// =============================================================================
// COMPOSITION
// =============================================================================

/// Shape of an exported period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompositionReport {
    pub rows: u64,
    pub kinds: BTreeMap<MessageKind, u64>,
    /// Consecutive rows further apart than the gap threshold.
    pub gaps: u64,
    pub max_gap_ms: i64,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
}

impl CompositionReport {
    /// Analyse rows in stored order. Gaps are measured between neighbours, so
    /// a reordered timestamp shows up as a negative step and is not a gap.
    pub fn analyze(rows: &[Message], gap_threshold: chrono::Duration) -> Self {
        let mut report = Self {
            rows: rows.len() as u64,
            ..Self::default()
        };
        let threshold_ms = gap_threshold.num_milliseconds();

        let mut prev: Option<i64> = None;
        for msg in rows {
            *report.kinds.entry(msg.kind).or_insert(0) += 1;
            let ts = msg.ts_millis();
            if let Some(p) = prev {
                let step = ts - p;
                if step > threshold_ms {
                    report.gaps += 1;
                }
                report.max_gap_ms = report.max_gap_ms.max(step);
            }
            prev = Some(ts);
        }

        report.first_ts = rows.iter().map(|m| m.timestamp).min();
        report.last_ts = rows.iter().map(|m| m.timestamp).max();
        report
    }

    pub fn kinds_summary(&self) -> String {
        self.kinds
            .iter()
            .map(|(kind, n)| format!("{}={}", kind.code(), n))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn btc() -> StreamId {
        StreamId::parse("btc").unwrap()
    }

    fn rows() -> Vec<Message> {
        vec![
            Message::at_millis(1_000, MessageKind::Ticker, b"t1".to_vec()),
            Message::at_millis(2_000, MessageKind::Deal, vec![0u8, 159, 146, 150]),
            Message::at_millis(9_000, MessageKind::Depth, b"d1".to_vec()),
        ]
    }

    #[test]
    fn test_file_names() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 13, 5, 0).unwrap();
        assert_eq!(
            JsonlExporter::file_name(&btc(), 4, start, false),
            "btc_20260301_1300_g4.jsonl"
        );
        assert_eq!(
            JsonlExporter::file_name(&btc(), 4, start, true),
            "btc_20260301_1305_g4_debug.jsonl"
        );
    }

    #[test]
    fn test_export_verify_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = JsonlExporter::new(dir.path());
        let dest = exporter.destination(&btc(), 1, Utc::now(), false);

        let receipt = exporter.export(&rows(), &dest).unwrap();
        assert_eq!(receipt.rows_written, 3);
        assert_eq!(receipt.sha256.len(), 64);
        assert_eq!(exporter.verify(&receipt).unwrap(), 3);
        assert_eq!(exporter.read_back(&receipt.path).unwrap(), rows());

        // No staging leftovers
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_reexport_same_content_reuses_file() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = JsonlExporter::new(dir.path());
        let dest = dir.path().join("btc_x.jsonl");

        let first = exporter.export(&rows(), &dest).unwrap();
        let second = exporter.export(&rows(), &dest).unwrap();
        assert_eq!(first.path, second.path);

        // Different content never overwrites a published archive
        let third = exporter.export(&rows()[..1], &dest).unwrap();
        assert_ne!(third.path, dest);
        assert_eq!(exporter.verify(&first).unwrap(), 3);
        assert_eq!(exporter.verify(&third).unwrap(), 1);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = JsonlExporter::new(dir.path());
        let dest = dir.path().join("btc_x.jsonl");
        let receipt = exporter.export(&rows(), &dest).unwrap();

        let mut body = fs::read_to_string(&dest).unwrap();
        body.push_str("{\"ts\":1,\"kind\":\"deal\",\"payload\":\"\"}\n");
        fs::write(&dest, body).unwrap();
        assert!(exporter.verify(&receipt).is_err());
    }

    #[test]
    fn test_empty_export() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = JsonlExporter::new(dir.path());
        let receipt = exporter.export(&[], &dir.path().join("empty.jsonl")).unwrap();
        assert_eq!(receipt.rows_written, 0);
        assert_eq!(exporter.verify(&receipt).unwrap(), 0);
    }

    #[test]
    fn test_resolve_export_dir_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"x").unwrap();
        let fallback = dir.path().join("fallback");

        let resolved = resolve_export_dir(&blocker.join("exports"), &[fallback.clone()]).unwrap();
        assert_eq!(resolved, fallback);
        assert!(resolve_export_dir(&blocker.join("exports"), &[]).is_err());
    }

    #[test]
    fn test_composition_counts_gaps_and_kinds() {
        let report = CompositionReport::analyze(&rows(), chrono::Duration::seconds(5));
        assert_eq!(report.rows, 3);
        assert_eq!(report.gaps, 1);
        assert_eq!(report.max_gap_ms, 7_000);
        assert_eq!(report.kinds.get(&MessageKind::Deal), Some(&1));
        assert_eq!(report.kinds_summary(), "t=1,d=1,dp=1");
    }
}
