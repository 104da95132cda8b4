//! SQLite Storage Backend
//!
//! One table per target plus a registry that hands out generations and a log
//! of verified exports. The writer and the orchestrator each open their own
//! connection to the same file; WAL mode lets them work side by side and the
//! busy timeout bounds how long either waits on the other.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use super::{validate_target_name, ExportRecord, StorageBackend, TargetSummary};
use crate::models::{Message, MessageKind, StreamId};

// =============================================================================
// SCHEMA
// =============================================================================

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

-- Live targets. AUTOINCREMENT keeps generations unique across drops.
CREATE TABLE IF NOT EXISTS target_registry (
    generation INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_ms INTEGER NOT NULL,
    dropped_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_target_registry_live
    ON target_registry(name) WHERE dropped_ms IS NULL;

-- Verified exports
CREATE TABLE IF NOT EXISTS export_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    stream TEXT NOT NULL,
    generation INTEGER NOT NULL,
    period_start_ms INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    rows INTEGER NOT NULL,
    bytes INTEGER NOT NULL,
    sha256 TEXT NOT NULL,
    exported_at_ms INTEGER NOT NULL,
    previous_kept INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_export_log_generation
    ON export_log(stream, generation);
"#;

fn target_ddl(target: &str) -> String {
    format!(
        r#"CREATE TABLE "{}" (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    mt TEXT NOT NULL,
    m BLOB NOT NULL
)"#,
        target
    )
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Run `f` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on any error.
fn in_transaction<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = f(conn).and_then(|value| {
        conn.execute_batch("COMMIT")?;
        Ok(value)
    });
    if result.is_err() {
        let _ = conn.execute_batch("ROLLBACK");
    }
    result
}

// =============================================================================
// BACKEND
// =============================================================================

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open or create the database at the given path.
    pub fn open(db_path: &str, busy_timeout: Duration) -> Result<Self> {
        let path = Path::new(db_path);

        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open ticklog database: {}", db_path))?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA)?;

        info!(
            path = %db_path,
            busy_timeout_ms = busy_timeout.as_millis() as u64,
            "SQLite backend opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn table_exists(conn: &Connection, target: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![target],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn live_generation(conn: &Connection, target: &str) -> Result<Option<u64>> {
        let generation: Option<i64> = conn
            .query_row(
                "SELECT generation FROM target_registry
                 WHERE name = ?1 AND dropped_ms IS NULL
                 ORDER BY generation DESC LIMIT 1",
                params![target],
                |row| row.get(0),
            )
            .optional()?;
        Ok(generation.map(|g| g as u64))
    }

    fn create_in(conn: &Connection, target: &str) -> Result<u64> {
        if Self::table_exists(conn, target)? {
            bail!("target {} already exists", target);
        }
        conn.execute_batch(&target_ddl(target))?;
        conn.execute(
            "INSERT INTO target_registry (name, created_ms) VALUES (?1, ?2)",
            params![target, Utc::now().timestamp_millis()],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn rename_in(conn: &Connection, from: &str, to: &str) -> Result<()> {
        if !Self::table_exists(conn, from)? {
            bail!("target {} does not exist", from);
        }
        if Self::table_exists(conn, to)? {
            bail!("target {} already exists", to);
        }
        conn.execute_batch(&format!(r#"ALTER TABLE "{}" RENAME TO "{}""#, from, to))?;
        let updated = conn.execute(
            "UPDATE target_registry SET name = ?2 WHERE name = ?1 AND dropped_ms IS NULL",
            params![from, to],
        )?;
        if updated == 0 {
            // Table predates the registry: adopt it under a fresh generation
            conn.execute(
                "INSERT INTO target_registry (name, created_ms) VALUES (?1, ?2)",
                params![to, Utc::now().timestamp_millis()],
            )?;
        }
        Ok(())
    }

    fn row_to_export(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ExportRow, String)> {
        Ok((
            ExportRow {
                run_id: row.get(0)?,
                generation: row.get(2)?,
                period_start_ms: row.get(3)?,
                file_path: row.get(4)?,
                rows: row.get(5)?,
                bytes: row.get(6)?,
                sha256: row.get(7)?,
                exported_at_ms: row.get(8)?,
                previous_kept: row.get(9)?,
            },
            row.get(1)?,
        ))
    }
}

/// Raw export-log row before the stream id is re-validated.
struct ExportRow {
    run_id: String,
    generation: i64,
    period_start_ms: i64,
    file_path: String,
    rows: i64,
    bytes: i64,
    sha256: String,
    exported_at_ms: i64,
    previous_kept: bool,
}

impl ExportRow {
    fn into_record(self, stream: &str) -> Result<ExportRecord> {
        Ok(ExportRecord {
            run_id: self.run_id,
            stream: StreamId::parse(stream)?,
            generation: self.generation as u64,
            period_start: ms_to_utc(self.period_start_ms),
            file_path: self.file_path,
            rows: self.rows as u64,
            bytes: self.bytes as u64,
            sha256: self.sha256,
            exported_at: ms_to_utc(self.exported_at_ms),
            previous_kept: self.previous_kept,
        })
    }
}

const EXPORT_COLUMNS: &str = "run_id, stream, generation, period_start_ms, file_path, rows, \
                              bytes, sha256, exported_at_ms, previous_kept";

impl StorageBackend for SqliteBackend {
    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        let _: i64 = conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))?;
        Ok(())
    }

    fn exists(&self, target: &str) -> Result<bool> {
        validate_target_name(target)?;
        let conn = self.conn.lock();
        Self::table_exists(&conn, target)
    }

    fn generation(&self, target: &str) -> Result<Option<u64>> {
        validate_target_name(target)?;
        let conn = self.conn.lock();
        if !Self::table_exists(&conn, target)? {
            return Ok(None);
        }
        Self::live_generation(&conn, target)
    }

    fn create(&self, target: &str) -> Result<u64> {
        validate_target_name(target)?;
        let conn = self.conn.lock();
        let generation = in_transaction(&conn, |c| Self::create_in(c, target))?;
        debug!(table = target, generation, "target created");
        Ok(generation)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        validate_target_name(from)?;
        validate_target_name(to)?;
        let conn = self.conn.lock();
        in_transaction(&conn, |c| Self::rename_in(c, from, to))
    }

    fn swap(&self, current: &str, previous: &str) -> Result<u64> {
        validate_target_name(current)?;
        validate_target_name(previous)?;
        let conn = self.conn.lock();
        let generation = in_transaction(&conn, |c| {
            Self::rename_in(c, current, previous)?;
            Self::create_in(c, current)
        })
        .with_context(|| format!("swap {} -> {}", current, previous))?;
        info!(current, previous, generation, "targets swapped");
        Ok(generation)
    }

    fn drop_target(&self, target: &str) -> Result<()> {
        validate_target_name(target)?;
        let conn = self.conn.lock();
        in_transaction(&conn, |c| {
            c.execute_batch(&format!(r#"DROP TABLE IF EXISTS "{}""#, target))?;
            c.execute(
                "UPDATE target_registry SET dropped_ms = ?2 WHERE name = ?1 AND dropped_ms IS NULL",
                params![target, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
    }

    fn insert(&self, target: &str, messages: &[Message]) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        validate_target_name(target)?;
        let conn = self.conn.lock();
        in_transaction(&conn, |c| {
            let mut stmt = c.prepare_cached(&format!(
                r#"INSERT INTO "{}" (ts_ms, mt, m) VALUES (?1, ?2, ?3)"#,
                target
            ))?;
            for msg in messages {
                stmt.execute(params![msg.ts_millis(), msg.kind.code(), msg.payload])?;
            }
            Ok(messages.len())
        })
    }

    fn fetch_all(&self, target: &str) -> Result<Vec<Message>> {
        validate_target_name(target)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"SELECT ts_ms, mt, m FROM "{}" ORDER BY id ASC"#,
            target
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (ts_ms, code, payload) = row?;
            let kind = MessageKind::from_code(&code)
                .ok_or_else(|| anyhow!("unknown kind code {:?} in {}", code, target))?;
            messages.push(Message::at_millis(ts_ms, kind, payload));
        }
        Ok(messages)
    }

    fn summary(&self, target: &str) -> Result<TargetSummary> {
        validate_target_name(target)?;
        let conn = self.conn.lock();

        let (rows, first, last): (i64, Option<i64>, Option<i64>) = conn.query_row(
            &format!(r#"SELECT COUNT(*), MIN(ts_ms), MAX(ts_ms) FROM "{}""#, target),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut summary = TargetSummary {
            rows: rows as u64,
            first_ts: first.map(ms_to_utc),
            last_ts: last.map(ms_to_utc),
            ..TargetSummary::default()
        };

        let mut stmt = conn.prepare(&format!(
            r#"SELECT mt, COUNT(*) FROM "{}" GROUP BY mt"#,
            target
        ))?;
        let kinds = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for kind in kinds {
            let (code, count) = kind?;
            if let Some(kind) = MessageKind::from_code(&code) {
                summary.kinds.insert(kind, count as u64);
            }
        }
        Ok(summary)
    }

    fn record_export(&self, record: &ExportRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO export_log ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                EXPORT_COLUMNS
            ),
            params![
                record.run_id,
                record.stream.as_str(),
                record.generation as i64,
                record.period_start.timestamp_millis(),
                record.file_path,
                record.rows as i64,
                record.bytes as i64,
                record.sha256,
                record.exported_at.timestamp_millis(),
                record.previous_kept,
            ],
        )
        .context("Failed to record export")?;
        Ok(())
    }

    fn find_export(&self, stream: &StreamId, generation: u64) -> Result<Option<ExportRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM export_log WHERE stream = ?1 AND generation = ?2",
                    EXPORT_COLUMNS
                ),
                params![stream.as_str(), generation as i64],
                Self::row_to_export,
            )
            .optional()?;
        row.map(|(row, stream)| row.into_record(&stream)).transpose()
    }

    fn list_exports(&self, stream: Option<&StreamId>, limit: usize) -> Result<Vec<ExportRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM export_log
             WHERE (?1 IS NULL OR stream = ?1)
             ORDER BY exported_at_ms DESC, id DESC LIMIT ?2",
            EXPORT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![stream.map(|s| s.as_str()), limit as i64],
            Self::row_to_export,
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (row, stream) = row?;
            records.push(row.into_record(&stream)?);
        }
        Ok(records)
    }
}
