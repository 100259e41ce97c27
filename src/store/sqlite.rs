//! SQLite-backed store.

use crate::core::session::{KeyRecord, SessionRecord};
use crate::store::migrations::run_migrations;
use crate::store::{IdentityStore, SessionSink, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange(value))
}

fn to_u64(value: i64, field: &'static str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field} contains negative value {value}")))
}

fn parse_datetime(value: &str, field: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("invalid {field} '{value}': {err}")))
}

/// Row counts per table, for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub processes: u64,
    pub windows: u64,
    pub sessions: u64,
    pub key_events: u64,
}

pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and migrate it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut conn = Connection::open(&path)?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            tracing::warn!("failed to enable WAL mode: {err}");
        }
        run_migrations(&mut conn)?;

        tracing::info!("database ready at {}", path.display());
        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn row_counts(&self) -> Result<RowCounts, StoreError> {
        let count = |table: &str| -> Result<u64, StoreError> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        };

        Ok(RowCounts {
            processes: count("processes")?,
            windows: count("windows")?,
            sessions: count("activity")?,
            key_events: count("key_events")?,
        })
    }

    /// Sessions stored for a window, oldest first.
    pub fn sessions_for_window(&self, window_id: i64) -> Result<Vec<SessionRecord>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT window_id, started_at, ended_at, duration, motions, motions_filtered,
                    clicks, scrolls, keys, pid
             FROM activity
             WHERE window_id = ?1
             ORDER BY id",
        )?;

        let mut rows = stmt.query(params![window_id])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(SessionRecord {
                window_id: row.get(0)?,
                start: parse_datetime(&row.get::<_, String>(1)?, "started_at")?,
                end: parse_datetime(&row.get::<_, String>(2)?, "ended_at")?,
                duration_ms: row.get(3)?,
                motions: to_u64(row.get(4)?, "motions")?,
                filtered_motions: to_u64(row.get(5)?, "motions_filtered")?,
                clicks: to_u64(row.get(6)?, "clicks")?,
                scrolls: to_u64(row.get(7)?, "scrolls")?,
                keys: to_u64(row.get(8)?, "keys")?,
                pid: row.get(9)?,
            });
        }

        Ok(sessions)
    }

    /// Key events stored for a window, in insertion order.
    pub fn key_events_for_window(&self, window_id: i64) -> Result<Vec<KeyRecord>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT window_id, code, at FROM key_events WHERE window_id = ?1 ORDER BY id",
        )?;

        let mut rows = stmt.query(params![window_id])?;
        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            keys.push(KeyRecord {
                window_id: row.get(0)?,
                code: row.get(1)?,
                at: parse_datetime(&row.get::<_, String>(2)?, "at")?,
            });
        }

        Ok(keys)
    }
}

/// Insert one finished session inside an open transaction.
pub fn insert_session(conn: &Connection, session: &SessionRecord) -> Result<i64, StoreError> {
    conn.prepare_cached(
        "INSERT INTO activity
             (window_id, started_at, ended_at, duration, motions, motions_filtered, clicks, scrolls, keys, pid)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?
    .execute(params![
        session.window_id,
        session.start.to_rfc3339(),
        session.end.to_rfc3339(),
        session.duration_ms,
        to_i64(session.motions)?,
        to_i64(session.filtered_motions)?,
        to_i64(session.clicks)?,
        to_i64(session.scrolls)?,
        to_i64(session.keys)?,
        session.pid,
    ])?;
    Ok(conn.last_insert_rowid())
}

/// Insert one key event inside an open transaction.
pub fn insert_key_event(conn: &Connection, key: &KeyRecord) -> Result<(), StoreError> {
    conn.prepare_cached("INSERT INTO key_events (window_id, code, at) VALUES (?1, ?2, ?3)")?
        .execute(params![key.window_id, key.code, key.at.to_rfc3339()])?;
    Ok(())
}

impl IdentityStore for SqliteStore {
    fn find_process(&mut self, name: &str, cmdline: &str) -> Result<Option<i64>, StoreError> {
        let id = self
            .conn
            .prepare_cached("SELECT id FROM processes WHERE name = ?1 AND cmdline = ?2 LIMIT 1")?
            .query_row(params![name, cmdline], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn insert_process(&mut self, name: &str, cmdline: &str) -> Result<i64, StoreError> {
        self.conn
            .prepare_cached("INSERT INTO processes (name, cmdline) VALUES (?1, ?2)")?
            .execute(params![name, cmdline])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn find_window(
        &mut self,
        title: &str,
        class: &str,
        process_id: i64,
    ) -> Result<Option<i64>, StoreError> {
        let id = self
            .conn
            .prepare_cached(
                "SELECT id FROM windows
                 WHERE title = ?1 AND class = ?2 AND process_id = ?3
                 LIMIT 1",
            )?
            .query_row(params![title, class, process_id], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn insert_window(
        &mut self,
        title: &str,
        class: &str,
        process_id: i64,
    ) -> Result<i64, StoreError> {
        self.conn
            .prepare_cached("INSERT INTO windows (title, class, process_id) VALUES (?1, ?2, ?3)")?
            .execute(params![title, class, process_id])?;
        Ok(self.conn.last_insert_rowid())
    }
}

impl SessionSink for SqliteStore {
    fn commit_session(
        &mut self,
        session: &SessionRecord,
        keys: &[KeyRecord],
    ) -> Result<i64, StoreError> {
        // Dropping `tx` without commit rolls everything back.
        let tx = self.conn.transaction()?;
        let session_id = insert_session(&tx, session)?;
        for key in keys {
            insert_key_event(&tx, key)?;
        }
        tx.commit()?;
        Ok(session_id)
    }
}
