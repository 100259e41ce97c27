//! Persistence for window identities and finished sessions.
//!
//! The aggregator talks to storage only through [`IdentityStore`] and
//! [`SessionSink`]; [`SqliteStore`] is the implementation the daemon uses.

mod migrations;
pub mod sqlite;

use crate::core::session::{KeyRecord, SessionRecord};
use std::path::PathBuf;
use thiserror::Error;

pub use migrations::CURRENT_SCHEMA_VERSION;
pub use sqlite::{RowCounts, SqliteStore};

/// Storage errors. A missing row is not an error: lookups return `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("database version ({found}) is newer than supported schema ({supported})")]
    UnsupportedVersion { found: i32, supported: i32 },
    #[error("unknown migration target version: {0}")]
    UnknownMigration(i32),
    #[error("value {0} exceeds SQLite INTEGER range")]
    OutOfRange(u64),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Lookup-or-insert operations backing the identity cache.
pub trait IdentityStore {
    fn find_process(&mut self, name: &str, cmdline: &str) -> Result<Option<i64>, StoreError>;

    fn insert_process(&mut self, name: &str, cmdline: &str) -> Result<i64, StoreError>;

    fn find_window(
        &mut self,
        title: &str,
        class: &str,
        process_id: i64,
    ) -> Result<Option<i64>, StoreError>;

    fn insert_window(&mut self, title: &str, class: &str, process_id: i64)
        -> Result<i64, StoreError>;
}

/// Receives finished sessions.
pub trait SessionSink {
    /// Persist a session and its key events as one atomic unit, returning the
    /// session's row id. Nothing is written if any part fails.
    fn commit_session(
        &mut self,
        session: &SessionRecord,
        keys: &[KeyRecord],
    ) -> Result<i64, StoreError>;
}

/// Everything the session aggregator needs from storage.
pub trait Store: IdentityStore + SessionSink {}

impl<T: IdentityStore + SessionSink> Store for T {}
