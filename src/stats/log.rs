//! Running counters of consumed events and committed sessions.

use crate::collector::types::EventType;
use crate::core::session::ClosedSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ingest counters, cumulative across runs when persisted.
#[derive(Debug)]
pub struct IngestLog {
    motion_events: AtomicU64,
    enter_events: AtomicU64,
    key_events: AtomicU64,
    click_events: AtomicU64,
    unknown_events: AtomicU64,
    undecodable_messages: AtomicU64,
    sessions_committed: AtomicU64,
    keys_persisted: AtomicU64,
    /// When this run started
    run_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl IngestLog {
    pub fn new() -> Self {
        Self {
            motion_events: AtomicU64::new(0),
            enter_events: AtomicU64::new(0),
            key_events: AtomicU64::new(0),
            click_events: AtomicU64::new(0),
            unknown_events: AtomicU64::new(0),
            undecodable_messages: AtomicU64::new(0),
            sessions_committed: AtomicU64::new(0),
            keys_persisted: AtomicU64::new(0),
            run_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log that resumes from, and saves to, `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!("could not load previous ingest stats: {e}");
        }

        log
    }

    /// Record one consumed event.
    pub fn record_event(&self, event_type: EventType) {
        let counter = match event_type {
            EventType::Motion => &self.motion_events,
            EventType::Enter => &self.enter_events,
            EventType::Key => &self.key_events,
            EventType::Click => &self.click_events,
            EventType::Unknown => &self.unknown_events,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record messages the source could not decode.
    pub fn record_undecodable(&self, count: u64) {
        self.undecodable_messages.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a committed session and its key events.
    pub fn record_session(&self, session: &ClosedSession) {
        self.sessions_committed.fetch_add(1, Ordering::Relaxed);
        self.keys_persisted
            .fetch_add(session.keys.len() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            motion_events: self.motion_events.load(Ordering::Relaxed),
            enter_events: self.enter_events.load(Ordering::Relaxed),
            key_events: self.key_events.load(Ordering::Relaxed),
            click_events: self.click_events.load(Ordering::Relaxed),
            unknown_events: self.unknown_events.load(Ordering::Relaxed),
            undecodable_messages: self.undecodable_messages.load(Ordering::Relaxed),
            sessions_committed: self.sessions_committed.load(Ordering::Relaxed),
            keys_persisted: self.keys_persisted.load(Ordering::Relaxed),
            run_start: self.run_start,
            run_duration_secs: (Utc::now() - self.run_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Ingest Statistics:\n\
             - Events consumed: {} (motion {}, enter {}, key {}, click {}, unknown {})\n\
             - Undecodable messages: {}\n\
             - Sessions committed: {}\n\
             - Key events persisted: {}\n\
             - Run duration: {} seconds",
            stats.total_events(),
            stats.motion_events,
            stats.enter_events,
            stats.key_events,
            stats.click_events,
            stats.unknown_events,
            stats.undecodable_messages,
            stats.sessions_committed,
            stats.keys_persisted,
            stats.run_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                motion_events: stats.motion_events,
                enter_events: stats.enter_events,
                key_events: stats.key_events,
                click_events: stats.click_events,
                unknown_events: stats.unknown_events,
                undecodable_messages: stats.undecodable_messages,
                sessions_committed: stats.sessions_committed,
                keys_persisted: stats.keys_persisted,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let persisted = PersistedStats::read(path)?;

                self.motion_events
                    .store(persisted.motion_events, Ordering::Relaxed);
                self.enter_events
                    .store(persisted.enter_events, Ordering::Relaxed);
                self.key_events.store(persisted.key_events, Ordering::Relaxed);
                self.click_events
                    .store(persisted.click_events, Ordering::Relaxed);
                self.unknown_events
                    .store(persisted.unknown_events, Ordering::Relaxed);
                self.undecodable_messages
                    .store(persisted.undecodable_messages, Ordering::Relaxed);
                self.sessions_committed
                    .store(persisted.sessions_committed, Ordering::Relaxed);
                self.keys_persisted
                    .store(persisted.keys_persisted, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for IngestLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of ingest statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestStats {
    pub motion_events: u64,
    pub enter_events: u64,
    pub key_events: u64,
    pub click_events: u64,
    pub unknown_events: u64,
    pub undecodable_messages: u64,
    pub sessions_committed: u64,
    pub keys_persisted: u64,
    pub run_start: DateTime<Utc>,
    pub run_duration_secs: u64,
}

impl IngestStats {
    pub fn total_events(&self) -> u64 {
        self.motion_events
            + self.enter_events
            + self.key_events
            + self.click_events
            + self.unknown_events
    }

    /// Read cumulative stats saved by a previous run.
    pub fn load_persisted(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let persisted = PersistedStats::read(path)?;
        Ok(Self {
            motion_events: persisted.motion_events,
            enter_events: persisted.enter_events,
            key_events: persisted.key_events,
            click_events: persisted.click_events,
            unknown_events: persisted.unknown_events,
            undecodable_messages: persisted.undecodable_messages,
            sessions_committed: persisted.sessions_committed,
            keys_persisted: persisted.keys_persisted,
            run_start: persisted.last_updated,
            run_duration_secs: 0,
        })
    }
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    motion_events: u64,
    enter_events: u64,
    key_events: u64,
    click_events: u64,
    unknown_events: u64,
    undecodable_messages: u64,
    sessions_committed: u64,
    keys_persisted: u64,
    last_updated: DateTime<Utc>,
}

impl PersistedStats {
    fn read(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }
}

/// Thread-safe shared ingest log.
pub type SharedIngestLog = Arc<IngestLog>;

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedIngestLog {
    Arc::new(IngestLog::with_persistence(path))
}
