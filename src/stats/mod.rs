//! Ingest statistics for the selftop daemon.
//!
//! Counts what the daemon has consumed and committed so `selftop status` can
//! report it between runs.

pub mod log;

// Re-export commonly used types
pub use log::{create_shared_log_with_persistence, IngestLog, IngestStats, SharedIngestLog};
