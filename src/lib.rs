//! selftop - personal activity telemetry daemon.
//!
//! Consumes the stream of input and focus events published by a capture
//! agent, reconstructs engagement sessions (contiguous activity in a single
//! window), and commits each finished session with its interaction counters
//! and key log to SQLite.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          selftop                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐        │
//! │  │ Subscriber  │──▶│   Session   │──▶│    Store    │        │
//! │  │ (SP / TCP)  │   │ Aggregator  │   │  (SQLite)   │        │
//! │  └─────────────┘   └─────────────┘   └─────────────┘        │
//! │                          │  ▲                ▲              │
//! │                          ▼  │                │              │
//! │                    ┌─────────────┐           │              │
//! │                    │  Identity   │───────────┘              │
//! │                    │    Cache    │                          │
//! │                    └─────────────┘                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything downstream of the subscriber runs on one thread: an event is
//! fully processed, including any session commit it triggers, before the
//! next one is read.
//!
//! # Example
//!
//! ```no_run
//! use selftop::collector::{Subscriber, SubscriberConfig};
//! use selftop::core::{AggregatorConfig, SessionAggregator};
//! use selftop::store::SqliteStore;
//!
//! let store = SqliteStore::open("selftop.db").expect("failed to open database");
//! let mut aggregator = SessionAggregator::new(store, AggregatorConfig::default());
//!
//! let mut subscriber = Subscriber::new(SubscriberConfig::default());
//! subscriber.start().expect("failed to connect to capture agent");
//!
//! for event in subscriber.receiver().iter() {
//!     if let Some(closed) = aggregator.process(event).expect("session commit failed") {
//!         println!("session {} closed", closed.id);
//!     }
//! }
//! ```

pub mod collector;
pub mod config;
pub mod core;
pub mod stats;
pub mod store;

// Re-export key types at crate root for convenience
pub use collector::{Event, EventType, Process, Subscriber, SubscriberConfig, Window};
pub use config::{Config, ConfigError};
pub use self::core::{
    AggregatorConfig, AggregatorError, ClosedSession, IdentityCache, LookupPolicy,
    SessionAggregator, SessionRecord,
};
pub use stats::{IngestLog, IngestStats, SharedIngestLog};
pub use store::{SqliteStore, Store, StoreError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
