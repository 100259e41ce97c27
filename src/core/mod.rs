//! Core functionality for selftop.
//!
//! This module contains:
//! - The session aggregator that turns events into engagement sessions
//! - The identity cache mapping windows and processes to stored ids
//! - String sanitisation for stored descriptors

pub mod identity;
pub mod sanitize;
pub mod session;

// Re-export commonly used types
pub use identity::{IdentityCache, IdentityError, LookupPolicy, PLACEHOLDER_ID};
pub use sanitize::sanitize;
pub use session::{
    AggregatorConfig, AggregatorError, Boundary, ClosedSession, Counter, KeyRecord, OpenSession,
    SessionAggregator, SessionRecord, IDLE_TIMEOUT_MS, MOTION_FILTER_MS,
};
