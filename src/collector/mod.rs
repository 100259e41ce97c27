//! Event intake from the external capture agent.
//!
//! This module decodes the agent's wire messages into [`Event`] values and
//! provides a SUB socket client that delivers them in capture order.

pub mod decode;
pub mod subscriber;
pub mod types;

// Re-export commonly used types
pub use decode::{decode_message, DecodeError};
pub use subscriber::{Subscriber, SubscriberConfig, SubscriberError};
pub use types::{Event, EventType, Process, Window, SCROLL_CODES};
