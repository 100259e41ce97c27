//! Wire message decoding.
//!
//! The capture agent publishes one message per event as UTF-8 text with
//! newline-separated fields:
//!
//! ```text
//! 0 topic          (ignored)
//! 1 event type     MotionEvent | EnterEvent | KeyEvent | ClickEvent | ...
//! 2 device time    u64 milliseconds
//! 3 window title
//! 4 window class
//! 5 timestamp      Unix seconds
//! 6 code           u8            (optional)
//! 7 pid            u32           (optional)
//! 8 process name                 (optional)
//! 9 process cmdline              (optional)
//! ```

use crate::collector::types::{Event, EventType, Process, Window};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use thiserror::Error;

/// Number of fields every message must carry.
const REQUIRED_FIELDS: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message is not valid UTF-8")]
    NotUtf8,
    #[error("message has {found} fields, expected at least 6")]
    MissingFields { found: usize },
    #[error("invalid {field} value '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("timestamp {0} is out of range")]
    TimestampOutOfRange(i64),
}

/// Decode a raw message payload into an [`Event`].
pub fn decode_message(payload: &[u8]) -> Result<Event, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
    decode_str(text)
}

/// Decode a message that is already text.
pub fn decode_str(message: &str) -> Result<Event, DecodeError> {
    let parts: Vec<&str> = message.split('\n').collect();
    if parts.len() < REQUIRED_FIELDS {
        return Err(DecodeError::MissingFields { found: parts.len() });
    }

    let event_type = EventType::from_wire(parts[1].trim());
    let time: u64 = parse_field(parts[2], "time")?;
    let unix_secs: i64 = parse_field(parts[5], "timestamp")?;
    let timestamp = DateTime::<Utc>::from_timestamp(unix_secs, 0)
        .ok_or(DecodeError::TimestampOutOfRange(unix_secs))?;

    let code = optional_field(&parts, 6, "code")?;
    let pid = optional_field(&parts, 7, "pid")?;
    let process = Process::new(
        parts.get(8).copied().unwrap_or_default(),
        parts.get(9).copied().unwrap_or_default(),
    );

    Ok(Event {
        event_type,
        window: Window::new(parts[3], parts[4], pid, process),
        time,
        timestamp,
        code,
    })
}

fn parse_field<T: FromStr>(raw: &str, field: &'static str) -> Result<T, DecodeError> {
    raw.trim().parse().map_err(|_| DecodeError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

fn optional_field<T: FromStr + Default>(
    parts: &[&str],
    index: usize,
    field: &'static str,
) -> Result<T, DecodeError> {
    match parts.get(index).map(|raw| raw.trim()) {
        None | Some("") => Ok(T::default()),
        Some(raw) => parse_field(raw, field),
    }
}
