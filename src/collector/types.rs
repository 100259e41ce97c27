//! Event types delivered by the capture agent.
//!
//! An [`Event`] is one observed occurrence (motion, key press, click, focus
//! change) together with the window it happened in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Input codes that denote scroll-wheel motion rather than a button click.
pub const SCROLL_CODES: [u8; 4] = [4, 5, 6, 7];

/// Kind of observed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Pointer movement sample
    Motion,
    /// Pointer entered a window (focus change notification)
    Enter,
    /// Key press
    Key,
    /// Button press or scroll-wheel step, see [`Event::is_scroll`]
    Click,
    /// Anything the capture agent sends that we do not classify
    Unknown,
}

impl EventType {
    /// Map a wire type name to an event type. Unrecognised names are `Unknown`.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "MotionEvent" => EventType::Motion,
            "EnterEvent" => EventType::Enter,
            "KeyEvent" => EventType::Key,
            "ClickEvent" => EventType::Click,
            _ => EventType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Motion => "motion",
            EventType::Enter => "enter",
            EventType::Key => "key",
            EventType::Click => "click",
            EventType::Unknown => "unknown",
        }
    }
}

/// Process owning a window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Process {
    pub name: String,
    pub cmdline: String,
}

impl Process {
    pub fn new(name: impl Into<String>, cmdline: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmdline: cmdline.into(),
        }
    }
}

/// Window descriptor. Equality covers every field, so it can key the
/// identity cache directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub title: String,
    pub class: String,
    /// Pid of the owning process
    pub pid: u32,
    pub process: Process,
}

impl Window {
    pub fn new(
        title: impl Into<String>,
        class: impl Into<String>,
        pid: u32,
        process: Process,
    ) -> Self {
        Self {
            title: title.into(),
            class: class.into(),
            pid,
            process,
        }
    }
}

/// A single decoded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub window: Window,
    /// Device-clock milliseconds, monotonic within one capture agent run
    pub time: u64,
    /// Wall-clock time the event was captured (second resolution)
    pub timestamp: DateTime<Utc>,
    /// Input code, only meaningful for `Click` and `Key` events
    pub code: u8,
}

impl Event {
    pub fn new(
        event_type: EventType,
        window: Window,
        time: u64,
        timestamp: DateTime<Utc>,
        code: u8,
    ) -> Self {
        Self {
            event_type,
            window,
            time,
            timestamp,
            code,
        }
    }

    /// Whether this is a `Click` carrying a scroll-wheel code.
    pub fn is_scroll(&self) -> bool {
        self.event_type == EventType::Click && SCROLL_CODES.contains(&self.code)
    }
}
