//! Engagement sessions.
//!
//! A session is a contiguous span of activity in one window. The
//! [`SessionAggregator`] consumes events in capture order, accumulates
//! interaction counters for the open session and closes it when focus moves
//! to another window or when the device clock shows an idle gap longer than
//! the idle timeout. Closed sessions are committed together with the key
//! events buffered while they were open.
//!
//! Sessions only close when the *next* event arrives. Whatever is open when
//! the event source ends or the process stops is never persisted.

use crate::collector::types::{Event, EventType};
use crate::core::identity::{IdentityCache, IdentityError, LookupPolicy};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Device-clock gap that ends a session regardless of window (5 minutes).
pub const IDLE_TIMEOUT_MS: u64 = 300_000;

/// Motion samples closer together than this are one interaction.
pub const MOTION_FILTER_MS: u64 = 200;

/// Tunables for the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub idle_timeout_ms: u64,
    pub motion_filter_ms: u64,
    pub identity_lookup: LookupPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: IDLE_TIMEOUT_MS,
            motion_filter_ms: MOTION_FILTER_MS,
            identity_lookup: LookupPolicy::default(),
        }
    }
}

/// Interaction counters of the open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    /// Every motion sample
    pub motions: u64,
    /// Motion samples that start a new burst
    pub filtered_motions: u64,
    pub clicks: u64,
    pub scrolls: u64,
    pub keys: u64,
    /// Device-clock milliseconds accumulated across the session's events
    pub time: u64,
    pub start: DateTime<Utc>,
}

impl Counter {
    /// Fresh counter for a session beginning at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            motions: 0,
            filtered_motions: 0,
            clicks: 0,
            scrolls: 0,
            keys: 0,
            time: 0,
            start,
        }
    }

    fn record(&mut self, event: &Event, previous: &Event, delta: u64, motion_filter_ms: u64) {
        self.time = self.time.saturating_add(delta);

        match event.event_type {
            EventType::Motion => {
                self.motions += 1;
                if previous.event_type != EventType::Motion || delta > motion_filter_ms {
                    self.filtered_motions += 1;
                }
            }
            EventType::Click if event.is_scroll() => self.scrolls += 1,
            EventType::Click => self.clicks += 1,
            EventType::Key => self.keys += 1,
            EventType::Enter | EventType::Unknown => {}
        }
    }
}

/// A finished session, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub window_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: i64,
    pub motions: u64,
    pub filtered_motions: u64,
    pub clicks: u64,
    pub scrolls: u64,
    pub keys: u64,
    /// Pid of the process owning the session's window
    pub pid: u32,
}

/// A key press flushed with its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub window_id: i64,
    pub code: u8,
    pub at: DateTime<Utc>,
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Focus moved to a different window
    WindowSwitch,
    /// Device-clock gap exceeded the idle timeout
    Idle,
}

/// Result of a committed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSession {
    /// Row id assigned by the store
    pub id: i64,
    pub record: SessionRecord,
    pub keys: Vec<KeyRecord>,
    pub boundary: Boundary,
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("failed to persist session: {0}")]
    Persist(#[source] StoreError),
}

/// State kept between events while a session is open.
#[derive(Debug, Clone)]
pub struct OpenSession {
    pub previous: Event,
    pub counter: Counter,
    /// Key events of this session, in arrival order
    pub keys: Vec<Event>,
}

impl OpenSession {
    fn starting_with(event: Event) -> Self {
        Self {
            counter: Counter::starting_at(event.timestamp),
            previous: event,
            keys: Vec::new(),
        }
    }
}

/// Session boundary detection and metric aggregation.
///
/// Owns the store, the identity cache and the open session; events must be
/// fed in capture order from a single thread.
pub struct SessionAggregator<S> {
    store: S,
    identities: IdentityCache,
    config: AggregatorConfig,
    open: Option<OpenSession>,
}

impl<S: Store> SessionAggregator<S> {
    pub fn new(store: S, config: AggregatorConfig) -> Self {
        Self {
            store,
            identities: IdentityCache::new(config.identity_lookup),
            config,
            open: None,
        }
    }

    /// Process one event.
    ///
    /// Returns the session this event closed, if any. A persistence error
    /// loses the closing session and its key buffer; the next event then
    /// starts over as if it were the first.
    pub fn process(&mut self, event: Event) -> Result<Option<ClosedSession>, AggregatorError> {
        self.identities.resolve_window(&mut self.store, &event.window)?;

        let mut open = match self.open.take() {
            Some(open) => open,
            None => {
                tracing::debug!(class = %event.window.class, "first event, opening session");
                self.open = Some(OpenSession::starting_with(event));
                return Ok(None);
            }
        };

        let delta = match event.time.checked_sub(open.previous.time) {
            Some(delta) => delta,
            None => {
                tracing::warn!(
                    previous = open.previous.time,
                    current = event.time,
                    "device clock went backwards, treating gap as zero"
                );
                0
            }
        };

        open.counter
            .record(&event, &open.previous, delta, self.config.motion_filter_ms);
        if event.event_type == EventType::Key {
            open.keys.push(event.clone());
        }

        tracing::debug!(
            event = event.event_type.as_str(),
            class = %event.window.class,
            active_secs = open.counter.time as f64 / 1000.0,
            motions = open.counter.motions,
            clicks = open.counter.clicks,
            keys = open.counter.keys,
            "event recorded"
        );

        let boundary = if delta > self.config.idle_timeout_ms {
            Some(Boundary::Idle)
        } else if event.window != open.previous.window {
            Some(Boundary::WindowSwitch)
        } else {
            None
        };

        let Some(boundary) = boundary else {
            open.previous = event;
            self.open = Some(open);
            return Ok(None);
        };

        let closed = self.close(open, &event, boundary)?;
        self.open = Some(OpenSession::starting_with(event));
        Ok(Some(closed))
    }

    fn close(
        &mut self,
        open: OpenSession,
        next: &Event,
        boundary: Boundary,
    ) -> Result<ClosedSession, AggregatorError> {
        let end = match boundary {
            // The session ended with the last observed activity, not when the
            // gap was noticed.
            Boundary::Idle => open.previous.timestamp,
            Boundary::WindowSwitch => next.timestamp,
        };

        let window_id = self
            .identities
            .resolve_window(&mut self.store, &open.previous.window)?;

        let mut keys = Vec::with_capacity(open.keys.len());
        for key in &open.keys {
            keys.push(KeyRecord {
                window_id: self.identities.resolve_window(&mut self.store, &key.window)?,
                code: key.code,
                at: key.timestamp,
            });
        }

        let counter = open.counter;
        let record = SessionRecord {
            window_id,
            start: counter.start,
            end,
            duration_ms: (end - counter.start).num_milliseconds().max(0),
            motions: counter.motions,
            filtered_motions: counter.filtered_motions,
            clicks: counter.clicks,
            scrolls: counter.scrolls,
            keys: counter.keys,
            pid: open.previous.window.pid,
        };

        let id = self
            .store
            .commit_session(&record, &keys)
            .map_err(AggregatorError::Persist)?;

        tracing::info!(
            session_id = id,
            window_id,
            class = %open.previous.window.class,
            ?boundary,
            duration_ms = record.duration_ms,
            motions = record.motions,
            filtered_motions = record.filtered_motions,
            clicks = record.clicks,
            scrolls = record.scrolls,
            keys = record.keys,
            "session committed"
        );

        Ok(ClosedSession {
            id,
            record,
            keys,
            boundary,
        })
    }

    /// The open session, if any event has been seen yet.
    pub fn open_session(&self) -> Option<&OpenSession> {
        self.open.as_ref()
    }

    /// Drop the open session without persisting it.
    pub fn discard(&mut self) -> Option<OpenSession> {
        self.open.take()
    }

    pub fn identities(&self) -> &IdentityCache {
        &self.identities
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::types::{Process, Window};
    use crate::store::{IdentityStore, SessionSink, SqliteStore};

    const T0: i64 = 1_700_000_000;

    fn window(title: &str, pid: u32) -> Window {
        Window::new(title, "Test", pid, Process::new("test", title))
    }

    fn event(kind: EventType, window: &Window, time: u64, secs: i64, code: u8) -> Event {
        Event::new(
            kind,
            window.clone(),
            time,
            DateTime::from_timestamp(T0 + secs, 0).unwrap(),
            code,
        )
    }

    fn motion(window: &Window, time: u64) -> Event {
        event(EventType::Motion, window, time, (time / 1000) as i64, 0)
    }

    fn aggregator() -> SessionAggregator<SqliteStore> {
        SessionAggregator::new(
            SqliteStore::open_in_memory().unwrap(),
            AggregatorConfig::default(),
        )
    }

    fn feed(agg: &mut SessionAggregator<SqliteStore>, events: Vec<Event>) -> Vec<ClosedSession> {
        events
            .into_iter()
            .filter_map(|e| agg.process(e).unwrap())
            .collect()
    }

    #[test]
    fn test_first_event_only_opens_session() {
        let mut agg = aggregator();
        let w1 = window("one", 1);

        assert!(agg.process(motion(&w1, 1_000)).unwrap().is_none());

        let open = agg.open_session().unwrap();
        assert_eq!(open.counter, Counter::starting_at(open.previous.timestamp));
        assert_eq!(open.counter.start.timestamp(), T0 + 1);
        assert_eq!(agg.identities().window_count(), 1);
    }

    #[test]
    fn test_single_window_never_closes_on_its_own() {
        let mut agg = aggregator();
        let w1 = window("one", 1);

        let events = (0..100).map(|i| motion(&w1, i * 1_000)).collect();
        assert!(feed(&mut agg, events).is_empty());

        let counter = &agg.open_session().unwrap().counter;
        assert_eq!(counter.motions, 99);
        assert_eq!(counter.time, 99_000);
        assert_eq!(agg.store().row_counts().unwrap().sessions, 0);
    }

    #[test]
    fn test_motion_burst_counts_once() {
        let mut agg = aggregator();
        let w1 = window("one", 1);

        let mut events = vec![event(EventType::Enter, &w1, 0, 0, 0)];
        events.extend((1..=10).map(|i| motion(&w1, i * 20)));
        feed(&mut agg, events);

        let counter = &agg.open_session().unwrap().counter;
        assert_eq!(counter.motions, 10);
        assert_eq!(counter.filtered_motions, 1);
    }

    #[test]
    fn test_spaced_motions_count_separately() {
        let mut agg = aggregator();
        let w1 = window("one", 1);

        feed(
            &mut agg,
            vec![
                motion(&w1, 0),
                motion(&w1, 201),
                motion(&w1, 401),
                motion(&w1, 602),
            ],
        );

        let counter = &agg.open_session().unwrap().counter;
        assert_eq!(counter.motions, 3);
        // 200ms is not more than the filter, 201ms is.
        assert_eq!(counter.filtered_motions, 2);
        assert!(counter.filtered_motions <= counter.motions);
    }

    #[test]
    fn test_scroll_codes_count_as_scrolls() {
        let mut agg = aggregator();
        let w1 = window("one", 1);

        let mut events = vec![motion(&w1, 0)];
        for (i, code) in [1u8, 2, 3, 4, 5, 6, 7, 8].into_iter().enumerate() {
            events.push(event(EventType::Click, &w1, 10 + i as u64, 0, code));
        }
        feed(&mut agg, events);

        let counter = &agg.open_session().unwrap().counter;
        assert_eq!(counter.clicks, 4);
        assert_eq!(counter.scrolls, 4);
    }

    #[test]
    fn test_idle_gap_ends_at_last_activity() {
        let mut agg = aggregator();
        let w1 = window("one", 1);

        let a = event(EventType::Key, &w1, 10_000, 10, 38);
        let b = event(EventType::Motion, &w1, 10_000 + IDLE_TIMEOUT_MS + 1, 400, 0);

        agg.process(event(EventType::Enter, &w1, 0, 0, 0)).unwrap();
        agg.process(a.clone()).unwrap();
        let closed = agg.process(b.clone()).unwrap().unwrap();

        assert_eq!(closed.boundary, Boundary::Idle);
        assert_eq!(closed.record.start.timestamp(), T0);
        assert_eq!(closed.record.end, a.timestamp);
        assert_eq!(closed.record.duration_ms, 10_000);

        let open = agg.open_session().unwrap();
        assert_eq!(open.counter.start, b.timestamp);
        assert_eq!(open.counter.motions, 0);
        assert!(open.keys.is_empty());
    }

    #[test]
    fn test_idle_gap_wins_over_window_switch() {
        let mut agg = aggregator();
        let w1 = window("one", 1);
        let w2 = window("two", 2);

        let a = event(EventType::Motion, &w1, 100, 5, 0);
        let b = event(EventType::Motion, &w2, 100 + IDLE_TIMEOUT_MS + 1, 400, 0);

        agg.process(event(EventType::Motion, &w1, 0, 0, 0)).unwrap();
        agg.process(a.clone()).unwrap();
        let closed = agg.process(b.clone()).unwrap().unwrap();

        assert_eq!(closed.boundary, Boundary::Idle);
        assert_eq!(closed.record.end, a.timestamp);
        assert_eq!(closed.record.duration_ms, 5_000);
        assert_eq!(closed.record.motions, 2);
        assert_eq!(
            Some(closed.record.window_id),
            agg.identities().cached_window(&w1)
        );

        let open = agg.open_session().unwrap();
        assert_eq!(open.previous.window, w2);
        assert_eq!(open.counter.start, b.timestamp);
    }

    #[test]
    fn test_idle_threshold_is_exclusive() {
        let mut agg = aggregator();
        let w1 = window("one", 1);

        let closed = feed(
            &mut agg,
            vec![motion(&w1, 0), motion(&w1, IDLE_TIMEOUT_MS)],
        );
        assert!(closed.is_empty());
    }

    #[test]
    fn test_window_switch_ends_at_next_event() {
        let mut agg = aggregator();
        let w1 = window("one", 1);
        let w2 = window("two", 2);

        agg.process(event(EventType::Motion, &w1, 1_000, 1, 0)).unwrap();
        let b = event(EventType::Motion, &w2, 1_050, 3, 0);
        let closed = agg.process(b.clone()).unwrap().unwrap();

        assert_eq!(closed.boundary, Boundary::WindowSwitch);
        assert_eq!(closed.record.end, b.timestamp);
        assert_eq!(closed.record.duration_ms, 2_000);
        assert_eq!(closed.record.pid, 1);
        assert_eq!(
            Some(closed.record.window_id),
            agg.identities().cached_window(&w1)
        );
    }

    #[test]
    fn test_keys_flush_with_session() {
        let mut agg = aggregator();
        let w1 = window("one", 1);
        let w2 = window("two", 2);

        let closed = feed(
            &mut agg,
            vec![
                motion(&w1, 0),
                event(EventType::Key, &w1, 100, 1, 24),
                event(EventType::Key, &w1, 200, 2, 25),
                event(EventType::Key, &w1, 300, 3, 26),
                motion(&w2, 400),
            ],
        );

        assert_eq!(closed.len(), 1);
        let session = &closed[0];
        assert_eq!(session.record.keys, 3);
        let codes: Vec<u8> = session.keys.iter().map(|k| k.code).collect();
        assert_eq!(codes, vec![24, 25, 26]);
        let seconds: Vec<i64> = session.keys.iter().map(|k| k.at.timestamp() - T0).collect();
        assert_eq!(seconds, vec![1, 2, 3]);
        assert!(session.keys.iter().all(|k| k.window_id == session.record.window_id));

        assert!(agg.open_session().unwrap().keys.is_empty());

        let stored = agg
            .store()
            .key_events_for_window(session.record.window_id)
            .unwrap();
        assert_eq!(stored, session.keys);
    }

    #[test]
    fn test_switching_key_is_tagged_with_its_own_window() {
        let mut agg = aggregator();
        let w1 = window("one", 1);
        let w2 = window("two", 2);

        let closed = feed(
            &mut agg,
            vec![
                event(EventType::Key, &w1, 0, 0, 10),
                event(EventType::Key, &w1, 50, 0, 11),
                event(EventType::Key, &w2, 100, 0, 12),
            ],
        );

        let session = &closed[0];
        let w1_id = agg.identities().cached_window(&w1).unwrap();
        let w2_id = agg.identities().cached_window(&w2).unwrap();
        assert_eq!(session.record.window_id, w1_id);
        assert_eq!(session.record.keys, 2);
        assert_eq!(
            session
                .keys
                .iter()
                .map(|k| (k.code, k.window_id))
                .collect::<Vec<_>>(),
            vec![(11, w1_id), (12, w2_id)]
        );
    }

    #[test]
    fn test_end_to_end_scenario() {
        let mut agg = aggregator();
        let w1 = window("one", 1);
        let w2 = window("two", 2);

        let last = motion(&w2, 400);
        let closed = feed(
            &mut agg,
            vec![
                motion(&w1, 0),
                motion(&w1, 50),
                event(EventType::Click, &w1, 300, 0, 1),
                last.clone(),
            ],
        );

        assert_eq!(closed.len(), 1);
        let record = &closed[0].record;
        assert_eq!(record.motions, 2);
        assert_eq!(record.filtered_motions, 1);
        assert_eq!(record.clicks, 1);
        assert_eq!(record.scrolls, 0);

        let stored = agg.store().sessions_for_window(record.window_id).unwrap();
        assert_eq!(stored, vec![record.clone()]);

        let open = agg.open_session().unwrap();
        assert_eq!(open.previous.window, w2);
        assert_eq!(open.counter, Counter::starting_at(last.timestamp));
    }

    #[test]
    fn test_clock_regression_is_clamped() {
        let mut agg = aggregator();
        let w1 = window("one", 1);

        let closed = feed(
            &mut agg,
            vec![motion(&w1, 5_000), motion(&w1, 1_000), motion(&w1, 1_100)],
        );

        assert!(closed.is_empty());
        let counter = &agg.open_session().unwrap().counter;
        assert_eq!(counter.time, 100);
        assert_eq!(counter.motions, 2);
    }

    #[test]
    fn test_clock_regression_still_switches_window() {
        let mut agg = aggregator();
        let w1 = window("one", 1);
        let w2 = window("two", 2);

        agg.process(event(EventType::Motion, &w1, 5_000, 5, 0)).unwrap();
        let key = event(EventType::Key, &w2, 1_000, 6, 9);
        let closed = agg.process(key.clone()).unwrap().unwrap();

        assert_eq!(closed.boundary, Boundary::WindowSwitch);
        assert_eq!(closed.record.end, key.timestamp);
        assert_eq!(closed.record.duration_ms, 1_000);
        assert_eq!(closed.record.keys, 1);

        let w2_id = agg.identities().cached_window(&w2).unwrap();
        assert_eq!(
            closed.keys,
            vec![KeyRecord {
                window_id: w2_id,
                code: 9,
                at: key.timestamp,
            }]
        );

        let open = agg.open_session().unwrap();
        assert!(open.keys.is_empty());
        assert_eq!(open.counter.time, 0);
    }

    #[test]
    fn test_enter_and_unknown_only_advance_time() {
        let mut agg = aggregator();
        let w1 = window("one", 1);

        feed(
            &mut agg,
            vec![
                motion(&w1, 0),
                event(EventType::Enter, &w1, 100, 0, 0),
                event(EventType::Unknown, &w1, 250, 0, 3),
            ],
        );

        let counter = &agg.open_session().unwrap().counter;
        assert_eq!(counter.time, 250);
        assert_eq!(
            (counter.motions, counter.clicks, counter.scrolls, counter.keys),
            (0, 0, 0, 0)
        );
    }

    /// Store whose commits always fail.
    struct BrokenSink(SqliteStore);

    impl IdentityStore for BrokenSink {
        fn find_process(&mut self, name: &str, cmdline: &str) -> Result<Option<i64>, StoreError> {
            self.0.find_process(name, cmdline)
        }
        fn insert_process(&mut self, name: &str, cmdline: &str) -> Result<i64, StoreError> {
            self.0.insert_process(name, cmdline)
        }
        fn find_window(
            &mut self,
            title: &str,
            class: &str,
            process_id: i64,
        ) -> Result<Option<i64>, StoreError> {
            self.0.find_window(title, class, process_id)
        }
        fn insert_window(
            &mut self,
            title: &str,
            class: &str,
            process_id: i64,
        ) -> Result<i64, StoreError> {
            self.0.insert_window(title, class, process_id)
        }
    }

    impl SessionSink for BrokenSink {
        fn commit_session(&mut self, _: &SessionRecord, _: &[KeyRecord]) -> Result<i64, StoreError> {
            Err(StoreError::Corrupt("read-only".to_string()))
        }
    }

    #[test]
    fn test_persist_failure_is_reported() {
        let store = BrokenSink(SqliteStore::open_in_memory().unwrap());
        let mut agg = SessionAggregator::new(store, AggregatorConfig::default());
        let w1 = window("one", 1);
        let w2 = window("two", 2);

        agg.process(motion(&w1, 0)).unwrap();
        agg.process(event(EventType::Key, &w1, 10, 0, 1)).unwrap();
        let err = agg.process(motion(&w2, 20)).unwrap_err();

        assert!(matches!(err, AggregatorError::Persist(_)));
        assert!(agg.open_session().is_none());
    }
}
