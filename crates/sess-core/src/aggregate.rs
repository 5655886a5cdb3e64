//! Per-session aggregation.
//!
//! Sessionized input is contiguous per `(entity_id, session_index)`, so a
//! single running accumulator is enough: it is closed and emitted whenever
//! the key changes and once more at the end of the stream.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::event::SessionEvent;
use crate::sessionizer::SessionizedEvent;
use crate::types::EntityId;

/// One contiguous burst of an entity's activity.
///
/// Immutable once produced. `value_sum` and `value_avg` only consider events
/// carrying a value; both are `None` when no event in the session has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub entity_id: EntityId,
    pub session_index: u64,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub event_count: u64,
    /// Events that contributed to `value_sum`.
    pub valued_event_count: u64,
    pub value_sum: Option<f64>,
    pub value_avg: Option<f64>,
}

impl Session {
    /// Time between the first and last event.
    pub fn duration(&self) -> TimeDelta {
        self.end_ts - self.start_ts
    }
}

/// A session excluded from output by `min_events_per_session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedSession {
    pub entity_id: EntityId,
    pub session_index: u64,
    pub event_count: u64,
}

impl From<&Session> for DroppedSession {
    fn from(session: &Session) -> Self {
        Self {
            entity_id: session.entity_id.clone(),
            session_index: session.session_index,
            event_count: session.event_count,
        }
    }
}

/// Running totals for the session currently being built.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAccumulator {
    entity_id: EntityId,
    session_index: u64,
    event_count: u64,
    valued_event_count: u64,
    value_sum: f64,
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
}

impl SessionAccumulator {
    /// Opens a session with its first event.
    pub fn open<E: SessionEvent>(event: &E, session_index: u64) -> Self {
        let ts = event.timestamp();
        let mut acc = Self {
            entity_id: event.entity_id().clone(),
            session_index,
            event_count: 0,
            valued_event_count: 0,
            value_sum: 0.0,
            start_ts: ts,
            end_ts: ts,
        };
        acc.push(event);
        acc
    }

    /// Adds an event. Timestamps may arrive out of order; the bounds are
    /// tracked as min and max.
    pub fn push<E: SessionEvent>(&mut self, event: &E) {
        let ts = event.timestamp();
        self.event_count += 1;
        if let Some(value) = event.value() {
            self.valued_event_count += 1;
            self.value_sum += value;
        }
        self.start_ts = self.start_ts.min(ts);
        self.end_ts = self.end_ts.max(ts);
    }

    /// Returns true if the event's key belongs to this session.
    pub fn holds(&self, entity_id: &EntityId, session_index: u64) -> bool {
        self.session_index == session_index && &self.entity_id == entity_id
    }

    pub const fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub const fn session_index(&self) -> u64 {
        self.session_index
    }

    pub const fn event_count(&self) -> u64 {
        self.event_count
    }

    pub const fn start_ts(&self) -> DateTime<Utc> {
        self.start_ts
    }

    pub const fn end_ts(&self) -> DateTime<Utc> {
        self.end_ts
    }

    /// Snapshot of the session as it stands.
    pub fn to_session(&self) -> Session {
        let (value_sum, value_avg) = if self.valued_event_count == 0 {
            (None, None)
        } else {
            #[allow(
                clippy::cast_precision_loss,
                reason = "event counts stay far below 2^52"
            )]
            let avg = self.value_sum / self.valued_event_count as f64;
            (Some(self.value_sum), Some(avg))
        };

        Session {
            entity_id: self.entity_id.clone(),
            session_index: self.session_index,
            start_ts: self.start_ts,
            end_ts: self.end_ts,
            event_count: self.event_count,
            valued_event_count: self.valued_event_count,
            value_sum,
            value_avg,
        }
    }

    pub fn finish(self) -> Session {
        self.to_session()
    }
}

/// Lazy iterator turning sessionized events into sessions.
///
/// Created by [`sessions`].
#[derive(Debug)]
pub struct Sessions<I> {
    inner: I,
    open: Option<SessionAccumulator>,
}

/// Aggregates sessionized events into one [`Session`] per
/// `(entity_id, session_index)`, without materializing the events.
pub fn sessions<I, E>(sessionized: I) -> Sessions<I::IntoIter>
where
    I: IntoIterator<Item = SessionizedEvent<E>>,
    E: SessionEvent,
{
    Sessions {
        inner: sessionized.into_iter(),
        open: None,
    }
}

impl<I, E> Iterator for Sessions<I>
where
    I: Iterator<Item = SessionizedEvent<E>>,
    E: SessionEvent,
{
    type Item = Session;

    fn next(&mut self) -> Option<Session> {
        loop {
            let Some(item) = self.inner.next() else {
                return self.open.take().map(SessionAccumulator::finish);
            };

            match self.open.as_mut() {
                Some(acc) if acc.holds(item.event.entity_id(), item.session_index) => {
                    acc.push(&item.event);
                }
                _ => {
                    let next = SessionAccumulator::open(&item.event, item.session_index);
                    if let Some(closed) = self.open.replace(next) {
                        return Some(closed.finish());
                    }
                }
            }
        }
    }
}

/// Sessions kept and sessions dropped by the minimum-size filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateOutput {
    pub sessions: Vec<Session>,
    pub dropped: Vec<DroppedSession>,
}

impl AggregateOutput {
    /// Files `session` as kept or dropped.
    pub fn record(&mut self, session: Session, min_events_per_session: u32) {
        if session.event_count < u64::from(min_events_per_session) {
            tracing::debug!(
                entity_id = %session.entity_id,
                session_index = session.session_index,
                event_count = session.event_count,
                "dropping session below minimum size"
            );
            self.dropped.push(DroppedSession::from(&session));
        } else {
            self.sessions.push(session);
        }
    }

    /// Events belonging to dropped sessions.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped.iter().map(|d| d.event_count).sum()
    }
}

/// Aggregates a sessionized sequence and applies the minimum-size filter.
///
/// Deterministic: the same input in the same order yields bit-identical
/// sessions.
pub fn aggregate<I, E>(sessionized: I, min_events_per_session: u32) -> AggregateOutput
where
    I: IntoIterator<Item = SessionizedEvent<E>>,
    E: SessionEvent,
{
    let mut output = AggregateOutput::default();
    for session in sessions(sessionized) {
        output.record(session, min_events_per_session);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::sessionizer::assign_sessions;
    use crate::types::GapThreshold;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap() + TimeDelta::minutes(minutes)
    }

    fn event(entity: &str, minutes: i64, value: Option<f64>) -> Event {
        let event = Event::new(EntityId::new(entity).unwrap(), ts(minutes));
        match value {
            Some(v) => event.with_value(v),
            None => event,
        }
    }

    fn gap(minutes: i64) -> GapThreshold {
        GapThreshold::new(TimeDelta::minutes(minutes)).unwrap()
    }

    fn sessionize(events: &[Event], threshold: GapThreshold) -> Vec<SessionizedEvent<&Event>> {
        assign_sessions(events, threshold)
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_two_sessions_with_bounds() {
        let events: Vec<_> = [0, 5, 40, 45]
            .into_iter()
            .map(|m| event("A", m, None))
            .collect();
        let output = aggregate(sessionize(&events, gap(30)), 1);

        assert_eq!(output.sessions.len(), 2);
        assert_eq!(output.sessions[0].session_index, 0);
        assert_eq!(output.sessions[0].start_ts, ts(0));
        assert_eq!(output.sessions[0].end_ts, ts(5));
        assert_eq!(output.sessions[0].event_count, 2);
        assert_eq!(output.sessions[1].session_index, 1);
        assert_eq!(output.sessions[1].start_ts, ts(40));
        assert_eq!(output.sessions[1].end_ts, ts(45));
        assert_eq!(output.sessions[1].duration(), TimeDelta::minutes(5));
        assert!(output.dropped.is_empty());
    }

    #[test]
    #[expect(
        clippy::float_cmp,
        reason = "exact equality intended for small integral sums"
    )]
    fn test_value_sum_and_average() {
        let events = vec![
            event("D", 0, Some(10.0)),
            event("D", 5, Some(20.0)),
            event("D", 10, Some(30.0)),
        ];
        let output = aggregate(sessionize(&events, gap(30)), 1);

        assert_eq!(output.sessions.len(), 1);
        let session = &output.sessions[0];
        assert_eq!(session.event_count, 3);
        assert_eq!(session.value_sum.unwrap(), 60.0);
        assert_eq!(session.value_avg.unwrap(), 20.0);
    }

    #[test]
    #[expect(clippy::float_cmp, reason = "exact equality intended")]
    fn test_average_ignores_unvalued_events() {
        let events = vec![
            event("D", 0, Some(10.0)),
            event("D", 1, None),
            event("D", 2, Some(30.0)),
        ];
        let session = &aggregate(sessionize(&events, gap(30)), 1).sessions[0];

        assert_eq!(session.event_count, 3);
        assert_eq!(session.valued_event_count, 2);
        assert_eq!(session.value_avg.unwrap(), 20.0);
    }

    #[test]
    fn test_no_values_gives_null_sum_and_average() {
        let events = vec![event("B", 100, None)];
        let output = aggregate(sessionize(&events, gap(30)), 1);

        let session = &output.sessions[0];
        assert_eq!(session.event_count, 1);
        assert_eq!(session.value_sum, None);
        assert_eq!(session.value_avg, None);

        let json = serde_json::to_value(session).unwrap();
        assert!(json["value_sum"].is_null());
        assert!(json["value_avg"].is_null());
    }

    #[test]
    fn test_min_events_filter_reports_dropped() {
        let events: Vec<_> = [0, 5, 100]
            .into_iter()
            .map(|m| event("A", m, None))
            .collect();
        let output = aggregate(sessionize(&events, gap(30)), 2);

        assert_eq!(output.sessions.len(), 1);
        assert_eq!(output.sessions[0].session_index, 0);
        assert_eq!(
            output.dropped,
            vec![DroppedSession {
                entity_id: EntityId::new("A").unwrap(),
                session_index: 1,
                event_count: 1,
            }]
        );
        assert_eq!(output.dropped_event_count(), 1);
    }

    #[test]
    fn test_entity_change_closes_session() {
        // Same session index, different entities.
        let a = event("A", 0, None);
        let b = event("B", 1, None);
        let input = vec![
            SessionizedEvent {
                event: &a,
                session_index: 0,
            },
            SessionizedEvent {
                event: &b,
                session_index: 0,
            },
        ];
        let output = aggregate(input, 1);

        assert_eq!(output.sessions.len(), 2);
        assert_eq!(output.sessions[0].entity_id.as_str(), "A");
        assert_eq!(output.sessions[1].entity_id.as_str(), "B");
    }

    #[test]
    fn test_empty_input() {
        let output = aggregate(Vec::<SessionizedEvent<Event>>::new(), 1);
        assert!(output.sessions.is_empty());
        assert!(output.dropped.is_empty());
    }

    #[test]
    fn test_accumulator_tracks_min_and_max() {
        let mut acc = SessionAccumulator::open(&event("A", 10, None), 0);
        acc.push(&event("A", 4, None));
        acc.push(&event("A", 12, None));

        assert_eq!(acc.start_ts(), ts(4));
        assert_eq!(acc.end_ts(), ts(12));
        assert_eq!(acc.event_count(), 3);
    }

    fn valued_events() -> impl Strategy<Value = Vec<(i64, Option<f64>)>> {
        prop::collection::vec((0i64..5_000, prop::option::of(-1e6f64..1e6)), 1..150).prop_map(
            |mut v| {
                v.sort_by_key(|(m, _)| *m);
                v
            },
        )
    }

    proptest! {
        #[test]
        fn sessions_partition_the_events(input in valued_events(), threshold in 1i64..300) {
            let events: Vec<_> = input.iter().map(|&(m, v)| event("P", m, v)).collect();
            let output = aggregate(sessionize(&events, gap(threshold)), 1);

            let total: u64 = output.sessions.iter().map(|s| s.event_count).sum();
            prop_assert_eq!(total, events.len() as u64);

            for (i, session) in output.sessions.iter().enumerate() {
                prop_assert_eq!(session.session_index, i as u64);
                prop_assert!(session.event_count >= 1);
                prop_assert!(session.start_ts <= session.end_ts);
            }
            for pair in output.sessions.windows(2) {
                prop_assert!(pair[1].start_ts - pair[0].end_ts > TimeDelta::minutes(threshold));
            }
        }

        #[test]
        fn aggregation_is_idempotent(input in valued_events(), threshold in 1i64..300) {
            let events: Vec<_> = input.iter().map(|&(m, v)| event("P", m, v)).collect();
            let tagged = sessionize(&events, gap(threshold));

            let first = aggregate(tagged.clone(), 1);
            let second = aggregate(tagged, 1);

            prop_assert_eq!(first.sessions.len(), second.sessions.len());
            for (a, b) in first.sessions.iter().zip(&second.sessions) {
                prop_assert_eq!(a.value_sum.map(f64::to_bits), b.value_sum.map(f64::to_bits));
                prop_assert_eq!(a.value_avg.map(f64::to_bits), b.value_avg.map(f64::to_bits));
                prop_assert_eq!(a, b);
            }
        }
    }
}
