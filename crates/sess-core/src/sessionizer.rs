//! Session boundary assignment.
//!
//! A single forward scan over one entity's events, carrying only the last
//! timestamp seen and the current session index:
//!
//! 1. The first event opens session 0.
//! 2. Each later event starts a new session when the gap to the previous
//!    event is strictly greater than the threshold.
//! 3. A gap exactly equal to the threshold stays in the same session.

use std::iter::FusedIterator;

use chrono::{DateTime, Utc};

use crate::error::ValidationError;
use crate::event::SessionEvent;
use crate::types::GapThreshold;

/// An event tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionizedEvent<E> {
    pub event: E,
    /// 0-based, increasing per entity in chronological order.
    pub session_index: u64,
}

#[derive(Debug, Clone, Copy)]
struct ScanState {
    last_ts: DateTime<Utc>,
    session_index: u64,
}

/// Lazy, forward-only session assignment over one entity's events.
///
/// Created by [`assign_sessions`]. Retains no events; traversing again
/// means re-reading the source.
#[derive(Debug)]
pub struct Sessionized<I> {
    events: I,
    gap_threshold: GapThreshold,
    strict_order_check: bool,
    position: usize,
    state: Option<ScanState>,
    failed: bool,
}

/// Assigns a session index to each event of one entity.
///
/// Events must be sorted ascending by timestamp. With the order check
/// enabled (the default), the first descending timestamp yields
/// [`ValidationError::OutOfOrder`] and the iterator ends.
pub fn assign_sessions<I>(events: I, gap_threshold: GapThreshold) -> Sessionized<I::IntoIter>
where
    I: IntoIterator,
    I::Item: SessionEvent,
{
    Sessionized {
        events: events.into_iter(),
        gap_threshold,
        strict_order_check: true,
        position: 0,
        state: None,
        failed: false,
    }
}

impl<I> Sessionized<I> {
    /// Enables or disables the O(n) order check.
    ///
    /// With the check disabled, the input is assumed sorted; a descending
    /// timestamp produces a negative gap and never opens a session.
    #[must_use]
    pub const fn strict_order_check(mut self, enabled: bool) -> Self {
        self.strict_order_check = enabled;
        self
    }

    /// Number of events consumed so far.
    pub const fn position(&self) -> usize {
        self.position
    }
}

impl<I> Iterator for Sessionized<I>
where
    I: Iterator,
    I::Item: SessionEvent,
{
    type Item = Result<SessionizedEvent<I::Item>, ValidationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let event = self.events.next()?;
        let index = self.position;
        self.position += 1;
        let ts = event.timestamp();

        let session_index = match self.state.as_mut() {
            None => {
                self.state = Some(ScanState {
                    last_ts: ts,
                    session_index: 0,
                });
                0
            }
            Some(state) => {
                if self.strict_order_check && ts < state.last_ts {
                    self.failed = true;
                    return Some(Err(ValidationError::OutOfOrder {
                        entity_id: event.entity_id().clone(),
                        index,
                        previous: state.last_ts,
                        current: ts,
                    }));
                }
                if self.gap_threshold.is_exceeded_by(ts - state.last_ts) {
                    state.session_index += 1;
                }
                state.last_ts = ts;
                state.session_index
            }
        };

        Some(Ok(SessionizedEvent {
            event,
            session_index,
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            (0, Some(0))
        } else {
            // An order violation can end the scan early.
            (0, self.events.size_hint().1)
        }
    }
}

impl<I> FusedIterator for Sessionized<I>
where
    I: FusedIterator,
    I::Item: SessionEvent,
{
}

/// Checks that `events` are sorted ascending by timestamp.
pub fn verify_order<E: SessionEvent>(events: &[E]) -> Result<(), ValidationError> {
    for (index, pair) in events.windows(2).enumerate() {
        let (previous, current) = (pair[0].timestamp(), pair[1].timestamp());
        if current < previous {
            return Err(ValidationError::OutOfOrder {
                entity_id: pair[1].entity_id().clone(),
                index: index + 1,
                previous,
                current,
            });
        }
    }
    Ok(())
}

/// Number of sessions a sorted timestamp sequence splits into.
///
/// `1 + count(consecutive gaps > threshold)`, or 0 for no timestamps.
pub fn count_sessions<I>(timestamps: I, gap_threshold: GapThreshold) -> u64
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    let mut timestamps = timestamps.into_iter();
    let Some(mut last) = timestamps.next() else {
        return 0;
    };

    let mut sessions = 1;
    for ts in timestamps {
        if gap_threshold.is_exceeded_by(ts - last) {
            sessions += 1;
        }
        last = ts;
    }
    sessions
}
