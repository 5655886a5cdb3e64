//! Streaming sessionization over unbounded input.
//!
//! Each entity is a keyed partition holding at most two accumulators: the
//! open session and the most recently closed one (kept so a late event can
//! be merged back). Sessions close on a gap, when the watermark passes the
//! idle timeout, on eviction, or on flush.
//!
//! An event is *late* when it would belong to a session that has already
//! been closed. That includes an event falling in the quiet interval
//! between the last closed session and the open one, out of reach of both:
//! it would need a session of its own, ordered before one whose index was
//! already handed out. What happens next is `late_event_policy`: `drop`
//! counts and discards it, `merge` folds it into the last closed session,
//! `error` fails the entity's partition. A late event that does not fall
//! within one gap of the last closed session cannot be merged and is
//! counted as unmergeable.
//!
//! A merge into a session that was already emitted yields a
//! [`StreamEmit::Corrected`] record. A merge that lifts a session dropped by
//! `min_events_per_session` over the minimum emits it for the first time as
//! [`StreamEmit::Closed`] with its original close reason.
//!
//! Once a partition has no open session and its last event is more than
//! `partition_retention` behind the watermark, it is discarded. This also
//! releases failed partitions, so an entity that failed can start over.
//!
//! Entities are pinned to shards with jump consistent hashing, so one
//! entity's events are always handled by the same [`StreamProcessor`].

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{Session, SessionAccumulator};
use crate::config::{AdmissionPolicy, LateEventPolicy, SessionConfig, StreamingConfig};
use crate::error::{EntityError, FailedEntity, LateEventError, ValidationError};
use crate::event::SessionEvent;
use crate::types::{EntityId, GapThreshold};

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// An event arrived more than one gap after the session's last event.
    Gap,
    /// The watermark passed the idle timeout.
    Idle,
    /// Closed early to make room for another entity.
    Evicted,
    /// Closed by an explicit flush.
    Flush,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gap => "gap",
            Self::Idle => "idle",
            Self::Evicted => "evicted",
            Self::Flush => "flush",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record emitted downstream by the streaming processor.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEmit {
    Closed { session: Session, reason: CloseReason },
    /// Replaces an earlier record with the same entity and session index.
    Corrected(Session),
}

impl StreamEmit {
    pub const fn session(&self) -> &Session {
        match self {
            Self::Closed { session, .. } | Self::Corrected(session) => session,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The open-session bound is reached under [`AdmissionPolicy::Reject`].
    /// Retry after the watermark has closed some sessions.
    #[error("open session limit of {limit} reached; entity {entity_id} not admitted")]
    Backpressure { entity_id: EntityId, limit: usize },

    #[error(transparent)]
    LateEvent(#[from] LateEventError),

    #[error("entity {entity_id}: partition has failed, event rejected")]
    PartitionFailed { entity_id: EntityId },
}

/// Counters for everything the processor did not emit as a plain close.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub events_accepted: u64,
    pub late_events: u64,
    /// Late events with no closed session to merge into.
    pub unmergeable_late_events: u64,
    pub sessions_closed: u64,
    pub dropped_sessions: u64,
    /// Merges into a session that had already been emitted.
    pub corrections: u64,
    pub evictions: u64,
    /// Partitions discarded after `partition_retention`.
    pub partitions_expired: u64,
    pub rejected_admissions: u64,
    /// Events addressed to a failed partition.
    pub rejected_events: u64,
    pub entities_failed: Vec<FailedEntity>,
}

impl StreamStats {
    fn merge(&mut self, other: &Self) {
        self.events_accepted += other.events_accepted;
        self.late_events += other.late_events;
        self.unmergeable_late_events += other.unmergeable_late_events;
        self.sessions_closed += other.sessions_closed;
        self.dropped_sessions += other.dropped_sessions;
        self.corrections += other.corrections;
        self.evictions += other.evictions;
        self.partitions_expired += other.partitions_expired;
        self.rejected_admissions += other.rejected_admissions;
        self.rejected_events += other.rejected_events;
        self.entities_failed
            .extend(other.entities_failed.iter().cloned());
    }
}

#[derive(Debug)]
struct ClosedSession {
    acc: SessionAccumulator,
    reason: CloseReason,
    /// False when the minimum-size filter dropped it.
    emitted: bool,
}

#[derive(Debug, Default)]
struct Partition {
    next_index: u64,
    open: Option<SessionAccumulator>,
    last_closed: Option<ClosedSession>,
    last_activity: u64,
    /// Latest timestamp of any event accepted into this partition.
    last_event_at: Option<DateTime<Utc>>,
    failed: bool,
}

impl Partition {
    fn record_event(&mut self, ts: DateTime<Utc>) {
        self.last_event_at = self.last_event_at.max(Some(ts));
    }

    fn is_expired(&self, watermark: DateTime<Utc>, retention: TimeDelta) -> bool {
        self.open.is_none() && self.last_event_at.is_none_or(|last| watermark - last > retention)
    }
}

/// Where an incoming event lands relative to its partition's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Extend,
    Split,
    Open,
    Late,
}

fn place(partition: Option<&Partition>, ts: DateTime<Utc>, gap: GapThreshold) -> Placement {
    let Some(partition) = partition else {
        return Placement::Open;
    };

    match (&partition.open, &partition.last_closed) {
        (Some(open), closed) => {
            if ts >= open.start_ts() {
                if gap.is_exceeded_by(ts - open.end_ts()) {
                    Placement::Split
                } else {
                    Placement::Extend
                }
            } else if !gap.is_exceeded_by(open.start_ts() - ts)
                && closed
                    .as_ref()
                    .is_none_or(|c| gap.is_exceeded_by(ts - c.acc.end_ts()))
            {
                Placement::Extend
            } else {
                Placement::Late
            }
        }
        (None, Some(closed)) => {
            if gap.is_exceeded_by(ts - closed.acc.end_ts()) {
                Placement::Open
            } else {
                Placement::Late
            }
        }
        (None, None) => Placement::Open,
    }
}

/// Emits a closed session unless it is below the minimum size. Returns
/// whether it was emitted.
fn emit_closed(
    stats: &mut StreamStats,
    config: &SessionConfig,
    acc: &SessionAccumulator,
    reason: CloseReason,
    out: &mut Vec<StreamEmit>,
) -> bool {
    let session = acc.to_session();
    if config.keeps(session.event_count) {
        stats.sessions_closed += 1;
        out.push(StreamEmit::Closed { session, reason });
        true
    } else {
        stats.dropped_sessions += 1;
        tracing::debug!(
            entity_id = %session.entity_id,
            session_index = session.session_index,
            event_count = session.event_count,
            "dropping session below minimum size"
        );
        false
    }
}

/// Streaming sessionizer for one shard.
#[derive(Debug)]
pub struct StreamProcessor {
    config: StreamingConfig,
    partitions: HashMap<EntityId, Partition>,
    open_sessions: usize,
    clock: u64,
    watermark: Option<DateTime<Utc>>,
    stats: StreamStats,
}

impl StreamProcessor {
    pub fn new(config: StreamingConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self {
            config,
            partitions: HashMap::new(),
            open_sessions: 0,
            clock: 0,
            watermark: None,
            stats: StreamStats::default(),
        })
    }

    pub const fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Sessions currently held in memory.
    pub const fn open_sessions(&self) -> usize {
        self.open_sessions
    }

    pub const fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub const fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Entities with state held in memory, open session or not.
    pub fn retained_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Feeds one event. Returns the records it caused to be emitted.
    pub fn push<E: SessionEvent>(&mut self, event: &E) -> Result<Vec<StreamEmit>, StreamError> {
        let entity_id = event.entity_id();
        if self.partitions.get(entity_id).is_some_and(|p| p.failed) {
            self.stats.rejected_events += 1;
            return Err(StreamError::PartitionFailed {
                entity_id: entity_id.clone(),
            });
        }

        let gap = self.config.session.gap_threshold;
        let mut emitted = Vec::new();
        match place(self.partitions.get(entity_id), event.timestamp(), gap) {
            Placement::Extend => {
                self.clock += 1;
                if let Some(partition) = self.partitions.get_mut(entity_id) {
                    if let Some(open) = partition.open.as_mut() {
                        open.push(event);
                    }
                    partition.last_activity = self.clock;
                }
            }
            Placement::Split => {
                self.close_open(entity_id, CloseReason::Gap, &mut emitted);
                self.open_session(event);
            }
            Placement::Open => {
                self.admit(entity_id, &mut emitted)?;
                self.open_session(event);
            }
            Placement::Late => return self.handle_late(event),
        }

        if let Some(partition) = self.partitions.get_mut(entity_id) {
            partition.record_event(event.timestamp());
        }
        self.stats.events_accepted += 1;
        Ok(emitted)
    }

    /// Closes every open session idle for longer than the idle timeout as of
    /// `watermark`, then discards partitions past their retention. A
    /// watermark that does not advance is ignored.
    pub fn advance_watermark(&mut self, watermark: DateTime<Utc>) -> Vec<StreamEmit> {
        if self.watermark.is_some_and(|w| watermark <= w) {
            return Vec::new();
        }
        self.watermark = Some(watermark);

        let idle = self.config.idle_timeout;
        let mut expired: Vec<EntityId> = self
            .partitions
            .iter()
            .filter(|(_, p)| {
                p.open
                    .as_ref()
                    .is_some_and(|open| watermark - open.end_ts() > idle)
            })
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        let mut emitted = Vec::new();
        for entity_id in &expired {
            self.close_open(entity_id, CloseReason::Idle, &mut emitted);
        }

        let retention = self.config.partition_retention;
        let before = self.partitions.len();
        self.partitions.retain(|_, p| !p.is_expired(watermark, retention));
        let discarded = before - self.partitions.len();
        if discarded > 0 {
            self.stats.partitions_expired += discarded as u64;
            tracing::debug!(discarded, retained = self.partitions.len(), "expired idle partitions");
        }
        emitted
    }

    /// Closes every open session.
    pub fn flush(&mut self) -> Vec<StreamEmit> {
        let mut open: Vec<EntityId> = self
            .partitions
            .iter()
            .filter(|(_, p)| p.open.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        open.sort();

        let mut emitted = Vec::new();
        for entity_id in &open {
            self.close_open(entity_id, CloseReason::Flush, &mut emitted);
        }
        emitted
    }

    fn open_session<E: SessionEvent>(&mut self, event: &E) {
        self.clock += 1;
        let partition = self.partitions.entry(event.entity_id().clone()).or_default();
        let index = partition.next_index;
        partition.next_index += 1;
        partition.open = Some(SessionAccumulator::open(event, index));
        partition.last_activity = self.clock;
        self.open_sessions += 1;
    }

    fn close_open(&mut self, entity_id: &EntityId, reason: CloseReason, out: &mut Vec<StreamEmit>) {
        let Some(partition) = self.partitions.get_mut(entity_id) else {
            return;
        };
        let Some(acc) = partition.open.take() else {
            return;
        };
        self.open_sessions -= 1;
        let emitted = emit_closed(&mut self.stats, &self.config.session, &acc, reason, out);
        partition.last_closed = Some(ClosedSession {
            acc,
            reason,
            emitted,
        });
    }

    /// Makes room for one more open session, or refuses.
    fn admit(&mut self, entity_id: &EntityId, out: &mut Vec<StreamEmit>) -> Result<(), StreamError> {
        if self.open_sessions < self.config.max_open_sessions {
            return Ok(());
        }

        match self.config.admission {
            AdmissionPolicy::Reject => {
                self.stats.rejected_admissions += 1;
                tracing::debug!(%entity_id, limit = self.config.max_open_sessions, "admission rejected");
                Err(StreamError::Backpressure {
                    entity_id: entity_id.clone(),
                    limit: self.config.max_open_sessions,
                })
            }
            AdmissionPolicy::EvictLeastRecent => {
                let victim = self
                    .partitions
                    .iter()
                    .filter(|(_, p)| p.open.is_some())
                    .min_by_key(|(_, p)| p.last_activity)
                    .map(|(id, _)| id.clone());
                if let Some(victim) = victim {
                    tracing::debug!(entity_id = %victim, "evicting least recently active session");
                    self.stats.evictions += 1;
                    self.close_open(&victim, CloseReason::Evicted, out);
                }
                Ok(())
            }
        }
    }

    fn handle_late<E: SessionEvent>(&mut self, event: &E) -> Result<Vec<StreamEmit>, StreamError> {
        let entity_id = event.entity_id();
        let ts = event.timestamp();
        let gap = self.config.session.gap_threshold;
        self.stats.late_events += 1;

        let Some(partition) = self.partitions.get_mut(entity_id) else {
            return Ok(Vec::new());
        };

        match self.config.session.late_event_policy {
            LateEventPolicy::Drop => {
                tracing::debug!(%entity_id, timestamp = %ts, "dropping late event");
                Ok(Vec::new())
            }
            LateEventPolicy::Error => {
                let error = LateEventError {
                    entity_id: entity_id.clone(),
                    timestamp: ts,
                    last_event_at: partition.last_event_at.unwrap_or(ts),
                };
                partition.failed = true;
                if partition.open.take().is_some() {
                    self.open_sessions -= 1;
                }
                tracing::warn!(%entity_id, error = %error, "partition failed on late event");
                self.stats.entities_failed.push(FailedEntity::new(
                    entity_id.clone(),
                    &EntityError::from(error.clone()),
                ));
                Err(error.into())
            }
            LateEventPolicy::Merge => match partition.last_closed.as_mut() {
                Some(closed)
                    if !gap.is_exceeded_by(closed.acc.start_ts() - ts)
                        && !gap.is_exceeded_by(ts - closed.acc.end_ts()) =>
                {
                    closed.acc.push(event);
                    partition.last_event_at = partition.last_event_at.max(Some(ts));
                    self.stats.events_accepted += 1;
                    let session = closed.acc.to_session();
                    tracing::debug!(
                        %entity_id,
                        session_index = session.session_index,
                        "late event merged into closed session"
                    );
                    if closed.emitted {
                        self.stats.corrections += 1;
                        Ok(vec![StreamEmit::Corrected(session)])
                    } else if self.config.session.keeps(session.event_count) {
                        closed.emitted = true;
                        self.stats.dropped_sessions -= 1;
                        self.stats.sessions_closed += 1;
                        Ok(vec![StreamEmit::Closed {
                            session,
                            reason: closed.reason,
                        }])
                    } else {
                        Ok(Vec::new())
                    }
                }
                _ => {
                    self.stats.unmergeable_late_events += 1;
                    tracing::warn!(%entity_id, timestamp = %ts, "late event has no session to merge into");
                    Ok(Vec::new())
                }
            },
        }
    }
}

/// Maps entities onto a fixed number of shards.
///
/// Uses jump consistent hashing over a stable FNV-1a hash of the entity ID,
/// so growing from `n` to `n + 1` shards only moves entities onto the new
/// shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shards: u32,
}

impl ShardRouter {
    pub fn new(shards: u32) -> Result<Self, ValidationError> {
        if shards == 0 {
            return Err(ValidationError::Zero { field: "shards" });
        }
        Ok(Self { shards })
    }

    pub const fn shards(&self) -> u32 {
        self.shards
    }

    pub fn shard_for(&self, entity_id: &EntityId) -> u32 {
        jump_hash(fnv1a(entity_id.as_str().as_bytes()), self.shards)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Lamping and Veach, "A Fast, Minimal Memory, Consistent Hash Algorithm".
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    reason = "values are bounded by the bucket count"
)]
fn jump_hash(mut key: u64, buckets: u32) -> u32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < i64::from(buckets) {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as u32
}

/// One [`StreamProcessor`] per shard, with events routed by entity.
///
/// `max_open_sessions` applies to each shard separately.
#[derive(Debug)]
pub struct ShardedStream {
    router: ShardRouter,
    shards: Vec<StreamProcessor>,
}

impl ShardedStream {
    pub fn new(config: &StreamingConfig, shards: u32) -> Result<Self, ValidationError> {
        let router = ShardRouter::new(shards)?;
        let shards = (0..shards)
            .map(|_| StreamProcessor::new(config.clone()))
            .collect::<Result<_, _>>()?;
        Ok(Self { router, shards })
    }

    pub const fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn shard(&self, index: u32) -> Option<&StreamProcessor> {
        self.shards.get(index as usize)
    }

    pub fn push<E: SessionEvent>(&mut self, event: &E) -> Result<Vec<StreamEmit>, StreamError> {
        let index = self.router.shard_for(event.entity_id()) as usize;
        self.shards[index].push(event)
    }

    pub fn advance_watermark(&mut self, watermark: DateTime<Utc>) -> Vec<StreamEmit> {
        self.shards
            .iter_mut()
            .flat_map(|shard| shard.advance_watermark(watermark))
            .collect()
    }

    pub fn flush(&mut self) -> Vec<StreamEmit> {
        self.shards.iter_mut().flat_map(StreamProcessor::flush).collect()
    }

    pub fn open_sessions(&self) -> usize {
        self.shards.iter().map(StreamProcessor::open_sessions).sum()
    }

    pub fn retained_partitions(&self) -> usize {
        self.shards.iter().map(StreamProcessor::retained_partitions).sum()
    }

    /// Counters summed over all shards.
    pub fn stats(&self) -> StreamStats {
        let mut total = StreamStats::default();
        for shard in &self.shards {
            total.merge(shard.stats());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::event::Event;
    use chrono::{TimeDelta, TimeZone};

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap() + TimeDelta::minutes(minutes)
    }

    fn event(entity: &str, minutes: i64) -> Event {
        Event::new(EntityId::new(entity).unwrap(), ts(minutes))
    }

    fn config(policy: LateEventPolicy) -> StreamingConfig {
        let session = SessionConfig::with_gap(TimeDelta::minutes(30))
            .unwrap()
            .with_late_event_policy(policy);
        StreamingConfig::new(session, TimeDelta::minutes(60)).unwrap()
    }

    fn processor(policy: LateEventPolicy) -> StreamProcessor {
        StreamProcessor::new(config(policy)).unwrap()
    }

    fn push_all(p: &mut StreamProcessor, entity: &str, minutes: &[i64]) -> Vec<StreamEmit> {
        minutes
            .iter()
            .flat_map(|&m| p.push(&event(entity, m)).unwrap())
            .collect()
    }

    fn closed(emit: &StreamEmit) -> (&Session, CloseReason) {
        match emit {
            StreamEmit::Closed { session, reason } => (session, *reason),
            StreamEmit::Corrected(_) => panic!("expected a closed session, got {emit:?}"),
        }
    }

    #[test]
    fn test_gap_closes_session() {
        let mut p = processor(LateEventPolicy::Error);
        let emitted = push_all(&mut p, "A", &[0, 5, 40, 45]);

        assert_eq!(emitted.len(), 1);
        let (session, reason) = closed(&emitted[0]);
        assert_eq!(reason, CloseReason::Gap);
        assert_eq!(session.session_index, 0);
        assert_eq!((session.start_ts, session.end_ts), (ts(0), ts(5)));
        assert_eq!(p.open_sessions(), 1);

        let flushed = p.flush();
        let (session, reason) = closed(&flushed[0]);
        assert_eq!(reason, CloseReason::Flush);
        assert_eq!(session.session_index, 1);
        assert_eq!(session.event_count, 2);
        assert_eq!(p.open_sessions(), 0);
    }

    #[test]
    fn test_gap_equal_to_threshold_does_not_close() {
        let mut p = processor(LateEventPolicy::Error);
        assert!(push_all(&mut p, "C", &[0, 30]).is_empty());
        assert_eq!(p.flush().len(), 1);
    }

    #[test]
    fn test_watermark_closes_idle_sessions() {
        let mut p = processor(LateEventPolicy::Error);
        push_all(&mut p, "A", &[0, 5]);
        push_all(&mut p, "B", &[50]);

        // A idle for 60 minutes exactly: not yet past the timeout.
        assert!(p.advance_watermark(ts(65)).is_empty());

        let emitted = p.advance_watermark(ts(66));
        assert_eq!(emitted.len(), 1);
        let (session, reason) = closed(&emitted[0]);
        assert_eq!(session.entity_id.as_str(), "A");
        assert_eq!(reason, CloseReason::Idle);
        assert_eq!(p.open_sessions(), 1);

        // Watermarks never move backwards.
        assert!(p.advance_watermark(ts(10)).is_empty());
        assert_eq!(p.watermark(), Some(ts(66)));
    }

    #[test]
    fn test_session_index_continues_after_idle_close() {
        let mut p = processor(LateEventPolicy::Error);
        push_all(&mut p, "A", &[0]);
        p.advance_watermark(ts(100));
        push_all(&mut p, "A", &[200]);

        let flushed = p.flush();
        let (session, _) = closed(&flushed[0]);
        assert_eq!(session.session_index, 1);
    }

    #[test]
    fn test_late_event_dropped_and_counted() {
        let mut p = processor(LateEventPolicy::Drop);
        push_all(&mut p, "A", &[0, 5, 100]);

        let emitted = p.push(&event("A", 3)).unwrap();
        assert!(emitted.is_empty());
        assert_eq!(p.stats().late_events, 1);
        assert_eq!(p.stats().events_accepted, 3);
    }

    #[test]
    fn test_late_event_merged_emits_correction() {
        let mut p = processor(LateEventPolicy::Merge);
        push_all(&mut p, "A", &[0, 5, 100]);

        let emitted = p.push(&event("A", 20)).unwrap();
        assert_eq!(emitted.len(), 1);
        let StreamEmit::Corrected(session) = &emitted[0] else {
            panic!("expected a correction, got {:?}", emitted[0]);
        };
        assert_eq!(session.session_index, 0);
        assert_eq!(session.event_count, 3);
        assert_eq!(session.end_ts, ts(20));
        assert_eq!(p.stats().corrections, 1);
        assert_eq!(p.stats().late_events, 1);
    }

    #[test]
    fn test_late_event_too_far_from_closed_session_is_unmergeable() {
        let mut p = processor(LateEventPolicy::Merge);
        push_all(&mut p, "A", &[0, 5, 200]);

        // 100 is more than one gap from both the closed session and the open one.
        assert!(p.push(&event("A", 100)).unwrap().is_empty());
        assert_eq!(p.stats().unmergeable_late_events, 1);
        assert_eq!(p.stats().corrections, 0);
    }

    #[test]
    fn test_late_event_error_fails_only_that_partition() {
        let mut p = processor(LateEventPolicy::Error);
        push_all(&mut p, "A", &[0, 100]);
        push_all(&mut p, "B", &[0]);

        let err = p.push(&event("A", 1)).unwrap_err();
        assert!(matches!(err, StreamError::LateEvent(_)));
        assert_eq!(p.stats().entities_failed.len(), 1);
        assert_eq!(
            p.stats().entities_failed[0].error_kind,
            ErrorKind::LateEventError
        );

        // A is now rejected; B carries on.
        assert!(matches!(
            p.push(&event("A", 101)),
            Err(StreamError::PartitionFailed { .. })
        ));
        assert!(p.push(&event("B", 10)).unwrap().is_empty());
        assert_eq!(p.open_sessions(), 1);
        assert_eq!(p.stats().rejected_events, 1);
    }

    #[test]
    fn test_out_of_order_within_open_session_is_not_late() {
        let mut p = processor(LateEventPolicy::Error);
        push_all(&mut p, "A", &[0, 10]);
        assert!(p.push(&event("A", 4)).unwrap().is_empty());
        assert_eq!(p.stats().late_events, 0);

        let flushed = p.flush();
        let (session, _) = closed(&flushed[0]);
        assert_eq!(session.event_count, 3);
    }

    #[test]
    fn test_event_after_idle_close_within_gap_is_late() {
        let session = SessionConfig::with_gap(TimeDelta::minutes(30))
            .unwrap()
            .with_late_event_policy(LateEventPolicy::Merge);
        let config = StreamingConfig::new(session, TimeDelta::minutes(10)).unwrap();
        let mut p = StreamProcessor::new(config).unwrap();

        push_all(&mut p, "A", &[0]);
        assert_eq!(p.advance_watermark(ts(11)).len(), 1);

        let emitted = p.push(&event("A", 20)).unwrap();
        assert!(matches!(emitted[0], StreamEmit::Corrected(_)));
        assert_eq!(p.open_sessions(), 0);
    }

    #[test]
    fn test_event_between_sessions_is_late() {
        let mut p = processor(LateEventPolicy::Drop);
        push_all(&mut p, "A", &[0, 5, 200]);

        // 100 is past session 0 and more than one gap before session 1.
        assert!(p.push(&event("A", 100)).unwrap().is_empty());
        assert_eq!(p.stats().late_events, 1);
        let flushed = p.flush();
        let (session, _) = closed(&flushed[0]);
        assert_eq!(session.session_index, 1);
        assert_eq!(session.event_count, 1);

        let mut p = processor(LateEventPolicy::Error);
        push_all(&mut p, "A", &[0, 5, 200]);
        assert!(matches!(
            p.push(&event("A", 100)),
            Err(StreamError::LateEvent(_))
        ));
    }

    #[test]
    fn test_merge_into_dropped_session_emits_it_once() {
        let session = SessionConfig::with_gap(TimeDelta::minutes(30))
            .unwrap()
            .with_min_events_per_session(2)
            .with_late_event_policy(LateEventPolicy::Merge);
        let config = StreamingConfig::new(session, TimeDelta::minutes(60)).unwrap();
        let mut p = StreamProcessor::new(config).unwrap();

        assert!(push_all(&mut p, "A", &[0, 100]).is_empty());
        assert_eq!(p.stats().dropped_sessions, 1);

        // The merge lifts session 0 to the minimum: first emission, not a correction.
        let emitted = p.push(&event("A", 3)).unwrap();
        assert_eq!(emitted.len(), 1);
        let (session, reason) = closed(&emitted[0]);
        assert_eq!(session.session_index, 0);
        assert_eq!(session.event_count, 2);
        assert_eq!(reason, CloseReason::Gap);
        assert_eq!(p.stats().dropped_sessions, 0);
        assert_eq!(p.stats().sessions_closed, 1);
        assert_eq!(p.stats().corrections, 0);

        // Now that it has been emitted, further merges are corrections.
        let emitted = p.push(&event("A", 4)).unwrap();
        assert!(matches!(&emitted[..], [StreamEmit::Corrected(s)] if s.event_count == 3));
        assert_eq!(p.stats().corrections, 1);
        assert_eq!(p.stats().sessions_closed, 1);
    }

    #[test]
    fn test_quiet_partitions_expire_after_retention() {
        let config = config(LateEventPolicy::Error).with_partition_retention(TimeDelta::minutes(120));
        let mut p = StreamProcessor::new(config).unwrap();
        for i in 0..1000 {
            push_all(&mut p, &format!("user-{i}"), &[0]);
        }
        assert_eq!(p.advance_watermark(ts(61)).len(), 1000);
        assert_eq!(p.retained_partitions(), 1000);

        push_all(&mut p, "recent", &[100]);
        p.advance_watermark(ts(200));
        assert_eq!(p.retained_partitions(), 1);
        assert_eq!(p.stats().partitions_expired, 1000);
        assert_eq!(p.open_sessions(), 0);

        p.advance_watermark(ts(300));
        assert_eq!(p.retained_partitions(), 0);
        assert_eq!(p.stats().partitions_expired, 1001);

        // A returning entity starts a new partition.
        push_all(&mut p, "user-7", &[400]);
        let flushed = p.flush();
        let (session, _) = closed(&flushed[0]);
        assert_eq!(session.session_index, 0);
    }

    #[test]
    fn test_partition_with_open_session_is_retained() {
        let config = config(LateEventPolicy::Error).with_partition_retention(TimeDelta::minutes(30));
        let mut p = StreamProcessor::new(config).unwrap();
        push_all(&mut p, "A", &[0]);

        // Past retention but not yet idle: the open session keeps it.
        assert!(p.advance_watermark(ts(45)).is_empty());
        assert_eq!(p.retained_partitions(), 1);
        assert_eq!(p.open_sessions(), 1);
    }

    #[test]
    fn test_failed_partition_expires() {
        let config = config(LateEventPolicy::Error).with_partition_retention(TimeDelta::minutes(120));
        let mut p = StreamProcessor::new(config).unwrap();
        push_all(&mut p, "A", &[0, 100]);
        assert!(p.push(&event("A", 1)).is_err());

        p.advance_watermark(ts(150));
        assert!(matches!(
            p.push(&event("A", 150)),
            Err(StreamError::PartitionFailed { .. })
        ));

        p.advance_watermark(ts(221));
        assert_eq!(p.retained_partitions(), 0);
        assert!(p.push(&event("A", 230)).unwrap().is_empty());
        assert_eq!(p.open_sessions(), 1);
    }

    #[test]
    fn test_backpressure_rejects_new_entities() {
        let config = config(LateEventPolicy::Error).with_max_open_sessions(2);
        let mut p = StreamProcessor::new(config).unwrap();
        push_all(&mut p, "A", &[0]);
        push_all(&mut p, "B", &[0]);

        let err = p.push(&event("C", 1)).unwrap_err();
        assert!(matches!(err, StreamError::Backpressure { limit: 2, .. }));
        assert_eq!(p.stats().rejected_admissions, 1);

        // Existing entities are still accepted.
        assert!(p.push(&event("A", 2)).is_ok());

        // Once a session closes, C gets in.
        p.advance_watermark(ts(200));
        assert!(p.push(&event("C", 201)).is_ok());
    }

    #[test]
    fn test_eviction_closes_least_recent_session() {
        let config = config(LateEventPolicy::Error)
            .with_max_open_sessions(2)
            .with_admission(AdmissionPolicy::EvictLeastRecent);
        let mut p = StreamProcessor::new(config).unwrap();
        push_all(&mut p, "A", &[0]);
        push_all(&mut p, "B", &[0]);
        push_all(&mut p, "A", &[1]);

        let emitted = p.push(&event("C", 2)).unwrap();
        assert_eq!(emitted.len(), 1);
        let (session, reason) = closed(&emitted[0]);
        assert_eq!(session.entity_id.as_str(), "B");
        assert_eq!(reason, CloseReason::Evicted);
        assert_eq!(p.open_sessions(), 2);
        assert_eq!(p.stats().evictions, 1);
    }

    #[test]
    fn test_min_events_filter_counts_dropped() {
        let session = SessionConfig::with_gap(TimeDelta::minutes(30))
            .unwrap()
            .with_min_events_per_session(2);
        let config = StreamingConfig::new(session, TimeDelta::minutes(60)).unwrap();
        let mut p = StreamProcessor::new(config).unwrap();

        let emitted = push_all(&mut p, "A", &[0, 100, 105]);
        assert!(emitted.is_empty());
        assert_eq!(p.stats().dropped_sessions, 1);
        assert_eq!(p.flush().len(), 1);
    }

    #[test]
    fn test_router_is_stable_and_in_range() {
        let router = ShardRouter::new(8).unwrap();
        for i in 0..500 {
            let id = EntityId::new(format!("customer-{i}")).unwrap();
            let shard = router.shard_for(&id);
            assert!(shard < 8);
            assert_eq!(shard, router.shard_for(&id));
        }
        assert!(ShardRouter::new(0).is_err());
    }

    #[test]
    fn test_router_growth_only_moves_to_new_shard() {
        for n in 1..16 {
            let before = ShardRouter::new(n).unwrap();
            let after = ShardRouter::new(n + 1).unwrap();
            for i in 0..200 {
                let id = EntityId::new(format!("user-{i}")).unwrap();
                let (old, new) = (before.shard_for(&id), after.shard_for(&id));
                assert!(new == old || new == n, "entity moved from {old} to {new}");
            }
        }
    }

    #[test]
    fn test_sharded_stream_pins_entities() {
        let mut stream = ShardedStream::new(&config(LateEventPolicy::Error), 4).unwrap();
        for entity in ["A", "B", "C", "D", "E"] {
            for m in [0, 5, 50] {
                stream.push(&event(entity, m)).unwrap();
            }
        }

        let stats = stream.stats();
        assert_eq!(stats.events_accepted, 15);
        assert_eq!(stats.sessions_closed, 5);
        assert_eq!(stream.open_sessions(), 5);

        let shard = stream.router().shard_for(&EntityId::new("A").unwrap());
        assert!(stream.shard(shard).unwrap().open_sessions() >= 1);

        let flushed = stream.flush();
        assert_eq!(flushed.len(), 5);
        assert!(flushed.iter().all(|e| e.session().session_index == 1));
    }
}
