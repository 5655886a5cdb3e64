//! Error taxonomy.
//!
//! Only [`ValidationError`] aborts a run. Everything else is scoped to one
//! entity and ends up as a [`FailedEntity`] in the run summary.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EntityId;

/// Configuration or input-order violations. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    #[error("gap threshold must be strictly positive, got {value_ms} ms")]
    NonPositiveGap { value_ms: i64 },

    #[error("idle timeout must be strictly positive, got {value_ms} ms")]
    NonPositiveIdleTimeout { value_ms: i64 },

    #[error("{field} must be at least 1")]
    Zero { field: &'static str },

    #[error("entity {entity_id} has no events")]
    EmptyStream { entity_id: EntityId },

    /// An entity's events are not sorted ascending by timestamp.
    #[error("entity {entity_id}: event {index} at {current} precedes previous event at {previous}")]
    OutOfOrder {
        entity_id: EntityId,
        index: usize,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("entity {entity_id} appears in more than one partition")]
    DuplicatePartition { entity_id: EntityId },

    #[error("invalid late event policy: {value}")]
    InvalidLateEventPolicy { value: String },

    #[error("invalid admission policy: {value}")]
    InvalidAdmissionPolicy { value: String },

    #[error("partition retention of {retention_ms} ms is shorter than the gap threshold of {gap_ms} ms")]
    RetentionBelowGap { retention_ms: i64, gap_ms: i64 },
}

/// A malformed event. Fails only the entity that owns it.
///
/// `index` is the event's position within its entity's input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("event {index}: missing entity id")]
    MissingEntityId { index: usize },

    #[error("event {index}: belongs to entity {found}, expected {expected}")]
    EntityMismatch {
        index: usize,
        expected: EntityId,
        found: EntityId,
    },

    #[error("event {index}: missing timestamp")]
    MissingTimestamp { index: usize },

    #[error("event {index}: invalid timestamp {value}")]
    InvalidTimestamp { index: usize, value: String },

    #[error("event {index}: value is not a number: {value}")]
    InvalidValue { index: usize, value: String },

    #[error("event {index}: value is not finite")]
    NonFiniteValue { index: usize },
}

/// An event arrived for a session that was already closed and emitted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("entity {entity_id}: late event at {timestamp} (last event at {last_event_at})")]
pub struct LateEventError {
    pub entity_id: EntityId,
    pub timestamp: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
}

/// An entity's scan ran past its allotted time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("entity {entity_id}: processing exceeded {limit:?} (elapsed {elapsed:?})")]
pub struct TimeoutError {
    pub entity_id: EntityId,
    pub limit: Duration,
    pub elapsed: Duration,
}

/// Any failure isolated to a single entity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    LateEvent(#[from] LateEventError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

impl EntityError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Data(_) => ErrorKind::DataError,
            Self::LateEvent(_) => ErrorKind::LateEventError,
            Self::Timeout(_) => ErrorKind::TimeoutError,
        }
    }
}

/// Category of an entity-scoped failure, as reported in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DataError,
    LateEventError,
    TimeoutError,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DataError => "data_error",
            Self::LateEventError => "late_event_error",
            Self::TimeoutError => "timeout_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity excluded from output because its partition failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntity {
    pub entity_id: EntityId,
    pub error_kind: ErrorKind,
    pub message: String,
}

impl FailedEntity {
    pub fn new(entity_id: EntityId, error: &EntityError) -> Self {
        Self {
            entity_id,
            error_kind: error.kind(),
            message: error.to_string(),
        }
    }
}
