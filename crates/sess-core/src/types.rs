//! Core type definitions with validation.

use std::fmt;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// A validated entity identifier.
///
/// Entity IDs must be non-empty strings. They group the events that are
/// sessionized together (e.g., a customer or a user account).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Creates a new ID after validation.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::Empty { field: "entity ID" });
        }
        Ok(Self(id))
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifies one pipeline run.
///
/// Sessions are owned by the run that produced them; the same events
/// sessionized twice produce equal sessions under two different run IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The inactivity window separating two sessions.
///
/// Always strictly positive. A gap between consecutive events that is
/// strictly greater than the threshold starts a new session; a gap equal to
/// it does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GapThreshold(TimeDelta);

impl GapThreshold {
    /// The largest representable threshold. Every entity yields one session.
    pub const MAX: Self = Self(TimeDelta::MAX);

    /// Creates a threshold after validation.
    pub fn new(delta: TimeDelta) -> Result<Self, ValidationError> {
        if delta <= TimeDelta::zero() {
            return Err(ValidationError::NonPositiveGap {
                value_ms: delta.num_milliseconds(),
            });
        }
        Ok(Self(delta))
    }

    /// Creates a threshold from milliseconds.
    pub fn from_millis(ms: i64) -> Result<Self, ValidationError> {
        // Only i64::MIN is out of range, and it is negative anyway.
        TimeDelta::try_milliseconds(ms)
            .ok_or(ValidationError::NonPositiveGap { value_ms: ms })
            .and_then(Self::new)
    }

    #[must_use]
    pub const fn as_delta(self) -> TimeDelta {
        self.0
    }

    /// Returns true if `gap` is long enough to start a new session.
    #[must_use]
    pub fn is_exceeded_by(self, gap: TimeDelta) -> bool {
        gap > self.0
    }
}

impl TryFrom<TimeDelta> for GapThreshold {
    type Error = ValidationError;

    fn try_from(value: TimeDelta) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for GapThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0.num_milliseconds())
    }
}
