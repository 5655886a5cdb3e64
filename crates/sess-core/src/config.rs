//! Run configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::GapThreshold;

/// What to do with an event whose session has already been closed.
///
/// Only meaningful for the streaming processor; batch input is fully
/// ordered and finite, so it never produces late events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LateEventPolicy {
    /// Discard the event and count it.
    Drop,
    /// Reopen the closed session and emit a corrected record.
    Merge,
    /// Fail the entity's partition.
    #[default]
    Error,
}

impl LateEventPolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Merge => "merge",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LateEventPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LateEventPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(Self::Drop),
            "merge" => Ok(Self::Merge),
            "error" => Ok(Self::Error),
            _ => Err(ValidationError::InvalidLateEventPolicy {
                value: s.to_string(),
            }),
        }
    }
}

/// Immutable configuration for one sessionization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Inactivity window defining a session boundary.
    pub gap_threshold: GapThreshold,

    /// Streaming only. Default: `error`.
    pub late_event_policy: LateEventPolicy,

    /// Sessions with fewer events are dropped from output and reported.
    /// 0 and 1 both keep every session. Default: 1.
    pub min_events_per_session: u32,

    /// Verify that each entity's events are sorted before scanning.
    /// Default: true.
    pub strict_order_check: bool,
}

impl SessionConfig {
    pub const fn new(gap_threshold: GapThreshold) -> Self {
        Self {
            gap_threshold,
            late_event_policy: LateEventPolicy::Error,
            min_events_per_session: 1,
            strict_order_check: true,
        }
    }

    /// Shorthand for `SessionConfig::new(GapThreshold::new(delta)?)`.
    pub fn with_gap(delta: TimeDelta) -> Result<Self, ValidationError> {
        GapThreshold::new(delta).map(Self::new)
    }

    #[must_use]
    pub const fn with_late_event_policy(mut self, policy: LateEventPolicy) -> Self {
        self.late_event_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_min_events_per_session(mut self, min: u32) -> Self {
        self.min_events_per_session = min;
        self
    }

    #[must_use]
    pub const fn with_strict_order_check(mut self, enabled: bool) -> Self {
        self.strict_order_check = enabled;
        self
    }

    /// Returns true if a session with `event_count` events is kept.
    #[must_use]
    pub fn keeps(&self, event_count: u64) -> bool {
        event_count >= u64::from(self.min_events_per_session)
    }
}

/// Configuration for the batch engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub session: SessionConfig,

    /// Worker threads. `None` uses one per available core.
    pub workers: Option<usize>,

    /// Per-entity processing limit. `None` disables the check.
    pub entity_timeout: Option<Duration>,
}

impl EngineConfig {
    pub const fn new(session: SessionConfig) -> Self {
        Self {
            session,
            workers: None,
            entity_timeout: None,
        }
    }

    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    #[must_use]
    pub const fn with_entity_timeout(mut self, timeout: Duration) -> Self {
        self.entity_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workers == Some(0) {
            return Err(ValidationError::Zero { field: "workers" });
        }
        if self.entity_timeout == Some(Duration::ZERO) {
            return Err(ValidationError::Zero {
                field: "entity timeout",
            });
        }
        Ok(())
    }

    /// Number of worker threads the engine will start.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
        })
    }
}

/// What the streaming processor does when the open-session bound is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Refuse the new entity; the caller blocks and retries later.
    #[default]
    Reject,
    /// Close the least recently active open session early.
    EvictLeastRecent,
}

impl AdmissionPolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::EvictLeastRecent => "evict_least_recent",
        }
    }
}

impl std::fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AdmissionPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "evict_least_recent" => Ok(Self::EvictLeastRecent),
            _ => Err(ValidationError::InvalidAdmissionPolicy {
                value: s.to_string(),
            }),
        }
    }
}

/// Configuration for the streaming processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingConfig {
    pub session: SessionConfig,

    /// An open session with no events for longer than this, measured
    /// against the watermark, is closed.
    pub idle_timeout: TimeDelta,

    /// Upper bound on open sessions held in memory. Default: 10,000.
    pub max_open_sessions: usize,

    pub admission: AdmissionPolicy,

    /// How long an entity's state is kept after its last event once it has
    /// no open session, measured against the watermark. An entity that
    /// returns after its state expired starts over at session index 0.
    /// Must be at least the gap threshold. Default: 24 hours.
    pub partition_retention: TimeDelta,
}

impl StreamingConfig {
    pub fn new(session: SessionConfig, idle_timeout: TimeDelta) -> Result<Self, ValidationError> {
        let config = Self {
            session,
            idle_timeout,
            max_open_sessions: 10_000,
            admission: AdmissionPolicy::Reject,
            partition_retention: TimeDelta::hours(24),
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub const fn with_max_open_sessions(mut self, max: usize) -> Self {
        self.max_open_sessions = max;
        self
    }

    #[must_use]
    pub const fn with_admission(mut self, admission: AdmissionPolicy) -> Self {
        self.admission = admission;
        self
    }

    #[must_use]
    pub const fn with_partition_retention(mut self, retention: TimeDelta) -> Self {
        self.partition_retention = retention;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.idle_timeout <= TimeDelta::zero() {
            return Err(ValidationError::NonPositiveIdleTimeout {
                value_ms: self.idle_timeout.num_milliseconds(),
            });
        }
        if self.max_open_sessions == 0 {
            return Err(ValidationError::Zero {
                field: "max open sessions",
            });
        }
        let gap = self.session.gap_threshold.as_delta();
        if self.partition_retention < gap {
            return Err(ValidationError::RetentionBelowGap {
                retention_ms: self.partition_retention.num_milliseconds(),
                gap_ms: gap.num_milliseconds(),
            });
        }
        Ok(())
    }
}
