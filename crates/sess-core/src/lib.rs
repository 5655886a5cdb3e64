//! Core logic for sessionizing timestamped event streams.
//!
//! This crate contains:
//! - Sessionization: grouping each entity's events into sessions separated
//!   by inactivity gaps
//! - Aggregation: one summary record per session
//! - Batch engine: entity partitions fanned out over a worker pool
//! - Streaming: incremental sessionization with watermarks and late events
//! - A JSONL event source

pub mod aggregate;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod sessionizer;
pub mod source;
pub mod streaming;
pub mod types;

pub use aggregate::{
    AggregateOutput, DroppedSession, Session, SessionAccumulator, Sessions, aggregate, sessions,
};
pub use config::{AdmissionPolicy, EngineConfig, LateEventPolicy, SessionConfig, StreamingConfig};
pub use engine::{
    CancellationToken, EngineError, EntityEvents, RunObserver, RunOutput, RunSummary, run_batch,
    run_batch_observed,
};
pub use error::{
    DataError, EntityError, ErrorKind, FailedEntity, LateEventError, TimeoutError,
    ValidationError,
};
pub use event::{Event, RawEvent, SessionEvent};
pub use sessionizer::{
    SessionizedEvent, Sessionized, assign_sessions, count_sessions, verify_order,
};
pub use source::{SourceBatch, SourceError, SourceStats, read_events};
pub use streaming::{
    CloseReason, ShardRouter, ShardedStream, StreamEmit, StreamError, StreamProcessor, StreamStats,
};
pub use types::{EntityId, GapThreshold, RunId};
