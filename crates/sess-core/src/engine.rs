//! Batch engine: fan out entity partitions over a worker pool, fan the
//! sessions back in.
//!
//! # Run phases
//!
//! 1. Validate the configuration and every partition. Empty partitions,
//!    duplicate entities, and (with `strict_order_check`) unsorted
//!    timestamps abort the run before any entity is scanned.
//! 2. Scan each partition on the pool. Data errors and timeouts fail only
//!    their own entity.
//! 3. Collect results in input order into a [`RunOutput`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{AggregateOutput, DroppedSession, Session, sessions};
use crate::config::EngineConfig;
use crate::error::{DataError, EntityError, FailedEntity, TimeoutError, ValidationError};
use crate::event::{Event, RawEvent};
use crate::sessionizer::{assign_sessions, verify_order};
use crate::types::{EntityId, RunId};

/// How many events are scanned between two timeout checks.
const TIMEOUT_CHECK_INTERVAL: usize = 1024;

/// All input events for one entity, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEvents {
    pub entity_id: EntityId,
    pub events: Vec<RawEvent>,
}

impl EntityEvents {
    pub const fn new(entity_id: EntityId, events: Vec<RawEvent>) -> Self {
        Self { entity_id, events }
    }
}

/// Cooperative cancellation flag shared between the caller and the workers.
///
/// Checked before each entity starts. An entity already being scanned
/// always completes, so a session is never emitted truncated.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Hooks called from the workers as entities are scanned.
///
/// Only entities that actually start scanning are reported; cancelled ones
/// are not.
pub trait RunObserver: Sync {
    fn entity_started(&self, _entity_id: &EntityId) {}

    fn entity_finished(&self, _entity_id: &EntityId) {}
}

impl RunObserver for () {}

/// Run-level accounting. Every failed, cancelled, or dropped unit shows up
/// here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Entities scanned to completion.
    pub entities_processed: u64,
    pub entities_failed: Vec<FailedEntity>,
    pub entities_cancelled: Vec<EntityId>,
    /// Events in successfully processed entities.
    pub events_processed: u64,
    pub sessions_emitted: u64,
    pub dropped_sessions: u64,
    /// Events still accounted for although their session was dropped.
    pub events_in_dropped_sessions: u64,
    /// Always 0 in batch mode; kept so batch and streaming summaries match.
    pub late_events: u64,
}

impl RunSummary {
    pub fn was_cancelled(&self) -> bool {
        !self.entities_cancelled.is_empty()
    }
}

/// Everything a batch run produces.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run_id: RunId,
    pub sessions: Vec<Session>,
    pub dropped: Vec<DroppedSession>,
    pub summary: RunSummary,
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A partition after decoding, ready to scan.
enum Prepared {
    Ready {
        entity_id: EntityId,
        events: Vec<Event>,
        /// Time already spent decoding and order-checking.
        spent: Duration,
    },
    Failed {
        entity_id: EntityId,
        error: DataError,
    },
}

impl Prepared {
    const fn entity_id(&self) -> &EntityId {
        match self {
            Self::Ready { entity_id, .. } | Self::Failed { entity_id, .. } => entity_id,
        }
    }
}

enum EntityOutcome {
    Completed {
        events: u64,
        output: AggregateOutput,
    },
    Failed {
        entity_id: EntityId,
        error: EntityError,
    },
    Cancelled(EntityId),
}

/// Sessionizes and aggregates every partition.
///
/// Only validation problems and pool start-up failures are returned as
/// errors; entity-scoped failures are reported in
/// [`RunSummary::entities_failed`].
pub fn run_batch(
    partitions: Vec<EntityEvents>,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<RunOutput, EngineError> {
    run_batch_observed(partitions, config, cancel, &())
}

/// Like [`run_batch`], reporting each entity to `observer` as it is
/// scanned.
pub fn run_batch_observed(
    partitions: Vec<EntityEvents>,
    config: &EngineConfig,
    cancel: &CancellationToken,
    observer: &impl RunObserver,
) -> Result<RunOutput, EngineError> {
    config.validate()?;
    let run_id = RunId::new();
    let workers = config.worker_count();
    tracing::info!(%run_id, entities = partitions.len(), workers, "starting batch run");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("sess-worker-{i}"))
        .build()?;

    let prepared = pool.install(|| prepare(partitions, config))?;
    let outcomes: Vec<EntityOutcome> = pool.install(|| {
        prepared
            .into_par_iter()
            .map(|p| process(p, config, cancel, observer))
            .collect()
    });

    let output = collect(run_id, outcomes);
    tracing::info!(
        %run_id,
        processed = output.summary.entities_processed,
        failed = output.summary.entities_failed.len(),
        cancelled = output.summary.entities_cancelled.len(),
        sessions = output.summary.sessions_emitted,
        dropped = output.summary.dropped_sessions,
        "batch run finished"
    );
    Ok(output)
}

/// Decodes every partition and enforces the run-wide preconditions.
fn prepare(
    partitions: Vec<EntityEvents>,
    config: &EngineConfig,
) -> Result<Vec<Prepared>, ValidationError> {
    let mut seen = HashSet::with_capacity(partitions.len());
    for partition in &partitions {
        if partition.events.is_empty() {
            return Err(ValidationError::EmptyStream {
                entity_id: partition.entity_id.clone(),
            });
        }
        if !seen.insert(&partition.entity_id) {
            return Err(ValidationError::DuplicatePartition {
                entity_id: partition.entity_id.clone(),
            });
        }
    }

    let strict = config.session.strict_order_check;
    partitions
        .into_par_iter()
        .map(|partition| -> Result<Prepared, ValidationError> {
            let started = Instant::now();
            let mut prepared = decode(partition);
            if let Prepared::Ready { events, spent, .. } = &mut prepared {
                if strict {
                    verify_order(events.as_slice())?;
                }
                *spent = started.elapsed();
            }
            Ok(prepared)
        })
        .collect()
}

fn decode(partition: EntityEvents) -> Prepared {
    let EntityEvents { entity_id, events } = partition;
    let decoded: Result<Vec<Event>, DataError> = events
        .into_iter()
        .enumerate()
        .map(|(index, raw)| -> Result<Event, DataError> {
            let event = Event::from_raw(raw, index)?;
            if event.entity_id != entity_id {
                return Err(DataError::EntityMismatch {
                    index,
                    expected: entity_id.clone(),
                    found: event.entity_id,
                });
            }
            Ok(event)
        })
        .collect();

    match decoded {
        Ok(events) => Prepared::Ready {
            entity_id,
            events,
            spent: Duration::ZERO,
        },
        Err(error) => Prepared::Failed { entity_id, error },
    }
}

fn process(
    prepared: Prepared,
    config: &EngineConfig,
    cancel: &CancellationToken,
    observer: &impl RunObserver,
) -> EntityOutcome {
    if cancel.is_cancelled() {
        let entity_id = prepared.entity_id().clone();
        tracing::debug!(%entity_id, "entity skipped after cancellation");
        return EntityOutcome::Cancelled(entity_id);
    }

    match prepared {
        Prepared::Failed { entity_id, error } => {
            tracing::warn!(%entity_id, error = %error, "entity failed on malformed event");
            EntityOutcome::Failed {
                entity_id,
                error: error.into(),
            }
        }
        Prepared::Ready {
            entity_id,
            events,
            spent,
        } => {
            observer.entity_started(&entity_id);
            let count = events.len() as u64;
            let result = scan_entity(&entity_id, &events, spent, config);
            observer.entity_finished(&entity_id);
            match result {
                Ok(output) => EntityOutcome::Completed {
                    events: count,
                    output,
                },
                Err(error) => {
                    tracing::warn!(%entity_id, error = %error, "entity failed");
                    EntityOutcome::Failed { entity_id, error }
                }
            }
        }
    }
}

/// Sessionizes and aggregates one entity in a single forward pass.
///
/// The timeout covers `spent` (decoding and the order check) plus the scan,
/// checked before the first event, every [`TIMEOUT_CHECK_INTERVAL`] events
/// and once more at the end.
fn scan_entity(
    entity_id: &EntityId,
    events: &[Event],
    spent: Duration,
    config: &EngineConfig,
) -> Result<AggregateOutput, EntityError> {
    let started = Instant::now();
    let limit = config.entity_timeout;
    let mut deadline = Ok(());

    // Order was verified during preparation when the check is enabled; the
    // unchecked scan never yields an error.
    let scan = assign_sessions(events, config.session.gap_threshold)
        .strict_order_check(false)
        .map_while(Result::ok)
        .enumerate()
        .map_while(|(position, item)| {
            if position % TIMEOUT_CHECK_INTERVAL == 0 {
                deadline = check_deadline(entity_id, spent, started, limit);
            }
            deadline.is_ok().then_some(item)
        });

    let mut output = AggregateOutput::default();
    for session in sessions(scan) {
        output.record(session, config.session.min_events_per_session);
    }
    deadline?;
    check_deadline(entity_id, spent, started, limit)?;
    Ok(output)
}

fn check_deadline(
    entity_id: &EntityId,
    spent: Duration,
    started: Instant,
    limit: Option<Duration>,
) -> Result<(), TimeoutError> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let elapsed = spent + started.elapsed();
    if elapsed > limit {
        return Err(TimeoutError {
            entity_id: entity_id.clone(),
            limit,
            elapsed,
        });
    }
    Ok(())
}

fn collect(run_id: RunId, outcomes: Vec<EntityOutcome>) -> RunOutput {
    let mut sessions = Vec::new();
    let mut dropped = Vec::new();
    let mut summary = RunSummary::default();

    for outcome in outcomes {
        match outcome {
            EntityOutcome::Completed { events, output } => {
                summary.entities_processed += 1;
                summary.events_processed += events;
                summary.events_in_dropped_sessions += output.dropped_event_count();
                sessions.extend(output.sessions);
                dropped.extend(output.dropped);
            }
            EntityOutcome::Failed { entity_id, error } => {
                summary
                    .entities_failed
                    .push(FailedEntity::new(entity_id, &error));
            }
            EntityOutcome::Cancelled(entity_id) => summary.entities_cancelled.push(entity_id),
        }
    }

    summary.sessions_emitted = sessions.len() as u64;
    summary.dropped_sessions = dropped.len() as u64;

    RunOutput {
        run_id,
        sessions,
        dropped,
        summary,
    }
}
