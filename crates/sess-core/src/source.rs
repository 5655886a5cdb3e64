//! JSONL event source.
//!
//! One JSON object per line: `{"entity_id", "timestamp", "value",
//! "attributes"}`. Records are grouped into one partition per entity, in
//! order of first appearance, each partition keeping arrival order.

use std::collections::HashMap;
use std::io::BufRead;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EntityEvents;
use crate::event::RawEvent;
use crate::types::EntityId;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read line {line}: {source}")]
    Io {
        line: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Input records that did not make it into a partition, plus the total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    /// Lines decoded as JSON objects.
    pub records_read: u64,
    /// Lines that were not valid JSON records. Skipped.
    pub malformed_lines: u64,
    /// Records with no entity id and no preceding entity. Skipped.
    pub unattributed_records: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub partitions: Vec<EntityEvents>,
    pub stats: SourceStats,
}

impl SourceBatch {
    pub fn event_count(&self) -> usize {
        self.partitions.iter().map(|p| p.events.len()).sum()
    }
}

/// Reads JSONL records and groups them by entity.
///
/// Blank lines are ignored. A record without a usable entity id is
/// attributed to the entity of the record before it, so that entity fails
/// validation instead of the record vanishing. With no preceding entity it
/// is counted in [`SourceStats::unattributed_records`].
pub fn read_events<R: BufRead>(reader: R) -> Result<SourceBatch, SourceError> {
    let mut partitions: Vec<EntityEvents> = Vec::new();
    let mut positions: HashMap<EntityId, usize> = HashMap::new();
    let mut stats = SourceStats::default();
    let mut current: Option<usize> = None;

    for (number, line) in reader.lines().enumerate() {
        let line_no = number + 1;
        let line = line.map_err(|source| SourceError::Io {
            line: line_no,
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let raw: RawEvent = match serde_json::from_str(trimmed) {
            Ok(raw) => raw,
            Err(e) => {
                stats.malformed_lines += 1;
                tracing::warn!(line = line_no, error = %e, "skipping malformed line");
                continue;
            }
        };
        stats.records_read += 1;

        let slot = if let Some(entity_id) = raw.entity_id() {
            Some(*positions.entry(entity_id.clone()).or_insert_with(|| {
                partitions.push(EntityEvents::new(entity_id, Vec::new()));
                partitions.len() - 1
            }))
        } else if let Some(slot) = current {
            tracing::warn!(
                line = line_no,
                entity_id = %partitions[slot].entity_id,
                "record without entity id attributed to preceding entity"
            );
            Some(slot)
        } else {
            stats.unattributed_records += 1;
            tracing::warn!(line = line_no, "skipping record without entity id");
            None
        };

        if let Some(slot) = slot {
            partitions[slot].events.push(raw);
        }
        current = slot;
    }

    tracing::debug!(
        entities = partitions.len(),
        records = stats.records_read,
        malformed = stats.malformed_lines,
        "read event source"
    );
    Ok(SourceBatch { partitions, stats })
}
