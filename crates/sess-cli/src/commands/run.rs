//! Run command: read events, sessionize, write one session per line.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::Serialize;

use sess_core::{
    CancellationToken, EngineConfig, RunId, RunSummary, SourceStats, read_events, run_batch,
};

use crate::Config;
use crate::cli::RunArgs;

/// Everything reported about a run once its sessions are written.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub source: SourceStats,
    #[serde(flatten)]
    pub summary: RunSummary,
}

/// Opens the event input. `None` or `-` reads stdin; `.gz` files are
/// decompressed.
pub fn open_input(path: Option<&Path>) -> Result<Box<dyn BufRead>> {
    let Some(path) = path.filter(|p| p.as_os_str() != "-") else {
        return Ok(Box::new(io::stdin().lock()));
    };

    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Reads all events from `reader`, runs the batch engine, and writes each
/// kept session to `sink` as one JSON object per line.
///
/// Entity-scoped failures are reported in the summary; only invalid
/// configuration, invalid input ordering, and I/O failures return an error.
pub fn execute<R: BufRead, W: Write>(
    reader: R,
    sink: &mut W,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let batch = read_events(reader).context("failed to read events")?;
    tracing::debug!(
        entities = batch.partitions.len(),
        events = batch.event_count(),
        "loaded events"
    );

    let output = run_batch(batch.partitions, config, cancel)?;

    for session in &output.sessions {
        serde_json::to_writer(&mut *sink, session).context("failed to write session")?;
        writeln!(sink).context("failed to write session")?;
    }
    sink.flush().context("failed to flush output")?;

    Ok(RunReport {
        run_id: output.run_id,
        source: batch.stats,
        summary: output.summary,
    })
}

/// Formats the run summary for humans.
pub fn format_summary(report: &RunReport) -> String {
    let summary = &report.summary;
    let source = &report.source;
    let mut output = String::new();

    writeln!(output, "SESSION RUN").unwrap();
    writeln!(output, "───────────").unwrap();
    writeln!(
        output,
        "Entities:  {} processed, {} failed, {} cancelled",
        summary.entities_processed,
        summary.entities_failed.len(),
        summary.entities_cancelled.len()
    )
    .unwrap();
    writeln!(output, "Events:    {} processed", summary.events_processed).unwrap();
    writeln!(output, "Sessions:  {} emitted", summary.sessions_emitted).unwrap();
    writeln!(
        output,
        "Dropped:   {} sessions ({} events)",
        summary.dropped_sessions, summary.events_in_dropped_sessions
    )
    .unwrap();
    writeln!(
        output,
        "Input:     {} records, {} malformed, {} unattributed",
        source.records_read, source.malformed_lines, source.unattributed_records
    )
    .unwrap();

    if !summary.entities_failed.is_empty() {
        writeln!(output).unwrap();
        writeln!(output, "FAILED").unwrap();
        writeln!(output, "──────").unwrap();
        for failed in &summary.entities_failed {
            writeln!(
                output,
                "  {}: {}: {}",
                failed.entity_id, failed.error_kind, failed.message
            )
            .unwrap();
        }
    }

    if summary.was_cancelled() {
        writeln!(output).unwrap();
        writeln!(output, "CANCELLED").unwrap();
        writeln!(output, "─────────").unwrap();
        for entity_id in &summary.entities_cancelled {
            writeln!(output, "  {entity_id}").unwrap();
        }
    }

    output
}

/// Ctrl+C stops entities that have not started yet. Sessions of entities
/// already being scanned are still written.
fn setup_ctrlc_handler(cancel: CancellationToken) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::info!("received Ctrl+C, cancelling remaining entities");
        cancel.cancel();
    })
    .context("failed to set Ctrl+C handler")
}

pub fn run(args: &RunArgs, config: Config) -> Result<()> {
    let engine = config
        .with_run_args(args)
        .to_engine_config()
        .context("invalid configuration")?;
    let cancel = CancellationToken::new();
    setup_ctrlc_handler(cancel.clone())?;
    let reader = open_input(args.input.as_deref())?;

    let report = if let Some(path) = &args.output {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut sink = BufWriter::new(file);
        execute(reader, &mut sink, &engine, &cancel)?
    } else {
        let mut sink = BufWriter::new(io::stdout().lock());
        execute(reader, &mut sink, &engine, &cancel)?
    };

    tracing::info!(
        run_id = %report.run_id,
        sessions = report.summary.sessions_emitted,
        failed = report.summary.entities_failed.len(),
        "run complete"
    );

    let mut stderr = io::stderr().lock();
    if args.json {
        serde_json::to_writer_pretty(&mut stderr, &report)?;
        writeln!(stderr)?;
    } else {
        write!(stderr, "{}", format_summary(&report))?;
    }
    Ok(())
}
