//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Sessionize timestamped event streams.
///
/// Groups each entity's events into sessions separated by inactivity gaps
/// and writes one summary record per session.
#[derive(Debug, Parser)]
#[command(name = "sess", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sessionize a JSONL event file and write sessions as JSONL.
    Run(RunArgs),

    /// Print the resolved configuration.
    CheckConfig,
}

/// Arguments for `sess run`. Flags override the configuration file.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// JSONL input (`.gz` is decompressed). Reads stdin when omitted or `-`.
    pub input: Option<PathBuf>,

    /// Inactivity gap that ends a session (e.g., 30m, 90s, 2h).
    #[arg(long)]
    pub gap: Option<String>,

    /// Drop sessions with fewer events.
    #[arg(long)]
    pub min_events: Option<u32>,

    /// Skip the timestamp order check.
    #[arg(long)]
    pub no_strict_order: bool,

    /// Number of worker threads (default: one per core).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Per-entity processing limit (e.g., 5s).
    #[arg(long)]
    pub timeout: Option<String>,

    /// Write sessions to this file instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the run summary as JSON.
    #[arg(long)]
    pub json: bool,
}
