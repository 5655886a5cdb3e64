//! Check-config command: print the configuration a run would use.

use std::io::Write;

use anyhow::{Context, Result};

use crate::Config;
use crate::config::dirs_config_path;

pub fn run<W: Write>(writer: &mut W, config: &Config) -> Result<()> {
    let engine = config.to_engine_config()?;

    if let Some(dir) = dirs_config_path() {
        writeln!(writer, "Config file: {}", dir.join("config.toml").display())?;
    }
    writeln!(writer, "Workers:     {}", engine.worker_count())?;
    writeln!(
        writer,
        "{}",
        serde_json::to_string_pretty(config).context("failed to serialize configuration")?
    )?;
    Ok(())
}
