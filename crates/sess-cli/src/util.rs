//! Shared utilities for CLI commands.

use std::sync::LazyLock;

use anyhow::Context;
use chrono::TimeDelta;
use regex::Regex;

/// Pre-compiled regex for duration parsing.
static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d+)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?|h|hours?|d|days?|w|weeks?)$",
    )
    .unwrap()
});

/// Parse a duration such as "30m", "90s", "2 hours" or "500ms".
pub fn parse_duration(s: &str) -> anyhow::Result<TimeDelta> {
    let s = s.trim();
    let Some(caps) = DURATION_RE.captures(s) else {
        anyhow::bail!("Invalid duration: {s}. Use a number and a unit (e.g., 30m, 90s, 2h)");
    };

    let n: i64 = caps[1]
        .parse()
        .context("failed to parse number in duration")?;

    let millis_per_unit: i64 = match &caps[2] {
        "ms" | "millisecond" | "milliseconds" => 1,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
        "h" | "hour" | "hours" => 3_600_000,
        "d" | "day" | "days" => 86_400_000,
        "w" | "week" | "weeks" => 604_800_000,
        unit => anyhow::bail!("Unknown duration unit: {unit}"),
    };

    n.checked_mul(millis_per_unit)
        .and_then(TimeDelta::try_milliseconds)
        .with_context(|| format!("Duration too large: {s}"))
}
