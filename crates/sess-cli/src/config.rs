//! Configuration loading and management.

use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use sess_core::{EngineConfig, LateEventPolicy, SessionConfig};

use crate::cli::RunArgs;
use crate::util::parse_duration;

/// Application configuration.
///
/// Durations are kept as written (`"30m"`) and parsed by
/// [`Config::to_engine_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Inactivity gap that ends a session.
    pub gap_threshold: String,

    /// Streaming only; batch input never produces late events.
    pub late_event_policy: LateEventPolicy,

    pub min_events_per_session: u32,

    pub strict_order_check: bool,

    /// Worker threads. Unset means one per core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Per-entity processing limit. Unset disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_timeout: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gap_threshold: "30m".to_string(),
            late_event_policy: LateEventPolicy::Error,
            min_events_per_session: 1,
            strict_order_check: true,
            workers: None,
            entity_timeout: None,
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (SESS_*)
        figment = figment.merge(Env::prefixed("SESS_"));

        figment.extract()
    }

    /// Applies command-line overrides.
    #[must_use]
    pub fn with_run_args(mut self, args: &RunArgs) -> Self {
        if let Some(gap) = &args.gap {
            self.gap_threshold.clone_from(gap);
        }
        if let Some(min) = args.min_events {
            self.min_events_per_session = min;
        }
        if args.no_strict_order {
            self.strict_order_check = false;
        }
        if let Some(workers) = args.workers {
            self.workers = Some(workers);
        }
        if let Some(timeout) = &args.timeout {
            self.entity_timeout = Some(timeout.clone());
        }
        self
    }

    /// Parses and validates the configuration for the batch engine.
    pub fn to_engine_config(&self) -> anyhow::Result<EngineConfig> {
        let gap = parse_duration(&self.gap_threshold).context("invalid gap_threshold")?;
        let session = SessionConfig::with_gap(gap)
            .context("invalid gap_threshold")?
            .with_late_event_policy(self.late_event_policy)
            .with_min_events_per_session(self.min_events_per_session)
            .with_strict_order_check(self.strict_order_check);

        let mut engine = EngineConfig::new(session);
        if let Some(workers) = self.workers {
            engine = engine.with_workers(workers);
        }
        if let Some(timeout) = &self.entity_timeout {
            let timeout = parse_duration(timeout)
                .context("invalid entity_timeout")?
                .to_std()
                .context("entity_timeout must not be negative")?;
            engine = engine.with_entity_timeout(timeout);
        }

        engine.validate()?;
        Ok(engine)
    }
}

/// Returns the platform-specific config directory for sess.
///
/// On Linux: `~/.config/sess`
pub fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sess"))
}
