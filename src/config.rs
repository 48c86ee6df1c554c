//! Runtime configuration.
//!
//! Settings are layered: built-in defaults, then an optional
//! `legion.toml` in the working directory, then `LEGION_*` environment
//! variables. All tuning knobs of the orchestration core live here so
//! operational policy (queue caps, scheduler cadence, missed-window
//! handling) is visible configuration rather than buried constants.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{LegionError, Result};

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LegionConfig {
    /// Root data directory for all persisted state.
    pub data_dir: PathBuf,
    /// Maximum pending items per session queue.
    pub max_queue_size: usize,
    /// Per-project cap on concurrent minions.
    pub max_concurrent_minions: usize,
    /// Seconds between scheduler evaluations.
    pub scheduler_tick_secs: u64,
    /// Milliseconds between queue delivery polls.
    pub delivery_poll_ms: u64,
    /// Seconds to wait for an auto-started recipient to become active.
    pub auto_start_timeout_secs: u64,
    /// When true, each active schedule whose window was missed while the
    /// server was down fires once immediately on startup. When false
    /// (cron semantics), missed windows are skipped and the next run is
    /// computed from now.
    pub scheduler_catch_up: bool,
}

impl Default for LegionConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            max_queue_size: 100,
            max_concurrent_minions: 20,
            scheduler_tick_secs: 30,
            delivery_poll_ms: 500,
            auto_start_timeout_secs: 30,
            scheduler_catch_up: false,
        }
    }
}

impl LegionConfig {
    /// Load configuration from defaults, `legion.toml` (optional), and
    /// `LEGION_*` environment variables.
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("legion").required(false))
            .add_source(config::Environment::with_prefix("LEGION"));

        let settings = builder.build().map_err(|e| LegionError::Configuration {
            message: "failed to assemble configuration sources".to_string(),
            source: Some(Box::new(e)),
        })?;

        settings
            .try_deserialize()
            .map_err(|e| LegionError::Configuration {
                message: "failed to deserialize configuration".to_string(),
                source: Some(Box::new(e)),
            })
    }

    /// Load with an explicit data directory override (CLI flag).
    pub fn load_with_data_dir(data_dir: Option<PathBuf>) -> Result<Self> {
        let mut cfg = Self::load()?;
        if let Some(dir) = data_dir {
            cfg.data_dir = dir;
        }
        Ok(cfg)
    }
}
