//! Layered process settings: serde defaults, then an optional TOML/JSON
//! file, then `AUTOPILOT_*` environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use autopilot_core::ControllerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub controller: ControllerConfig,
    pub daemon: DaemonSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonSettings {
    /// Long cadence: one full cycle per interval.
    pub cycle_interval_secs: u64,
    /// Short cadence: one monitor-and-respond pass per interval.
    pub monitor_interval_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 3_600,
            monitor_interval_secs: 300,
        }
    }
}

impl DaemonSettings {
    #[must_use]
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }

    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }
}

impl Settings {
    /// Loads and validates settings.
    ///
    /// Defaults come from the serde field defaults rather than a seeded
    /// source: the `config` crate merges arrays index by index, which would
    /// splice a file's `kpi_targets` into the default list.
    ///
    /// # Errors
    /// Returns an error when the file cannot be parsed, an environment
    /// override has the wrong type, or the controller section fails
    /// validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("AUTOPILOT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Self = builder
            .build()
            .context("failed to assemble configuration sources")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        settings
            .controller
            .validate()
            .context("invalid controller configuration")?;
        Ok(settings)
    }
}
