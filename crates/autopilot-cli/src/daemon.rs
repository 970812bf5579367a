//! Long-running scheduler: full cycles on the long cadence, monitor passes
//! on the short one, until SIGINT or SIGTERM.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use autopilot_controller::Controller;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::settings::{DaemonSettings, Settings};

#[derive(Debug)]
pub struct Daemon {
    controller: Arc<Controller>,
    config_path: Option<PathBuf>,
    intervals: DaemonSettings,
    max_cycles: Option<u64>,
}

impl Daemon {
    #[must_use]
    pub fn new(
        controller: Arc<Controller>,
        config_path: Option<PathBuf>,
        intervals: DaemonSettings,
    ) -> Self {
        Self {
            controller,
            config_path,
            intervals,
            max_cycles: None,
        }
    }

    /// Stops after `limit` scheduled cycles have been started.
    #[must_use]
    pub fn with_max_cycles(mut self, limit: Option<u64>) -> Self {
        self.max_cycles = limit;
        self
    }

    /// Scheduled cycle and monitor failures are logged and the loop keeps
    /// going; only a shutdown signal or the cycle limit ends it.
    pub async fn run(self) {
        let mut cycles = tokio::time::interval(self.intervals.cycle_interval());
        cycles.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut monitors = tokio::time::interval(self.intervals.monitor_interval());
        monitors.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            cycle_interval_secs = self.intervals.cycle_interval().as_secs(),
            monitor_interval_secs = self.intervals.monitor_interval().as_secs(),
            "daemon started"
        );

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut in_flight = JoinSet::new();
        let mut started_cycles = 0_u64;

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = cycles.tick() => {
                    started_cycles += 1;
                    self.reload_settings();
                    let controller = Arc::clone(&self.controller);
                    in_flight.spawn(async move {
                        match controller.run_cycle(false, BTreeSet::new()).await {
                            Ok(report) => tracing::info!(
                                cycle_id = %report.cycle_id,
                                issues_found = report.summary.issues_found,
                                issues_healed = report.summary.issues_healed,
                                "scheduled cycle finished"
                            ),
                            Err(err) => tracing::error!(error = %err, "scheduled cycle failed"),
                        }
                    });
                    if self.max_cycles.is_some_and(|limit| started_cycles >= limit) {
                        break;
                    }
                }
                _ = monitors.tick() => {
                    let controller = Arc::clone(&self.controller);
                    in_flight.spawn(async move {
                        match controller.monitor_and_respond().await {
                            Ok(response) if response.degraded => tracing::warn!(
                                monitor_id = %response.monitor_id,
                                triggers = ?response.triggers,
                                "monitor responded to degradation"
                            ),
                            Ok(response) => tracing::debug!(
                                monitor_id = %response.monitor_id,
                                "monitor pass healthy"
                            ),
                            Err(err) => tracing::error!(error = %err, "monitor pass failed"),
                        }
                    });
                }
                Some(joined) = in_flight.join_next() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "daemon task aborted");
                    }
                }
            }
        }

        tracing::info!(pending = in_flight.len(), "daemon stopping; draining in-flight work");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "daemon task aborted");
            }
        }
    }

    /// Re-reads the configuration file before a cycle. A broken file keeps
    /// the previous configuration in force.
    fn reload_settings(&self) {
        let settings = match Settings::load(self.config_path.as_deref()) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(
                    error = %format!("{err:#}"),
                    "configuration reload failed; keeping previous"
                );
                return;
            }
        };
        if let Err(err) = self.controller.reload_config(settings.controller) {
            tracing::warn!(error = %err, "configuration rejected; keeping previous");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received terminate signal, shutting down"),
    }
}
