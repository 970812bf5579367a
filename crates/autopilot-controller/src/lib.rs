//! Async control loop over the operational store.
//!
//! [`Controller`] owns the store connection and the current configuration.
//! Cycles and monitor runs are serialized per controller; every store and
//! collaborator call runs on the blocking pool under a phase deadline.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use autopilot_core::{
    kpi_status, ActionId, AlignmentScore, ControllerConfig, CycleReport, CycleSummaryRow, Deadline,
    KpiName, KpiStatus, MonitorResponse, OpsError, PhaseName, PriorityAction, WindowDays,
};
use autopilot_store_sqlite::SqliteOpsStore;
use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;

pub mod collaborators;
mod cycle;
mod dispatch;
mod handlers;
mod monitor;

pub use collaborators::{
    AlertNotifier, CacheProbe, Collaborators, NoCacheProbe, NoopPaymentGateway, PaymentGateway,
    TracingAlertNotifier,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ControllerError {
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("store degraded: {0}")]
    StoreDegraded(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<OpsError> for ControllerError {
    fn from(err: OpsError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl ControllerError {
    fn classify(err: &anyhow::Error) -> Self {
        if err.downcast_ref::<OpsError>().is_some() {
            Self::Validation(format!("{err:#}"))
        } else {
            Self::Persistence(format!("{err:#}"))
        }
    }
}

/// Store handle plus collaborators, cloned into every blocking task.
#[derive(Debug, Clone)]
pub(crate) struct Shared {
    pub(crate) store: Arc<Mutex<SqliteOpsStore>>,
    pub(crate) collaborators: Collaborators,
}

impl Shared {
    pub(crate) async fn blocking<T, F>(
        &self,
        label: &'static str,
        op: F,
    ) -> Result<T, ControllerError>
    where
        T: Send + 'static,
        F: FnOnce(&Shared) -> anyhow::Result<T> + Send + 'static,
    {
        let shared = self.clone();
        let handle = tokio::task::spawn_blocking(move || op(&shared));
        let joined = handle
            .await
            .map_err(|err| ControllerError::Join(format!("{label} join failure: {err}")))?;
        joined.map_err(|err| ControllerError::classify(&err))
    }
}

#[derive(Debug)]
pub struct Controller {
    shared: Shared,
    config: RwLock<Arc<ControllerConfig>>,
    /// Holds the last completed report so overlapping triggers can reuse it.
    cycle_gate: tokio::sync::Mutex<Option<CycleReport>>,
    monitor_gate: tokio::sync::Mutex<()>,
    degraded: AtomicBool,
}

impl Controller {
    /// # Errors
    /// Returns [`ControllerError::Validation`] when the configuration is
    /// out of bounds.
    pub fn new(store: SqliteOpsStore, config: ControllerConfig) -> Result<Self, ControllerError> {
        config.validate()?;
        Ok(Self {
            shared: Shared {
                store: Arc::new(Mutex::new(store)),
                collaborators: Collaborators::default(),
            },
            config: RwLock::new(Arc::new(config)),
            cycle_gate: tokio::sync::Mutex::new(None),
            monitor_gate: tokio::sync::Mutex::new(()),
            degraded: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn with_payment_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.shared.collaborators.payments = gateway;
        self
    }

    #[must_use]
    pub fn with_alert_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.shared.collaborators.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_cache_probe(mut self, probe: Arc<dyn CacheProbe>) -> Self {
        self.shared.collaborators.cache = probe;
        self
    }

    #[must_use]
    pub fn config(&self) -> Arc<ControllerConfig> {
        Arc::clone(&self.config.read())
    }

    /// Swaps the configuration used by the next cycle. A running cycle keeps
    /// the copy it started with.
    ///
    /// # Errors
    /// Returns [`ControllerError::Validation`] and keeps the current
    /// configuration when the new one is out of bounds.
    pub fn reload_config(&self, config: ControllerConfig) -> Result<(), ControllerError> {
        config.validate()?;
        *self.config.write() = Arc::new(config);
        tracing::info!("controller configuration reloaded");
        Ok(())
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Runs one full cycle and persists its report.
    ///
    /// A trigger that arrives while another cycle is running waits for it
    /// and returns that cycle's report instead of starting a second one.
    ///
    /// # Errors
    /// Returns [`ControllerError::StoreDegraded`] while the store has not
    /// recovered from an earlier persistence failure, and
    /// [`ControllerError::Persistence`] when the report cannot be written
    /// after one retry.
    pub async fn run_cycle(
        &self,
        dry_run: bool,
        confirmations: BTreeSet<ActionId>,
    ) -> Result<CycleReport, ControllerError> {
        let requested_at = autopilot_core::now_utc();
        let mut gate = if let Ok(gate) = self.cycle_gate.try_lock() {
            gate
        } else {
            let gate = self.cycle_gate.lock().await;
            if let Some(last) = gate.as_ref().filter(|last| last.ended_at >= requested_at) {
                tracing::info!(cycle_id = %last.cycle_id, "overlapping cycle trigger coalesced");
                return Ok(last.clone());
            }
            gate
        };

        self.ensure_store_ready().await?;
        let report = cycle::run(&self.shared, self.config(), dry_run, confirmations).await?;
        self.persist_report(&report).await?;
        *gate = Some(report.clone());
        Ok(report)
    }

    /// Short-cadence check: critical alerts and liveness over the last
    /// seven days, with fast-path remediation when either trips.
    ///
    /// # Errors
    /// Returns [`ControllerError::Persistence`] when the outcomes of an
    /// executed response cannot be recorded after one retry.
    pub async fn monitor_and_respond(&self) -> Result<MonitorResponse, ControllerError> {
        let _guard = self.monitor_gate.lock().await;
        monitor::respond(&self.shared, self.config()).await
    }

    /// # Errors
    /// Returns an error when the analysis task fails.
    pub async fn get_alignment(
        &self,
        window: WindowDays,
    ) -> Result<AlignmentScore, ControllerError> {
        Ok(self.read_analysis(window).await?.alignment)
    }

    /// # Errors
    /// Returns an error when the analysis task fails.
    pub async fn get_kpi_status(
        &self,
        window: WindowDays,
    ) -> Result<BTreeMap<KpiName, KpiStatus>, ControllerError> {
        let config = self.config();
        let analysis = self.read_analysis(window).await?;
        Ok(kpi_status(
            &analysis.snapshot,
            &analysis.alignment,
            &analysis.alerts,
            &config,
        ))
    }

    /// # Errors
    /// Returns an error when the analysis task fails.
    pub async fn get_priority_actions(
        &self,
        window: WindowDays,
    ) -> Result<Vec<PriorityAction>, ControllerError> {
        Ok(self.read_analysis(window).await?.priorities)
    }

    /// # Errors
    /// Returns [`ControllerError::Persistence`] when the listing query fails.
    pub async fn list_cycle_reports(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<CycleSummaryRow>, ControllerError> {
        self.shared
            .blocking("list cycle reports", move |shared| {
                shared.store.lock().list_cycle_summaries(since)
            })
            .await
    }

    /// # Errors
    /// Returns [`ControllerError::Persistence`] when the lookup fails.
    pub async fn get_cycle_report(
        &self,
        cycle_id: &str,
    ) -> Result<Option<CycleReport>, ControllerError> {
        let cycle_id = cycle_id.to_string();
        self.shared
            .blocking("get cycle report", move |shared| {
                shared.store.lock().get_cycle_report(&cycle_id)
            })
            .await
    }

    async fn read_analysis(&self, window: WindowDays) -> Result<cycle::Analysis, ControllerError> {
        let config = self.config();
        let deadline = Deadline::after(config.phase_deadline(PhaseName::Analyze));
        self.shared
            .blocking("read analysis", move |shared| {
                cycle::analyze(shared, &config, window, cycle::AlertMode::Ignore, &deadline)
            })
            .await
    }

    async fn ensure_store_ready(&self) -> Result<(), ControllerError> {
        if !self.is_degraded() {
            return Ok(());
        }
        let ping = self
            .shared
            .blocking("store ping", |shared| shared.store.lock().ping())
            .await;
        match ping {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                tracing::info!("store recovered; cycles resumed");
                Ok(())
            }
            Err(err) => Err(ControllerError::StoreDegraded(err.to_string())),
        }
    }

    async fn persist_report(&self, report: &CycleReport) -> Result<(), ControllerError> {
        let mut last_error = String::new();
        for attempt in 1..=2_u8 {
            let owned = report.clone();
            let written = self
                .shared
                .blocking("persist cycle report", move |shared| {
                    shared.store.lock().insert_cycle_report(&owned)
                })
                .await;
            match written {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        cycle_id = %report.cycle_id,
                        attempt,
                        error = %err,
                        "cycle report persistence failed"
                    );
                    last_error = err.to_string();
                }
            }
        }

        self.degraded.store(true, Ordering::SeqCst);
        tracing::error!(
            cycle_id = %report.cycle_id,
            "store marked degraded; cycles refused until it answers a ping"
        );
        Err(ControllerError::Persistence(last_error))
    }
}
