//! Monitor-and-respond: the short-cadence loop. No optimize, learn or decide.

use std::collections::BTreeSet;
use std::sync::Arc;

use autopilot_core::{
    new_monitor_id, now_utc, ActionId, AlertSeverity, ControllerConfig, Deadline, MonitorResponse,
    PhaseName, WindowDays,
};

use crate::cycle::{analyze, AlertMode};
use crate::dispatch::{
    dispatch, BudgetLedger, DispatchScope, Invocation, Journal, SETTLE_GRACE,
};
use crate::{ControllerError, Shared};

pub(crate) async fn respond(
    shared: &Shared,
    config: Arc<ControllerConfig>,
) -> Result<MonitorResponse, ControllerError> {
    let observed_at = now_utc();
    let monitor_id = new_monitor_id(observed_at)?;

    let analyze_config = Arc::clone(&config);
    let analyze_deadline = Deadline::after(config.phase_deadline(PhaseName::Analyze));
    let analysis = shared
        .blocking("monitor analyze", move |shared| {
            analyze(
                shared,
                &analyze_config,
                WindowDays::WEEK,
                AlertMode::RecordAndNotify,
                &analyze_deadline,
            )
        })
        .await?;

    let critical_alerts: Vec<_> = analysis
        .alerts
        .iter()
        .filter(|alert| alert.severity == AlertSeverity::Critical)
        .cloned()
        .collect();
    let liveness = analysis.snapshot.signals.liveness.clone();

    let mut triggers: Vec<String> = critical_alerts
        .iter()
        .map(|alert| format!("critical_alert:{}", alert.kpi))
        .collect();
    if let Some(report) = &liveness {
        triggers.extend(
            report
                .failed_checks()
                .into_iter()
                .map(|check| format!("liveness:{check}")),
        );
    }
    let degraded = !triggers.is_empty();

    let mut outcomes = Vec::new();
    if degraded {
        tracing::warn!(
            monitor_id = %monitor_id,
            triggers = ?triggers,
            "monitor degraded; running fast path"
        );
        let heal_budget = config.phase_deadline(PhaseName::Heal);
        let scope = DispatchScope {
            shared: shared.clone(),
            config: Arc::clone(&config),
            owner_id: monitor_id.clone(),
            dry_run: false,
            confirmations: Arc::new(BTreeSet::new()),
            allowed: Some(Arc::new(ActionId::fast_path_set().into_iter().collect())),
            ledger: Arc::new(BudgetLedger::new(&config)),
            deadline: Deadline::after(heal_budget),
            journal: Journal::default(),
        };
        let invocations: Vec<Invocation> = analysis
            .issues
            .iter()
            .filter_map(Invocation::from_issue)
            .collect();
        outcomes = match tokio::time::timeout(heal_budget, dispatch(&scope, invocations)).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                scope.deadline.cancel();
                tracing::warn!(monitor_id = %monitor_id, "fast path timed out");
                if !scope.journal.settle(SETTLE_GRACE).await {
                    tracing::warn!(
                        monitor_id = %monitor_id,
                        "fast path actions still running after grace period"
                    );
                }
                scope.journal.snapshot()
            }
        };
        persist_outcomes(shared, &monitor_id, &outcomes).await?;
    }

    Ok(MonitorResponse {
        monitor_id,
        observed_at,
        degraded,
        triggers,
        critical_alerts,
        liveness,
        outcomes,
    })
}

async fn persist_outcomes(
    shared: &Shared,
    monitor_id: &str,
    outcomes: &[autopilot_core::ActionOutcome],
) -> Result<(), ControllerError> {
    if outcomes.is_empty() {
        return Ok(());
    }
    let mut last_error = None;
    for attempt in 1..=2_u8 {
        let owned = outcomes.to_vec();
        let written = shared
            .blocking("persist monitor outcomes", move |shared| {
                shared.store.lock().insert_action_outcomes(&owned)
            })
            .await;
        match written {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(
                    monitor_id,
                    attempt,
                    error = %err,
                    "monitor outcome persistence failed"
                );
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        ControllerError::Persistence("monitor outcomes were not written".to_string())
    }))
}
