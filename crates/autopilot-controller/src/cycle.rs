//! Orchestrator: one cycle is seven phases in a fixed order, each under its
//! own deadline and the cycle deadline.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use autopilot_core::{
    decide, derive_advisories, detect_issues, evaluate_alerts, find_opportunities, health_score,
    new_cycle_id, now_utc, priority_actions, score_alignment, select_top, ActionId,
    ActionOutcome, Alert, AlignmentScore, ControllerConfig, CycleReport, CycleSummary, Deadline,
    Issue, KpiName, KpiSnapshot, LearnedAdvisory, Opportunity, PhaseName, PhaseOutcome,
    PhaseStatus, PriorityAction, WindowDays,
};
use autopilot_store_sqlite::MetricParams;
use serde::Serialize;
use serde_json::{json, Value};

use crate::dispatch::{dispatch, BudgetLedger, DispatchScope, Invocation, Journal, SETTLE_GRACE};
use crate::{ControllerError, Shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlertMode {
    /// Evaluate only; read APIs never write.
    Ignore,
    Record,
    RecordAndNotify,
}

/// Output of the analyze phase. The rest of the cycle works from this one
/// snapshot.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Analysis {
    pub(crate) snapshot: KpiSnapshot,
    pub(crate) alignment: AlignmentScore,
    pub(crate) alerts: Vec<Alert>,
    pub(crate) new_alerts: usize,
    pub(crate) issues: Vec<Issue>,
    pub(crate) opportunities: Vec<Opportunity>,
    pub(crate) priorities: Vec<PriorityAction>,
    pub(crate) warnings: Vec<String>,
}

pub(crate) fn sample(
    shared: &Shared,
    config: &ControllerConfig,
    window: WindowDays,
    deadline: &Deadline,
) -> KpiSnapshot {
    let cache_status = shared.collaborators.cache.probe();
    let params = MetricParams::from_config(config, cache_status);
    shared
        .store
        .lock()
        .kpi_snapshot(window, now_utc(), &params, deadline)
}

/// Metrics, scoring, alerting and issue detection over one window.
pub(crate) fn analyze(
    shared: &Shared,
    config: &ControllerConfig,
    window: WindowDays,
    mode: AlertMode,
    deadline: &Deadline,
) -> anyhow::Result<Analysis> {
    let snapshot = sample(shared, config, window, deadline);
    let alignment = score_alignment(&snapshot, &config.kpi_targets);
    let alerts = evaluate_alerts(&snapshot, config, snapshot.window_end)?;

    let mut recorded = Vec::new();
    if mode != AlertMode::Ignore {
        let mut store = shared.store.lock();
        for alert in &alerts {
            if store.record_alert(alert)? {
                recorded.push(alert);
            }
        }
    }
    if mode == AlertMode::RecordAndNotify {
        for alert in &recorded {
            if let Err(err) = shared
                .collaborators
                .notifier
                .notify(alert, &config.alert_recipients)
            {
                tracing::warn!(
                    kpi = alert.kpi.as_str(),
                    error = %format!("{err:#}"),
                    "alert notification failed"
                );
            }
        }
    }

    let (issues, mut warnings) = detect_issues(&snapshot, &alignment, &alerts, config);
    let opportunities = find_opportunities(&snapshot, config);
    let priorities = priority_actions(&alignment, config);
    if snapshot.truncated {
        warnings.push("kpi snapshot truncated by deadline".to_string());
    }

    Ok(Analysis {
        new_alerts: recorded.len(),
        snapshot,
        alignment,
        alerts,
        issues,
        opportunities,
        priorities,
        warnings,
    })
}

struct PhaseRun<T> {
    outcome: PhaseOutcome,
    value: Option<T>,
    actions: Vec<ActionOutcome>,
}

impl<T> PhaseRun<T> {
    fn skipped(reason: &str) -> Self {
        let at = now_utc();
        Self {
            outcome: PhaseOutcome {
                status: PhaseStatus::Skipped,
                started_at: at,
                ended_at: at,
                duration_ms: 0,
                error: Some(reason.to_string()),
                detail: Value::Null,
                partial: None,
            },
            value: None,
            actions: Vec::new(),
        }
    }

    fn completed(&self) -> bool {
        self.outcome.status == PhaseStatus::Completed
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn to_detail<T: Serialize>(value: &T) -> Result<Value, ControllerError> {
    serde_json::to_value(value)
        .map_err(|err| ControllerError::Validation(format!("failed to encode phase detail: {err}")))
}

/// Runs one phase body under `min(phase deadline, cycle time left)`.
///
/// The body receives the phase deadline and a journal. On timeout the
/// deadline is cancelled so in-flight handlers stop before their next
/// external call. Once they have recorded their outcomes the journal becomes
/// the phase's partial result.
async fn run_phase<T, F, Fut>(
    phase: PhaseName,
    config: &ControllerConfig,
    cycle_id: &str,
    cycle_deadline: &Deadline,
    body: F,
) -> PhaseRun<T>
where
    F: FnOnce(Deadline, Journal) -> Fut,
    Fut: Future<Output = Result<(T, Value), ControllerError>>,
{
    if cycle_deadline.expired() {
        tracing::warn!(cycle_id, phase = phase.as_str(), "phase skipped: cycle deadline exceeded");
        return PhaseRun::skipped("cycle_deadline_exceeded");
    }

    let phase_budget = config.phase_deadline(phase);
    let budget = cycle_deadline
        .remaining()
        .map_or(phase_budget, |left| left.min(phase_budget));
    let deadline = Deadline::after(budget);
    let journal = Journal::default();
    let started_at = now_utc();
    let clock = Instant::now();

    let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
    let result = tokio::time::timeout(budget, body(deadline.clone(), journal.clone())).await;

    let (status, error, detail, partial, value) = match result {
        Ok(Ok((value, detail))) => (PhaseStatus::Completed, None, detail, None, Some(value)),
        Ok(Err(err)) => {
            tracing::warn!(cycle_id, phase = phase.as_str(), error = %err, "phase failed");
            let partial = json!({ "actions": journal.snapshot() });
            (
                PhaseStatus::Failed,
                Some(err.to_string()),
                Value::Null,
                Some(partial),
                None,
            )
        }
        Err(_) => {
            deadline.cancel();
            tracing::warn!(
                cycle_id,
                phase = phase.as_str(),
                budget_ms,
                "phase timed out"
            );
            if !journal.settle(SETTLE_GRACE).await {
                tracing::warn!(
                    cycle_id,
                    phase = phase.as_str(),
                    "cancelled actions still running after grace period"
                );
            }
            let partial = json!({ "actions": journal.snapshot() });
            (
                PhaseStatus::Timeout,
                Some(format!("phase exceeded {budget_ms} ms")),
                Value::Null,
                Some(partial),
                None,
            )
        }
    };

    let ended_at = now_utc();
    let duration_ms = elapsed_ms(clock);
    tracing::info!(
        cycle_id,
        phase = phase.as_str(),
        status = ?status,
        duration_ms,
        "phase finished"
    );

    PhaseRun {
        outcome: PhaseOutcome {
            status,
            started_at,
            ended_at,
            duration_ms,
            error,
            detail,
            partial,
        },
        value,
        actions: journal.snapshot(),
    }
}

struct CycleContext {
    shared: Shared,
    config: Arc<ControllerConfig>,
    cycle_id: String,
    dry_run: bool,
    confirmations: Arc<BTreeSet<ActionId>>,
    ledger: Arc<BudgetLedger>,
}

impl CycleContext {
    fn scope(&self, deadline: Deadline, journal: Journal, dry_run: bool) -> DispatchScope {
        DispatchScope {
            shared: self.shared.clone(),
            config: Arc::clone(&self.config),
            owner_id: self.cycle_id.clone(),
            dry_run,
            confirmations: Arc::clone(&self.confirmations),
            allowed: None,
            ledger: Arc::clone(&self.ledger),
            deadline,
            journal,
        }
    }
}

async fn analyze_phase(
    ctx: &CycleContext,
    deadline: Deadline,
) -> Result<(Analysis, Value), ControllerError> {
    let config = Arc::clone(&ctx.config);
    let mode = if ctx.dry_run {
        AlertMode::Record
    } else {
        AlertMode::RecordAndNotify
    };
    let analysis = ctx
        .shared
        .blocking("analyze", move |shared| {
            analyze(shared, &config, config.analysis_window_days, mode, &deadline)
        })
        .await?;
    let detail = to_detail(&analysis)?;
    Ok((analysis, detail))
}

async fn heal_phase(
    ctx: &CycleContext,
    analysis: &Analysis,
    deadline: Deadline,
    journal: Journal,
) -> Result<((), Value), ControllerError> {
    let invocations: Vec<Invocation> = analysis
        .issues
        .iter()
        .filter_map(Invocation::from_issue)
        .collect();
    let scope = ctx.scope(deadline, journal, ctx.dry_run);
    let outcomes = dispatch(&scope, invocations).await;
    let healed = outcomes.iter().filter(|outcome| outcome.succeeded()).count();
    Ok((
        (),
        json!({
            "issues": analysis.issues.len(),
            "dispatched": outcomes.len(),
            "healed": healed,
        }),
    ))
}

fn display_value(kpi: KpiName, value: f64) -> f64 {
    if kpi.is_ratio() {
        value * 100.0
    } else {
        value
    }
}

/// Applies the top opportunities, then rescores on a fresh snapshot of the
/// same window length.
async fn optimize_phase(
    ctx: &CycleContext,
    analysis: &Analysis,
    deadline: Deadline,
    journal: Journal,
) -> Result<((), Value), ControllerError> {
    let selected = select_top(&analysis.opportunities, ctx.config.optimizer_top_k);
    let invocations = selected.iter().map(Invocation::from_opportunity).collect();
    let scope = ctx.scope(deadline.clone(), journal.clone(), ctx.dry_run);
    let outcomes = dispatch(&scope, invocations).await;

    let config = Arc::clone(&ctx.config);
    let fresh = ctx
        .shared
        .blocking("optimizer resample", move |shared| {
            Ok(sample(shared, &config, config.analysis_window_days, &deadline))
        })
        .await?;
    let after = score_alignment(&fresh, &ctx.config.kpi_targets);

    for outcome in outcomes.iter().filter(|outcome| outcome.succeeded()) {
        let Some(opportunity) = selected
            .iter()
            .find(|opportunity| opportunity.action == outcome.action_id)
        else {
            continue;
        };
        if let Some(measured) = fresh.value(opportunity.kpi) {
            journal.set_after_metric(outcome.id, display_value(opportunity.kpi, measured.value));
        }
    }

    let before_score = analysis.alignment.overall;
    Ok((
        (),
        json!({
            "selected": selected,
            "before_score": before_score,
            "after_score": after.overall,
            "improvement": after.overall - before_score,
        }),
    ))
}

/// Runs the catalog against at-risk KPIs in dry-run only, so operators can
/// see what would fire next.
async fn preventive_phase(
    ctx: &CycleContext,
    analysis: &Analysis,
    deadline: Deadline,
    journal: Journal,
) -> Result<((), Value), ControllerError> {
    let mut seen = BTreeSet::new();
    let invocations: Vec<Invocation> = analysis
        .priorities
        .iter()
        .filter(|priority| seen.insert(priority.action))
        .map(|priority| Invocation::from_priority(priority, &analysis.snapshot))
        .collect();
    let triggers = invocations.len();
    let scope = ctx.scope(deadline, journal, true);
    let outcomes = dispatch(&scope, invocations).await;
    let would_run = outcomes
        .iter()
        .filter(|outcome| outcome.reason.as_deref() == Some("dry_run"))
        .count();
    Ok((
        (),
        json!({
            "triggers": triggers,
            "would_run": would_run,
        }),
    ))
}

async fn learn_phase(ctx: &CycleContext) -> Result<(Vec<LearnedAdvisory>, Value), ControllerError> {
    let window = ctx.config.analysis_window_days;
    let dry_run = ctx.dry_run;
    let (advisories, cohort, adoption) = ctx
        .shared
        .blocking("learn", move |shared| {
            let now = now_utc();
            let (cohort, adoption) = {
                let store = shared.store.lock();
                (
                    store.high_performer_cohort(window, now)?,
                    store.suggestion_adoption(window, now)?,
                )
            };
            let advisories = derive_advisories(&cohort, &adoption, now);
            if !dry_run && !advisories.is_empty() {
                shared.store.lock().append_learned_advisories(&advisories)?;
            }
            Ok((advisories, cohort, adoption))
        })
        .await?;
    let detail = json!({
        "cohort": cohort,
        "adoption": adoption,
        "advisories": advisories,
        "persisted": !dry_run && !advisories.is_empty(),
    });
    Ok((advisories, detail))
}

async fn recheck_phase(
    ctx: &CycleContext,
    deadline: Deadline,
) -> Result<(AlignmentScore, Value), ControllerError> {
    let config = Arc::clone(&ctx.config);
    let fresh = ctx
        .shared
        .blocking("alignment recheck", move |shared| {
            Ok(sample(shared, &config, config.analysis_window_days, &deadline))
        })
        .await?;
    let alignment = score_alignment(&fresh, &ctx.config.kpi_targets);
    let detail = to_detail(&alignment)?;
    Ok((alignment, detail))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn run(
    shared: &Shared,
    config: Arc<ControllerConfig>,
    dry_run: bool,
    confirmations: BTreeSet<ActionId>,
) -> Result<CycleReport, ControllerError> {
    let started_at = now_utc();
    let cycle_deadline = Deadline::after(config.cycle_deadline());
    let ctx = CycleContext {
        shared: shared.clone(),
        ledger: Arc::new(BudgetLedger::new(&config)),
        cycle_id: new_cycle_id(started_at)?,
        dry_run,
        confirmations: Arc::new(confirmations),
        config,
    };
    let config = Arc::clone(&ctx.config);
    let cycle_id = ctx.cycle_id.as_str();
    tracing::info!(cycle_id, dry_run, "cycle started");

    let mut phase_results = BTreeMap::new();
    let mut actions = Vec::new();
    let mut config_warnings = config.config_warnings();

    let analyze = run_phase(PhaseName::Analyze, &config, cycle_id, &cycle_deadline, |deadline, _| {
        analyze_phase(&ctx, deadline)
    })
    .await;
    let analysis = analyze.value;
    phase_results.insert(PhaseName::Analyze, analyze.outcome);
    if let Some(analysis) = &analysis {
        config_warnings.extend(analysis.warnings.iter().cloned());
    }

    let mut healed = 0_u64;
    let mut optimized = 0_u64;

    for phase in [PhaseName::Heal, PhaseName::Optimize, PhaseName::Preventive] {
        let Some(analysis) = &analysis else {
            phase_results.insert(phase, PhaseRun::<()>::skipped("analysis_unavailable").outcome);
            continue;
        };
        let run = run_phase(phase, &config, cycle_id, &cycle_deadline, |deadline, journal| {
            let ctx = &ctx;
            async move {
                match phase {
                    PhaseName::Heal => heal_phase(ctx, analysis, deadline, journal).await,
                    PhaseName::Optimize => optimize_phase(ctx, analysis, deadline, journal).await,
                    _ => preventive_phase(ctx, analysis, deadline, journal).await,
                }
            }
        })
        .await;
        let succeeded = run.actions.iter().filter(|outcome| outcome.succeeded()).count() as u64;
        match phase {
            PhaseName::Heal => healed = succeeded,
            PhaseName::Optimize => optimized = succeeded,
            _ => {}
        }
        actions.extend(run.actions);
        phase_results.insert(phase, run.outcome);
    }

    let learn = run_phase(PhaseName::Learn, &config, cycle_id, &cycle_deadline, |_, _| {
        learn_phase(&ctx)
    })
    .await;
    let patterns_learned = learn.value.as_ref().map_or(0, |advisories| advisories.len() as u64);
    phase_results.insert(PhaseName::Learn, learn.outcome);

    let decide_run = match &analysis {
        Some(analysis) => {
            run_phase(PhaseName::Decide, &config, cycle_id, &cycle_deadline, |_, _| async move {
                let decisions =
                    decide(&analysis.snapshot, &analysis.alignment, &analysis.priorities);
                let detail = to_detail(&decisions)?;
                Ok::<_, ControllerError>(((), detail))
            })
            .await
        }
        None => PhaseRun::skipped("analysis_unavailable"),
    };
    phase_results.insert(PhaseName::Decide, decide_run.outcome);

    let recheck = run_phase(
        PhaseName::AlignmentRecheck,
        &config,
        cycle_id,
        &cycle_deadline,
        |deadline, _| recheck_phase(&ctx, deadline),
    )
    .await;
    let alignment_score = if recheck.completed() {
        recheck.value.as_ref().map(|alignment| alignment.overall)
    } else {
        analysis.as_ref().map(|analysis| analysis.alignment.overall)
    };
    phase_results.insert(PhaseName::AlignmentRecheck, recheck.outcome);

    let summary = CycleSummary {
        issues_found: analysis.as_ref().map_or(0, |analysis| analysis.issues.len() as u64),
        issues_healed: healed,
        optimizations_applied: optimized,
        patterns_learned,
        health_score: analysis.as_ref().map(|analysis| health_score(&analysis.issues)),
        alignment_score,
    };

    let confirmations: Vec<ActionId> = ctx.confirmations.iter().copied().collect();
    let report = CycleReport {
        cycle_id: ctx.cycle_id.clone(),
        started_at,
        ended_at: now_utc(),
        dry_run,
        confirmations,
        phase_results,
        actions,
        config_warnings,
        summary,
    };

    tracing::info!(
        cycle_id = %report.cycle_id,
        issues_found = report.summary.issues_found,
        issues_healed = report.summary.issues_healed,
        optimizations_applied = report.summary.optimizations_applied,
        "cycle finished"
    );
    Ok(report)
}
