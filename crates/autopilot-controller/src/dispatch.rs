//! Remediator: gates, ordering and execution of catalog actions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use autopilot_core::{
    action_catalog, clamp_unit, now_utc, ActionId, ActionKind, ActionOutcome, ActionResult,
    ActionState, ControllerConfig, Deadline, Issue, IssueSeverity, KpiName, KpiSnapshot,
    Opportunity, PriorityAction, TrackStatus,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use ulid::Ulid;

use crate::handlers::{self, Effect};
use crate::Shared;

pub(crate) const PRICING_ADVISORY_KIND: &str = "pricing_change_recommended";

/// Advisory row a handler emits instead of touching business state.
#[derive(Debug, Clone)]
pub(crate) struct Advisory {
    pub(crate) kind: String,
    pub(crate) payload: Value,
}

impl Advisory {
    fn for_action(action: ActionId, subject: &str, payload: Value) -> Option<Self> {
        match action {
            ActionId::RecommendManualReview => Some(Self {
                kind: format!("manual_review.{subject}"),
                payload,
            }),
            ActionId::OptimizePricingSignal => Some(Self {
                kind: PRICING_ADVISORY_KIND.to_string(),
                payload,
            }),
            _ => None,
        }
    }
}

/// One request to run a catalog action, with the evidence behind it.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub(crate) action: ActionId,
    pub(crate) confidence: f64,
    pub(crate) severity_rank: u8,
    pub(crate) kpi: Option<KpiName>,
    pub(crate) sample_size: Option<u64>,
    pub(crate) before_metric: Option<f64>,
    /// Distance to target in KPI units, when the trigger has one.
    pub(crate) gap: Option<f64>,
    pub(crate) advisory: Option<Advisory>,
}

fn issue_rank(severity: IssueSeverity) -> u8 {
    match severity {
        IssueSeverity::Low => 0,
        IssueSeverity::Medium => 1,
        IssueSeverity::High => 2,
        IssueSeverity::Critical => 3,
    }
}

impl Invocation {
    pub(crate) fn from_issue(issue: &Issue) -> Option<Self> {
        let action = issue.healing_action?;
        Some(Self {
            action,
            confidence: issue.confidence,
            severity_rank: issue_rank(issue.severity),
            kpi: issue.evidence.kpi,
            sample_size: issue.evidence.sample_size,
            before_metric: issue.evidence.value,
            gap: None,
            advisory: Advisory::for_action(
                action,
                issue.issue_type.as_str(),
                json!({
                    "issue_type": issue.issue_type,
                    "severity": issue.severity,
                    "confidence": issue.confidence,
                    "evidence": issue.evidence,
                }),
            ),
        })
    }

    pub(crate) fn from_opportunity(opportunity: &Opportunity) -> Self {
        let scale = if opportunity.kpi.is_ratio() { 100.0 } else { 1.0 };
        Self {
            action: opportunity.action,
            confidence: opportunity.confidence,
            severity_rank: 0,
            kpi: Some(opportunity.kpi),
            sample_size: Some(opportunity.sample_size),
            before_metric: Some(opportunity.current),
            gap: Some((opportunity.target - opportunity.current) / scale),
            advisory: Advisory::for_action(
                opportunity.action,
                opportunity.kpi.as_str(),
                json!({
                    "opportunity_type": opportunity.opportunity_type,
                    "kpi": opportunity.kpi,
                    "current": opportunity.current,
                    "target": opportunity.target,
                    "expected_impact": opportunity.expected_impact,
                }),
            ),
        }
    }

    /// Preventive trigger for an off-track or at-risk KPI.
    pub(crate) fn from_priority(priority: &PriorityAction, snapshot: &KpiSnapshot) -> Self {
        let measured = snapshot.value(priority.kpi);
        let confidence = if priority.status == TrackStatus::OffTrack {
            0.85
        } else {
            0.65
        };
        Self {
            action: priority.action,
            confidence,
            severity_rank: priority.severity_rank,
            kpi: Some(priority.kpi),
            sample_size: measured.map(|m| m.sample_size),
            before_metric: measured.map(|m| m.value),
            gap: None,
            advisory: Advisory::for_action(
                priority.action,
                priority.kpi.as_str(),
                json!({
                    "kpi": priority.kpi,
                    "status": priority.status,
                    "normalized_score": priority.normalized_score,
                }),
            ),
        }
    }
}

/// Remaining external-call budget per action for one cycle or monitor run.
#[derive(Debug)]
pub(crate) struct BudgetLedger {
    remaining: Mutex<BTreeMap<ActionId, u32>>,
}

impl BudgetLedger {
    pub(crate) fn new(config: &ControllerConfig) -> Self {
        Self {
            remaining: Mutex::new(
                action_catalog()
                    .iter()
                    .map(|spec| (spec.id, config.budget(spec.id)))
                    .collect(),
            ),
        }
    }

    pub(crate) fn available(&self, action: ActionId) -> u32 {
        self.remaining.lock().get(&action).copied().unwrap_or(0)
    }

    pub(crate) fn consume(&self, action: ActionId, used: u64) {
        let mut remaining = self.remaining.lock();
        if let Some(left) = remaining.get_mut(&action) {
            let used = u32::try_from(used).unwrap_or(u32::MAX);
            *left = left.saturating_sub(used);
        }
    }
}

/// Outcomes recorded by a phase so far. A timed-out phase reports whatever
/// reached the journal before it was cancelled.
///
/// Executed actions record themselves from inside their blocking task, so an
/// outcome survives the dispatching future being dropped on timeout.
#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Arc<JournalInner>);

#[derive(Debug, Default)]
struct JournalInner {
    entries: Mutex<Vec<ActionOutcome>>,
    in_flight: AtomicUsize,
    settled: Notify,
}

/// Held by a blocking task until its outcome is in the journal.
#[derive(Debug)]
pub(crate) struct InFlight {
    journal: Journal,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let inner = &self.journal.0;
        if inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            inner.settled.notify_waiters();
        }
    }
}

impl Journal {
    pub(crate) fn len(&self) -> usize {
        self.0.entries.lock().len()
    }

    pub(crate) fn push(&self, outcome: ActionOutcome) {
        self.0.entries.lock().push(outcome);
    }

    pub(crate) fn snapshot(&self) -> Vec<ActionOutcome> {
        self.0.entries.lock().clone()
    }

    pub(crate) fn entries_from(&self, start: usize) -> Vec<ActionOutcome> {
        self.0
            .entries
            .lock()
            .get(start..)
            .map(<[_]>::to_vec)
            .unwrap_or_default()
    }

    fn reorder_from(&self, start: usize, rank: &BTreeMap<Ulid, usize>) {
        let mut entries = self.0.entries.lock();
        if let Some(tail) = entries.get_mut(start..) {
            tail.sort_by_key(|outcome| rank.get(&outcome.id).copied().unwrap_or(usize::MAX));
        }
    }

    pub(crate) fn set_after_metric(&self, id: Ulid, value: f64) {
        if let Some(outcome) = self
            .0
            .entries
            .lock()
            .iter_mut()
            .find(|outcome| outcome.id == id)
        {
            outcome.after_metric = Some(value);
        }
    }

    fn begin(&self) -> InFlight {
        self.0.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            journal: self.clone(),
        }
    }

    fn in_flight(&self) -> usize {
        self.0.in_flight.load(Ordering::Acquire)
    }

    /// Waits until every started action has recorded its outcome, or until
    /// `grace` elapses. Returns `false` when tasks were still running.
    pub(crate) async fn settle(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let settled = self.0.settled.notified();
                if self.in_flight() == 0 {
                    return;
                }
                settled.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

/// How long a timed-out phase waits for cancelled handlers to record what
/// they already did.
pub(crate) const SETTLE_GRACE: Duration = Duration::from_secs(5);

/// Everything a handler needs besides its invocation.
#[derive(Debug, Clone)]
pub(crate) struct DispatchScope {
    pub(crate) shared: Shared,
    pub(crate) config: Arc<ControllerConfig>,
    /// Cycle or monitor id the outcomes are recorded under.
    pub(crate) owner_id: String,
    pub(crate) dry_run: bool,
    pub(crate) confirmations: Arc<BTreeSet<ActionId>>,
    /// Restricts execution to a subset of the catalog (monitor fast path).
    pub(crate) allowed: Option<Arc<BTreeSet<ActionId>>>,
    pub(crate) ledger: Arc<BudgetLedger>,
    pub(crate) deadline: Deadline,
    pub(crate) journal: Journal,
}

impl DispatchScope {
    fn skipped(&self, invocation: &Invocation, reason: &str) -> ActionOutcome {
        let mut outcome = ActionOutcome::skipped(
            &self.owner_id,
            invocation.action,
            self.dry_run,
            clamp_unit(invocation.confidence),
            reason,
            now_utc(),
        );
        outcome.before_metric = invocation.before_metric;
        outcome
    }

    /// Static gates, checked in order before anything is scheduled.
    fn gate(&self, invocation: &Invocation) -> Option<&'static str> {
        let spec = invocation.action.spec();
        if self
            .allowed
            .as_ref()
            .is_some_and(|allowed| !allowed.contains(&invocation.action))
        {
            return Some("not_permitted_in_fast_path");
        }
        if invocation.action == ActionId::RestartService {
            return Some("requires_operator");
        }
        let confirmed = self.confirmations.contains(&invocation.action);
        if spec.requires_confirmation && !confirmed {
            return Some("confirmation_required");
        }
        let threshold = match spec.kind {
            ActionKind::Remediate => self.config.auto_remediate_threshold,
            ActionKind::Optimize => self.config.auto_optimize_threshold,
        };
        if invocation.confidence < threshold && !(spec.requires_confirmation && confirmed) {
            return Some("below_confidence_threshold");
        }
        if let (Some(kpi), Some(sample_size)) = (invocation.kpi, invocation.sample_size) {
            if sample_size < self.config.sample_floor(kpi) {
                return Some("insufficient_sample");
            }
        }
        if self.dry_run {
            return Some("dry_run");
        }
        None
    }

    /// Runs one gated invocation on the calling (blocking) thread.
    fn execute(&self, invocation: &Invocation) -> ActionOutcome {
        if self.deadline.expired() {
            return self.skipped(invocation, "deadline_exceeded");
        }
        let budget = self.ledger.available(invocation.action);
        if budget == 0 {
            return self.skipped(invocation, "budget_exhausted");
        }

        let started_at = now_utc();
        let (result, reason, used) = match self.run_handler(invocation, budget) {
            Ok(Effect::Applied { used, truncated }) => (
                ActionResult::Success,
                truncated.then(|| "deadline_truncated".to_string()),
                used,
            ),
            Ok(Effect::Precondition(reason)) => (ActionResult::Skipped, Some(reason), 0),
            Err(err) => {
                tracing::warn!(
                    owner_id = %self.owner_id,
                    action = %invocation.action,
                    error = %format!("{err:#}"),
                    "action handler failed"
                );
                (ActionResult::Failed, Some(format!("{err:#}")), 0)
            }
        };
        self.ledger.consume(invocation.action, used);

        ActionOutcome {
            id: Ulid::new(),
            cycle_id: self.owner_id.clone(),
            action_id: invocation.action,
            kind: invocation.action.spec().kind,
            executed: result != ActionResult::Skipped,
            dry_run: self.dry_run,
            confidence: clamp_unit(invocation.confidence),
            before_metric: invocation.before_metric,
            after_metric: None,
            result,
            reason,
            started_at,
            ended_at: now_utc(),
        }
    }

    /// Runs one invocation and records the outcome before returning it.
    fn execute_recorded(&self, invocation: &Invocation, in_flight: InFlight) -> ActionOutcome {
        let outcome = self.execute(invocation);
        self.journal.push(outcome.clone());
        drop(in_flight);
        outcome
    }

    /// Spawns one invocation on the blocking pool.
    fn spawn(&self, invocation: &Invocation) -> tokio::task::JoinHandle<ActionOutcome> {
        let task_scope = self.clone();
        let task_invocation = invocation.clone();
        let in_flight = self.journal.begin();
        tokio::task::spawn_blocking(move || {
            task_scope.execute_recorded(&task_invocation, in_flight)
        })
    }

    fn run_handler(&self, invocation: &Invocation, budget: u32) -> anyhow::Result<Effect> {
        let running = ActionState::Pending.advance(ActionState::Running)?;
        let effect = handlers::apply(self, invocation, budget);
        let result = match &effect {
            Ok(Effect::Applied { .. }) => ActionResult::Success,
            Ok(Effect::Precondition(_)) => ActionResult::Skipped,
            Err(_) => ActionResult::Failed,
        };
        running.advance(ActionState::Done(result))?;
        effect
    }

    fn join_failure(&self, invocation: &Invocation, detail: String) -> ActionOutcome {
        let at = now_utc();
        ActionOutcome {
            id: Ulid::new(),
            cycle_id: self.owner_id.clone(),
            action_id: invocation.action,
            kind: invocation.action.spec().kind,
            executed: true,
            dry_run: self.dry_run,
            confidence: clamp_unit(invocation.confidence),
            before_metric: invocation.before_metric,
            after_metric: None,
            result: ActionResult::Failed,
            reason: Some(detail),
            started_at: at,
            ended_at: at,
        }
    }
}

/// A finished task already recorded its outcome; a panicked one did not.
fn settle_task(
    scope: &DispatchScope,
    invocation: &Invocation,
    joined: Result<ActionOutcome, tokio::task::JoinError>,
) -> ActionOutcome {
    joined.unwrap_or_else(|err| {
        let outcome = scope.join_failure(invocation, format!("action task join failure: {err}"));
        scope.journal.push(outcome.clone());
        outcome
    })
}

/// Severity first, then confidence, then catalog position.
fn dispatch_order(lhs: &Invocation, rhs: &Invocation) -> std::cmp::Ordering {
    rhs.severity_rank
        .cmp(&lhs.severity_rank)
        .then(rhs.confidence.total_cmp(&lhs.confidence))
        .then(lhs.action.catalog_index().cmp(&rhs.action.catalog_index()))
}

/// Gates and runs every invocation, returning one outcome per invocation in
/// dispatch order.
///
/// The first invocation of each idempotent, independent action runs
/// concurrently with the others like it; everything else runs serially
/// afterwards.
pub(crate) async fn dispatch(
    scope: &DispatchScope,
    mut invocations: Vec<Invocation>,
) -> Vec<ActionOutcome> {
    invocations.sort_by(dispatch_order);

    let start = scope.journal.len();
    let mut rank = BTreeMap::new();
    let mut parallel = Vec::new();
    let mut serial = Vec::new();
    let mut claimed = BTreeSet::new();

    for (index, invocation) in invocations.into_iter().enumerate() {
        if let Some(reason) = scope.gate(&invocation) {
            tracing::debug!(
                owner_id = %scope.owner_id,
                action = %invocation.action,
                reason,
                "action gated"
            );
            let outcome = scope.skipped(&invocation, reason);
            rank.insert(outcome.id, index);
            scope.journal.push(outcome);
            continue;
        }
        let spec = invocation.action.spec();
        if spec.idempotent && spec.independent && claimed.insert(invocation.action) {
            parallel.push((index, invocation));
        } else {
            serial.push((index, invocation));
        }
    }

    let handles: Vec<_> = parallel
        .into_iter()
        .map(|(index, invocation)| {
            let handle = scope.spawn(&invocation);
            (index, invocation, handle)
        })
        .collect();

    for (index, invocation, handle) in handles {
        let outcome = settle_task(scope, &invocation, handle.await);
        rank.insert(outcome.id, index);
    }

    for (index, invocation) in serial {
        let outcome = settle_task(scope, &invocation, scope.spawn(&invocation).await);
        rank.insert(outcome.id, index);
    }

    scope.journal.reorder_from(start, &rank);
    scope.journal.entries_from(start)
}
