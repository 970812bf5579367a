//! Domain model for the autonomous operations control loop.
//!
//! Everything in this crate is pure: snapshots come in, scores, alerts,
//! issues, opportunities and decisions come out. Storage lives in
//! `autopilot-store-sqlite`, orchestration in `autopilot-controller`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub mod action;
pub mod alert;
pub mod config;
pub mod decision;
pub mod issue;
pub mod kpi;
pub mod learn;
pub mod opportunity;
pub mod report;
pub mod score;

pub use action::{
    action_catalog, ActionId, ActionKind, ActionOutcome, ActionResult, ActionSpec, ActionState,
};
pub use alert::{evaluate_alerts, Alert, AlertSeverity};
pub use config::{ControllerConfig, PhaseDeadlines};
pub use decision::{decide, Decision, DecisionKind, DecisionSet};
pub use issue::{detect_issues, health_score, Evidence, Issue, IssueSeverity, IssueType};
pub use kpi::{
    CacheStatus, Direction, KpiMeasurement, KpiName, KpiSnapshot, KpiTarget, KpiValue,
    LivenessReport, OperationalSignals, WindowDays,
};
pub use learn::{derive_advisories, AdoptionStats, CohortStats, LearnedAdvisory};
pub use opportunity::{find_opportunities, select_top, Opportunity, OpportunityType};
pub use report::{
    new_cycle_id, new_monitor_id, CycleReport, CycleSummary, CycleSummaryRow, MonitorResponse,
    PhaseName, PhaseOutcome, PhaseStatus,
};
pub use score::{
    kpi_status, priority_actions, score_alignment, AlignmentScore, KpiScore, KpiStatus,
    PriorityAction, TrackStatus,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OpsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("data unavailable: {0}")]
    DataUnavailable(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

/// Fixed-width RFC3339 layout. Stored timestamps compare lexicographically.
const TIMESTAMP_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

const DAY_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Parses an RFC3339 timestamp and requires the UTC offset.
///
/// # Errors
/// Returns [`OpsError::Validation`] when the value is not RFC3339 or carries
/// a non-UTC offset.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, OpsError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| OpsError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(OpsError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as fixed-width RFC3339 (microsecond precision, `Z`).
///
/// # Errors
/// Returns [`OpsError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, OpsError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(TIMESTAMP_FORMAT)
        .map_err(|err| OpsError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// UTC calendar day key (`YYYY-MM-DD`) used for alert and advisory dedupe.
///
/// # Errors
/// Returns [`OpsError::Validation`] when formatting fails.
pub fn utc_day(value: OffsetDateTime) -> Result<String, OpsError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(DAY_FORMAT)
        .map_err(|err| OpsError::Validation(format!("failed to format UTC day: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Cooperative deadline shared by a phase and every task it spawns.
///
/// Clones share the cancellation flag, so cancelling any clone is observed
/// by all of them.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    #[must_use]
    pub fn after(budget: StdDuration) -> Self {
        Self {
            at: Instant::now().checked_add(budget),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            at: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn remaining(&self) -> Option<StdDuration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[must_use]
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
