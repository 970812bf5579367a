use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::action::{ActionId, ActionOutcome};
use crate::alert::Alert;
use crate::kpi::LivenessReport;
use crate::OpsError;

const CYCLE_STAMP_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year][month][day]T[hour][minute][second].[subsecond digits:6]Z"
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Analyze,
    Heal,
    Optimize,
    Preventive,
    Learn,
    Decide,
    AlignmentRecheck,
}

impl PhaseName {
    pub const ORDER: [Self; 7] = [
        Self::Analyze,
        Self::Heal,
        Self::Optimize,
        Self::Preventive,
        Self::Learn,
        Self::Decide,
        Self::AlignmentRecheck,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Heal => "heal",
            Self::Optimize => "optimize",
            Self::Preventive => "preventive",
            Self::Learn => "learn",
            Self::Decide => "decide",
            Self::AlignmentRecheck => "alignment_recheck",
        }
    }

    /// Phases that consume the analyze output and are skipped without it.
    #[must_use]
    pub fn requires_analysis(self) -> bool {
        matches!(
            self,
            Self::Heal | Self::Optimize | Self::Preventive | Self::Decide
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Timeout,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseOutcome {
    pub status: PhaseStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: OffsetDateTime,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub detail: Value,
    /// Work recorded before a timeout cancelled the phase.
    pub partial: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleSummary {
    pub issues_found: u64,
    pub issues_healed: u64,
    pub optimizations_applied: u64,
    pub patterns_learned: u64,
    pub health_score: Option<f64>,
    pub alignment_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleReport {
    pub cycle_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: OffsetDateTime,
    pub dry_run: bool,
    pub confirmations: Vec<ActionId>,
    pub phase_results: BTreeMap<PhaseName, PhaseOutcome>,
    pub actions: Vec<ActionOutcome>,
    pub config_warnings: Vec<String>,
    pub summary: CycleSummary,
}

impl CycleReport {
    #[must_use]
    pub fn phase(&self, phase: PhaseName) -> Option<&PhaseOutcome> {
        self.phase_results.get(&phase)
    }

    #[must_use]
    pub fn outcomes_for(&self, action: ActionId) -> Vec<&ActionOutcome> {
        self.actions
            .iter()
            .filter(|outcome| outcome.action_id == action)
            .collect()
    }
}

/// Listing row for persisted cycle reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleSummaryRow {
    pub cycle_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: OffsetDateTime,
    pub dry_run: bool,
    pub summary: CycleSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorResponse {
    pub monitor_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    pub degraded: bool,
    pub triggers: Vec<String>,
    pub critical_alerts: Vec<Alert>,
    pub liveness: Option<LivenessReport>,
    pub outcomes: Vec<ActionOutcome>,
}

fn stamp(now: OffsetDateTime) -> Result<String, OpsError> {
    now.to_offset(time::UtcOffset::UTC)
        .format(CYCLE_STAMP_FORMAT)
        .map_err(|err| OpsError::Validation(format!("failed to format cycle stamp: {err}")))
}

/// `cycle_` followed by the compact UTC start time.
///
/// # Errors
/// Returns [`OpsError::Validation`] when the timestamp cannot be formatted.
pub fn new_cycle_id(now: OffsetDateTime) -> Result<String, OpsError> {
    Ok(format!("cycle_{}", stamp(now)?))
}

/// # Errors
/// Returns [`OpsError::Validation`] when the timestamp cannot be formatted.
pub fn new_monitor_id(now: OffsetDateTime) -> Result<String, OpsError> {
    Ok(format!("monitor_{}", stamp(now)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_ids_are_prefixed_utc_stamps() {
        let at = match crate::parse_rfc3339_utc("2026-02-07T12:34:56.789Z") {
            Ok(value) => value,
            Err(err) => panic!("fixture timestamp invalid: {err}"),
        };
        assert_eq!(
            new_cycle_id(at).ok().as_deref(),
            Some("cycle_20260207T123456.789000Z")
        );
        assert_eq!(
            new_monitor_id(at).ok().as_deref(),
            Some("monitor_20260207T123456.789000Z")
        );
    }

    #[test]
    fn phase_order_serializes_in_cycle_order() {
        let keys: Vec<String> = PhaseName::ORDER
            .iter()
            .map(|phase| match serde_json::to_value(phase) {
                Ok(Value::String(raw)) => raw,
                other => panic!("unexpected phase encoding: {other:?}"),
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                "analyze",
                "heal",
                "optimize",
                "preventive",
                "learn",
                "decide",
                "alignment_recheck"
            ]
        );
        let mut sorted = PhaseName::ORDER.to_vec();
        sorted.sort();
        assert_eq!(sorted, PhaseName::ORDER.to_vec());
    }
}
