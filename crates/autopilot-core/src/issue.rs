use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::action::{ActionId, ActionKind};
use crate::alert::{Alert, AlertSeverity};
use crate::config::ControllerConfig;
use crate::kpi::{KpiName, KpiSnapshot};
use crate::score::AlignmentScore;

pub const FAILED_PAYMENT_BURST_MIN: u64 = 5;
pub const DATA_QUALITY_FLOOR: f64 = 80.0;
pub const ALIGNMENT_DROP_FLOOR: f64 = 60.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    SystemLiveness,
    DataQuality,
    KpiAlert,
    OrphanReference,
    FailedPaymentBurst,
    AlignmentDrop,
}

impl IssueType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemLiveness => "SYSTEM_LIVENESS",
            Self::DataQuality => "DATA_QUALITY",
            Self::KpiAlert => "KPI_ALERT",
            Self::OrphanReference => "ORPHAN_REFERENCE",
            Self::FailedPaymentBurst => "FAILED_PAYMENT_BURST",
            Self::AlignmentDrop => "ALIGNMENT_DROP",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl IssueSeverity {
    #[must_use]
    pub fn penalty(self) -> f64 {
        match self {
            Self::Low => 5.0,
            Self::Medium => 10.0,
            Self::High => 20.0,
            Self::Critical => 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub kpi: Option<KpiName>,
    pub value: Option<f64>,
    pub sample_size: Option<u64>,
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub confidence: f64,
    pub evidence: Evidence,
    pub healing_action: Option<ActionId>,
}

/// Builds the issue list from one analysis. Rules are fixed; each carries a
/// constant confidence. Returns the issues plus any configuration warnings
/// raised while mapping them to actions.
#[must_use]
pub fn detect_issues(
    snapshot: &KpiSnapshot,
    alignment: &AlignmentScore,
    alerts: &[Alert],
    config: &ControllerConfig,
) -> (Vec<Issue>, Vec<String>) {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    if let Some(liveness) = &snapshot.signals.liveness {
        if !liveness.healthy() {
            issues.push(Issue {
                issue_type: IssueType::SystemLiveness,
                severity: IssueSeverity::High,
                confidence: 0.70,
                evidence: Evidence {
                    kpi: Some(KpiName::SystemLiveness),
                    value: Some(0.0),
                    sample_size: Some(3),
                    detail: json!({ "failed_checks": liveness.failed_checks() }),
                },
                healing_action: Some(ActionId::RestartService),
            });
        }
    }

    if let Some(quality) = snapshot.value(KpiName::DataQualityScore) {
        if quality.value < DATA_QUALITY_FLOOR
            && quality.sample_size >= config.sample_floor(KpiName::DataQualityScore)
        {
            issues.push(Issue {
                issue_type: IssueType::DataQuality,
                severity: IssueSeverity::Medium,
                confidence: 0.75,
                evidence: Evidence {
                    kpi: Some(KpiName::DataQualityScore),
                    value: Some(quality.value),
                    sample_size: Some(quality.sample_size),
                    detail: json!({ "floor": DATA_QUALITY_FLOOR }),
                },
                healing_action: Some(ActionId::RecommendManualReview),
            });
        }
    }

    if let Some(issue) = kpi_alert_issue(snapshot, alerts, config, &mut warnings) {
        issues.push(issue);
    }

    if let Some(orphans) = snapshot.signals.orphan_subscriptions.filter(|count| *count > 0) {
        issues.push(count_issue(
            IssueType::OrphanReference,
            IssueSeverity::Medium,
            0.90,
            orphans,
            ActionId::CleanupOrphanSubscriptions,
        ));
    }

    if let Some(failed) = snapshot
        .signals
        .failed_payments_7d
        .filter(|count| *count > FAILED_PAYMENT_BURST_MIN)
    {
        issues.push(count_issue(
            IssueType::FailedPaymentBurst,
            IssueSeverity::High,
            0.85,
            failed,
            ActionId::RetryFailedPayments,
        ));
    }

    if !alignment.is_empty() && alignment.overall < ALIGNMENT_DROP_FLOOR {
        issues.push(Issue {
            issue_type: IssueType::AlignmentDrop,
            severity: IssueSeverity::High,
            confidence: 0.80,
            evidence: Evidence {
                kpi: None,
                value: Some(alignment.overall),
                sample_size: None,
                detail: json!({ "floor": ALIGNMENT_DROP_FLOOR }),
            },
            healing_action: Some(ActionId::RecommendManualReview),
        });
    }

    for issue in &issues {
        if issue.healing_action.is_none() && issue.confidence >= config.auto_remediate_threshold {
            warnings.push(format!(
                "{} issue has no catalog action",
                issue.issue_type.as_str()
            ));
        }
    }

    (issues, warnings)
}

#[allow(clippy::cast_precision_loss)]
fn count_issue(
    issue_type: IssueType,
    severity: IssueSeverity,
    confidence: f64,
    count: u64,
    action: ActionId,
) -> Issue {
    Issue {
        issue_type,
        severity,
        confidence,
        evidence: Evidence {
            kpi: None,
            value: Some(count as f64),
            sample_size: None,
            detail: json!({ "count": count }),
        },
        healing_action: Some(action),
    }
}

fn kpi_alert_issue(
    snapshot: &KpiSnapshot,
    alerts: &[Alert],
    config: &ControllerConfig,
    warnings: &mut Vec<String>,
) -> Option<Issue> {
    let worst_severity = alerts.iter().map(|alert| alert.severity).max()?;

    let worst = alerts
        .iter()
        .filter(|alert| alert.severity == worst_severity)
        .max_by(|lhs, rhs| {
            let weight = |alert: &Alert| config.target(alert.kpi).map_or(0, |t| t.weight);
            weight(lhs)
                .cmp(&weight(rhs))
                .then(rhs.kpi.cmp(&lhs.kpi))
        })?;

    let healing_action = match config.action_for_kpi(worst.kpi) {
        Ok(action) if action.spec().kind == ActionKind::Remediate => Some(action),
        Ok(_) => Some(ActionId::RecommendManualReview),
        Err(err) => {
            warnings.push(err.to_string());
            None
        }
    };

    let (severity, confidence) = match worst_severity {
        AlertSeverity::Critical => (IssueSeverity::Critical, 0.85),
        AlertSeverity::Warning => (IssueSeverity::Medium, 0.65),
    };

    let measured = snapshot.value(worst.kpi);
    Some(Issue {
        issue_type: IssueType::KpiAlert,
        severity,
        confidence,
        evidence: Evidence {
            kpi: Some(worst.kpi),
            value: Some(worst.current),
            sample_size: measured.map(|m| m.sample_size),
            detail: json!({
                "alert_severity": worst_severity.as_str(),
                "alerted_kpis": alerts
                    .iter()
                    .map(|alert| json!({
                        "kpi": alert.kpi.as_str(),
                        "severity": alert.severity.as_str(),
                        "current": alert.current,
                        "threshold": alert.threshold,
                    }))
                    .collect::<Vec<_>>(),
            }),
        },
        healing_action,
    })
}

/// `100 - sum(severity penalties)`, floored at zero.
#[must_use]
pub fn health_score(issues: &[Issue]) -> f64 {
    let penalty: f64 = issues.iter().map(|issue| issue.severity.penalty()).sum();
    (100.0 - penalty).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::evaluate_alerts;
    use crate::kpi::{CacheStatus, KpiMeasurement, LivenessReport, OperationalSignals, WindowDays};
    use crate::score::score_alignment;

    fn snapshot(values: &[(KpiName, f64, u64)], signals: OperationalSignals) -> KpiSnapshot {
        let now = crate::now_utc();
        KpiSnapshot {
            window_start: now - WindowDays::MONTH.duration(),
            window_end: now,
            window_days: WindowDays::MONTH,
            kpis: values
                .iter()
                .map(|(name, value, sample)| (*name, KpiMeasurement::available(*value, *sample)))
                .collect(),
            signals,
            truncated: false,
        }
    }

    fn quiet_signals() -> OperationalSignals {
        OperationalSignals {
            orphan_subscriptions: Some(0),
            failed_payments_7d: Some(0),
            liveness: Some(LivenessReport {
                store_reachable: true,
                cache_status: CacheStatus::NotConfigured,
                cache_ok: true,
                recent_ingestion_events: 12,
            }),
        }
    }

    fn analyze(snap: &KpiSnapshot, config: &ControllerConfig) -> (Vec<Issue>, Vec<String>) {
        let alignment = score_alignment(snap, &config.kpi_targets);
        let alerts = match evaluate_alerts(snap, config, crate::now_utc()) {
            Ok(alerts) => alerts,
            Err(err) => panic!("alert evaluation failed: {err}"),
        };
        detect_issues(snap, &alignment, &alerts, config)
    }

    #[test]
    fn healthy_snapshot_produces_no_issues() {
        let config = ControllerConfig {
            kpi_targets: vec![crate::kpi::KpiTarget::higher(KpiName::ActivationRate, 0.4, 10)
                .with_thresholds(Some(0.3), Some(0.2))],
            ..ControllerConfig::default()
        };
        let snap = snapshot(
            &[
                (KpiName::ActivationRate, 0.5, 40),
                (KpiName::DataQualityScore, 100.0, 40),
            ],
            quiet_signals(),
        );
        let (issues, warnings) = analyze(&snap, &config);
        assert!(issues.is_empty());
        assert!(warnings.is_empty());
        assert!((health_score(&issues) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn orphan_references_raise_medium_issue_with_cleanup() {
        let mut signals = quiet_signals();
        signals.orphan_subscriptions = Some(10);
        let config = ControllerConfig {
            kpi_targets: Vec::new(),
            ..ControllerConfig::default()
        };
        let (issues, _) = analyze(&snapshot(&[], signals), &config);
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert_eq!(issue.issue_type, IssueType::OrphanReference);
        assert_eq!(issue.severity, IssueSeverity::Medium);
        assert!((issue.confidence - 0.90).abs() < f64::EPSILON);
        assert_eq!(
            issue.healing_action,
            Some(ActionId::CleanupOrphanSubscriptions)
        );
    }

    #[test]
    fn failed_payment_burst_needs_more_than_five() {
        let config = ControllerConfig {
            kpi_targets: Vec::new(),
            ..ControllerConfig::default()
        };
        let mut signals = quiet_signals();
        signals.failed_payments_7d = Some(5);
        assert!(analyze(&snapshot(&[], signals.clone()), &config).0.is_empty());

        signals.failed_payments_7d = Some(6);
        let (issues, _) = analyze(&snapshot(&[], signals), &config);
        assert_eq!(issues[0].issue_type, IssueType::FailedPaymentBurst);
        assert_eq!(issues[0].severity, IssueSeverity::High);
    }

    #[test]
    fn critical_retention_alert_maps_to_retention_campaign() {
        let config = ControllerConfig::default();
        let snap = snapshot(&[(KpiName::D7Retention, 0.05, 60)], quiet_signals());
        let (issues, _) = analyze(&snap, &config);
        let alert_issue = issues
            .iter()
            .find(|issue| issue.issue_type == IssueType::KpiAlert);
        let Some(alert_issue) = alert_issue else {
            panic!("expected a KPI_ALERT issue");
        };
        assert_eq!(alert_issue.severity, IssueSeverity::Critical);
        assert!((alert_issue.confidence - 0.85).abs() < f64::EPSILON);
        assert_eq!(
            alert_issue.healing_action,
            Some(ActionId::TriggerRetentionCampaign)
        );
        assert!(issues
            .iter()
            .any(|issue| issue.issue_type == IssueType::AlignmentDrop));
    }

    #[test]
    fn optimize_mapped_alerts_fall_back_to_manual_review() {
        let config = ControllerConfig::default();
        let snap = snapshot(&[(KpiName::ActivationRate, 0.25, 60)], quiet_signals());
        let (issues, _) = analyze(&snap, &config);
        let Some(alert_issue) = issues
            .iter()
            .find(|issue| issue.issue_type == IssueType::KpiAlert)
        else {
            panic!("expected a KPI_ALERT issue");
        };
        assert_eq!(alert_issue.severity, IssueSeverity::Medium);
        assert_eq!(
            alert_issue.healing_action,
            Some(ActionId::RecommendManualReview)
        );
    }

    #[test]
    fn unmapped_alert_kpi_is_a_config_warning() {
        let mut config = ControllerConfig::default();
        config.kpi_actions.remove("churn_rate");
        let snap = snapshot(&[(KpiName::ChurnRate, 0.5, 60)], quiet_signals());
        let (issues, warnings) = analyze(&snap, &config);
        let Some(alert_issue) = issues
            .iter()
            .find(|issue| issue.issue_type == IssueType::KpiAlert)
        else {
            panic!("expected a KPI_ALERT issue");
        };
        assert!(alert_issue.healing_action.is_none());
        assert!(warnings.iter().any(|w| w.contains("churn_rate")));
    }

    #[test]
    fn liveness_failure_raises_high_issue() {
        let mut signals = quiet_signals();
        signals.liveness = Some(LivenessReport {
            store_reachable: true,
            cache_status: CacheStatus::NotConfigured,
            cache_ok: true,
            recent_ingestion_events: 0,
        });
        let config = ControllerConfig {
            kpi_targets: Vec::new(),
            ..ControllerConfig::default()
        };
        let (issues, _) = analyze(&snapshot(&[], signals), &config);
        assert_eq!(issues[0].issue_type, IssueType::SystemLiveness);
        assert_eq!(issues[0].healing_action, Some(ActionId::RestartService));
        assert!((health_score(&issues) - 80.0).abs() < f64::EPSILON);
    }
}
