use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::action::ActionId;
use crate::alert::{Alert, AlertSeverity};
use crate::config::ControllerConfig;
use crate::kpi::{Direction, KpiName, KpiSnapshot, KpiTarget};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackStatus {
    OnTrack,
    AtRisk,
    OffTrack,
}

impl TrackStatus {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::OnTrack
        } else if score >= 50.0 {
            Self::AtRisk
        } else {
            Self::OffTrack
        }
    }

    #[must_use]
    pub fn severity_rank(self) -> u8 {
        match self {
            Self::OnTrack => 0,
            Self::AtRisk => 1,
            Self::OffTrack => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiScore {
    pub current: f64,
    pub target: f64,
    pub normalized_score: f64,
    pub weight: u32,
    pub status: TrackStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlignmentScore {
    pub overall: f64,
    pub per_kpi: BTreeMap<KpiName, KpiScore>,
}

impl AlignmentScore {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.per_kpi.is_empty()
    }

    #[must_use]
    pub fn lowest(&self) -> Option<(KpiName, &KpiScore)> {
        self.per_kpi
            .iter()
            .filter(|(_, score)| score.weight > 0)
            .min_by(|lhs, rhs| lhs.1.normalized_score.total_cmp(&rhs.1.normalized_score))
            .map(|(name, score)| (*name, score))
    }
}

/// Normalizes one KPI against its target onto `[0, 100]`.
///
/// Higher-is-better scores `100 * value / target`. Lower-is-better is linear
/// from 100 at the target down to 0 at twice the target.
#[must_use]
pub fn normalize(value: f64, target: &KpiTarget) -> f64 {
    let raw = match target.direction {
        Direction::HigherIsBetter => {
            if target.target_value <= 0.0 {
                if value >= target.target_value {
                    100.0
                } else {
                    0.0
                }
            } else {
                100.0 * value / target.target_value
            }
        }
        Direction::LowerIsBetter => {
            if target.target_value <= 0.0 {
                if value <= target.target_value {
                    100.0
                } else {
                    0.0
                }
            } else {
                100.0 * (2.0 - value / target.target_value)
            }
        }
    };

    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 100.0)
    }
}

/// Scores a snapshot against the configured targets. KPIs that are
/// unavailable or have no target are left out of `per_kpi` and of the mean.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn score_alignment(snapshot: &KpiSnapshot, targets: &[KpiTarget]) -> AlignmentScore {
    let mut per_kpi = BTreeMap::new();
    let mut weighted_sum = 0.0;
    let mut weight_total = 0_u64;

    for target in targets {
        let Some(measured) = snapshot.value(target.name) else {
            continue;
        };
        let normalized_score = normalize(measured.value, target);
        weighted_sum += normalized_score * f64::from(target.weight);
        weight_total += u64::from(target.weight);
        per_kpi.insert(
            target.name,
            KpiScore {
                current: measured.value,
                target: target.target_value,
                normalized_score,
                weight: target.weight,
                status: TrackStatus::from_score(normalized_score),
            },
        );
    }

    let overall = if weight_total > 0 {
        weighted_sum / weight_total as f64
    } else if per_kpi.is_empty() {
        0.0
    } else {
        per_kpi.values().map(|s| s.normalized_score).sum::<f64>() / per_kpi.len() as f64
    };

    AlignmentScore {
        overall: overall.clamp(0.0, 100.0),
        per_kpi,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriorityAction {
    pub kpi: KpiName,
    pub status: TrackStatus,
    pub severity_rank: u8,
    pub weight: u32,
    pub normalized_score: f64,
    pub action: ActionId,
}

/// Off-track and at-risk KPIs ranked by `(severity_rank desc, weight desc)`,
/// each mapped through the KPI to action table. Unmapped KPIs are dropped;
/// the cycle reports them as configuration warnings.
#[must_use]
pub fn priority_actions(
    alignment: &AlignmentScore,
    config: &ControllerConfig,
) -> Vec<PriorityAction> {
    let mut actions: Vec<PriorityAction> = alignment
        .per_kpi
        .iter()
        .filter(|(_, score)| score.status != TrackStatus::OnTrack)
        .filter_map(|(kpi, score)| {
            let action = config.action_for_kpi(*kpi).ok()?;
            Some(PriorityAction {
                kpi: *kpi,
                status: score.status,
                severity_rank: score.status.severity_rank(),
                weight: score.weight,
                normalized_score: score.normalized_score,
                action,
            })
        })
        .collect();

    actions.sort_by(|lhs, rhs| {
        rhs.severity_rank
            .cmp(&lhs.severity_rank)
            .then(rhs.weight.cmp(&lhs.weight))
            .then(lhs.kpi.cmp(&rhs.kpi))
    });
    actions
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiStatus {
    pub available: bool,
    pub value: Option<f64>,
    pub sample_size: Option<u64>,
    pub target: Option<f64>,
    pub normalized_score: Option<f64>,
    pub status: Option<TrackStatus>,
    pub alert: Option<AlertSeverity>,
}

/// Status line for every KPI in the closed set, available or not.
#[must_use]
pub fn kpi_status(
    snapshot: &KpiSnapshot,
    alignment: &AlignmentScore,
    alerts: &[Alert],
    config: &ControllerConfig,
) -> BTreeMap<KpiName, KpiStatus> {
    KpiName::ALL
        .into_iter()
        .map(|kpi| {
            let measured = snapshot.value(kpi);
            let score = alignment.per_kpi.get(&kpi);
            let alert = alerts
                .iter()
                .filter(|alert| alert.kpi == kpi)
                .map(|alert| alert.severity)
                .max();
            (
                kpi,
                KpiStatus {
                    available: measured.is_some(),
                    value: measured.map(|m| m.value),
                    sample_size: measured.map(|m| m.sample_size),
                    target: config.target(kpi).map(|t| t.target_value),
                    normalized_score: score.map(|s| s.normalized_score),
                    status: score.map(|s| s.status),
                    alert,
                },
            )
        })
        .collect()
}
