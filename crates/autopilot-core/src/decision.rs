use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::kpi::{KpiName, KpiSnapshot};
use crate::score::{AlignmentScore, PriorityAction};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    ResourceAllocation,
    FeaturePriority,
    PricingSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub kind: DecisionKind,
    pub recommendation: String,
    pub confidence: f64,
    pub rationale: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionSet {
    pub decisions: Vec<Decision>,
    pub mean_confidence: Option<f64>,
    pub min_confidence: Option<f64>,
}

impl DecisionSet {
    #[must_use]
    pub fn get(&self, kind: DecisionKind) -> Option<&Decision> {
        self.decisions.iter().find(|decision| decision.kind == kind)
    }
}

/// Ranked recommendations from one analysis. Each decision carries a
/// constant confidence; nothing here mutates state.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn decide(
    snapshot: &KpiSnapshot,
    alignment: &AlignmentScore,
    priorities: &[PriorityAction],
) -> DecisionSet {
    let mut decisions = Vec::new();

    if let Some((kpi, score)) = alignment.lowest() {
        let gap = 100.0 - score.normalized_score;
        decisions.push(Decision {
            kind: DecisionKind::ResourceAllocation,
            recommendation: format!("focus on {kpi}"),
            confidence: if gap > 20.0 { 0.90 } else { 0.70 },
            rationale: json!({
                "kpi": kpi.as_str(),
                "normalized_score": score.normalized_score,
                "gap": gap,
            }),
        });
    }

    if let Some(top) = priorities.first() {
        decisions.push(Decision {
            kind: DecisionKind::FeaturePriority,
            recommendation: top.action.as_str().to_string(),
            confidence: 0.85,
            rationale: json!({
                "kpi": top.kpi.as_str(),
                "status": top.status,
                "weight": top.weight,
            }),
        });
    }

    if let Some(ratio) = snapshot.value(KpiName::LtvCacRatio) {
        let signal = if ratio.value < 3.0 {
            Some(("reduce_cac", 0.80))
        } else if ratio.value > 6.0 {
            Some(("invest_in_growth", 0.75))
        } else {
            None
        };
        if let Some((recommendation, confidence)) = signal {
            decisions.push(Decision {
                kind: DecisionKind::PricingSignal,
                recommendation: recommendation.to_string(),
                confidence,
                rationale: json!({ "ltv_cac_ratio": ratio.value }),
            });
        }
    }

    let mean_confidence = if decisions.is_empty() {
        None
    } else {
        Some(decisions.iter().map(|d| d.confidence).sum::<f64>() / decisions.len() as f64)
    };
    let min_confidence = decisions
        .iter()
        .map(|d| d.confidence)
        .min_by(f64::total_cmp);

    DecisionSet {
        decisions,
        mean_confidence,
        min_confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::kpi::{KpiMeasurement, OperationalSignals, WindowDays};
    use crate::score::{priority_actions, score_alignment};

    fn snapshot(values: &[(KpiName, f64, u64)]) -> KpiSnapshot {
        let now = crate::now_utc();
        KpiSnapshot {
            window_start: now - WindowDays::MONTH.duration(),
            window_end: now,
            window_days: WindowDays::MONTH,
            kpis: values
                .iter()
                .map(|(name, value, sample)| (*name, KpiMeasurement::available(*value, *sample)))
                .collect(),
            signals: OperationalSignals {
                orphan_subscriptions: None,
                failed_payments_7d: None,
                liveness: None,
            },
            truncated: false,
        }
    }

    fn decide_for(values: &[(KpiName, f64, u64)]) -> DecisionSet {
        let config = ControllerConfig::default();
        let snap = snapshot(values);
        let alignment = score_alignment(&snap, &config.kpi_targets);
        let priorities = priority_actions(&alignment, &config);
        decide(&snap, &alignment, &priorities)
    }

    #[test]
    fn low_ltv_cac_recommends_reducing_cac() {
        let set = decide_for(&[(KpiName::LtvCacRatio, 2.0, 1)]);
        let Some(pricing) = set.get(DecisionKind::PricingSignal) else {
            panic!("expected pricing signal");
        };
        assert_eq!(pricing.recommendation, "reduce_cac");
        assert!((pricing.confidence - 0.80).abs() < f64::EPSILON);
    }

    #[test]
    fn high_ltv_cac_recommends_growth_and_healthy_is_silent() {
        let set = decide_for(&[(KpiName::LtvCacRatio, 7.0, 1)]);
        assert_eq!(
            set.get(DecisionKind::PricingSignal)
                .map(|d| d.recommendation.as_str()),
            Some("invest_in_growth")
        );
        let set = decide_for(&[(KpiName::LtvCacRatio, 4.0, 1)]);
        assert!(set.get(DecisionKind::PricingSignal).is_none());
    }

    #[test]
    fn resource_allocation_targets_lowest_kpi() {
        let set = decide_for(&[
            (KpiName::ActivationRate, 0.38, 100),
            (KpiName::D7Retention, 0.09, 100),
        ]);
        let Some(allocation) = set.get(DecisionKind::ResourceAllocation) else {
            panic!("expected resource allocation");
        };
        assert_eq!(allocation.recommendation, "focus on d7_retention");
        assert!((allocation.confidence - 0.90).abs() < f64::EPSILON);

        let Some(feature) = set.get(DecisionKind::FeaturePriority) else {
            panic!("expected feature priority");
        };
        assert_eq!(feature.recommendation, "trigger_retention_campaign");
        assert!(set.min_confidence.is_some_and(|c| (c - 0.85).abs() < f64::EPSILON));
    }

    #[test]
    fn small_gap_lowers_allocation_confidence() {
        let set = decide_for(&[(KpiName::ActivationRate, 0.36, 100)]);
        let Some(allocation) = set.get(DecisionKind::ResourceAllocation) else {
            panic!("expected resource allocation");
        };
        assert!((allocation.confidence - 0.70).abs() < f64::EPSILON);
    }
}
