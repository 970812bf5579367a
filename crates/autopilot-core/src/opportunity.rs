use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::action::ActionId;
use crate::config::ControllerConfig;
use crate::kpi::{KpiName, KpiSnapshot};

pub const RETENTION_GAP_MIN: f64 = 0.05;
pub const HEALTHY_LTV_CAC: f64 = 3.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityType {
    Activation,
    Retention,
    Conversion,
    Pricing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Opportunity {
    pub opportunity_type: OpportunityType,
    pub kpi: KpiName,
    /// Percent for ratio KPIs, raw value otherwise.
    pub current: f64,
    pub target: f64,
    pub action: ActionId,
    pub expected_impact: f64,
    pub confidence: f64,
    pub priority: u32,
    pub sample_size: u64,
}

fn display_scale(kpi: KpiName) -> f64 {
    if kpi.is_ratio() {
        100.0
    } else {
        1.0
    }
}

fn below_target(
    snapshot: &KpiSnapshot,
    config: &ControllerConfig,
    kpi: KpiName,
    min_gap: f64,
) -> Option<(f64, f64, u32, u64)> {
    let measured = snapshot.value(kpi)?;
    let target = config.target(kpi)?;
    let gap = target.target_value - measured.value;
    if gap > min_gap {
        Some((measured.value, target.target_value, target.weight, measured.sample_size))
    } else {
        None
    }
}

#[must_use]
pub fn find_opportunities(snapshot: &KpiSnapshot, config: &ControllerConfig) -> Vec<Opportunity> {
    let mut found = Vec::new();

    let rules = [
        (
            OpportunityType::Activation,
            KpiName::ActivationRate,
            0.0,
            ActionId::OptimizeActivation,
            0.85,
        ),
        (
            OpportunityType::Retention,
            KpiName::D7Retention,
            RETENTION_GAP_MIN,
            ActionId::OptimizeRetention,
            0.80,
        ),
        (
            OpportunityType::Conversion,
            KpiName::ActivationToSubscription,
            0.0,
            ActionId::OptimizePricingSignal,
            0.70,
        ),
    ];

    for (opportunity_type, kpi, min_gap, action, confidence) in rules {
        if let Some((value, target, weight, sample_size)) =
            below_target(snapshot, config, kpi, min_gap)
        {
            let scale = display_scale(kpi);
            let current = value * scale;
            let target = target * scale;
            found.push(Opportunity {
                opportunity_type,
                kpi,
                current,
                target,
                action,
                expected_impact: (target - current) / 2.0,
                confidence,
                priority: weight,
                sample_size,
            });
        }
    }

    if let Some(ratio) = snapshot.value(KpiName::LtvCacRatio) {
        if ratio.value < HEALTHY_LTV_CAC {
            found.push(Opportunity {
                opportunity_type: OpportunityType::Pricing,
                kpi: KpiName::LtvCacRatio,
                current: ratio.value,
                target: HEALTHY_LTV_CAC,
                action: ActionId::OptimizePricingSignal,
                expected_impact: (HEALTHY_LTV_CAC - ratio.value) / 2.0,
                confidence: 0.75,
                priority: config.target(KpiName::LtvCacRatio).map_or(0, |t| t.weight),
                sample_size: ratio.sample_size,
            });
        }
    }

    found
}

/// Top `k` by `(priority desc, confidence desc)`, one entry per action.
#[must_use]
pub fn select_top(opportunities: &[Opportunity], k: usize) -> Vec<Opportunity> {
    let mut ranked = opportunities.to_vec();
    ranked.sort_by(|lhs, rhs| {
        rhs.priority
            .cmp(&lhs.priority)
            .then(rhs.confidence.total_cmp(&lhs.confidence))
            .then(lhs.opportunity_type.cmp(&rhs.opportunity_type))
    });

    let mut seen = BTreeSet::new();
    ranked
        .into_iter()
        .filter(|opportunity| seen.insert(opportunity.action))
        .take(k)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kpi::{KpiMeasurement, OperationalSignals, WindowDays};

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

    #[test]
    fn low_activation_is_reported_in_percent() {
        let found = find_opportunities(
            &snapshot(&[(KpiName::ActivationRate, 0.20, 100)]),
            &ControllerConfig::default(),
        );
        assert_eq!(found.len(), 1);
        let activation = &found[0];
        assert_eq!(activation.opportunity_type, OpportunityType::Activation);
        assert!((activation.current - 20.0).abs() < 1e-9);
        assert!((activation.target - 40.0).abs() < 1e-9);
        assert_eq!(activation.action, ActionId::OptimizeActivation);
        assert!((activation.expected_impact - 10.0).abs() < 1e-9);
    }

    #[test]
    fn retention_needs_more_than_five_points_of_gap() {
        let config = ControllerConfig::default();
        assert!(find_opportunities(&snapshot(&[(KpiName::D7Retention, 0.26, 50)]), &config)
            .is_empty());
        let found = find_opportunities(&snapshot(&[(KpiName::D7Retention, 0.20, 50)]), &config);
        assert_eq!(found[0].opportunity_type, OpportunityType::Retention);
    }

    #[test]
    fn pricing_opportunity_uses_ratio_floor() {
        let found = find_opportunities(
            &snapshot(&[(KpiName::LtvCacRatio, 2.0, 4)]),
            &ControllerConfig::default(),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].opportunity_type, OpportunityType::Pricing);
        assert!((found[0].current - 2.0).abs() < 1e-9);
    }

    #[test]
    fn top_k_deduplicates_actions() {
        let found = find_opportunities(
            &snapshot(&[
                (KpiName::ActivationRate, 0.20, 100),
                (KpiName::D7Retention, 0.10, 100),
                (KpiName::ActivationToSubscription, 0.01, 40),
                (KpiName::LtvCacRatio, 1.5, 10),
            ]),
            &ControllerConfig::default(),
        );
        assert_eq!(found.len(), 4);

        let top = select_top(&found, 3);
        let actions: Vec<ActionId> = top.iter().map(|o| o.action).collect();
        assert_eq!(
            actions,
            vec![
                ActionId::OptimizeActivation,
                ActionId::OptimizeRetention,
                ActionId::OptimizePricingSignal
            ]
        );
        assert_eq!(top[2].opportunity_type, OpportunityType::Pricing);
    }
}
