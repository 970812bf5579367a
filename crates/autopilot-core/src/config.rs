use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::ActionId;
use crate::kpi::{default_kpi_targets, Direction, KpiName, KpiTarget, WindowDays};
use crate::report::PhaseName;
use crate::OpsError;

pub const MAX_INGESTION_WINDOW_MINUTES: u64 = 7 * 24 * 60;

/// Per-phase deadlines in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PhaseDeadlines {
    pub analyze: u64,
    pub heal: u64,
    pub optimize: u64,
    pub preventive: u64,
    pub learn: u64,
    pub decide: u64,
    pub alignment_recheck: u64,
}

impl Default for PhaseDeadlines {
    fn default() -> Self {
        Self {
            analyze: 30_000,
            heal: 60_000,
            optimize: 60_000,
            preventive: 15_000,
            learn: 15_000,
            decide: 15_000,
            alignment_recheck: 15_000,
        }
    }
}

impl PhaseDeadlines {
    #[must_use]
    pub fn for_phase(&self, phase: PhaseName) -> Duration {
        let millis = match phase {
            PhaseName::Analyze => self.analyze,
            PhaseName::Heal => self.heal,
            PhaseName::Optimize => self.optimize,
            PhaseName::Preventive => self.preventive,
            PhaseName::Learn => self.learn,
            PhaseName::Decide => self.decide,
            PhaseName::AlignmentRecheck => self.alignment_recheck,
        };
        Duration::from_millis(millis)
    }
}

/// Process-scoped controller configuration. A cycle receives one immutable
/// copy; reloads only take effect for the next cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    #[serde(default = "default_kpi_targets")]
    pub kpi_targets: Vec<KpiTarget>,
    #[serde(default = "default_auto_remediate_threshold")]
    pub auto_remediate_threshold: f64,
    #[serde(default = "default_auto_optimize_threshold")]
    pub auto_optimize_threshold: f64,
    #[serde(default = "default_analysis_window_days")]
    pub analysis_window_days: WindowDays,
    #[serde(default)]
    pub phase_deadlines_ms: PhaseDeadlines,
    #[serde(default = "default_cycle_deadline_ms")]
    pub cycle_deadline_ms: u64,
    /// Maximum external calls per action per cycle, keyed by action id.
    #[serde(default = "default_action_budgets")]
    pub action_budgets: BTreeMap<String, u32>,
    #[serde(default)]
    pub alert_recipients: Vec<String>,
    /// KPI name to action id. Unknown names on either side become warnings.
    #[serde(default = "default_kpi_actions")]
    pub kpi_actions: BTreeMap<String, String>,
    #[serde(default)]
    pub sample_floors: BTreeMap<String, u64>,
    #[serde(default = "default_expected_lifetime_months")]
    pub expected_lifetime_months: f64,
    #[serde(default)]
    pub cac: Option<f64>,
    #[serde(default = "default_optimizer_top_k")]
    pub optimizer_top_k: usize,
    #[serde(default = "default_ingestion_window_minutes")]
    pub ingestion_window_minutes: u64,
    #[serde(default = "default_cache_optional")]
    pub cache_optional: bool,
}

fn default_auto_remediate_threshold() -> f64 {
    0.75
}

fn default_auto_optimize_threshold() -> f64 {
    0.80
}

fn default_analysis_window_days() -> WindowDays {
    WindowDays::MONTH
}

fn default_cycle_deadline_ms() -> u64 {
    600_000
}

fn default_action_budgets() -> BTreeMap<String, u32> {
    crate::action::action_catalog()
        .iter()
        .map(|spec| (spec.id.as_str().to_string(), spec.default_budget))
        .collect()
}

fn default_kpi_actions() -> BTreeMap<String, String> {
    use KpiName as K;

    KpiName::ALL
        .into_iter()
        .map(|kpi| {
            let action = match kpi {
                K::ActivationRate | K::SignupToActivation => ActionId::OptimizeActivation,
                K::D1Retention
                | K::D7Retention
                | K::D30Retention
                | K::ChurnRate
                | K::Dau
                | K::Wau
                | K::Mau => ActionId::TriggerRetentionCampaign,
                K::ActivationToSubscription | K::LtvCacRatio | K::Ltv | K::Cac => {
                    ActionId::OptimizePricingSignal
                }
                K::Mrr | K::MrrGrowthMom => ActionId::RetryFailedPayments,
                K::ViralCoefficient | K::DataQualityScore | K::SystemLiveness => {
                    ActionId::RecommendManualReview
                }
            };
            (kpi.as_str().to_string(), action.as_str().to_string())
        })
        .collect()
}

fn default_expected_lifetime_months() -> f64 {
    24.0
}

fn default_optimizer_top_k() -> usize {
    3
}

fn default_ingestion_window_minutes() -> u64 {
    60
}

fn default_cache_optional() -> bool {
    true
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kpi_targets: default_kpi_targets(),
            auto_remediate_threshold: default_auto_remediate_threshold(),
            auto_optimize_threshold: default_auto_optimize_threshold(),
            analysis_window_days: default_analysis_window_days(),
            phase_deadlines_ms: PhaseDeadlines::default(),
            cycle_deadline_ms: default_cycle_deadline_ms(),
            action_budgets: default_action_budgets(),
            alert_recipients: Vec::new(),
            kpi_actions: default_kpi_actions(),
            sample_floors: BTreeMap::new(),
            expected_lifetime_months: default_expected_lifetime_months(),
            cac: None,
            optimizer_top_k: default_optimizer_top_k(),
            ingestion_window_minutes: default_ingestion_window_minutes(),
            cache_optional: default_cache_optional(),
        }
    }
}

impl ControllerConfig {
    /// Validates numeric bounds and target table consistency.
    ///
    /// # Errors
    /// Returns [`OpsError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), OpsError> {
        for (name, value) in [
            ("auto_remediate_threshold", self.auto_remediate_threshold),
            ("auto_optimize_threshold", self.auto_optimize_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(OpsError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if self.auto_optimize_threshold < self.auto_remediate_threshold {
            return Err(OpsError::Configuration(
                "auto_optimize_threshold MUST be >= auto_remediate_threshold".to_string(),
            ));
        }

        for phase in PhaseName::ORDER {
            if self.phase_deadlines_ms.for_phase(phase).is_zero() {
                return Err(OpsError::Configuration(format!(
                    "phase_deadlines_ms.{} MUST be >= 1",
                    phase.as_str()
                )));
            }
        }

        if self.cycle_deadline_ms == 0 {
            return Err(OpsError::Configuration(
                "cycle_deadline_ms MUST be >= 1".to_string(),
            ));
        }

        if self.optimizer_top_k == 0 {
            return Err(OpsError::Configuration(
                "optimizer_top_k MUST be >= 1".to_string(),
            ));
        }

        if !(self.expected_lifetime_months.is_finite() && self.expected_lifetime_months > 0.0) {
            return Err(OpsError::Configuration(
                "expected_lifetime_months MUST be > 0".to_string(),
            ));
        }

        if !(1..=MAX_INGESTION_WINDOW_MINUTES).contains(&self.ingestion_window_minutes) {
            return Err(OpsError::Configuration(format!(
                "ingestion_window_minutes MUST be in [1, {MAX_INGESTION_WINDOW_MINUTES}]"
            )));
        }

        if let Some(cac) = self.cac {
            if !(cac.is_finite() && cac > 0.0) {
                return Err(OpsError::Configuration("cac MUST be > 0".to_string()));
            }
        }

        let mut seen = BTreeSet::new();
        for target in &self.kpi_targets {
            if !seen.insert(target.name) {
                return Err(OpsError::Configuration(format!(
                    "duplicate kpi target for {}",
                    target.name
                )));
            }
            validate_target(target)?;
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`OpsError::Configuration`] when JSON decoding fails or
    /// decoded values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, OpsError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            OpsError::Configuration(format!("invalid controller config payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn target(&self, kpi: KpiName) -> Option<&KpiTarget> {
        self.kpi_targets.iter().find(|target| target.name == kpi)
    }

    #[must_use]
    pub fn sample_floor(&self, kpi: KpiName) -> u64 {
        self.sample_floors
            .get(kpi.as_str())
            .copied()
            .unwrap_or_else(|| kpi.default_sample_floor())
    }

    /// Resolves the KPI to action mapping.
    ///
    /// # Errors
    /// Returns [`OpsError::Configuration`] when the KPI has no mapping or
    /// maps to an id outside the catalog.
    pub fn action_for_kpi(&self, kpi: KpiName) -> Result<ActionId, OpsError> {
        let Some(raw) = self.kpi_actions.get(kpi.as_str()) else {
            return Err(OpsError::Configuration(format!(
                "no action mapped for kpi {kpi}"
            )));
        };
        ActionId::parse(raw).ok_or_else(|| {
            OpsError::Configuration(format!("kpi {kpi} maps to unknown action id {raw}"))
        })
    }

    #[must_use]
    pub fn budget(&self, action: ActionId) -> u32 {
        self.action_budgets
            .get(action.as_str())
            .copied()
            .unwrap_or_else(|| action.spec().default_budget)
    }

    #[must_use]
    pub fn phase_deadline(&self, phase: PhaseName) -> Duration {
        self.phase_deadlines_ms.for_phase(phase)
    }

    #[must_use]
    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_millis(self.cycle_deadline_ms)
    }

    /// Non-fatal configuration problems, reported on every cycle.
    #[must_use]
    pub fn config_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (kpi_raw, action_raw) in &self.kpi_actions {
            if KpiName::parse(kpi_raw).is_none() {
                warnings.push(format!("kpi_actions references unknown kpi {kpi_raw}"));
            }
            if ActionId::parse(action_raw).is_none() {
                warnings.push(format!(
                    "kpi_actions maps {kpi_raw} to unknown action id {action_raw}"
                ));
            }
        }

        for target in &self.kpi_targets {
            if !self.kpi_actions.contains_key(target.name.as_str()) {
                warnings.push(format!("kpi {} has a target but no action mapping", target.name));
            }
        }

        for key in self.action_budgets.keys() {
            if ActionId::parse(key).is_none() {
                warnings.push(format!("action_budgets references unknown action id {key}"));
            }
        }

        for key in self.sample_floors.keys() {
            if KpiName::parse(key).is_none() {
                warnings.push(format!("sample_floors references unknown kpi {key}"));
            }
        }

        warnings
    }
}

fn validate_target(target: &KpiTarget) -> Result<(), OpsError> {
    if !target.target_value.is_finite() {
        return Err(OpsError::Configuration(format!(
            "target_value for {} MUST be finite",
            target.name
        )));
    }

    if let (Some(warning), Some(critical)) = (target.warning_threshold, target.critical_threshold)
    {
        let ordered = match target.direction {
            Direction::HigherIsBetter => critical <= warning,
            Direction::LowerIsBetter => critical >= warning,
        };
        if !ordered {
            return Err(OpsError::Configuration(format!(
                "critical_threshold for {} MUST be at least as severe as warning_threshold",
                target.name
            )));
        }
    }

    Ok(())
}
