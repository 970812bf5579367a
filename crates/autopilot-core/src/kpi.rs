use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::OpsError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KpiName {
    ActivationRate,
    D1Retention,
    D7Retention,
    D30Retention,
    SignupToActivation,
    ActivationToSubscription,
    Mrr,
    MrrGrowthMom,
    Ltv,
    Cac,
    LtvCacRatio,
    ViralCoefficient,
    ChurnRate,
    Dau,
    Wau,
    Mau,
    DataQualityScore,
    SystemLiveness,
}

impl KpiName {
    pub const ALL: [Self; 18] = [
        Self::ActivationRate,
        Self::D1Retention,
        Self::D7Retention,
        Self::D30Retention,
        Self::SignupToActivation,
        Self::ActivationToSubscription,
        Self::Mrr,
        Self::MrrGrowthMom,
        Self::Ltv,
        Self::Cac,
        Self::LtvCacRatio,
        Self::ViralCoefficient,
        Self::ChurnRate,
        Self::Dau,
        Self::Wau,
        Self::Mau,
        Self::DataQualityScore,
        Self::SystemLiveness,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActivationRate => "activation_rate",
            Self::D1Retention => "d1_retention",
            Self::D7Retention => "d7_retention",
            Self::D30Retention => "d30_retention",
            Self::SignupToActivation => "signup_to_activation",
            Self::ActivationToSubscription => "activation_to_subscription",
            Self::Mrr => "mrr",
            Self::MrrGrowthMom => "mrr_growth_mom",
            Self::Ltv => "ltv",
            Self::Cac => "cac",
            Self::LtvCacRatio => "ltv_cac_ratio",
            Self::ViralCoefficient => "viral_coefficient",
            Self::ChurnRate => "churn_rate",
            Self::Dau => "dau",
            Self::Wau => "wau",
            Self::Mau => "mau",
            Self::DataQualityScore => "data_quality_score",
            Self::SystemLiveness => "system_liveness",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == value)
    }

    /// Ratio KPIs are fractions of a user population and need a real cohort
    /// before anyone acts on them.
    #[must_use]
    pub fn is_ratio(self) -> bool {
        matches!(
            self,
            Self::ActivationRate
                | Self::D1Retention
                | Self::D7Retention
                | Self::D30Retention
                | Self::SignupToActivation
                | Self::ActivationToSubscription
                | Self::ViralCoefficient
                | Self::ChurnRate
        )
    }

    #[must_use]
    pub fn default_sample_floor(self) -> u64 {
        if self.is_ratio() {
            20
        } else {
            1
        }
    }
}

impl Display for KpiName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct KpiValue {
    pub value: f64,
    pub sample_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KpiMeasurement {
    Available { value: f64, sample_size: u64 },
    Unavailable { reason: String },
}

impl KpiMeasurement {
    #[must_use]
    pub fn available(value: f64, sample_size: u64) -> Self {
        if value.is_finite() {
            Self::Available { value, sample_size }
        } else {
            Self::Unavailable {
                reason: "non_finite_value".to_string(),
            }
        }
    }

    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn value(&self) -> Option<KpiValue> {
        match self {
            Self::Available { value, sample_size } => Some(KpiValue {
                value: *value,
                sample_size: *sample_size,
            }),
            Self::Unavailable { .. } => None,
        }
    }
}

/// Analysis window length in days. Only 1, 7, 30 and 90 are supported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u32", into = "u32")]
pub struct WindowDays(u32);

impl WindowDays {
    pub const DAY: Self = Self(1);
    pub const WEEK: Self = Self(7);
    pub const MONTH: Self = Self(30);
    pub const QUARTER: Self = Self(90);

    /// # Errors
    /// Returns [`OpsError::Validation`] for any length other than 1, 7, 30 or 90.
    pub fn new(days: u32) -> Result<Self, OpsError> {
        match days {
            1 | 7 | 30 | 90 => Ok(Self(days)),
            other => Err(OpsError::Validation(format!(
                "window_days MUST be one of 1, 7, 30, 90 (got {other})"
            ))),
        }
    }

    #[must_use]
    pub fn days(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn duration(self) -> Duration {
        Duration::days(i64::from(self.0))
    }
}

impl TryFrom<u32> for WindowDays {
    type Error = OpsError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WindowDays> for u32 {
    fn from(value: WindowDays) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Healthy,
    Unhealthy,
    NotConfigured,
}

impl CacheStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::NotConfigured => "not_configured",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LivenessReport {
    pub store_reachable: bool,
    pub cache_status: CacheStatus,
    pub cache_ok: bool,
    pub recent_ingestion_events: u64,
}

impl LivenessReport {
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.store_reachable && self.cache_ok && self.recent_ingestion_events > 0
    }

    #[must_use]
    pub fn failed_checks(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if !self.store_reachable {
            failed.push("store_unreachable");
        }
        if !self.cache_ok {
            failed.push("cache_unhealthy");
        }
        if self.recent_ingestion_events == 0 {
            failed.push("no_recent_ingestion");
        }
        failed
    }
}

/// Raw counts gathered next to the KPI map. They feed issue detection but
/// are not KPIs themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationalSignals {
    pub orphan_subscriptions: Option<u64>,
    pub failed_payments_7d: Option<u64>,
    pub liveness: Option<LivenessReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub window_end: OffsetDateTime,
    pub window_days: WindowDays,
    pub kpis: BTreeMap<KpiName, KpiMeasurement>,
    pub signals: OperationalSignals,
    /// Set when the provider stopped early because its deadline expired.
    pub truncated: bool,
}

impl KpiSnapshot {
    #[must_use]
    pub fn value(&self, name: KpiName) -> Option<KpiValue> {
        self.kpis.get(&name).and_then(KpiMeasurement::value)
    }

    #[must_use]
    pub fn available_count(&self) -> usize {
        self.kpis.values().filter(|m| m.value().is_some()).count()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiTarget {
    pub name: KpiName,
    pub target_value: f64,
    pub direction: Direction,
    pub weight: u32,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
    #[serde(default)]
    pub critical_threshold: Option<f64>,
}

impl KpiTarget {
    #[must_use]
    pub fn higher(name: KpiName, target_value: f64, weight: u32) -> Self {
        Self {
            name,
            target_value,
            direction: Direction::HigherIsBetter,
            weight,
            warning_threshold: None,
            critical_threshold: None,
        }
    }

    #[must_use]
    pub fn with_thresholds(mut self, warning: Option<f64>, critical: Option<f64>) -> Self {
        self.warning_threshold = warning;
        self.critical_threshold = critical;
        self
    }

    /// Direction-aware threshold test: higher-is-better fires at or below,
    /// lower-is-better fires at or above.
    #[must_use]
    pub fn breaches(&self, value: f64, threshold: f64) -> bool {
        match self.direction {
            Direction::HigherIsBetter => value <= threshold,
            Direction::LowerIsBetter => value >= threshold,
        }
    }
}

/// Built-in target table.
#[must_use]
pub fn default_kpi_targets() -> Vec<KpiTarget> {
    use KpiName as K;

    vec![
        KpiTarget::higher(K::ActivationRate, 0.40, 20).with_thresholds(Some(0.30), Some(0.20)),
        KpiTarget::higher(K::D1Retention, 0.50, 5).with_thresholds(Some(0.40), Some(0.30)),
        KpiTarget::higher(K::D7Retention, 0.30, 15).with_thresholds(Some(0.20), Some(0.10)),
        KpiTarget::higher(K::D30Retention, 0.20, 10).with_thresholds(Some(0.12), Some(0.06)),
        KpiTarget::higher(K::SignupToActivation, 0.35, 5).with_thresholds(Some(0.25), Some(0.15)),
        KpiTarget::higher(K::ActivationToSubscription, 0.10, 10)
            .with_thresholds(Some(0.05), Some(0.02)),
        KpiTarget::higher(K::Mrr, 10_000.0, 10).with_thresholds(Some(5_000.0), Some(2_000.0)),
        KpiTarget::higher(K::MrrGrowthMom, 0.10, 5).with_thresholds(Some(0.0), Some(-0.05)),
        KpiTarget::higher(K::LtvCacRatio, 3.0, 10).with_thresholds(Some(2.0), Some(1.0)),
        KpiTarget::higher(K::ViralCoefficient, 0.30, 2).with_thresholds(Some(0.15), Some(0.05)),
        KpiTarget {
            name: K::ChurnRate,
            target_value: 0.05,
            direction: Direction::LowerIsBetter,
            weight: 10,
            warning_threshold: Some(0.08),
            critical_threshold: Some(0.12),
        },
        KpiTarget::higher(K::DataQualityScore, 100.0, 5).with_thresholds(Some(80.0), Some(60.0)),
        KpiTarget::higher(K::SystemLiveness, 1.0, 0).with_thresholds(None, Some(0.0)),
    ]
}
