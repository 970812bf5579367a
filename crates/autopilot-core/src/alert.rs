use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::ControllerConfig;
use crate::kpi::{KpiName, KpiSnapshot};
use crate::{utc_day, OpsError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "WARNING" => Some(Self::Warning),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub kpi: KpiName,
    pub severity: AlertSeverity,
    pub current: f64,
    pub threshold: f64,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    /// UTC day key; `(kpi, severity, day)` identifies the alert.
    pub day: String,
}

/// Evaluates two-tier thresholds for every targeted KPI.
///
/// At most one alert per KPI is produced: a critical breach supersedes the
/// warning. KPIs below their sample floor never alert.
///
/// # Errors
/// Returns [`OpsError::Validation`] when the observation day cannot be
/// formatted.
pub fn evaluate_alerts(
    snapshot: &KpiSnapshot,
    config: &ControllerConfig,
    observed_at: OffsetDateTime,
) -> Result<Vec<Alert>, OpsError> {
    let day = utc_day(observed_at)?;
    let mut alerts = Vec::new();

    for target in &config.kpi_targets {
        let Some(measured) = snapshot.value(target.name) else {
            continue;
        };
        if measured.sample_size < config.sample_floor(target.name) {
            continue;
        }

        let breach = [
            (AlertSeverity::Critical, target.critical_threshold),
            (AlertSeverity::Warning, target.warning_threshold),
        ]
        .into_iter()
        .find_map(|(severity, threshold)| {
            threshold
                .filter(|limit| target.breaches(measured.value, *limit))
                .map(|limit| (severity, limit))
        });

        if let Some((severity, threshold)) = breach {
            alerts.push(Alert {
                kpi: target.name,
                severity,
                current: measured.value,
                threshold,
                message: format!(
                    "{} {} at {:.4} (threshold {:.4}, target {:.4})",
                    target.name,
                    severity.as_str().to_ascii_lowercase(),
                    measured.value,
                    threshold,
                    target.target_value
                ),
                observed_at,
                day: day.clone(),
            });
        }
    }

    Ok(alerts)
}
