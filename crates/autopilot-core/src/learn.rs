use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

pub const HIGH_PERFORMER_PROFILE: &str = "high_performer_profile";
pub const SUGGESTION_MIN_CONFIDENCE: &str = "suggestion_min_confidence";
pub const SUGGESTION_MIN_SUPPORT: u64 = 10;

/// Users with more than 3 workflows and more than 100 events in the window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CohortStats {
    pub cohort_size: u64,
    pub active_users: u64,
    pub mean_workflows: f64,
    pub mean_events: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdoptionStats {
    pub support: u64,
    pub mean_confidence: Option<f64>,
}

/// Operator-facing learned value. Never applied automatically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearnedAdvisory {
    pub key: String,
    pub value: Value,
    pub support: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub derived_at: OffsetDateTime,
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn derive_advisories(
    cohort: &CohortStats,
    adoption: &AdoptionStats,
    derived_at: OffsetDateTime,
) -> Vec<LearnedAdvisory> {
    let mut advisories = Vec::new();

    if cohort.cohort_size > 0 {
        let share = if cohort.active_users == 0 {
            0.0
        } else {
            cohort.cohort_size as f64 / cohort.active_users as f64
        };
        advisories.push(LearnedAdvisory {
            key: HIGH_PERFORMER_PROFILE.to_string(),
            value: json!({
                "cohort_size": cohort.cohort_size,
                "mean_workflows": cohort.mean_workflows,
                "mean_events": cohort.mean_events,
                "share_of_active_users": share,
            }),
            support: cohort.cohort_size,
            derived_at,
        });
    }

    if adoption.support >= SUGGESTION_MIN_SUPPORT {
        if let Some(mean) = adoption.mean_confidence {
            advisories.push(LearnedAdvisory {
                key: SUGGESTION_MIN_CONFIDENCE.to_string(),
                value: json!(mean),
                support: adoption.support,
                derived_at,
            });
        }
    }

    advisories
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adoption_threshold_requires_ten_adoptions() {
        let cohort = CohortStats {
            cohort_size: 0,
            active_users: 40,
            mean_workflows: 0.0,
            mean_events: 0.0,
        };
        let thin = AdoptionStats {
            support: 9,
            mean_confidence: Some(0.9),
        };
        assert!(derive_advisories(&cohort, &thin, crate::now_utc()).is_empty());

        let enough = AdoptionStats {
            support: 10,
            mean_confidence: Some(0.82),
        };
        let advisories = derive_advisories(&cohort, &enough, crate::now_utc());
        assert_eq!(advisories.len(), 1);
        assert_eq!(advisories[0].key, SUGGESTION_MIN_CONFIDENCE);
        assert_eq!(advisories[0].value, json!(0.82));
        assert_eq!(advisories[0].support, 10);
    }

    #[test]
    fn high_performer_profile_reports_cohort_share() {
        let cohort = CohortStats {
            cohort_size: 5,
            active_users: 20,
            mean_workflows: 4.4,
            mean_events: 130.0,
        };
        let adoption = AdoptionStats {
            support: 0,
            mean_confidence: None,
        };
        let advisories = derive_advisories(&cohort, &adoption, crate::now_utc());
        assert_eq!(advisories.len(), 1);
        assert_eq!(advisories[0].key, HIGH_PERFORMER_PROFILE);
        assert_eq!(advisories[0].value["share_of_active_users"], json!(0.25));
    }
}
