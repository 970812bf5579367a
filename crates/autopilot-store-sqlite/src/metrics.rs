//! Read-only KPI computation over the operational tables.
//!
//! Every KPI is computed independently: a failing query marks that KPI
//! unavailable and the snapshot still completes. When the caller's deadline
//! expires the remaining KPIs are marked unavailable and the snapshot is
//! flagged as truncated.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use autopilot_core::{
    AdoptionStats, CacheStatus, CohortStats, ControllerConfig, Deadline, KpiMeasurement, KpiName,
    KpiSnapshot, LivenessReport, OperationalSignals, WindowDays,
};
use rusqlite::params;
use time::{Duration, OffsetDateTime};

use crate::{count, timestamp, SqliteOpsStore};

/// Events that count as activation. `suggestion_viewed` only counts with a
/// dwell above 30 seconds.
pub(crate) const ACTIVATION_PREDICATE: &str = "(e.event_type IN (
        'workflow_created',
        'suggestion_applied',
        'onboarding_completed',
        'integration_configured'
    ) OR (e.event_type = 'suggestion_viewed' AND COALESCE(e.dwell_seconds, 0) > 30))";

const BOT_EVENTS_PER_MINUTE: i64 = 60;
const DATA_QUALITY_PENALTY: f64 = 20.0;
const HIGH_PERFORMER_MIN_WORKFLOWS: i64 = 3;
const HIGH_PERFORMER_MIN_EVENTS: i64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct MetricParams {
    pub expected_lifetime_months: f64,
    pub cac: Option<f64>,
    pub ingestion_window_minutes: u64,
    pub cache_status: CacheStatus,
    pub cache_optional: bool,
}

impl MetricParams {
    #[must_use]
    pub fn from_config(config: &ControllerConfig, cache_status: CacheStatus) -> Self {
        Self {
            expected_lifetime_months: config.expected_lifetime_months,
            cac: config.cac,
            ingestion_window_minutes: config.ingestion_window_minutes,
            cache_status,
            cache_optional: config.cache_optional,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Revenue {
    mrr: f64,
    subscriptions: u64,
    paying_users: u64,
}

struct Window {
    start_at: OffsetDateTime,
    start: String,
    end: String,
    as_of: OffsetDateTime,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: u64, denominator: u64, empty_reason: &str) -> KpiMeasurement {
    if denominator == 0 {
        return KpiMeasurement::unavailable(empty_reason);
    }
    KpiMeasurement::available(numerator as f64 / denominator as f64, denominator)
}

impl SqliteOpsStore {
    /// Computes the full KPI catalog for the window ending at `as_of`.
    #[must_use]
    pub fn kpi_snapshot(
        &self,
        window: WindowDays,
        as_of: OffsetDateTime,
        params: &MetricParams,
        deadline: &Deadline,
    ) -> KpiSnapshot {
        let window_start = as_of - window.duration();
        let mut kpis = BTreeMap::new();
        let mut truncated = false;

        let bounds = match (timestamp(window_start), timestamp(as_of)) {
            (Ok(start), Ok(end)) => Some(Window {
                start_at: window_start,
                start,
                end,
                as_of,
            }),
            _ => None,
        };

        for name in KpiName::ALL {
            if deadline.expired() {
                truncated = true;
                kpis.insert(name, KpiMeasurement::unavailable("deadline_exceeded"));
                continue;
            }
            let measurement = match &bounds {
                Some(bounds) => self.measure(name, bounds, params).unwrap_or_else(|err| {
                    KpiMeasurement::unavailable(format!("query_failed: {err:#}"))
                }),
                None => KpiMeasurement::unavailable("invalid_window"),
            };
            kpis.insert(name, measurement);
        }

        let signals = match &bounds {
            Some(bounds) if !deadline.expired() => OperationalSignals {
                orphan_subscriptions: self.orphan_subscription_count().ok(),
                failed_payments_7d: self.failed_payment_count(bounds.as_of).ok(),
                liveness: Some(self.liveness(bounds.as_of, params)),
            },
            _ => {
                truncated = true;
                OperationalSignals {
                    orphan_subscriptions: None,
                    failed_payments_7d: None,
                    liveness: None,
                }
            }
        };

        KpiSnapshot {
            window_start,
            window_end: as_of,
            window_days: window,
            kpis,
            signals,
            truncated,
        }
    }

    fn measure(
        &self,
        name: KpiName,
        window: &Window,
        params: &MetricParams,
    ) -> Result<KpiMeasurement> {
        match name {
            KpiName::ActivationRate => self.activation_rate(window),
            KpiName::D1Retention => self.retention(window.as_of, 1),
            KpiName::D7Retention => self.retention(window.as_of, 7),
            KpiName::D30Retention => self.retention(window.as_of, 30),
            KpiName::SignupToActivation => self.signup_to_activation(window),
            KpiName::ActivationToSubscription => self.activation_to_subscription(window),
            KpiName::Mrr => {
                let revenue = self.revenue_at(window.as_of)?;
                Ok(KpiMeasurement::available(revenue.mrr, revenue.subscriptions))
            }
            KpiName::MrrGrowthMom => self.mrr_growth(window.as_of),
            KpiName::Ltv => self.ltv(window.as_of, params),
            KpiName::Cac => Ok(cac(params)),
            KpiName::LtvCacRatio => {
                let ltv = self.ltv(window.as_of, params)?;
                Ok(match (ltv.value(), cac(params).value()) {
                    (Some(ltv), Some(cac)) if cac.value > 0.0 => {
                        KpiMeasurement::available(ltv.value / cac.value, ltv.sample_size)
                    }
                    (None, _) => KpiMeasurement::unavailable("ltv_unavailable"),
                    _ => KpiMeasurement::unavailable("cac_not_configured"),
                })
            }
            KpiName::ViralCoefficient => self.viral_coefficient(window),
            KpiName::ChurnRate => self.churn_rate(window),
            KpiName::Dau => self.active_users(window.as_of, Duration::days(1)),
            KpiName::Wau => self.active_users(window.as_of, Duration::days(7)),
            KpiName::Mau => self.active_users(window.as_of, Duration::days(30)),
            KpiName::DataQualityScore => self.data_quality(window),
            KpiName::SystemLiveness => {
                let report = self.liveness(window.as_of, params);
                let value = if report.healthy() { 1.0 } else { 0.0 };
                Ok(KpiMeasurement::available(value, 3))
            }
        }
    }

    fn activation_rate(&self, window: &Window) -> Result<KpiMeasurement> {
        let query = format!(
            "SELECT COUNT(*), COALESCE(SUM(EXISTS(
                SELECT 1 FROM events e
                WHERE e.user_id = u.user_id AND e.occurred_at <= ?2 AND {ACTIVATION_PREDICATE}
             )), 0)
             FROM users u
             WHERE u.signup_at >= ?1 AND u.signup_at <= ?2"
        );
        let (signups, activated) = self.pair(&query, &window.start, &window.end)?;
        Ok(ratio(activated, signups, "no_signups_in_window"))
    }

    fn signup_to_activation(&self, window: &Window) -> Result<KpiMeasurement> {
        let query = format!(
            "SELECT COUNT(*), COALESCE(SUM(EXISTS(
                SELECT 1 FROM events e
                WHERE e.user_id = u.user_id
                  AND e.occurred_at >= u.signup_at
                  AND e.occurred_at <= ?2
                  AND julianday(e.occurred_at) <= julianday(u.signup_at) + 7
                  AND {ACTIVATION_PREDICATE}
             )), 0)
             FROM users u
             WHERE u.signup_at >= ?1 AND u.signup_at <= ?2"
        );
        let (signups, activated) = self.pair(&query, &window.start, &window.end)?;
        Ok(ratio(activated, signups, "no_signups_in_window"))
    }

    fn activation_to_subscription(&self, window: &Window) -> Result<KpiMeasurement> {
        let query = format!(
            "SELECT COUNT(*), COALESCE(SUM(EXISTS(
                SELECT 1 FROM subscriptions s
                WHERE s.user_id = u.user_id AND s.started_at <= ?2
             )), 0)
             FROM users u
             WHERE u.signup_at >= ?1 AND u.signup_at <= ?2
               AND EXISTS(
                 SELECT 1 FROM events e
                 WHERE e.user_id = u.user_id AND e.occurred_at <= ?2 AND {ACTIVATION_PREDICATE}
               )"
        );
        let (activated, subscribed) = self.pair(&query, &window.start, &window.end)?;
        Ok(ratio(subscribed, activated, "no_activated_users"))
    }

    /// Share of the cohort that signed up between `N + 7` and `N` days ago
    /// with any event within `N` days of signup.
    fn retention(&self, as_of: OffsetDateTime, days: i64) -> Result<KpiMeasurement> {
        let cohort_start = timestamp(as_of - Duration::days(days + 7))?;
        let cohort_end = timestamp(as_of - Duration::days(days))?;
        let (cohort, retained): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(EXISTS(
                    SELECT 1 FROM events e
                    WHERE e.user_id = u.user_id
                      AND e.occurred_at >= u.signup_at
                      AND julianday(e.occurred_at) <= julianday(u.signup_at) + ?3
                 )), 0)
                 FROM users u
                 WHERE u.signup_at >= ?1 AND u.signup_at <= ?2",
                params![cohort_start, cohort_end, days],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .with_context(|| format!("failed to compute d{days} retention"))?;
        Ok(ratio(count(retained), count(cohort), "empty_cohort"))
    }

    fn revenue_at(&self, at: OffsetDateTime) -> Result<Revenue> {
        let at = timestamp(at)?;
        let (subscriptions, paying_users, mrr): (i64, i64, f64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT user_id), COALESCE(SUM(
                    CASE billing_interval WHEN 'year' THEN price / 12.0 ELSE price END
                 ), 0.0)
                 FROM subscriptions
                 WHERE started_at <= ?1 AND (canceled_at IS NULL OR canceled_at > ?1)",
                params![at],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("failed to compute recurring revenue")?;
        Ok(Revenue {
            mrr,
            subscriptions: count(subscriptions),
            paying_users: count(paying_users),
        })
    }

    fn mrr_growth(&self, as_of: OffsetDateTime) -> Result<KpiMeasurement> {
        let current = self.revenue_at(as_of)?;
        let previous = self.revenue_at(as_of - Duration::days(30))?;
        if previous.mrr <= 0.0 {
            return Ok(KpiMeasurement::unavailable("no_prior_revenue"));
        }
        Ok(KpiMeasurement::available(
            (current.mrr - previous.mrr) / previous.mrr,
            previous.subscriptions,
        ))
    }

    fn ltv(&self, as_of: OffsetDateTime, params: &MetricParams) -> Result<KpiMeasurement> {
        let revenue = self.revenue_at(as_of)?;
        if revenue.paying_users == 0 {
            return Ok(KpiMeasurement::unavailable("no_paying_users"));
        }
        #[allow(clippy::cast_precision_loss)]
        let per_user = revenue.mrr / revenue.paying_users as f64;
        Ok(KpiMeasurement::available(
            per_user * params.expected_lifetime_months,
            revenue.paying_users,
        ))
    }

    fn viral_coefficient(&self, window: &Window) -> Result<KpiMeasurement> {
        let (referred, active): (i64, i64) = self
            .conn
            .query_row(
                "SELECT
                   (SELECT COUNT(*) FROM users
                    WHERE signup_at >= ?1 AND signup_at <= ?2 AND referred_by IS NOT NULL),
                   (SELECT COUNT(DISTINCT user_id) FROM events
                    WHERE occurred_at >= ?1 AND occurred_at <= ?2)",
                params![window.start, window.end],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to compute viral coefficient")?;
        Ok(ratio(count(referred), count(active), "no_active_users"))
    }

    fn churn_rate(&self, window: &Window) -> Result<KpiMeasurement> {
        let active_at_start = self.revenue_at(window.start_at)?.subscriptions;
        let canceled: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM subscriptions
                 WHERE canceled_at IS NOT NULL AND canceled_at > ?1 AND canceled_at <= ?2",
                params![window.start, window.end],
                |row| row.get(0),
            )
            .context("failed to count cancellations")?;
        Ok(ratio(count(canceled), active_at_start, "no_active_subscriptions_at_start"))
    }

    #[allow(clippy::cast_precision_loss)]
    fn active_users(&self, as_of: OffsetDateTime, span: Duration) -> Result<KpiMeasurement> {
        let active: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(DISTINCT user_id) FROM events
                 WHERE occurred_at > ?1 AND occurred_at <= ?2",
                params![timestamp(as_of - span)?, timestamp(as_of)?],
                |row| row.get(0),
            )
            .context("failed to count active users")?;
        let active = count(active);
        Ok(KpiMeasurement::available(active as f64, active))
    }

    /// Starts at 100 and loses 20 points per failed check.
    fn data_quality(&self, window: &Window) -> Result<KpiMeasurement> {
        let users: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .context("failed to count users")?;
        let live_subscriptions: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM subscriptions WHERE status <> 'canceled'",
                [],
                |row| row.get(0),
            )
            .context("failed to count live subscriptions")?;
        let orphans = self.orphan_subscription_count()?;
        let duplicate_emails: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(
                   SELECT 1 FROM users WHERE email IS NOT NULL
                   GROUP BY lower(email) HAVING COUNT(*) > 1
                 )",
                [],
                |row| row.get(0),
            )
            .context("failed to check duplicate emails")?;
        let missing_email: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE email IS NULL OR trim(email) = '')",
                [],
                |row| row.get(0),
            )
            .context("failed to check missing emails")?;
        let events_in_window: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE occurred_at >= ?1 AND occurred_at <= ?2",
                params![window.start, window.end],
                |row| row.get(0),
            )
            .context("failed to count events in window")?;
        let bot_like: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(
                   SELECT 1 FROM events
                   WHERE occurred_at >= ?1 AND occurred_at <= ?2
                   GROUP BY user_id, substr(occurred_at, 1, 16)
                   HAVING COUNT(*) > ?3
                 )",
                params![window.start, window.end, BOT_EVENTS_PER_MINUTE],
                |row| row.get(0),
            )
            .context("failed to check bot-like activity")?;

        #[allow(clippy::cast_precision_loss)]
        let orphan_share = if live_subscriptions == 0 {
            0.0
        } else {
            orphans as f64 / live_subscriptions as f64
        };

        let failed_checks = [
            orphan_share > 0.0,
            duplicate_emails,
            missing_email,
            events_in_window == 0,
            bot_like,
        ]
        .into_iter()
        .filter(|failed| *failed)
        .count();

        #[allow(clippy::cast_precision_loss)]
        let score = (100.0 - DATA_QUALITY_PENALTY * failed_checks as f64).max(0.0);
        Ok(KpiMeasurement::available(score, count(users)))
    }

    pub(crate) fn orphan_subscription_count(&self) -> Result<u64> {
        let orphans: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM subscriptions s
                 WHERE s.status <> 'canceled'
                   AND NOT EXISTS (SELECT 1 FROM users u WHERE u.user_id = s.user_id)",
                [],
                |row| row.get(0),
            )
            .context("failed to count orphan subscriptions")?;
        Ok(count(orphans))
    }

    fn failed_payment_count(&self, as_of: OffsetDateTime) -> Result<u64> {
        let failed: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM payment_attempts
                 WHERE status IN ('failed', 'retry_pending')
                   AND attempted_at >= ?1 AND attempted_at <= ?2",
                params![timestamp(as_of - Duration::days(7))?, timestamp(as_of)?],
                |row| row.get(0),
            )
            .context("failed to count failed payments")?;
        Ok(count(failed))
    }

    /// Never fails: a store query that errors is itself a failed check.
    fn liveness(&self, as_of: OffsetDateTime, params: &MetricParams) -> LivenessReport {
        let ping = self
            .conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0));
        let ingestion = self.recent_ingestion(as_of, params.ingestion_window_minutes);
        let cache_ok = match params.cache_status {
            CacheStatus::Healthy => true,
            CacheStatus::Unhealthy => false,
            CacheStatus::NotConfigured => params.cache_optional,
        };
        LivenessReport {
            store_reachable: ping.is_ok() && ingestion.is_ok(),
            cache_status: params.cache_status,
            cache_ok,
            recent_ingestion_events: ingestion.unwrap_or(0),
        }
    }

    fn recent_ingestion(&self, as_of: OffsetDateTime, window_minutes: u64) -> Result<u64> {
        let minutes = i64::try_from(window_minutes).context("ingestion window out of range")?;
        let since = as_of
            .checked_sub(Duration::seconds(minutes.saturating_mul(60)))
            .context("ingestion window out of range")?;
        let recent: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE occurred_at >= ?1 AND occurred_at <= ?2",
                params![timestamp(since)?, timestamp(as_of)?],
                |row| row.get(0),
            )
            .context("failed to count recent ingestion")?;
        Ok(count(recent))
    }

    /// Users with more than three workflows and more than a hundred events
    /// in the window, relative to everyone active in the window.
    pub fn high_performer_cohort(
        &self,
        window: WindowDays,
        as_of: OffsetDateTime,
    ) -> Result<CohortStats> {
        let start = timestamp(as_of - window.duration())?;
        let end = timestamp(as_of)?;
        let (cohort_size, mean_workflows, mean_events): (i64, f64, f64) = self
            .conn
            .query_row(
                "WITH activity AS (
                   SELECT u.user_id,
                     (SELECT COUNT(*) FROM workflows w
                      WHERE w.user_id = u.user_id AND w.created_at <= ?2) AS workflows,
                     (SELECT COUNT(*) FROM events e
                      WHERE e.user_id = u.user_id
                        AND e.occurred_at >= ?1 AND e.occurred_at <= ?2) AS events
                   FROM users u
                 )
                 SELECT COUNT(*), COALESCE(AVG(workflows), 0.0), COALESCE(AVG(events), 0.0)
                 FROM activity
                 WHERE workflows > ?3 AND events > ?4",
                params![
                    start,
                    end,
                    HIGH_PERFORMER_MIN_WORKFLOWS,
                    HIGH_PERFORMER_MIN_EVENTS
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("failed to compute high performer cohort")?;
        let active_users: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(DISTINCT user_id) FROM events
                 WHERE occurred_at >= ?1 AND occurred_at <= ?2",
                params![start, end],
                |row| row.get(0),
            )
            .context("failed to count active users")?;
        Ok(CohortStats {
            cohort_size: count(cohort_size),
            active_users: count(active_users),
            mean_workflows,
            mean_events,
        })
    }

    pub fn suggestion_adoption(
        &self,
        window: WindowDays,
        as_of: OffsetDateTime,
    ) -> Result<AdoptionStats> {
        let (support, mean_confidence): (i64, Option<f64>) = self
            .conn
            .query_row(
                "SELECT COUNT(*), AVG(confidence) FROM suggestions
                 WHERE status = 'applied' AND applied_at >= ?1 AND applied_at <= ?2",
                params![timestamp(as_of - window.duration())?, timestamp(as_of)?],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to compute suggestion adoption")?;
        Ok(AdoptionStats {
            support: count(support),
            mean_confidence,
        })
    }

    fn pair(&self, query: &str, start: &str, end: &str) -> Result<(u64, u64)> {
        let (lhs, rhs): (i64, i64) = self
            .conn
            .query_row(query, params![start, end], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .context("failed to evaluate KPI query")?;
        Ok((count(lhs), count(rhs)))
    }
}

fn cac(params: &MetricParams) -> KpiMeasurement {
    match params.cac {
        Some(value) if value > 0.0 => KpiMeasurement::available(value, 1),
        _ => KpiMeasurement::unavailable("cac_not_configured"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use std::path::Path;

    use super::*;
    use crate::fixtures::SeedSubscription;
    use autopilot_core::parse_rfc3339_utc;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteOpsStore {
        let store = must(SqliteOpsStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn as_of() -> OffsetDateTime {
        match parse_rfc3339_utc("2026-03-01T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn params() -> MetricParams {
        MetricParams {
            expected_lifetime_months: 24.0,
            cac: Some(240.0),
            ingestion_window_minutes: 60,
            cache_status: CacheStatus::NotConfigured,
            cache_optional: true,
        }
    }

    fn snapshot(store: &SqliteOpsStore) -> KpiSnapshot {
        store.kpi_snapshot(WindowDays::MONTH, as_of(), &params(), &Deadline::unbounded())
    }

    #[test]
    fn activation_counts_qualifying_events_only() {
        let store = fixture_store();
        let signup = as_of() - Duration::days(3);
        for index in 0..10 {
            let user = format!("u-{index}");
            must(store.seed_user(&user, Some(&format!("{user}@example.com")), signup, None));
            let at = signup + Duration::hours(2);
            match index {
                0..=3 => must(store.seed_event(&user, "workflow_created", at, None)),
                4 => must(store.seed_event(&user, "suggestion_viewed", at, Some(45))),
                5 => must(store.seed_event(&user, "suggestion_viewed", at, Some(10))),
                _ => must(store.seed_event(&user, "login", at, None)),
            }
        }

        let snap = snapshot(&store);
        let Some(activation) = snap.value(KpiName::ActivationRate) else {
            panic!("activation should be available");
        };
        assert_eq!(activation.value, 0.5);
        assert_eq!(activation.sample_size, 10);
        assert_eq!(
            snap.value(KpiName::SignupToActivation).map(|v| v.value),
            Some(0.5)
        );
        assert!(!snap.truncated);
    }

    #[test]
    fn retention_uses_cohort_relative_to_as_of() {
        let store = fixture_store();
        let signup = as_of() - Duration::days(10);
        for index in 0..4 {
            let user = format!("u-{index}");
            must(store.seed_user(&user, Some(&format!("{user}@example.com")), signup, None));
            if index < 3 {
                must(store.seed_event(&user, "login", signup + Duration::days(6), None));
            }
        }

        let snap = snapshot(&store);
        assert_eq!(snap.value(KpiName::D7Retention).map(|v| v.value), Some(0.75));
        assert_eq!(snap.value(KpiName::D7Retention).map(|v| v.sample_size), Some(4));
        assert!(snap.value(KpiName::D30Retention).is_none());
    }

    #[test]
    fn revenue_normalizes_yearly_plans_and_derives_ltv_cac() {
        let store = fixture_store();
        let started = as_of() - Duration::days(10);
        must(store.seed_user("u-1", Some("u1@example.com"), started, None));
        must(store.seed_subscription(&SeedSubscription::monthly("sub-1", "u-1", 20.0, started)));

        let snap = snapshot(&store);
        assert_eq!(snap.value(KpiName::Mrr).map(|v| v.value), Some(20.0));
        assert_eq!(snap.value(KpiName::Ltv).map(|v| v.value), Some(480.0));
        assert_eq!(snap.value(KpiName::LtvCacRatio).map(|v| v.value), Some(2.0));
        assert!(snap.value(KpiName::MrrGrowthMom).is_none());

        must(store.seed_user("u-2", Some("u2@example.com"), started, None));
        must(store.seed_subscription(&SeedSubscription {
            billing_interval: "year",
            ..SeedSubscription::monthly("sub-2", "u-2", 120.0, started)
        }));
        let snap = snapshot(&store);
        assert_eq!(snap.value(KpiName::Mrr).map(|v| v.value), Some(30.0));
    }

    #[test]
    fn missing_cac_makes_ratio_unavailable() {
        let store = fixture_store();
        let snap = store.kpi_snapshot(
            WindowDays::MONTH,
            as_of(),
            &MetricParams {
                cac: None,
                ..params()
            },
            &Deadline::unbounded(),
        );
        assert!(matches!(
            snap.kpis.get(&KpiName::Cac),
            Some(KpiMeasurement::Unavailable { reason }) if reason == "cac_not_configured"
        ));
        assert!(snap.value(KpiName::LtvCacRatio).is_none());
    }

    #[test]
    fn data_quality_penalizes_each_failed_check() {
        let store = fixture_store();
        let signup = as_of() - Duration::days(2);
        must(store.seed_user("u-1", Some("dup@example.com"), signup, None));
        must(store.seed_user("u-2", Some("DUP@example.com"), signup, None));
        must(store.seed_event("u-1", "login", signup, None));

        let snap = snapshot(&store);
        assert_eq!(snap.value(KpiName::DataQualityScore).map(|v| v.value), Some(80.0));

        must(store.seed_subscription(&SeedSubscription::monthly(
            "sub-ghost",
            "ghost",
            10.0,
            signup,
        )));
        must(store.seed_user("u-3", None, signup, None));
        let snap = snapshot(&store);
        assert_eq!(snap.value(KpiName::DataQualityScore).map(|v| v.value), Some(40.0));
        assert_eq!(snap.signals.orphan_subscriptions, Some(1));
    }

    #[test]
    fn bot_like_bursts_reduce_data_quality() {
        let store = fixture_store();
        let signup = as_of() - Duration::days(2);
        must(store.seed_user("u-bot", Some("bot@example.com"), signup, None));
        for second in 0..61 {
            must(store.seed_event("u-bot", "click", signup + Duration::seconds(second % 59), None));
        }
        let snap = snapshot(&store);
        assert_eq!(snap.value(KpiName::DataQualityScore).map(|v| v.value), Some(80.0));
    }

    #[test]
    fn liveness_fails_without_recent_ingestion() {
        let store = fixture_store();
        must(store.seed_user("u-1", Some("u1@example.com"), as_of() - Duration::days(5), None));
        must(store.seed_event("u-1", "login", as_of() - Duration::days(2), None));

        let snap = snapshot(&store);
        assert_eq!(snap.value(KpiName::SystemLiveness).map(|v| v.value), Some(0.0));
        let Some(liveness) = snap.signals.liveness.as_ref() else {
            panic!("liveness should be reported");
        };
        assert_eq!(liveness.failed_checks(), vec!["no_recent_ingestion"]);

        must(store.seed_event("u-1", "login", as_of() - Duration::minutes(5), None));
        let snap = snapshot(&store);
        assert_eq!(snap.value(KpiName::SystemLiveness).map(|v| v.value), Some(1.0));
    }

    #[test]
    fn failing_store_query_is_reported_as_unreachable() {
        let store = fixture_store();
        must(store.seed_event("u-1", "login", as_of() - Duration::minutes(5), None));
        if let Err(err) = store.connection().execute_batch("DROP TABLE events") {
            panic!("failed to drop events: {err}");
        }

        let snap = snapshot(&store);
        assert_eq!(snap.value(KpiName::SystemLiveness).map(|v| v.value), Some(0.0));
        let Some(liveness) = snap.signals.liveness.as_ref() else {
            panic!("liveness should be reported when its queries fail");
        };
        assert!(!liveness.store_reachable);
        assert_eq!(
            liveness.failed_checks(),
            vec!["store_unreachable", "no_recent_ingestion"]
        );
    }

    #[test]
    fn required_cache_that_is_missing_degrades_liveness() {
        let store = fixture_store();
        must(store.seed_event("u-1", "login", as_of() - Duration::minutes(5), None));
        let snap = store.kpi_snapshot(
            WindowDays::DAY,
            as_of(),
            &MetricParams {
                cache_optional: false,
                ..params()
            },
            &Deadline::unbounded(),
        );
        assert_eq!(snap.value(KpiName::SystemLiveness).map(|v| v.value), Some(0.0));
    }

    #[test]
    fn failed_payments_count_last_seven_days() {
        let store = fixture_store();
        for index in 0..3 {
            must(store.seed_payment_attempt(
                &format!("pay-{index}"),
                "sub-1",
                "u-1",
                20.0,
                if index == 2 { "retry_pending" } else { "failed" },
                as_of() - Duration::days(1),
            ));
        }
        let stale = as_of() - Duration::days(9);
        must(store.seed_payment_attempt("pay-old", "sub-1", "u-1", 20.0, "failed", stale));
        assert_eq!(snapshot(&store).signals.failed_payments_7d, Some(3));
    }

    #[test]
    fn cancelled_deadline_truncates_the_snapshot() {
        let store = fixture_store();
        let deadline = Deadline::unbounded();
        deadline.cancel();
        let snap = store.kpi_snapshot(WindowDays::MONTH, as_of(), &params(), &deadline);
        assert!(snap.truncated);
        assert_eq!(snap.available_count(), 0);
        assert_eq!(snap.kpis.len(), KpiName::ALL.len());
        assert!(snap.signals.liveness.is_none());
    }

    #[test]
    fn learner_queries_report_cohort_and_adoption() {
        let store = fixture_store();
        let signup = as_of() - Duration::days(20);
        must(store.seed_user("u-power", Some("p@example.com"), signup, None));
        must(store.seed_user("u-casual", Some("c@example.com"), signup, None));
        for index in 0..4 {
            must(store.seed_workflow(&format!("wf-{index}"), "u-power", signup));
        }
        for minute in 0..101 {
            must(store.seed_event("u-power", "run", signup + Duration::minutes(minute), None));
        }
        must(store.seed_event("u-casual", "login", signup, None));
        for index in 0..10 {
            must(store.seed_suggestion(
                &format!("sg-{index}"),
                "u-power",
                0.8,
                "applied",
                signup,
                Some(signup + Duration::days(1)),
            ));
        }

        let cohort = must(store.high_performer_cohort(WindowDays::MONTH, as_of()));
        assert_eq!(cohort.cohort_size, 1);
        assert_eq!(cohort.active_users, 2);
        assert_eq!(cohort.mean_workflows, 4.0);

        let adoption = must(store.suggestion_adoption(WindowDays::MONTH, as_of()));
        assert_eq!(adoption.support, 10);
        assert!(adoption.mean_confidence.is_some_and(|c| (c - 0.8).abs() < 1e-9));
    }
}
