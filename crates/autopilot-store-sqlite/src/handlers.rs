//! Writes performed by action handlers. Each call runs in one transaction
//! and stops issuing statements once the caller's deadline has expired.

use anyhow::{Context, Result};
use autopilot_core::Deadline;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

use crate::metrics::ACTIVATION_PREDICATE;
use crate::{collect_rows, timestamp, SqliteOpsStore};

/// Lapse period for at-risk users and the signup horizon for activation
/// nudges.
const CAMPAIGN_LOOKBACK_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignAudience {
    /// Signed up more than a week ago, has history, but no events in the
    /// last seven days.
    AtRisk,
    /// Signed up within the last seven days and not yet activated.
    RecentNonActivated,
}

#[derive(Debug, Clone)]
pub struct CampaignRequest<'a> {
    pub campaign: &'a str,
    pub audience: CampaignAudience,
    /// Users contacted for this campaign within the last `window_days`
    /// before `as_of` are skipped.
    pub window_days: u32,
    /// Label stored with each new contact.
    pub window_key: &'a str,
    pub cycle_id: &'a str,
    pub as_of: OffsetDateTime,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HandlerWrite {
    pub eligible: u64,
    pub affected: u64,
    /// The deadline expired before every eligible row was written.
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedPayment {
    pub attempt_id: String,
    pub subscription_id: String,
    pub user_id: String,
    pub amount: f64,
    pub attempted_at: String,
}

impl SqliteOpsStore {
    pub fn enqueue_campaign(
        &mut self,
        request: &CampaignRequest<'_>,
        deadline: &Deadline,
    ) -> Result<HandlerWrite> {
        let horizon = timestamp(request.as_of - Duration::days(CAMPAIGN_LOOKBACK_DAYS))?;
        let contacted_since =
            timestamp(request.as_of - Duration::days(i64::from(request.window_days)))?;
        let as_of = timestamp(request.as_of)?;
        let query = match request.audience {
            CampaignAudience::AtRisk => "SELECT u.user_id FROM users u
                 WHERE u.signup_at <= ?1
                   AND EXISTS (SELECT 1 FROM events e WHERE e.user_id = u.user_id)
                   AND NOT EXISTS (
                     SELECT 1 FROM events e
                     WHERE e.user_id = u.user_id AND e.occurred_at > ?1 AND e.occurred_at <= ?2
                   )
                   AND NOT EXISTS (
                     SELECT 1 FROM outbound_messages m
                     WHERE m.user_id = u.user_id AND m.campaign = ?3 AND m.enqueued_at > ?4
                   )
                 ORDER BY u.user_id ASC"
                .to_string(),
            CampaignAudience::RecentNonActivated => format!(
                "SELECT u.user_id FROM users u
                 WHERE u.signup_at > ?1 AND u.signup_at <= ?2
                   AND NOT EXISTS (
                     SELECT 1 FROM events e
                     WHERE e.user_id = u.user_id AND e.occurred_at <= ?2 AND {ACTIVATION_PREDICATE}
                   )
                   AND NOT EXISTS (
                     SELECT 1 FROM outbound_messages m
                     WHERE m.user_id = u.user_id AND m.campaign = ?3 AND m.enqueued_at > ?4
                   )
                 ORDER BY u.user_id ASC"
            ),
        };

        let tx = self
            .conn
            .transaction()
            .context("failed to start campaign transaction")?;

        let candidates: Vec<String> = {
            let mut stmt = tx.prepare(&query)?;
            let rows = stmt.query_map(
                params![horizon, as_of, request.campaign, contacted_since],
                |row| row.get(0),
            )?;
            collect_rows(rows)?
        };

        let mut write = HandlerWrite {
            eligible: candidates.len() as u64,
            ..HandlerWrite::default()
        };

        for user_id in candidates.iter().take(request.limit as usize) {
            if deadline.expired() {
                write.truncated = true;
                break;
            }
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO outbound_messages(
                        message_id, user_id, campaign, window_key, cycle_id, enqueued_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        Ulid::new().to_string(),
                        user_id,
                        request.campaign,
                        request.window_key,
                        request.cycle_id,
                        as_of
                    ],
                )
                .with_context(|| format!("failed to enqueue {} for {user_id}", request.campaign))?;
            write.affected += inserted as u64;
        }

        tx.commit().context("failed to commit campaign transaction")?;
        Ok(write)
    }

    /// Cancels live subscriptions whose user no longer exists.
    pub fn cancel_orphan_subscriptions(
        &mut self,
        limit: u32,
        now: OffsetDateTime,
        deadline: &Deadline,
    ) -> Result<HandlerWrite> {
        let now = timestamp(now)?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start orphan cleanup transaction")?;

        let orphans: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT s.subscription_id FROM subscriptions s
                 WHERE s.status <> 'canceled'
                   AND NOT EXISTS (SELECT 1 FROM users u WHERE u.user_id = s.user_id)
                 ORDER BY s.subscription_id ASC",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            collect_rows(rows)?
        };

        let mut write = HandlerWrite {
            eligible: orphans.len() as u64,
            ..HandlerWrite::default()
        };

        for subscription_id in orphans.iter().take(limit as usize) {
            if deadline.expired() {
                write.truncated = true;
                break;
            }
            let changed = tx
                .execute(
                    "UPDATE subscriptions SET status = 'canceled', canceled_at = ?2
                     WHERE subscription_id = ?1 AND status <> 'canceled'",
                    params![subscription_id, now],
                )
                .with_context(|| format!("failed to cancel subscription {subscription_id}"))?;
            write.affected += changed as u64;
        }

        tx.commit()
            .context("failed to commit orphan cleanup transaction")?;
        Ok(write)
    }

    /// The most recent failed attempts from the last seven days that have
    /// not been retried, newest first.
    pub fn failed_payments_for_retry(
        &self,
        as_of: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<FailedPayment>> {
        let mut stmt = self.conn.prepare(
            "SELECT attempt_id, subscription_id, user_id, amount, attempted_at
             FROM payment_attempts
             WHERE status = 'failed' AND attempted_at >= ?1 AND attempted_at <= ?2
             ORDER BY attempted_at DESC, attempt_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                timestamp(as_of - Duration::days(CAMPAIGN_LOOKBACK_DAYS))?,
                timestamp(as_of)?,
                i64::from(limit)
            ],
            |row| {
                Ok(FailedPayment {
                    attempt_id: row.get(0)?,
                    subscription_id: row.get(1)?,
                    user_id: row.get(2)?,
                    amount: row.get(3)?,
                    attempted_at: row.get(4)?,
                })
            },
        )?;
        collect_rows(rows)
    }

    /// Moves resubmitted attempts to `retry_pending`. Attempts already moved
    /// are left alone.
    pub fn mark_payments_retried(
        &mut self,
        attempt_ids: &[String],
        now: OffsetDateTime,
    ) -> Result<u64> {
        let now = timestamp(now)?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start payment retry transaction")?;
        let mut changed = 0_u64;
        for attempt_id in attempt_ids {
            changed += tx
                .execute(
                    "UPDATE payment_attempts SET status = 'retry_pending', retried_at = ?2
                     WHERE attempt_id = ?1 AND status = 'failed'",
                    params![attempt_id, now],
                )
                .with_context(|| format!("failed to mark payment {attempt_id} retried"))?
                as u64;
        }
        tx.commit()
            .context("failed to commit payment retry transaction")?;
        Ok(changed)
    }

    /// Records an operator advisory once per `(kind, day)`. Returns whether
    /// a new row was written.
    pub fn emit_advisory(
        &mut self,
        kind: &str,
        day: &str,
        cycle_id: &str,
        payload: &Value,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start advisory transaction")?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO ops_advisories(advisory_id, kind, day, cycle_id, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Ulid::new().to_string(),
                    kind,
                    day,
                    cycle_id,
                    serde_json::to_string(payload).context("failed to serialize advisory payload")?,
                    timestamp(now)?,
                ],
            )
            .with_context(|| format!("failed to emit advisory {kind}"))?;
        tx.commit().context("failed to commit advisory transaction")?;
        Ok(inserted == 1)
    }
}
