//! Seeding and inspection helpers for the operational tables.
//!
//! The controller never writes users or events itself; these exist so tests
//! across the workspace can build a realistic store.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;

use ulid::Ulid;

use crate::{collect_rows, count, timestamp, SqliteOpsStore};

/// Everything outside the controller's own report, outcome and alert
/// history.
const DIGEST_TABLES: [&str; 9] = [
    "users",
    "events",
    "workflows",
    "suggestions",
    "subscriptions",
    "payment_attempts",
    "outbound_messages",
    "ops_advisories",
    "learned_advisories",
];

const COUNTABLE_TABLES: [&str; 12] = [
    "users",
    "events",
    "workflows",
    "suggestions",
    "subscriptions",
    "payment_attempts",
    "outbound_messages",
    "ops_advisories",
    "cycle_reports",
    "action_outcomes",
    "alerts",
    "learned_advisories",
];

#[derive(Debug, Clone)]
pub struct SeedSubscription<'a> {
    pub subscription_id: &'a str,
    pub user_id: &'a str,
    pub price: f64,
    pub billing_interval: &'a str,
    pub status: &'a str,
    pub started_at: OffsetDateTime,
    pub canceled_at: Option<OffsetDateTime>,
}

impl<'a> SeedSubscription<'a> {
    #[must_use]
    pub fn monthly(
        subscription_id: &'a str,
        user_id: &'a str,
        price: f64,
        started_at: OffsetDateTime,
    ) -> Self {
        Self {
            subscription_id,
            user_id,
            price,
            billing_interval: "month",
            status: "active",
            started_at,
            canceled_at: None,
        }
    }
}

impl SqliteOpsStore {
    pub fn seed_user(
        &self,
        user_id: &str,
        email: Option<&str>,
        signup_at: OffsetDateTime,
        referred_by: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO users(user_id, email, full_name, signup_at, referred_by)
                 VALUES (?1, ?2, NULL, ?3, ?4)",
                params![user_id, email, timestamp(signup_at)?, referred_by],
            )
            .with_context(|| format!("failed to seed user {user_id}"))?;
        Ok(())
    }

    pub fn seed_event(
        &self,
        user_id: &str,
        event_type: &str,
        occurred_at: OffsetDateTime,
        dwell_seconds: Option<i64>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO events(user_id, event_type, occurred_at, dwell_seconds)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, event_type, timestamp(occurred_at)?, dwell_seconds],
            )
            .with_context(|| format!("failed to seed {event_type} event for {user_id}"))?;
        Ok(())
    }

    pub fn seed_workflow(
        &self,
        workflow_id: &str,
        user_id: &str,
        created_at: OffsetDateTime,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workflows(workflow_id, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![workflow_id, user_id, timestamp(created_at)?],
            )
            .with_context(|| format!("failed to seed workflow {workflow_id}"))?;
        Ok(())
    }

    pub fn seed_suggestion(
        &self,
        suggestion_id: &str,
        user_id: &str,
        confidence: f64,
        status: &str,
        created_at: OffsetDateTime,
        applied_at: Option<OffsetDateTime>,
    ) -> Result<()> {
        let applied_at = applied_at.map(timestamp).transpose()?;
        self.conn
            .execute(
                "INSERT INTO suggestions(suggestion_id, user_id, confidence, status, created_at, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    suggestion_id,
                    user_id,
                    confidence,
                    status,
                    timestamp(created_at)?,
                    applied_at
                ],
            )
            .with_context(|| format!("failed to seed suggestion {suggestion_id}"))?;
        Ok(())
    }

    pub fn seed_subscription(&self, seed: &SeedSubscription<'_>) -> Result<()> {
        let canceled_at = seed.canceled_at.map(timestamp).transpose()?;
        self.conn
            .execute(
                "INSERT INTO subscriptions(
                    subscription_id, user_id, price, billing_interval, status, started_at, canceled_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    seed.subscription_id,
                    seed.user_id,
                    seed.price,
                    seed.billing_interval,
                    seed.status,
                    timestamp(seed.started_at)?,
                    canceled_at
                ],
            )
            .with_context(|| format!("failed to seed subscription {}", seed.subscription_id))?;
        Ok(())
    }

    pub fn seed_payment_attempt(
        &self,
        attempt_id: &str,
        subscription_id: &str,
        user_id: &str,
        amount: f64,
        status: &str,
        attempted_at: OffsetDateTime,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO payment_attempts(
                    attempt_id, subscription_id, user_id, amount, status, attempted_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attempt_id,
                    subscription_id,
                    user_id,
                    amount,
                    status,
                    timestamp(attempted_at)?
                ],
            )
            .with_context(|| format!("failed to seed payment attempt {attempt_id}"))?;
        Ok(())
    }

    /// A contact enqueued by an earlier run.
    pub fn seed_outbound_message(
        &self,
        user_id: &str,
        campaign: &str,
        window_key: &str,
        enqueued_at: OffsetDateTime,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO outbound_messages(
                    message_id, user_id, campaign, window_key, cycle_id, enqueued_at
                 ) VALUES (?1, ?2, ?3, ?4, 'seed', ?5)",
                params![
                    Ulid::new().to_string(),
                    user_id,
                    campaign,
                    window_key,
                    timestamp(enqueued_at)?
                ],
            )
            .with_context(|| format!("failed to seed {campaign} message for {user_id}"))?;
        Ok(())
    }

    pub fn count_rows(&self, table: &str) -> Result<u64> {
        if !COUNTABLE_TABLES.contains(&table) {
            return Err(anyhow!("unknown table: {table}"));
        }
        let rows: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count rows in {table}"))?;
        Ok(count(rows))
    }

    pub fn subscription_status(&self, subscription_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT status FROM subscriptions WHERE subscription_id = ?1",
                params![subscription_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read subscription {subscription_id}"))
    }

    pub fn subscription_price(&self, subscription_id: &str) -> Result<Option<f64>> {
        self.conn
            .query_row(
                "SELECT price FROM subscriptions WHERE subscription_id = ?1",
                params![subscription_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read subscription {subscription_id}"))
    }

    /// Attempt ids in `status`, ordered by id.
    pub fn payment_attempts_with_status(&self, status: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT attempt_id FROM payment_attempts WHERE status = ?1 ORDER BY attempt_id ASC",
        )?;
        let rows = stmt.query_map(params![status], |row| row.get(0))?;
        collect_rows(rows)
    }

    pub fn outbound_messages_for(&self, user_id: &str, campaign: &str) -> Result<u64> {
        let rows: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM outbound_messages WHERE user_id = ?1 AND campaign = ?2",
                params![user_id, campaign],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count {campaign} messages for {user_id}"))?;
        Ok(count(rows))
    }

    /// Deterministic dump of every row outside the controller history. Two
    /// digests are equal exactly when no such write happened in between.
    pub fn state_digest(&self) -> Result<String> {
        let mut digest = String::new();
        for table in DIGEST_TABLES {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT * FROM {table} ORDER BY rowid ASC"))?;
            let columns = stmt.column_count();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                digest.push_str(table);
                for index in 0..columns {
                    let value: rusqlite::types::Value = row.get(index)?;
                    digest.push('|');
                    digest.push_str(&format!("{value:?}"));
                }
                digest.push('\n');
            }
        }
        Ok(digest)
    }
}
