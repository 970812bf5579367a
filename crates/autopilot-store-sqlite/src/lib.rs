#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use autopilot_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ActionId, ActionKind, ActionOutcome,
    ActionResult, Alert, AlertSeverity, CycleReport, CycleSummary, CycleSummaryRow, KpiName,
    LearnedAdvisory,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

pub mod fixtures;
pub mod handlers;
pub mod metrics;

pub use handlers::{CampaignAudience, CampaignRequest, FailedPayment, HandlerWrite};
pub use metrics::MetricParams;

const OPERATIONAL_MIGRATION_VERSION: i64 = 1;
const CONTROL_MIGRATION_VERSION: i64 = 2;

const SCHEMA_OPERATIONAL_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  email TEXT,
  full_name TEXT,
  signup_at TEXT NOT NULL,
  referred_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_users_signup ON users(signup_at);

CREATE TABLE IF NOT EXISTS events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  event_type TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  dwell_seconds INTEGER CHECK (dwell_seconds >= 0 OR dwell_seconds IS NULL)
);

CREATE INDEX IF NOT EXISTS idx_events_user_time ON events(user_id, occurred_at);
CREATE INDEX IF NOT EXISTS idx_events_time ON events(occurred_at);

CREATE TABLE IF NOT EXISTS workflows (
  workflow_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workflows_user ON workflows(user_id);

CREATE TABLE IF NOT EXISTS suggestions (
  suggestion_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  status TEXT NOT NULL CHECK (status IN ('pending', 'applied', 'dismissed')),
  created_at TEXT NOT NULL,
  applied_at TEXT
);

CREATE TABLE IF NOT EXISTS subscriptions (
  subscription_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  price REAL NOT NULL CHECK (price >= 0.0),
  billing_interval TEXT NOT NULL CHECK (billing_interval IN ('month', 'year')),
  status TEXT NOT NULL CHECK (status IN ('active', 'past_due', 'canceled')),
  started_at TEXT NOT NULL,
  canceled_at TEXT,
  CHECK (status <> 'canceled' OR canceled_at IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_id);

CREATE TABLE IF NOT EXISTS payment_attempts (
  attempt_id TEXT PRIMARY KEY,
  subscription_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  amount REAL NOT NULL CHECK (amount >= 0.0),
  status TEXT NOT NULL CHECK (status IN ('succeeded', 'failed', 'retry_pending')),
  attempted_at TEXT NOT NULL,
  retried_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_payment_attempts_status_time
  ON payment_attempts(status, attempted_at);

CREATE TABLE IF NOT EXISTS outbound_messages (
  message_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  campaign TEXT NOT NULL,
  window_key TEXT NOT NULL,
  cycle_id TEXT NOT NULL,
  enqueued_at TEXT NOT NULL,
  UNIQUE (user_id, campaign, window_key)
);

CREATE TABLE IF NOT EXISTS ops_advisories (
  advisory_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  day TEXT NOT NULL,
  cycle_id TEXT NOT NULL,
  payload_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  UNIQUE (kind, day)
);
";

const SCHEMA_CONTROL_V1: &str = r"
CREATE TABLE IF NOT EXISTS cycle_reports (
  cycle_id TEXT PRIMARY KEY,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  dry_run INTEGER NOT NULL CHECK (dry_run IN (0, 1)),
  report_json TEXT NOT NULL,
  summary_json TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_cycle_reports_no_update
BEFORE UPDATE ON cycle_reports
BEGIN
  SELECT RAISE(FAIL, 'cycle_reports is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_cycle_reports_no_delete
BEFORE DELETE ON cycle_reports
BEGIN
  SELECT RAISE(FAIL, 'cycle_reports is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_cycle_reports_started ON cycle_reports(started_at);

CREATE TABLE IF NOT EXISTS action_outcomes (
  outcome_id TEXT PRIMARY KEY,
  cycle_id TEXT NOT NULL,
  action_id TEXT NOT NULL CHECK (
    action_id IN (
      'trigger_retention_campaign',
      'cleanup_orphan_subscriptions',
      'retry_failed_payments',
      'recommend_manual_review',
      'optimize_retention',
      'optimize_activation',
      'optimize_pricing_signal',
      'restart_service'
    )
  ),
  kind TEXT NOT NULL CHECK (kind IN ('REMEDIATE', 'OPTIMIZE')),
  executed INTEGER NOT NULL CHECK (executed IN (0, 1)),
  dry_run INTEGER NOT NULL CHECK (dry_run IN (0, 1)),
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  result TEXT NOT NULL CHECK (result IN ('SUCCESS', 'SKIPPED', 'FAILED')),
  reason TEXT,
  before_metric REAL,
  after_metric REAL,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  CHECK (executed = 1 OR result = 'SKIPPED')
);

CREATE TRIGGER IF NOT EXISTS trg_action_outcomes_no_update
BEFORE UPDATE ON action_outcomes
BEGIN
  SELECT RAISE(FAIL, 'action_outcomes is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_action_outcomes_no_delete
BEFORE DELETE ON action_outcomes
BEGIN
  SELECT RAISE(FAIL, 'action_outcomes is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_action_outcomes_cycle ON action_outcomes(cycle_id, started_at);

CREATE TABLE IF NOT EXISTS alerts (
  kpi TEXT NOT NULL,
  severity TEXT NOT NULL CHECK (severity IN ('WARNING', 'CRITICAL')),
  day TEXT NOT NULL,
  value REAL NOT NULL,
  threshold REAL NOT NULL,
  message TEXT NOT NULL,
  observed_at TEXT NOT NULL,
  PRIMARY KEY (kpi, severity, day)
);

CREATE TABLE IF NOT EXISTS learned_advisories (
  advisory_id TEXT PRIMARY KEY,
  key TEXT NOT NULL,
  value_json TEXT NOT NULL,
  support INTEGER NOT NULL CHECK (support >= 0),
  derived_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_learned_advisories_key ON learned_advisories(key, derived_at);
";

const OUTCOME_COLUMNS: &str = "outcome_id, cycle_id, action_id, kind, executed, dry_run, confidence,
     result, reason, before_metric, after_metric, started_at, ended_at";

/// Operational store plus the controller's own append-only history.
#[derive(Debug)]
pub struct SqliteOpsStore {
    conn: Connection,
}

/// Row of `ops_advisories`: a recommendation surfaced to operators.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct OpsAdvisory {
    pub kind: String,
    pub day: String,
    pub cycle_id: String,
    pub payload: Value,
    pub created_at: String,
}

impl SqliteOpsStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        for (version, schema, label) in [
            (OPERATIONAL_MIGRATION_VERSION, SCHEMA_OPERATIONAL_V1, "operational"),
            (CONTROL_MIGRATION_VERSION, SCHEMA_CONTROL_V1, "control"),
        ] {
            self.conn
                .execute_batch(schema)
                .with_context(|| format!("failed to apply {label} schema"))?;

            let now = timestamp(now_utc())?;
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                    params![version, now],
                )
                .with_context(|| format!("failed to register {label} schema migration"))?;
        }

        Ok(())
    }

    pub fn schema_versions(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        collect_rows(rows)
    }

    /// Cheap reachability probe over the controller tables. Fails when the
    /// history tables are missing or the connection is unusable.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT COUNT(*) FROM cycle_reports", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("store ping failed")?;
        Ok(())
    }

    /// Persists the report and every action outcome it carries in one
    /// transaction.
    pub fn insert_cycle_report(&mut self, report: &CycleReport) -> Result<()> {
        let report_json =
            serde_json::to_string(report).context("failed to serialize cycle report")?;
        let summary_json =
            serde_json::to_string(&report.summary).context("failed to serialize cycle summary")?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start cycle report transaction")?;

        tx.execute(
            "INSERT INTO cycle_reports(cycle_id, started_at, ended_at, dry_run, report_json, summary_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.cycle_id,
                timestamp(report.started_at)?,
                timestamp(report.ended_at)?,
                bool_to_sql(report.dry_run),
                report_json,
                summary_json,
            ],
        )
        .with_context(|| format!("failed to insert cycle report {}", report.cycle_id))?;

        for outcome in &report.actions {
            insert_outcome(&tx, outcome)?;
        }

        tx.commit().context("failed to commit cycle report transaction")?;
        Ok(())
    }

    pub fn insert_action_outcomes(&mut self, outcomes: &[ActionOutcome]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start action outcome transaction")?;
        for outcome in outcomes {
            insert_outcome(&tx, outcome)?;
        }
        tx.commit()
            .context("failed to commit action outcome transaction")?;
        Ok(())
    }

    pub fn get_cycle_report(&self, cycle_id: &str) -> Result<Option<CycleReport>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT report_json FROM cycle_reports WHERE cycle_id = ?1",
                params![cycle_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to load cycle report {cycle_id}"))?;

        raw.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("invalid stored cycle report JSON for {cycle_id}"))
        })
        .transpose()
    }

    /// Cycle summaries started at or after `since`, oldest first.
    pub fn list_cycle_summaries(&self, since: OffsetDateTime) -> Result<Vec<CycleSummaryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle_id, started_at, ended_at, dry_run, summary_json
             FROM cycle_reports
             WHERE started_at >= ?1
             ORDER BY started_at ASC, cycle_id ASC",
        )?;
        let rows = stmt.query_map(params![timestamp(since)?], parse_summary_row)?;
        collect_rows(rows)
    }

    pub fn latest_cycle_started_at(&self) -> Result<Option<OffsetDateTime>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT MAX(started_at) FROM cycle_reports", [], |row| {
                row.get(0)
            })
            .context("failed to read latest cycle start")?;
        raw.map(|value| parse_rfc3339_utc(&value).map_err(|err| anyhow!(err.to_string())))
            .transpose()
    }

    /// Outcomes for one cycle or monitor run, or every outcome when
    /// `cycle_id` is `None`.
    pub fn list_action_outcomes(&self, cycle_id: Option<&str>) -> Result<Vec<ActionOutcome>> {
        let query = match cycle_id {
            Some(_) => format!(
                "SELECT {OUTCOME_COLUMNS} FROM action_outcomes WHERE cycle_id = ?1
                 ORDER BY started_at ASC, rowid ASC"
            ),
            None => format!(
                "SELECT {OUTCOME_COLUMNS} FROM action_outcomes ORDER BY started_at ASC, rowid ASC"
            ),
        };
        let mut stmt = self.conn.prepare(&query)?;
        let rows = match cycle_id {
            Some(id) => stmt.query_map(params![id], parse_outcome_row)?,
            None => stmt.query_map([], parse_outcome_row)?,
        };
        collect_rows(rows)
    }

    /// Records an alert once per `(kpi, severity, day)`. A warning is not
    /// recorded when a critical alert already exists for the same KPI and
    /// day. Returns whether a new row was written.
    pub fn record_alert(&mut self, alert: &Alert) -> Result<bool> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start alert transaction")?;

        if alert.severity == AlertSeverity::Warning {
            let critical_exists: bool = tx
                .query_row(
                    "SELECT EXISTS(
                        SELECT 1 FROM alerts WHERE kpi = ?1 AND day = ?2 AND severity = 'CRITICAL'
                     )",
                    params![alert.kpi.as_str(), alert.day],
                    |row| row.get(0),
                )
                .context("failed to check existing critical alert")?;
            if critical_exists {
                return Ok(false);
            }
        }

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO alerts(kpi, severity, day, value, threshold, message, observed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    alert.kpi.as_str(),
                    alert.severity.as_str(),
                    alert.day,
                    alert.current,
                    alert.threshold,
                    alert.message,
                    timestamp(alert.observed_at)?,
                ],
            )
            .context("failed to record alert")?;

        tx.commit().context("failed to commit alert transaction")?;
        Ok(inserted == 1)
    }

    /// Alerts whose day key is on or after `since_day` (`YYYY-MM-DD`).
    pub fn list_alerts(&self, since_day: Option<&str>) -> Result<Vec<Alert>> {
        let mut stmt = self.conn.prepare(
            "SELECT kpi, severity, day, value, threshold, message, observed_at
             FROM alerts
             WHERE day >= ?1
             ORDER BY day ASC, observed_at ASC, kpi ASC",
        )?;
        let rows = stmt.query_map(params![since_day.unwrap_or("")], parse_alert_row)?;
        collect_rows(rows)
    }

    pub fn append_learned_advisories(&mut self, advisories: &[LearnedAdvisory]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start learned advisory transaction")?;
        for advisory in advisories {
            tx.execute(
                "INSERT INTO learned_advisories(advisory_id, key, value_json, support, derived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Ulid::new().to_string(),
                    advisory.key,
                    serde_json::to_string(&advisory.value)
                        .context("failed to serialize advisory value")?,
                    i64::try_from(advisory.support).context("advisory support overflow")?,
                    timestamp(advisory.derived_at)?,
                ],
            )
            .with_context(|| format!("failed to append learned advisory {}", advisory.key))?;
        }
        tx.commit()
            .context("failed to commit learned advisory transaction")?;
        Ok(())
    }

    /// Learned advisories, newest derivation per key when `latest_only`.
    pub fn list_learned_advisories(&self, latest_only: bool) -> Result<Vec<LearnedAdvisory>> {
        let query = if latest_only {
            "SELECT key, value_json, support, derived_at
             FROM learned_advisories AS la
             WHERE derived_at = (
               SELECT MAX(derived_at) FROM learned_advisories WHERE key = la.key
             )
             GROUP BY key
             ORDER BY key ASC"
        } else {
            "SELECT key, value_json, support, derived_at
             FROM learned_advisories
             ORDER BY derived_at ASC, key ASC"
        };
        let mut stmt = self.conn.prepare(query)?;
        let rows = stmt.query_map([], parse_learned_row)?;
        collect_rows(rows)
    }

    pub fn list_ops_advisories(&self) -> Result<Vec<OpsAdvisory>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, day, cycle_id, payload_json, created_at
             FROM ops_advisories
             ORDER BY day ASC, kind ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let payload_raw: String = row.get(3)?;
            let payload = serde_json::from_str(&payload_raw)
                .map_err(|err| conversion_error(3, rusqlite::types::Type::Text, err.to_string()))?;
            Ok(OpsAdvisory {
                kind: row.get(0)?,
                day: row.get(1)?,
                cycle_id: row.get(2)?,
                payload,
                created_at: row.get(4)?,
            })
        })?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn insert_outcome(tx: &rusqlite::Transaction<'_>, outcome: &ActionOutcome) -> Result<()> {
    tx.execute(
        "INSERT INTO action_outcomes(
            outcome_id, cycle_id, action_id, kind, executed, dry_run, confidence,
            result, reason, before_metric, after_metric, started_at, ended_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            outcome.id.to_string(),
            outcome.cycle_id,
            outcome.action_id.as_str(),
            kind_to_sql(outcome.kind),
            bool_to_sql(outcome.executed),
            bool_to_sql(outcome.dry_run),
            outcome.confidence,
            outcome.result.as_str(),
            outcome.reason,
            outcome.before_metric,
            outcome.after_metric,
            timestamp(outcome.started_at)?,
            timestamp(outcome.ended_at)?,
        ],
    )
    .with_context(|| {
        format!(
            "failed to insert outcome {} for {}",
            outcome.action_id, outcome.cycle_id
        )
    })?;
    Ok(())
}

fn parse_outcome_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionOutcome> {
    let id_raw: String = row.get(0)?;
    let action_raw: String = row.get(2)?;
    let kind_raw: String = row.get(3)?;
    let executed: i64 = row.get(4)?;
    let dry_run: i64 = row.get(5)?;
    let result_raw: String = row.get(7)?;

    let id = Ulid::from_string(&id_raw).map_err(|err| {
        conversion_error(0, rusqlite::types::Type::Text, format!("invalid outcome_id: {err}"))
    })?;
    let action_id = ActionId::parse(&action_raw).ok_or_else(|| {
        conversion_error(
            2,
            rusqlite::types::Type::Text,
            format!("invalid action_id: {action_raw}"),
        )
    })?;
    let kind = match kind_raw.as_str() {
        "REMEDIATE" => ActionKind::Remediate,
        "OPTIMIZE" => ActionKind::Optimize,
        other => {
            return Err(conversion_error(
                3,
                rusqlite::types::Type::Text,
                format!("invalid kind: {other}"),
            ))
        }
    };
    let result = ActionResult::parse(&result_raw).ok_or_else(|| {
        conversion_error(
            7,
            rusqlite::types::Type::Text,
            format!("invalid result: {result_raw}"),
        )
    })?;

    Ok(ActionOutcome {
        id,
        cycle_id: row.get(1)?,
        action_id,
        kind,
        executed: executed != 0,
        dry_run: dry_run != 0,
        confidence: row.get(6)?,
        result,
        reason: row.get(8)?,
        before_metric: row.get(9)?,
        after_metric: row.get(10)?,
        started_at: parse_timestamp_column(row, 11)?,
        ended_at: parse_timestamp_column(row, 12)?,
    })
}

fn parse_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CycleSummaryRow> {
    let dry_run: i64 = row.get(3)?;
    let summary_raw: String = row.get(4)?;
    let summary: CycleSummary = serde_json::from_str(&summary_raw).map_err(|err| {
        conversion_error(
            4,
            rusqlite::types::Type::Text,
            format!("invalid summary_json: {err}"),
        )
    })?;
    Ok(CycleSummaryRow {
        cycle_id: row.get(0)?,
        started_at: parse_timestamp_column(row, 1)?,
        ended_at: parse_timestamp_column(row, 2)?,
        dry_run: dry_run != 0,
        summary,
    })
}

fn parse_alert_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    let kpi_raw: String = row.get(0)?;
    let severity_raw: String = row.get(1)?;
    let kpi = KpiName::parse(&kpi_raw).ok_or_else(|| {
        conversion_error(0, rusqlite::types::Type::Text, format!("invalid kpi: {kpi_raw}"))
    })?;
    let severity = AlertSeverity::parse(&severity_raw).ok_or_else(|| {
        conversion_error(
            1,
            rusqlite::types::Type::Text,
            format!("invalid severity: {severity_raw}"),
        )
    })?;
    Ok(Alert {
        kpi,
        severity,
        day: row.get(2)?,
        current: row.get(3)?,
        threshold: row.get(4)?,
        message: row.get(5)?,
        observed_at: parse_timestamp_column(row, 6)?,
    })
}

fn parse_learned_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LearnedAdvisory> {
    let value_raw: String = row.get(1)?;
    let support_i64: i64 = row.get(2)?;
    let value = serde_json::from_str(&value_raw).map_err(|err| {
        conversion_error(
            1,
            rusqlite::types::Type::Text,
            format!("invalid value_json: {err}"),
        )
    })?;
    let support = u64::try_from(support_i64).map_err(|_| {
        conversion_error(
            2,
            rusqlite::types::Type::Integer,
            format!("invalid support: {support_i64}"),
        )
    })?;
    Ok(LearnedAdvisory {
        key: row.get(0)?,
        value,
        support,
        derived_at: parse_timestamp_column(row, 3)?,
    })
}

fn parse_timestamp_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw)
        .map_err(|err| conversion_error(index, rusqlite::types::Type::Text, err.to_string()))
}

fn conversion_error(
    index: usize,
    column_type: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn kind_to_sql(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Remediate => "REMEDIATE",
        ActionKind::Optimize => "OPTIMIZE",
    }
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

pub(crate) fn timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

pub(crate) fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use autopilot_core::{utc_day, PhaseName, PhaseOutcome, PhaseStatus};
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

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

    fn at(raw: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(raw) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn fixture_outcome(cycle_id: &str, action_id: ActionId, result: ActionResult) -> ActionOutcome {
        let started = at("2026-02-07T12:00:00Z");
        ActionOutcome {
            id: Ulid::new(),
            cycle_id: cycle_id.to_string(),
            action_id,
            kind: action_id.spec().kind,
            executed: result != ActionResult::Skipped,
            dry_run: false,
            confidence: 0.9,
            before_metric: Some(10.0),
            after_metric: None,
            result,
            reason: None,
            started_at: started,
            ended_at: started,
        }
    }

    fn fixture_report(cycle_id: &str, started: &str) -> CycleReport {
        let started_at = at(started);
        let mut phase_results = BTreeMap::new();
        phase_results.insert(
            PhaseName::Analyze,
            PhaseOutcome {
                status: PhaseStatus::Completed,
                started_at,
                ended_at: started_at,
                duration_ms: 3,
                error: None,
                detail: json!({"issues": 0}),
                partial: None,
            },
        );
        CycleReport {
            cycle_id: cycle_id.to_string(),
            started_at,
            ended_at: started_at,
            dry_run: false,
            confirmations: Vec::new(),
            phase_results,
            actions: vec![fixture_outcome(
                cycle_id,
                ActionId::CleanupOrphanSubscriptions,
                ActionResult::Success,
            )],
            config_warnings: Vec::new(),
            summary: CycleSummary {
                issues_found: 1,
                issues_healed: 1,
                optimizations_applied: 0,
                patterns_learned: 0,
                health_score: Some(90.0),
                alignment_score: Some(72.5),
            },
        }
    }

    fn fixture_alert(kpi: KpiName, severity: AlertSeverity) -> Alert {
        let observed_at = at("2026-02-07T12:00:00Z");
        Alert {
            kpi,
            severity,
            current: 0.1,
            threshold: 0.2,
            message: format!("{kpi} breached"),
            observed_at,
            day: must(utc_day(observed_at).map_err(|err| anyhow!(err.to_string()))),
        }
    }

    #[test]
    fn migration_registers_both_versions_and_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        assert_eq!(must(store.schema_versions()), vec![1, 2]);
        must(store.ping());
    }

    #[test]
    fn cycle_report_round_trips_with_its_outcomes() {
        let mut store = fixture_store();
        let report = fixture_report("cycle_a", "2026-02-07T12:00:00Z");
        must(store.insert_cycle_report(&report));

        let loaded = must(store.get_cycle_report("cycle_a"));
        assert_eq!(loaded.as_ref(), Some(&report));

        let outcomes = must(store.list_action_outcomes(Some("cycle_a")));
        assert_eq!(outcomes, report.actions);
        assert!(must(store.get_cycle_report("missing")).is_none());
    }

    #[test]
    fn append_only_triggers_block_updates_and_deletes() {
        let mut store = fixture_store();
        must(store.insert_cycle_report(&fixture_report("cycle_a", "2026-02-07T12:00:00Z")));

        let update = store
            .connection()
            .execute("UPDATE cycle_reports SET dry_run = 1", []);
        assert!(update.is_err());
        let delete = store.connection().execute("DELETE FROM action_outcomes", []);
        assert!(delete.is_err());
    }

    #[test]
    fn duplicate_cycle_id_is_rejected_atomically() {
        let mut store = fixture_store();
        let report = fixture_report("cycle_a", "2026-02-07T12:00:00Z");
        must(store.insert_cycle_report(&report));
        assert!(store.insert_cycle_report(&report).is_err());
        assert_eq!(must(store.list_action_outcomes(None)).len(), 1);
    }

    #[test]
    fn cycle_summaries_are_filtered_by_start_time() {
        let mut store = fixture_store();
        must(store.insert_cycle_report(&fixture_report("cycle_a", "2026-02-01T00:00:00Z")));
        must(store.insert_cycle_report(&fixture_report("cycle_b", "2026-02-07T00:00:00Z")));

        let rows = must(store.list_cycle_summaries(at("2026-02-05T00:00:00Z")));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cycle_id, "cycle_b");
        assert_eq!(rows[0].summary.alignment_score, Some(72.5));
        assert_eq!(
            must(store.latest_cycle_started_at()),
            Some(at("2026-02-07T00:00:00Z"))
        );
    }

    #[test]
    fn monitor_outcomes_persist_without_a_cycle_row() {
        let mut store = fixture_store();
        let outcome = fixture_outcome(
            "monitor_20260207T120000.000000Z",
            ActionId::CleanupOrphanSubscriptions,
            ActionResult::Success,
        );
        must(store.insert_action_outcomes(std::slice::from_ref(&outcome)));
        assert_eq!(
            must(store.list_action_outcomes(Some("monitor_20260207T120000.000000Z"))),
            vec![outcome]
        );
    }

    #[test]
    fn unexecuted_outcome_must_be_recorded_as_skipped() {
        let mut store = fixture_store();
        let mut outcome =
            fixture_outcome("cycle_x", ActionId::RetryFailedPayments, ActionResult::Failed);
        outcome.executed = false;
        assert!(store.insert_action_outcomes(&[outcome]).is_err());
    }

    #[test]
    fn alerts_dedupe_per_day_and_critical_supersedes_warning() {
        let mut store = fixture_store();
        let critical = fixture_alert(KpiName::D7Retention, AlertSeverity::Critical);
        let warning = fixture_alert(KpiName::D7Retention, AlertSeverity::Warning);

        assert!(must(store.record_alert(&critical)));
        assert!(!must(store.record_alert(&critical)));
        assert!(!must(store.record_alert(&warning)));

        let other = fixture_alert(KpiName::ChurnRate, AlertSeverity::Warning);
        assert!(must(store.record_alert(&other)));

        let listed = must(store.list_alerts(Some("2026-02-07")));
        assert_eq!(listed.len(), 2);
        assert!(must(store.list_alerts(Some("2026-02-08"))).is_empty());
    }

    #[test]
    fn learned_advisories_keep_history_and_list_latest() {
        let mut store = fixture_store();
        let first = LearnedAdvisory {
            key: "suggestion_min_confidence".to_string(),
            value: json!(0.7),
            support: 12,
            derived_at: at("2026-02-01T00:00:00Z"),
        };
        let second = LearnedAdvisory {
            value: json!(0.8),
            support: 20,
            derived_at: at("2026-02-02T00:00:00Z"),
            ..first.clone()
        };
        must(store.append_learned_advisories(&[first]));
        must(store.append_learned_advisories(std::slice::from_ref(&second)));

        assert_eq!(must(store.list_learned_advisories(false)).len(), 2);
        assert_eq!(must(store.list_learned_advisories(true)), vec![second]);
    }

    #[test]
    fn ping_fails_when_history_table_is_gone() {
        let store = fixture_store();
        must(
            store
                .connection()
                .execute_batch(
                    "DROP TRIGGER trg_cycle_reports_no_update;
                     DROP TRIGGER trg_cycle_reports_no_delete;
                     DROP TABLE cycle_reports;",
                )
                .map_err(anyhow::Error::from),
        );
        assert!(store.ping().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_alert_rows_never_exceed_one_per_kpi_and_day(
            stream in prop::collection::vec((0usize..4, any::<bool>()), 1..40)
        ) {
            let mut store = fixture_store();
            let kpis = [
                KpiName::ActivationRate,
                KpiName::D7Retention,
                KpiName::ChurnRate,
                KpiName::Mrr,
            ];
            for (index, critical) in &stream {
                let severity = if *critical {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Warning
                };
                must(store.record_alert(&fixture_alert(kpis[*index], severity)));
            }

            let listed = must(store.list_alerts(None));
            let mut per_kpi: BTreeMap<KpiName, Vec<AlertSeverity>> = BTreeMap::new();
            for alert in listed {
                per_kpi.entry(alert.kpi).or_default().push(alert.severity);
            }
            for severities in per_kpi.values() {
                prop_assert!(severities.len() <= 2);
                if severities.len() == 2 {
                    // A warning recorded first can coexist with a later critical.
                    prop_assert!(severities.contains(&AlertSeverity::Critical));
                }
            }
        }
    }
}
