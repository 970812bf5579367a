#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use autopilot_controller::{AlertNotifier, CacheProbe, Controller, ControllerError};
use autopilot_core::{
    now_utc, ActionId, Alert, CacheStatus, ControllerConfig, PhaseDeadlines, PhaseName,
    PhaseStatus,
};
use autopilot_store_sqlite::fixtures::SeedSubscription;
use autopilot_store_sqlite::SqliteOpsStore;
use rusqlite::Connection;
use time::Duration;
use ulid::Ulid;

fn must<T, E: std::fmt::Display>(result: Result<T, E>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("{context}: {err}"),
    }
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("autopilot-{label}-{}.sqlite3", Ulid::new()))
}

fn seed_store(path: &Path) -> SqliteOpsStore {
    let store = must(SqliteOpsStore::open(path), "open seed store");
    must(store.migrate(), "migrate seed store");
    store
}

fn controller(path: &Path, config: ControllerConfig) -> Controller {
    let store = must(SqliteOpsStore::open(path), "open controller store");
    must(Controller::new(store, config), "build controller")
}

/// Orphans, a failed payment burst and a fresh cohort nobody activated.
fn seed_troubled_store(seed: &SqliteOpsStore) {
    let now = now_utc();
    for i in 0..3 {
        let id = format!("sub-orphan-{i}");
        let owner = format!("ghost-{i}");
        must(
            seed.seed_subscription(&SeedSubscription::monthly(
                &id,
                &owner,
                12.0,
                now - Duration::days(5),
            )),
            "seed orphan subscription",
        );
    }
    for i in 0..6_i64 {
        must(
            seed.seed_payment_attempt(
                &format!("pay-{i}"),
                &format!("sub-billing-{i}"),
                &format!("user-{i:02}"),
                25.0,
                "failed",
                now - Duration::hours(2 + i),
            ),
            "seed failed payment",
        );
    }
    for i in 0..30_i64 {
        let user_id = format!("user-{i:02}");
        let email = format!("user{i}@example.com");
        let signup_at = now - Duration::days(3) + Duration::minutes(i);
        must(
            seed.seed_user(&user_id, Some(email.as_str()), signup_at, None),
            "seed user",
        );
        must(
            seed.seed_event(&user_id, "page_viewed", signup_at + Duration::minutes(1), None),
            "seed event",
        );
    }
}

#[derive(Debug)]
struct SlowCache(StdDuration);

impl CacheProbe for SlowCache {
    fn probe(&self) -> CacheStatus {
        std::thread::sleep(self.0);
        CacheStatus::Healthy
    }
}

#[derive(Debug, Default)]
struct CountingNotifier {
    delivered: AtomicUsize,
}

impl AlertNotifier for CountingNotifier {
    fn notify(&self, _alert: &Alert, _recipients: &[String]) -> anyhow::Result<()> {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dry_run_leaves_business_state_untouched() {
    let db_path = temp_db("dry-run");
    let seed = seed_store(&db_path);
    seed_troubled_store(&seed);
    let before = must(seed.state_digest(), "digest before");

    let controller = controller(&db_path, ControllerConfig::default());
    let report = must(controller.run_cycle(true, BTreeSet::new()).await, "dry-run cycle");

    assert!(report.summary.issues_found > 0);
    assert!(report.actions.iter().all(|outcome| !outcome.executed));
    assert_eq!(must(seed.state_digest(), "digest after"), before);
    assert_eq!(must(seed.count_rows("cycle_reports"), "count reports"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_cycle_changes_nothing_the_first_already_fixed() {
    let db_path = temp_db("idempotent");
    let seed = seed_store(&db_path);
    seed_troubled_store(&seed);

    let controller = controller(&db_path, ControllerConfig::default());
    let first = must(controller.run_cycle(false, BTreeSet::new()).await, "first cycle");
    assert!(first.actions.iter().any(|outcome| outcome.succeeded()));
    assert!(must(seed.count_rows("outbound_messages"), "count messages") > 0);
    let after_first = must(seed.state_digest(), "digest after first");

    let second = must(controller.run_cycle(false, BTreeSet::new()).await, "second cycle");
    assert_ne!(first.cycle_id, second.cycle_id);
    assert!(
        second.actions.iter().all(|outcome| !outcome.succeeded()),
        "second cycle acted again: {:?}",
        second.actions
    );
    assert_eq!(must(seed.state_digest(), "digest after second"), after_first);
}

#[tokio::test(flavor = "multi_thread")]
async fn confidence_below_threshold_never_executes() {
    let db_path = temp_db("threshold");
    let seed = seed_store(&db_path);
    seed_troubled_store(&seed);

    let config = ControllerConfig {
        auto_remediate_threshold: 0.95,
        auto_optimize_threshold: 0.95,
        ..ControllerConfig::default()
    };
    let controller = controller(&db_path, config);
    let report = must(controller.run_cycle(false, BTreeSet::new()).await, "run cycle");

    let cleanups = report.outcomes_for(ActionId::CleanupOrphanSubscriptions);
    assert!(!cleanups.is_empty());
    for outcome in cleanups {
        assert!(!outcome.executed);
        assert_eq!(outcome.reason.as_deref(), Some("below_confidence_threshold"));
    }
    assert!(report.actions.iter().all(|outcome| !outcome.executed));
    for i in 0..3 {
        assert_eq!(
            must(seed.subscription_status(&format!("sub-orphan-{i}")), "read status").as_deref(),
            Some("active")
        );
    }
    assert_eq!(must(seed.count_rows("outbound_messages"), "count messages"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn alerts_are_recorded_and_notified_once_per_day() {
    let db_path = temp_db("alert-dedupe");
    let seed = seed_store(&db_path);
    seed_troubled_store(&seed);

    let notifier = Arc::new(CountingNotifier::default());
    let controller = controller(&db_path, ControllerConfig::default())
        .with_alert_notifier(notifier.clone());

    let first = must(controller.monitor_and_respond().await, "first monitor");
    assert!(!first.critical_alerts.is_empty());
    let recorded = must(seed.count_rows("alerts"), "count alerts");
    let delivered = notifier.delivered.load(Ordering::SeqCst);
    assert!(recorded > 0);
    assert_eq!(delivered as u64, recorded);

    let second = must(controller.monitor_and_respond().await, "second monitor");
    assert!(!second.critical_alerts.is_empty());
    assert_eq!(must(seed.count_rows("alerts"), "count alerts"), recorded);
    assert_eq!(notifier.delivered.load(Ordering::SeqCst), delivered);
}

#[tokio::test(flavor = "multi_thread")]
async fn analyze_timeout_skips_dependent_phases() {
    let db_path = temp_db("analyze-timeout");
    let seed = seed_store(&db_path);
    seed_troubled_store(&seed);

    let config = ControllerConfig {
        phase_deadlines_ms: PhaseDeadlines {
            analyze: 1,
            ..PhaseDeadlines::default()
        },
        ..ControllerConfig::default()
    };
    let controller = controller(&db_path, config)
        .with_cache_probe(Arc::new(SlowCache(StdDuration::from_millis(50))));
    let report = must(controller.run_cycle(false, BTreeSet::new()).await, "run cycle");

    let status = |phase: PhaseName| report.phase(phase).map(|outcome| outcome.status);
    assert_eq!(status(PhaseName::Analyze), Some(PhaseStatus::Timeout));
    for phase in PhaseName::ORDER
        .into_iter()
        .filter(|phase| phase.requires_analysis())
    {
        assert_eq!(status(phase), Some(PhaseStatus::Skipped), "{}", phase.as_str());
        assert_eq!(
            report
                .phase(phase)
                .and_then(|outcome| outcome.error.as_deref()),
            Some("analysis_unavailable")
        );
    }
    assert_eq!(status(PhaseName::Learn), Some(PhaseStatus::Completed));
    assert_eq!(status(PhaseName::AlignmentRecheck), Some(PhaseStatus::Completed));
    assert!(report.actions.is_empty());
    assert_eq!(report.summary.issues_found, 0);
    assert_eq!(must(seed.count_rows("cycle_reports"), "count reports"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unwritable_report_degrades_store_until_it_recovers() {
    let db_path = temp_db("degraded");
    let seed = seed_store(&db_path);
    let controller = controller(&db_path, ControllerConfig::default());

    let conn = must(Connection::open(&db_path), "open side connection");
    must(
        conn.execute_batch("DROP TABLE cycle_reports;"),
        "drop cycle_reports",
    );

    match controller.run_cycle(false, BTreeSet::new()).await {
        Err(ControllerError::Persistence(_)) => {}
        other => panic!("expected persistence failure, got {other:?}"),
    }
    assert!(controller.is_degraded());

    match controller.run_cycle(false, BTreeSet::new()).await {
        Err(ControllerError::StoreDegraded(_)) => {}
        other => panic!("expected degraded store, got {other:?}"),
    }

    must(seed.migrate(), "restore schema");
    let report = must(
        controller.run_cycle(false, BTreeSet::new()).await,
        "cycle after recovery",
    );
    assert!(!controller.is_degraded());
    let stored = must(
        controller.get_cycle_report(&report.cycle_id).await,
        "load stored report",
    );
    assert_eq!(stored.map(|stored| stored.cycle_id), Some(report.cycle_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_triggers_share_one_cycle() {
    let db_path = temp_db("coalesce");
    let seed = seed_store(&db_path);
    seed_troubled_store(&seed);

    let controller = controller(&db_path, ControllerConfig::default())
        .with_cache_probe(Arc::new(SlowCache(StdDuration::from_millis(50))));
    let (first, second) = tokio::join!(
        controller.run_cycle(true, BTreeSet::new()),
        controller.run_cycle(true, BTreeSet::new()),
    );
    let first = must(first, "first trigger");
    let second = must(second, "second trigger");

    assert_eq!(first.cycle_id, second.cycle_id);
    assert_eq!(must(seed.count_rows("cycle_reports"), "count reports"), 1);

    let listed = must(
        controller
            .list_cycle_reports(now_utc() - Duration::hours(1))
            .await,
        "list reports",
    );
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].cycle_id, first.cycle_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_apis_never_record_alerts() {
    let db_path = temp_db("read-only");
    let seed = seed_store(&db_path);
    seed_troubled_store(&seed);
    let controller = controller(&db_path, ControllerConfig::default());

    let window = autopilot_core::WindowDays::WEEK;
    let alignment = must(controller.get_alignment(window).await, "alignment");
    let status = must(controller.get_kpi_status(window).await, "kpi status");
    let priorities = must(controller.get_priority_actions(window).await, "priorities");

    assert!(!alignment.per_kpi.is_empty());
    assert!(status
        .get(&autopilot_core::KpiName::ActivationRate)
        .is_some_and(|entry| entry.available));
    assert!(priorities
        .iter()
        .any(|priority| priority.action == ActionId::OptimizeActivation));
    assert_eq!(must(seed.count_rows("alerts"), "count alerts"), 0);
}
