//! `apctl`: operator surface for the autonomous operations controller.
//!
//! Every command opens the `SQLite` store at `--db`, applies migrations and
//! prints its result as pretty JSON on stdout. Logs go to stderr.

pub mod daemon;
pub mod settings;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use autopilot_controller::Controller;
use autopilot_core::{parse_rfc3339_utc, utc_day, ActionId, WindowDays};
use autopilot_store_sqlite::SqliteOpsStore;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use daemon::Daemon;
pub use settings::{DaemonSettings, Settings};

#[derive(Debug, Parser)]
#[command(name = "apctl", version)]
#[command(about = "Autonomous operations control loop")]
pub struct Cli {
    #[arg(long, env = "AUTOPILOT_DB", default_value = "./autopilot.sqlite3")]
    db: PathBuf,

    /// TOML or JSON settings file, layered under `AUTOPILOT_*` variables.
    #[arg(short, long, env = "AUTOPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Fallback filter when `RUST_LOG` is unset.
    #[arg(long, env = "AUTOPILOT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "AUTOPILOT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Cycle {
        #[command(subcommand)]
        command: Box<CycleCommand>,
    },
    /// Short-cadence check with fast-path remediation.
    Monitor,
    Alignment(WindowArgs),
    Kpi {
        #[command(subcommand)]
        command: KpiCommand,
    },
    PriorityActions(WindowArgs),
    Alerts {
        #[command(subcommand)]
        command: AlertsCommand,
    },
    Advisories {
        #[command(subcommand)]
        command: AdvisoriesCommand,
    },
    Outcomes {
        #[command(subcommand)]
        command: OutcomesCommand,
    },
    /// Runs cycles and monitor passes on their cadences until signalled.
    Daemon(DaemonArgs),
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
}

#[derive(Debug, Subcommand)]
pub enum CycleCommand {
    Run(CycleRunArgs),
    List {
        /// RFC3339 lower bound on `started_at`.
        #[arg(long)]
        since: Option<String>,
    },
    Show {
        cycle_id: String,
    },
}

#[derive(Debug, Args)]
pub struct CycleRunArgs {
    /// Report what would run without changing business state.
    #[arg(long)]
    dry_run: bool,

    /// Action id an operator approves for this cycle. Repeatable.
    #[arg(long = "confirm", value_name = "ACTION")]
    confirm: Vec<String>,
}

#[derive(Debug, Args)]
pub struct WindowArgs {
    #[arg(long, default_value_t = 30)]
    window_days: u32,
}

#[derive(Debug, Subcommand)]
pub enum KpiCommand {
    Status(WindowArgs),
}

#[derive(Debug, Subcommand)]
pub enum AlertsCommand {
    List {
        /// `YYYY-MM-DD` day or RFC3339 timestamp.
        #[arg(long)]
        since: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum AdvisoriesCommand {
    List {
        /// Only the newest learned value per key.
        #[arg(long)]
        latest_only: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum OutcomesCommand {
    List {
        #[arg(long)]
        cycle_id: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct DaemonArgs {
    #[arg(long)]
    cycle_interval_secs: Option<u64>,

    #[arg(long)]
    monitor_interval_secs: Option<u64>,

    /// Exit once this many scheduled cycles have run.
    #[arg(long)]
    max_cycles: Option<u64>,
}

/// Installs the global subscriber. `RUST_LOG` wins over `--log-level`.
pub fn init_tracing(cli: &Cli) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Executes a parsed `apctl` invocation.
///
/// # Errors
/// Returns an error when settings fail to load, the store cannot be opened
/// or migrated, or the requested command fails.
pub async fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Db {
            command: DbCommand::Migrate,
        } => {
            let store = open_store(&cli.db)?;
            print_json(&json!({
                "db": cli.db.display().to_string(),
                "schema_versions": store.schema_versions()?,
            }))
        }
        Command::Cycle { command } => match *command {
            CycleCommand::Run(args) => {
                let confirmations = parse_confirmations(&args.confirm)?;
                let controller = build_controller(&cli.db, cli.config.as_deref())?;
                let report = controller.run_cycle(args.dry_run, confirmations).await?;
                print_json(&report)
            }
            CycleCommand::List { since } => {
                let since = match since {
                    Some(value) => parse_rfc3339_utc(&value)?,
                    None => OffsetDateTime::UNIX_EPOCH,
                };
                let store = open_store(&cli.db)?;
                print_json(&store.list_cycle_summaries(since)?)
            }
            CycleCommand::Show { cycle_id } => {
                let store = open_store(&cli.db)?;
                match store.get_cycle_report(&cycle_id)? {
                    Some(report) => print_json(&report),
                    None => bail!("cycle report not found: {cycle_id}"),
                }
            }
        },
        Command::Monitor => {
            let controller = build_controller(&cli.db, cli.config.as_deref())?;
            print_json(&controller.monitor_and_respond().await?)
        }
        Command::Alignment(args) => {
            let controller = build_controller(&cli.db, cli.config.as_deref())?;
            print_json(&controller.get_alignment(args.window()?).await?)
        }
        Command::Kpi {
            command: KpiCommand::Status(args),
        } => {
            let controller = build_controller(&cli.db, cli.config.as_deref())?;
            print_json(&controller.get_kpi_status(args.window()?).await?)
        }
        Command::PriorityActions(args) => {
            let controller = build_controller(&cli.db, cli.config.as_deref())?;
            print_json(&controller.get_priority_actions(args.window()?).await?)
        }
        Command::Alerts {
            command: AlertsCommand::List { since },
        } => {
            let since_day = since.as_deref().map(parse_since_day).transpose()?;
            let store = open_store(&cli.db)?;
            print_json(&store.list_alerts(since_day.as_deref())?)
        }
        Command::Advisories {
            command: AdvisoriesCommand::List { latest_only },
        } => {
            let store = open_store(&cli.db)?;
            print_json(&json!({
                "operator": store.list_ops_advisories()?,
                "learned": store.list_learned_advisories(latest_only)?,
            }))
        }
        Command::Outcomes {
            command: OutcomesCommand::List { cycle_id },
        } => {
            let store = open_store(&cli.db)?;
            print_json(&store.list_action_outcomes(cycle_id.as_deref())?)
        }
        Command::Daemon(args) => {
            let settings = Settings::load(cli.config.as_deref())?;
            let intervals = DaemonSettings {
                cycle_interval_secs: args
                    .cycle_interval_secs
                    .unwrap_or(settings.daemon.cycle_interval_secs),
                monitor_interval_secs: args
                    .monitor_interval_secs
                    .unwrap_or(settings.daemon.monitor_interval_secs),
            };
            let store = open_store(&cli.db)?;
            let controller = Arc::new(Controller::new(store, settings.controller)?);
            Daemon::new(controller, cli.config, intervals)
                .with_max_cycles(args.max_cycles)
                .run()
                .await;
            Ok(())
        }
    }
}

impl WindowArgs {
    fn window(&self) -> Result<WindowDays> {
        Ok(WindowDays::new(self.window_days)?)
    }
}

fn open_store(db: &Path) -> Result<SqliteOpsStore> {
    let store = SqliteOpsStore::open(db)?;
    store.migrate()?;
    Ok(store)
}

fn build_controller(db: &Path, config: Option<&Path>) -> Result<Controller> {
    let settings = Settings::load(config)?;
    let store = open_store(db)?;
    Ok(Controller::new(store, settings.controller)?)
}

fn parse_confirmations(values: &[String]) -> Result<BTreeSet<ActionId>> {
    values
        .iter()
        .map(|value| ActionId::parse(value).ok_or_else(|| anyhow!("unknown action id: {value}")))
        .collect()
}

/// Accepts a bare UTC day or an RFC3339 timestamp and returns the day key.
fn parse_since_day(value: &str) -> Result<String> {
    let day_format = time::macros::format_description!("[year]-[month]-[day]");
    if time::Date::parse(value, &day_format).is_ok() {
        return Ok(value.to_string());
    }
    let timestamp = parse_rfc3339_utc(value)
        .with_context(|| format!("--since must be YYYY-MM-DD or RFC3339 (got {value})"))?;
    Ok(utc_day(timestamp)?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_day_accepts_days_and_timestamps() {
        assert_eq!(
            parse_since_day("2026-03-01").ok().as_deref(),
            Some("2026-03-01")
        );
        assert_eq!(
            parse_since_day("2026-03-01T23:30:00-02:00").ok().as_deref(),
            Some("2026-03-02")
        );
        assert!(parse_since_day("yesterday").is_err());
    }

    #[test]
    fn confirmations_reject_unknown_actions() {
        let parsed = parse_confirmations(&["cleanup_orphan_subscriptions".to_string()]);
        assert!(parsed.is_ok_and(|set| set.contains(&ActionId::CleanupOrphanSubscriptions)));
        assert!(parse_confirmations(&["reboot_everything".to_string()]).is_err());
    }
}
