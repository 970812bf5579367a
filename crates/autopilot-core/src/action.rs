use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::OpsError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionId {
    TriggerRetentionCampaign,
    CleanupOrphanSubscriptions,
    RetryFailedPayments,
    RecommendManualReview,
    OptimizeRetention,
    OptimizeActivation,
    OptimizePricingSignal,
    RestartService,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Remediate,
    Optimize,
}

/// Static catalog entry. `independent` actions touch disjoint rows and may
/// run concurrently when they are also idempotent.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ActionSpec {
    pub id: ActionId,
    pub kind: ActionKind,
    pub idempotent: bool,
    pub requires_confirmation: bool,
    pub independent: bool,
    pub default_budget: u32,
}

const CATALOG: [ActionSpec; 8] = [
    ActionSpec {
        id: ActionId::TriggerRetentionCampaign,
        kind: ActionKind::Remediate,
        idempotent: true,
        requires_confirmation: false,
        independent: true,
        default_budget: 500,
    },
    ActionSpec {
        id: ActionId::CleanupOrphanSubscriptions,
        kind: ActionKind::Remediate,
        idempotent: true,
        requires_confirmation: false,
        independent: true,
        default_budget: 1_000,
    },
    ActionSpec {
        id: ActionId::RetryFailedPayments,
        kind: ActionKind::Remediate,
        idempotent: true,
        requires_confirmation: false,
        independent: true,
        default_budget: 10,
    },
    ActionSpec {
        id: ActionId::RecommendManualReview,
        kind: ActionKind::Remediate,
        idempotent: true,
        requires_confirmation: false,
        independent: true,
        default_budget: 10,
    },
    ActionSpec {
        id: ActionId::OptimizeRetention,
        kind: ActionKind::Optimize,
        idempotent: true,
        requires_confirmation: false,
        independent: false,
        default_budget: 500,
    },
    ActionSpec {
        id: ActionId::OptimizeActivation,
        kind: ActionKind::Optimize,
        idempotent: true,
        requires_confirmation: false,
        independent: false,
        default_budget: 500,
    },
    ActionSpec {
        id: ActionId::OptimizePricingSignal,
        kind: ActionKind::Optimize,
        idempotent: true,
        requires_confirmation: true,
        independent: false,
        default_budget: 1,
    },
    ActionSpec {
        id: ActionId::RestartService,
        kind: ActionKind::Remediate,
        idempotent: false,
        requires_confirmation: true,
        independent: false,
        default_budget: 0,
    },
];

#[must_use]
pub fn action_catalog() -> &'static [ActionSpec] {
    &CATALOG
}

impl ActionId {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TriggerRetentionCampaign => "trigger_retention_campaign",
            Self::CleanupOrphanSubscriptions => "cleanup_orphan_subscriptions",
            Self::RetryFailedPayments => "retry_failed_payments",
            Self::RecommendManualReview => "recommend_manual_review",
            Self::OptimizeRetention => "optimize_retention",
            Self::OptimizeActivation => "optimize_activation",
            Self::OptimizePricingSignal => "optimize_pricing_signal",
            Self::RestartService => "restart_service",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        CATALOG
            .iter()
            .map(|spec| spec.id)
            .find(|id| id.as_str() == value)
    }

    #[must_use]
    pub fn spec(self) -> ActionSpec {
        CATALOG[self.catalog_index()]
    }

    /// Position in the catalog; the stable tie-break for dispatch order.
    #[must_use]
    pub fn catalog_index(self) -> usize {
        match self {
            Self::TriggerRetentionCampaign => 0,
            Self::CleanupOrphanSubscriptions => 1,
            Self::RetryFailedPayments => 2,
            Self::RecommendManualReview => 3,
            Self::OptimizeRetention => 4,
            Self::OptimizeActivation => 5,
            Self::OptimizePricingSignal => 6,
            Self::RestartService => 7,
        }
    }

    /// Actions the fast path may execute without a full cycle.
    #[must_use]
    pub fn fast_path_set() -> [Self; 4] {
        [
            Self::TriggerRetentionCampaign,
            Self::CleanupOrphanSubscriptions,
            Self::RetryFailedPayments,
            Self::RecommendManualReview,
        ]
    }
}

impl Display for ActionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionResult {
    Success,
    Skipped,
    Failed,
}

impl ActionResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(Self::Success),
            "SKIPPED" => Some(Self::Skipped),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    Pending,
    Running,
    Done(ActionResult),
}

impl ActionState {
    /// `PENDING -> RUNNING -> {SUCCESS | FAILED | SKIPPED}`. Gates may also
    /// skip straight from `PENDING`.
    ///
    /// # Errors
    /// Returns [`OpsError::Validation`] for any other transition.
    pub fn advance(self, next: Self) -> Result<Self, OpsError> {
        match (self, next) {
            (Self::Pending, Self::Running)
            | (Self::Pending, Self::Done(ActionResult::Skipped))
            | (Self::Running, Self::Done(_)) => Ok(next),
            (from, to) => Err(OpsError::Validation(format!(
                "invalid action transition {from:?} -> {to:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionOutcome {
    pub id: Ulid,
    pub cycle_id: String,
    pub action_id: ActionId,
    pub kind: ActionKind,
    pub executed: bool,
    pub dry_run: bool,
    pub confidence: f64,
    pub before_metric: Option<f64>,
    pub after_metric: Option<f64>,
    pub result: ActionResult,
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: OffsetDateTime,
}

impl ActionOutcome {
    #[must_use]
    pub fn skipped(
        cycle_id: &str,
        action_id: ActionId,
        dry_run: bool,
        confidence: f64,
        reason: impl Into<String>,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Ulid::new(),
            cycle_id: cycle_id.to_string(),
            action_id,
            kind: action_id.spec().kind,
            executed: false,
            dry_run,
            confidence,
            before_metric: None,
            after_metric: None,
            result: ActionResult::Skipped,
            reason: Some(reason.into()),
            started_at: at,
            ended_at: at,
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.executed && self.result == ActionResult::Success
    }
}
