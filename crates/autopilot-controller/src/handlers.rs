//! Per-action effects. Each handler runs on the blocking pool, writes inside
//! one store transaction and reports how much of its budget it used.

use autopilot_core::opportunity::RETENTION_GAP_MIN;
use autopilot_core::{now_utc, utc_day, ActionId};
use autopilot_store_sqlite::{CampaignAudience, CampaignRequest, HandlerWrite};

use crate::dispatch::{DispatchScope, Invocation};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    /// State changed. `used` counts external calls or rows touched.
    Applied { used: u64, truncated: bool },
    /// Nothing ran; the reason is recorded on the SKIPPED outcome.
    Precondition(String),
}

impl Effect {
    fn skip(reason: &str) -> Self {
        Self::Precondition(reason.to_string())
    }

    fn from_write(write: HandlerWrite) -> Self {
        if write.eligible == 0 {
            Self::skip("nothing_to_do")
        } else if write.affected == 0 && write.truncated {
            Self::skip("deadline_exceeded")
        } else {
            Self::Applied {
                used: write.affected,
                truncated: write.truncated,
            }
        }
    }
}

pub(crate) fn apply(
    scope: &DispatchScope,
    invocation: &Invocation,
    budget: u32,
) -> anyhow::Result<Effect> {
    match invocation.action {
        ActionId::TriggerRetentionCampaign => {
            campaign(scope, "retention_winback", CampaignAudience::AtRisk, budget)
        }
        ActionId::CleanupOrphanSubscriptions => cleanup_orphans(scope, budget),
        ActionId::RetryFailedPayments => retry_payments(scope, budget),
        ActionId::RecommendManualReview | ActionId::OptimizePricingSignal => {
            emit_advisory(scope, invocation)
        }
        ActionId::OptimizeRetention => {
            if !invocation.gap.is_some_and(|gap| gap > RETENTION_GAP_MIN) {
                return Ok(Effect::skip("d7_gap_below_threshold"));
            }
            campaign(scope, "retention_optimizer", CampaignAudience::AtRisk, budget)
        }
        ActionId::OptimizeActivation => campaign(
            scope,
            "activation_nudge",
            CampaignAudience::RecentNonActivated,
            budget,
        ),
        ActionId::RestartService => Ok(Effect::skip("requires_operator")),
    }
}

fn campaign(
    scope: &DispatchScope,
    name: &str,
    audience: CampaignAudience,
    budget: u32,
) -> anyhow::Result<Effect> {
    let now = now_utc();
    // One contact per user and campaign per analysis window.
    let window_days = scope.config.analysis_window_days.days();
    let window_key = format!("{}/{window_days}d", utc_day(now)?);
    let request = CampaignRequest {
        campaign: name,
        audience,
        window_days,
        window_key: &window_key,
        cycle_id: &scope.owner_id,
        as_of: now,
        limit: budget,
    };
    let write = scope
        .shared
        .store
        .lock()
        .enqueue_campaign(&request, &scope.deadline)?;
    tracing::info!(
        owner_id = %scope.owner_id,
        campaign = name,
        eligible = write.eligible,
        enqueued = write.affected,
        "campaign messages enqueued"
    );
    Ok(Effect::from_write(write))
}

fn cleanup_orphans(scope: &DispatchScope, budget: u32) -> anyhow::Result<Effect> {
    let write = scope.shared.store.lock().cancel_orphan_subscriptions(
        budget,
        now_utc(),
        &scope.deadline,
    )?;
    Ok(Effect::from_write(write))
}

/// Resubmits through the gateway without holding the store lock, then marks
/// whatever was accepted. A gateway rejection fails the action after the
/// accepted attempts are recorded.
fn retry_payments(scope: &DispatchScope, budget: u32) -> anyhow::Result<Effect> {
    let due = scope
        .shared
        .store
        .lock()
        .failed_payments_for_retry(now_utc(), budget)?;
    if due.is_empty() {
        return Ok(Effect::skip("nothing_to_do"));
    }

    let mut resubmitted = Vec::with_capacity(due.len());
    let mut truncated = false;
    let mut rejection = None;
    for payment in &due {
        if scope.deadline.expired() {
            truncated = true;
            break;
        }
        match scope.shared.collaborators.payments.resubmit(payment) {
            Ok(()) => resubmitted.push(payment.attempt_id.clone()),
            Err(err) => {
                rejection =
                    Some(err.context(format!("gateway rejected payment {}", payment.attempt_id)));
                break;
            }
        }
    }

    let marked = scope
        .shared
        .store
        .lock()
        .mark_payments_retried(&resubmitted, now_utc())?;
    tracing::info!(
        owner_id = %scope.owner_id,
        due = due.len(),
        marked,
        "failed payments resubmitted"
    );

    if let Some(err) = rejection {
        return Err(err);
    }
    if resubmitted.is_empty() {
        return Ok(Effect::skip("deadline_exceeded"));
    }
    Ok(Effect::Applied {
        used: resubmitted.len() as u64,
        truncated,
    })
}

fn emit_advisory(scope: &DispatchScope, invocation: &Invocation) -> anyhow::Result<Effect> {
    let Some(advisory) = &invocation.advisory else {
        return Ok(Effect::skip("no_advisory_payload"));
    };
    let now = now_utc();
    let inserted = scope.shared.store.lock().emit_advisory(
        &advisory.kind,
        &utc_day(now)?,
        &scope.owner_id,
        &advisory.payload,
        now,
    )?;
    if inserted {
        Ok(Effect::Applied {
            used: 1,
            truncated: false,
        })
    } else {
        Ok(Effect::skip("already_emitted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_or_cancelled_writes_become_skips() {
        assert_eq!(
            Effect::from_write(HandlerWrite::default()),
            Effect::skip("nothing_to_do")
        );
        assert_eq!(
            Effect::from_write(HandlerWrite {
                eligible: 4,
                affected: 0,
                truncated: true,
            }),
            Effect::skip("deadline_exceeded")
        );
        assert_eq!(
            Effect::from_write(HandlerWrite {
                eligible: 4,
                affected: 2,
                truncated: true,
            }),
            Effect::Applied {
                used: 2,
                truncated: true,
            }
        );
    }
}
