//! External services the controller calls out to.
//!
//! Every method is synchronous and runs on the blocking pool, next to the
//! store calls of the same phase. Implementations must return promptly once
//! their work is done; the controller checks the phase deadline between
//! calls, never during one.

use std::fmt::Debug;
use std::sync::Arc;

use autopilot_core::{Alert, CacheStatus};
use autopilot_store_sqlite::FailedPayment;

pub trait PaymentGateway: Send + Sync + Debug {
    /// Re-submits one failed billing attempt.
    ///
    /// # Errors
    /// Returns an error when the provider rejects the resubmission.
    fn resubmit(&self, payment: &FailedPayment) -> anyhow::Result<()>;
}

pub trait AlertNotifier: Send + Sync + Debug {
    /// Delivers one newly recorded alert.
    ///
    /// # Errors
    /// Returns an error when delivery fails. Delivery failures are logged
    /// and never fail the phase.
    fn notify(&self, alert: &Alert, recipients: &[String]) -> anyhow::Result<()>;
}

pub trait CacheProbe: Send + Sync + Debug {
    fn probe(&self) -> CacheStatus;
}

/// Leaves the attempt in `retry_pending` for the billing worker to pick up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPaymentGateway;

impl PaymentGateway for NoopPaymentGateway {
    fn resubmit(&self, payment: &FailedPayment) -> anyhow::Result<()> {
        tracing::debug!(
            attempt_id = %payment.attempt_id,
            subscription_id = %payment.subscription_id,
            "payment resubmission queued"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertNotifier;

impl AlertNotifier for TracingAlertNotifier {
    fn notify(&self, alert: &Alert, recipients: &[String]) -> anyhow::Result<()> {
        tracing::warn!(
            kpi = alert.kpi.as_str(),
            severity = alert.severity.as_str(),
            current = alert.current,
            threshold = alert.threshold,
            recipients = ?recipients,
            "{}",
            alert.message
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCacheProbe;

impl CacheProbe for NoCacheProbe {
    fn probe(&self) -> CacheStatus {
        CacheStatus::NotConfigured
    }
}

#[derive(Debug, Clone)]
pub struct Collaborators {
    pub payments: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn AlertNotifier>,
    pub cache: Arc<dyn CacheProbe>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            payments: Arc::new(NoopPaymentGateway),
            notifier: Arc::new(TracingAlertNotifier),
            cache: Arc::new(NoCacheProbe),
        }
    }
}
