//! Shared collaborators for the orchestrators.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{PayoutError, Result};
use crate::fees::FeeSchedule;
use crate::ledger::Ledger;
use crate::models::PayrollSettings;
use crate::notify::Notifier;
use crate::provider::TransferProvider;
use crate::store::LedgerStore;
use crate::work_units::WorkUnits;
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Everything the payout and payment services talk to, injected once.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn LedgerStore>,
    pub provider: Arc<dyn TransferProvider>,
    pub work_units: Arc<dyn WorkUnits>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn TransferProvider>,
        work_units: Arc<dyn WorkUnits>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            provider,
            work_units,
            notifier,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.max_conflict_retries,
        )
    }

    /// The fee table for `landlord_id`, with its tier's platform fee.
    pub async fn fee_schedule_for(&self, landlord_id: Uuid) -> Result<FeeSchedule> {
        let settings = self.store.landlord_settings(landlord_id).await?;
        let schedule = match settings.and_then(|s| s.platform_fee_percent) {
            Some(percent) => self.config.fees.with_platform_fee_percent(percent),
            None => self.config.fees.clone(),
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub async fn payroll_settings_for(&self, landlord_id: Uuid) -> Result<PayrollSettings> {
        let settings = self.store.landlord_settings(landlord_id).await?;
        let payroll = settings
            .and_then(|s| s.payroll)
            .unwrap_or_else(|| self.config.payroll.clone());
        crate::payroll::validate_settings(&payroll)?;
        Ok(payroll)
    }
}

/// Runs a money-moving operation on its own task and waits for it.
///
/// Once a debit is reserved the operation has to reach commit or
/// cancel.  Dropping the returned future (a client hanging up, a caller
/// timeout) only stops the waiting; the task still runs to completion.
pub(crate) async fn run_detached<T, F>(operation: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(operation.in_current_span())
        .await
        .map_err(|err| PayoutError::TaskFailed(err.to_string()))?
}
