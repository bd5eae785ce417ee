//! Contractor and team payments.
//!
//! A work payment debits the landlord's wallet to pay a third party for
//! a unit of completed work: a work order or an approved timesheet.
//! Each unit can be paid at most once.  Payroll runs settle several
//! timesheets against a single reservation and compensate only the
//! entries whose transfer failed.  Both run on their own task so a
//! dropped caller cannot leave a reservation open.

use crate::context::{run_detached, EngineContext};
use crate::error::{PayoutError, ProviderErrorCode, Result, StoreError};
use crate::fees::{FeeClass, FeeQuote};
use crate::ledger::{DebitRequest, Ledger, Reservation};
use crate::models::{
    Money, Payee, PaymentKind, PaymentStatus, PlatformFeeRecord, Timesheet, WorkPayment,
    WorkUnitRef, WorkUnitStatus,
};
use crate::notify::{emit, MoneyEvent, MoneyEventKind, MoneyEventStatus};
use crate::payroll::{preview_payroll, price_timesheet, PayCalculation, PayrollPreview};
use crate::provider::{transfer_with_timeout, TransferRequest};
use crate::store::WriteBatch;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPaymentRequest {
    pub landlord_id: Uuid,
    pub kind: PaymentKind,
    pub payee: Payee,
    pub work_unit: WorkUnitRef,
    /// Gross amount debited from the wallet.
    pub amount: Money,
}

/// A timesheet whose transfer failed during a payroll run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollFailure {
    pub payment_id: Uuid,
    pub timesheet_id: Uuid,
    pub code: ProviderErrorCode,
    pub message: String,
}

/// Outcome of [`PaymentProcessor::process_payroll`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollRun {
    pub batch_id: Uuid,
    pub landlord_id: Uuid,
    /// Gross amount finally debited, i.e. the successful entries only.
    pub total_gross: Money,
    pub total_fees: Money,
    pub total_net: Money,
    pub calculations: Vec<PayCalculation>,
    pub payments: Vec<WorkPayment>,
    pub failures: Vec<PayrollFailure>,
}

impl PayrollRun {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct PaymentProcessor {
    ctx: EngineContext,
}

impl PaymentProcessor {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn pay_for_work(&self, request: WorkPaymentRequest) -> Result<WorkPayment> {
        let this = self.clone();
        run_detached(async move { this.execute_pay_for_work(request).await }).await
    }

    #[tracing::instrument(name = "payment.pay_for_work", skip_all, fields(landlord_id = %request.landlord_id, work_unit = %request.work_unit))]
    async fn execute_pay_for_work(&self, request: WorkPaymentRequest) -> Result<WorkPayment> {
        if !request.kind.settles(request.work_unit) {
            return Err(PayoutError::InvalidRequest(format!(
                "a {:?} payment cannot settle {}",
                request.kind, request.work_unit
            )));
        }
        if let WorkUnitRef::Timesheet(id) = request.work_unit {
            self.load_timesheet(request.landlord_id, id).await?;
        }
        let fees = self.ctx.fee_schedule_for(request.landlord_id).await?;
        let quote = fees.quote(request.amount, FeeClass::from(request.kind))?;
        self.ensure_payable(request.work_unit).await?;

        let ledger = self.ctx.ledger();
        let payment = self.new_payment(&request, quote, None);
        let reservation = ledger
            .reserve_debit(
                DebitRequest {
                    landlord_id: payment.landlord_id,
                    amount: payment.amount,
                    kind: payment.kind.transaction_kind(),
                    reference_id: payment.id,
                    description: format!("payment to {} for {}", payment.payee.name, payment.work_unit),
                },
                WriteBatch::new().with_payment(payment.clone()),
            )
            .await
            .map_err(|err| duplicate_on_conflict(err, payment.work_unit))?;

        match self.transfer(&payment).await {
            Ok(settled) => {
                let records = WriteBatch::new()
                    .with_payment(settled.clone())
                    .with_fees(fee_record(&settled));
                if let Err(err) = ledger.commit_debit(reservation, records).await {
                    error!(payment_id = %settled.id, error = %err, "transfer succeeded but the payment could not be recorded");
                    return Err(err);
                }
                self.mark_paid(settled.work_unit).await;
                info!(payment_id = %settled.id, gross = %settled.amount, net = %settled.net_amount, "work payment completed");
                self.announce(&settled);
                Ok(settled)
            }
            Err((failed, err)) => {
                let transaction_id = reservation.transaction_id();
                if let Err(cancel_err) = ledger
                    .cancel_debit(reservation, WriteBatch::new().with_payment(failed.clone()))
                    .await
                {
                    error!(payment_id = %failed.id, %transaction_id, error = %cancel_err, "balance not restored, debit left pending for reconciliation");
                }
                self.announce(&failed);
                Err(err)
            }
        }
    }

    /// Settles a batch of approved timesheets.
    ///
    /// Every timesheet is priced first; if any cannot be paid the run is
    /// rejected before the wallet is touched.  The batch total is then
    /// reserved in one step.  Transfers fail independently: a failed
    /// entry is marked failed, keeps its timesheet approved and has its
    /// share returned to the wallet.
    pub async fn process_payroll(&self, landlord_id: Uuid, timesheet_ids: &[Uuid]) -> Result<PayrollRun> {
        let this = self.clone();
        let timesheet_ids = timesheet_ids.to_vec();
        run_detached(async move { this.execute_payroll(landlord_id, &timesheet_ids).await }).await
    }

    #[tracing::instrument(name = "payment.process_payroll", skip_all, fields(landlord_id = %landlord_id, timesheets = timesheet_ids.len()))]
    async fn execute_payroll(&self, landlord_id: Uuid, timesheet_ids: &[Uuid]) -> Result<PayrollRun> {
        if timesheet_ids.is_empty() {
            return Err(PayoutError::InvalidRequest("payroll run has no timesheets".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = timesheet_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(PayoutError::InvalidRequest(format!(
                "timesheet {dup} listed more than once"
            )));
        }

        let settings = self.ctx.payroll_settings_for(landlord_id).await?;
        let fees = self.ctx.fee_schedule_for(landlord_id).await?;
        let batch_id = Uuid::new_v4();
        let mut calculations = Vec::with_capacity(timesheet_ids.len());
        let mut pending = Vec::with_capacity(timesheet_ids.len());

        for id in timesheet_ids {
            let timesheet = self.load_timesheet(landlord_id, *id).await?;
            let unit = WorkUnitRef::Timesheet(timesheet.id);
            self.ensure_payable(unit).await?;
            let compensation = self.ctx.store.compensation(timesheet.employee_id).await?;
            let line = price_timesheet(&timesheet, compensation.as_ref(), &settings, &fees)?;
            let request = WorkPaymentRequest {
                landlord_id,
                kind: PaymentKind::Team,
                payee: line.payee.clone(),
                work_unit: unit,
                amount: line.quote.amount,
            };
            pending.push(self.new_payment(&request, line.quote, Some(batch_id)));
            calculations.push(line.calculation);
        }

        let total = pending
            .iter()
            .try_fold(Decimal::ZERO, |sum, p| sum.checked_add(p.amount))
            .ok_or_else(|| PayoutError::overflow(Decimal::MAX))?;
        let ledger = self.ctx.ledger();
        let reservation = ledger
            .reserve_debit(
                DebitRequest {
                    landlord_id,
                    amount: total,
                    kind: PaymentKind::Team.transaction_kind(),
                    reference_id: batch_id,
                    description: format!("payroll run of {} timesheets", pending.len()),
                },
                WriteBatch::new().with_payments(pending.iter().cloned()),
            )
            .await
            .map_err(|err| match err {
                PayoutError::Store(StoreError::UniqueViolation(msg)) => {
                    PayoutError::InvalidRequest(format!("payroll overlaps another payment: {msg}"))
                }
                other => other,
            })?;
        info!(%batch_id, %total, "payroll reserved");

        let mut settled = Vec::new();
        let mut failed = Vec::new();
        let mut failures = Vec::new();
        for payment in pending {
            match self.transfer(&payment).await {
                Ok(done) => settled.push(done),
                Err((undone, err)) => {
                    let (code, message) = match err {
                        PayoutError::ProviderTransferFailed { code, message } => (code, message),
                        other => (ProviderErrorCode::Generic, other.to_string()),
                    };
                    failures.push(PayrollFailure {
                        payment_id: undone.id,
                        timesheet_id: undone.work_unit.id(),
                        code,
                        message,
                    });
                    failed.push(undone);
                }
            }
        }

        if let Err(err) = self.settle_batch(&ledger, reservation, &settled, &failed).await {
            error!(%batch_id, error = %err, "payroll transfers ran but the batch could not be recorded");
            return Err(err);
        }

        for payment in &settled {
            self.mark_paid(payment.work_unit).await;
        }
        for payment in settled.iter().chain(failed.iter()) {
            self.announce(payment);
        }

        let total_gross = settled.iter().map(|p| p.amount).sum();
        let total_fees = settled.iter().map(|p| p.platform_fee).sum();
        let total_net = settled.iter().map(|p| p.net_amount).sum();
        if !failures.is_empty() {
            warn!(%batch_id, failed = failures.len(), succeeded = settled.len(), "payroll run partially failed");
        }
        let mut payments = settled;
        payments.extend(failed);
        Ok(PayrollRun {
            batch_id,
            landlord_id,
            total_gross,
            total_fees,
            total_net,
            calculations,
            payments,
            failures,
        })
    }

    /// Records the outcome of a run against its reservation: cancelled
    /// outright when every transfer failed, otherwise the failed share is
    /// returned to the wallet and the remainder committed.
    async fn settle_batch(
        &self,
        ledger: &Ledger,
        mut reservation: Reservation,
        settled: &[WorkPayment],
        failed: &[WorkPayment],
    ) -> Result<()> {
        let failed_records = WriteBatch::new().with_payments(failed.iter().cloned());
        if settled.is_empty() {
            ledger.cancel_debit(reservation, failed_records).await?;
            return Ok(());
        }
        if !failed.is_empty() {
            let refund: Money = failed.iter().map(|p| p.amount).sum();
            ledger
                .release_partial(&mut reservation, refund, failed_records)
                .await?;
        }
        ledger
            .commit_debit(
                reservation,
                WriteBatch::new()
                    .with_payments(settled.iter().cloned())
                    .with_fees(settled.iter().flat_map(fee_record)),
            )
            .await?;
        Ok(())
    }

    /// Prices a batch without moving money.  Timesheets lacking a
    /// compensation record or not currently approved are listed as
    /// skipped.
    pub async fn preview_payroll(&self, landlord_id: Uuid, timesheet_ids: &[Uuid]) -> Result<PayrollPreview> {
        let settings = self.ctx.payroll_settings_for(landlord_id).await?;
        let fees = self.ctx.fee_schedule_for(landlord_id).await?;
        let mut timesheets = Vec::with_capacity(timesheet_ids.len());
        let mut compensation = HashMap::new();
        for id in timesheet_ids {
            let timesheet = self.load_timesheet(landlord_id, *id).await?;
            if let Some(found) = self.ctx.store.compensation(timesheet.employee_id).await? {
                compensation.insert(found.employee_id, found);
            }
            timesheets.push(timesheet);
        }
        Ok(preview_payroll(timesheets, &compensation, &settings, &fees))
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<WorkPayment> {
        self.ctx
            .store
            .payment(id)
            .await?
            .ok_or(PayoutError::NotFound {
                entity: "payment",
                id,
            })
    }

    pub async fn payments_for(&self, landlord_id: Uuid) -> Result<Vec<WorkPayment>> {
        Ok(self.ctx.store.payments_for(landlord_id).await?)
    }

    /// Loads one of the landlord's timesheets with its status refreshed
    /// from the work-unit service.
    async fn load_timesheet(&self, landlord_id: Uuid, id: Uuid) -> Result<Timesheet> {
        let mut timesheet = self
            .ctx
            .store
            .timesheet(id)
            .await?
            .ok_or(PayoutError::NotFound {
                entity: "timesheet",
                id,
            })?;
        if timesheet.landlord_id != landlord_id {
            return Err(PayoutError::InvalidRequest(format!(
                "timesheet {id} belongs to another landlord"
            )));
        }
        if let Some(status) = self.ctx.work_units.status(WorkUnitRef::Timesheet(id)).await? {
            timesheet.status = status;
        }
        Ok(timesheet)
    }

    /// Rejects units that are already paid, being paid, or not ready.
    async fn ensure_payable(&self, unit: WorkUnitRef) -> Result<()> {
        if self.ctx.store.active_payment_for(unit).await?.is_some() {
            return Err(PayoutError::DuplicatePayment { work_unit: unit });
        }
        let status = self
            .ctx
            .work_units
            .status(unit)
            .await?
            .ok_or(PayoutError::NotFound {
                entity: "work unit",
                id: unit.id(),
            })?;
        if status == WorkUnitStatus::Paid {
            return Err(PayoutError::DuplicatePayment { work_unit: unit });
        }
        if status != unit.ready_status() {
            return Err(PayoutError::WorkUnitNotReady {
                work_unit: unit,
                status,
                expected: unit.ready_status(),
            });
        }
        Ok(())
    }

    fn new_payment(&self, request: &WorkPaymentRequest, quote: FeeQuote, batch_id: Option<Uuid>) -> WorkPayment {
        WorkPayment {
            id: Uuid::new_v4(),
            landlord_id: request.landlord_id,
            kind: request.kind,
            payee: request.payee.clone(),
            work_unit: request.work_unit,
            amount: quote.amount,
            platform_fee: quote.fee,
            net_amount: quote.net_amount,
            status: PaymentStatus::Pending,
            batch_id,
            provider_transfer_id: None,
            failure: None,
            created_at: self.ctx.clock.now(),
            paid_at: None,
        }
    }

    /// Sends the net amount to the payee.  Returns the payment in its
    /// final state either way.
    async fn transfer(&self, payment: &WorkPayment) -> std::result::Result<WorkPayment, (WorkPayment, PayoutError)> {
        let mut metadata = BTreeMap::new();
        metadata.insert("payment_id".to_string(), payment.id.to_string());
        metadata.insert("landlord_id".to_string(), payment.landlord_id.to_string());
        metadata.insert("work_unit".to_string(), payment.work_unit.to_string());
        if let Some(batch_id) = payment.batch_id {
            metadata.insert("batch_id".to_string(), batch_id.to_string());
        }
        let request = TransferRequest {
            amount: payment.net_amount,
            currency: self.ctx.config.currency.clone(),
            destination: payment.payee.destination.clone(),
            idempotency_key: payment.id,
            metadata,
        };

        let mut payment = payment.clone();
        match transfer_with_timeout(self.ctx.provider.as_ref(), request, self.ctx.config.provider_timeout()).await {
            Ok(receipt) => {
                payment.status = PaymentStatus::Completed;
                payment.provider_transfer_id = Some(receipt.provider_transfer_id);
                payment.paid_at = Some(self.ctx.clock.now());
                Ok(payment)
            }
            Err(err) => {
                warn!(payment_id = %payment.id, error = %err, "work payment transfer failed");
                payment.status = PaymentStatus::Failed;
                payment.failure = Some(err.to_string());
                Err((payment, err.into()))
            }
        }
    }

    /// Moves a paid unit to `paid`.  The money has already moved, so a
    /// failure here is logged and left for reconciliation.
    async fn mark_paid(&self, unit: WorkUnitRef) {
        if let Err(err) = self.ctx.work_units.transition(unit, WorkUnitStatus::Paid).await {
            error!(work_unit = %unit, error = %err, "payment completed but the work unit could not be marked paid");
        }
    }

    fn announce(&self, payment: &WorkPayment) {
        emit(
            self.ctx.notifier.as_ref(),
            MoneyEvent {
                kind: match payment.kind {
                    PaymentKind::Contractor => MoneyEventKind::ContractorPayment,
                    PaymentKind::Team => MoneyEventKind::TeamPayment,
                },
                landlord_id: payment.landlord_id,
                payee_id: Some(payment.payee.id),
                amount: payment.amount,
                status: if payment.status == PaymentStatus::Completed {
                    MoneyEventStatus::Succeeded
                } else {
                    MoneyEventStatus::Failed
                },
                reference_id: payment.id,
            },
        );
    }
}

fn fee_record(payment: &WorkPayment) -> Option<PlatformFeeRecord> {
    (payment.platform_fee > Decimal::ZERO).then(|| PlatformFeeRecord {
        id: Uuid::new_v4(),
        landlord_id: payment.landlord_id,
        source_id: payment.id,
        amount: payment.platform_fee,
        created_at: payment.paid_at.unwrap_or(payment.created_at),
    })
}

/// A unique-constraint hit while reserving means another payment for the
/// same unit got in first.
fn duplicate_on_conflict(err: PayoutError, work_unit: WorkUnitRef) -> PayoutError {
    match err {
        PayoutError::Store(StoreError::UniqueViolation(_)) => PayoutError::DuplicatePayment { work_unit },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::{ErrorClass, ProviderError};
    use crate::ledger::CreditRequest;
    use crate::models::{
        Compensation, DestinationKind, LandlordSettings, PayType, PayoutDestination, Timesheet,
    };
    use crate::notify::RecordingNotifier;
    use crate::provider::SandboxTransferProvider;
    use crate::store::{LedgerStore, MemoryStore};
    use crate::work_units::{MemoryWorkUnits, WorkUnits};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        payments: PaymentProcessor,
        ctx: EngineContext,
        store: Arc<MemoryStore>,
        provider: SandboxTransferProvider,
        work_units: Arc<MemoryWorkUnits>,
        notifier: Arc<RecordingNotifier>,
        landlord: Uuid,
    }

    async fn fixture(balance: Money) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let provider = SandboxTransferProvider::new("usd", dec!(1000000));
        let work_units = Arc::new(MemoryWorkUnits::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = EngineContext::new(
            EngineConfig::default(),
            store.clone(),
            Arc::new(provider.clone()),
            work_units.clone(),
            notifier.clone(),
        );
        let landlord = Uuid::new_v4();
        ctx.ledger()
            .credit(CreditRequest {
                landlord_id: landlord,
                amount: balance,
                description: "rent".into(),
                reference_id: Uuid::new_v4(),
                hold_until: None,
            })
            .await
            .unwrap();
        Fixture {
            payments: PaymentProcessor::new(ctx.clone()),
            ctx,
            store,
            provider,
            work_units,
            notifier,
            landlord,
        }
    }

    fn payee(account: &str) -> Payee {
        Payee {
            id: Uuid::new_v4(),
            name: format!("payee {account}"),
            destination: PayoutDestination {
                kind: DestinationKind::BankAccount,
                external_ref: account.to_string(),
                property_id: None,
            },
        }
    }

    async fn completed_work_order(f: &Fixture) -> WorkUnitRef {
        let unit = WorkUnitRef::WorkOrder(Uuid::new_v4());
        f.work_units.insert(unit, WorkUnitStatus::Completed).await;
        unit
    }

    fn contractor_request(f: &Fixture, unit: WorkUnitRef, amount: Money) -> WorkPaymentRequest {
        WorkPaymentRequest {
            landlord_id: f.landlord,
            kind: PaymentKind::Contractor,
            payee: payee("ba_plumber"),
            work_unit: unit,
            amount,
        }
    }

    /// An approved timesheet of `hours` regular hours paid hourly at `rate`.
    async fn approved_timesheet(f: &Fixture, hours: Money, rate: Money, account: &str) -> Uuid {
        let employee_id = Uuid::new_v4();
        let start = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let timesheet = Timesheet {
            id: Uuid::new_v4(),
            employee_id,
            landlord_id: f.landlord,
            period_start: start,
            period_end: start + chrono::Duration::days(6),
            total_hours: hours,
            regular_hours: hours,
            overtime_hours: Decimal::ZERO,
            status: WorkUnitStatus::Approved,
            entries: Vec::new(),
        };
        let id = timesheet.id;
        f.store.insert_timesheet(timesheet).await;
        f.store
            .insert_compensation(Compensation {
                employee_id,
                pay_type: PayType::Hourly,
                hourly_rate: Some(rate),
                overtime_rate: None,
                salary_amount: None,
                payee: payee(account),
            })
            .await;
        f.work_units
            .insert(WorkUnitRef::Timesheet(id), WorkUnitStatus::Approved)
            .await;
        id
    }

    async fn available(f: &Fixture) -> Money {
        f.ctx.ledger().balance(f.landlord).await.unwrap().available_balance
    }

    async fn unit_status(f: &Fixture, unit: WorkUnitRef) -> WorkUnitStatus {
        f.work_units.status(unit).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_contractor_paid_once() {
        let f = fixture(dec!(100)).await;
        let unit = completed_work_order(&f).await;

        let payment = f
            .payments
            .pay_for_work(contractor_request(&f, unit, dec!(40)))
            .await
            .unwrap();
        assert_eq!(payment.platform_fee, dec!(1.00));
        assert_eq!(payment.net_amount, dec!(39.00));
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(available(&f).await, dec!(60));
        assert_eq!(unit_status(&f, unit).await, WorkUnitStatus::Paid);
        assert_eq!(f.provider.transfers().await[0].amount, dec!(39.00));

        let err = f
            .payments
            .pay_for_work(contractor_request(&f, unit, dec!(40)))
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::DuplicatePayment { .. }));
        assert_eq!(err.class(), ErrorClass::UserCorrectable);
        assert_eq!(available(&f).await, dec!(60));
        assert_eq!(f.provider.transfers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unfinished_work_order_is_not_payable() {
        let f = fixture(dec!(100)).await;
        let unit = WorkUnitRef::WorkOrder(Uuid::new_v4());
        f.work_units.insert(unit, WorkUnitStatus::InProgress).await;

        let err = f
            .payments
            .pay_for_work(contractor_request(&f, unit, dec!(40)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PayoutError::WorkUnitNotReady { status: WorkUnitStatus::InProgress, .. }
        ));
        assert_eq!(available(&f).await, dec!(100));
    }

    #[tokio::test]
    async fn test_failed_transfer_can_be_retried() {
        let f = fixture(dec!(100)).await;
        let unit = completed_work_order(&f).await;
        f.provider
            .fail_next(ProviderError::new(ProviderErrorCode::Generic, "bank offline"))
            .await;

        let err = f
            .payments
            .pay_for_work(contractor_request(&f, unit, dec!(40)))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransferFailed);
        assert_eq!(available(&f).await, dec!(100));
        assert_eq!(unit_status(&f, unit).await, WorkUnitStatus::Completed);
        let recorded = f.payments.payments_for(f.landlord).await.unwrap();
        assert_eq!(recorded[0].status, PaymentStatus::Failed);
        assert_eq!(f.notifier.events()[0].status, MoneyEventStatus::Failed);

        f.payments
            .pay_for_work(contractor_request(&f, unit, dec!(40)))
            .await
            .unwrap();
        assert_eq!(available(&f).await, dec!(60));
        assert_eq!(unit_status(&f, unit).await, WorkUnitStatus::Paid);
    }

    #[tokio::test]
    async fn test_fee_free_tier_records_no_fee() {
        let f = fixture(dec!(100)).await;
        f.store
            .set_landlord_settings(
                f.landlord,
                LandlordSettings {
                    platform_fee_percent: Some(Decimal::ZERO),
                    ..LandlordSettings::default()
                },
            )
            .await;
        let unit = completed_work_order(&f).await;

        let payment = f
            .payments
            .pay_for_work(contractor_request(&f, unit, dec!(40)))
            .await
            .unwrap();
        assert_eq!(payment.platform_fee, Decimal::ZERO);
        assert_eq!(payment.net_amount, dec!(40));
        assert!(f.store.fee_records(f.landlord).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_negative_fee_tier_is_rejected() {
        let f = fixture(dec!(100)).await;
        f.store
            .set_landlord_settings(
                f.landlord,
                LandlordSettings {
                    platform_fee_percent: Some(dec!(-10)),
                    ..LandlordSettings::default()
                },
            )
            .await;
        let unit = completed_work_order(&f).await;

        let err = f
            .payments
            .pay_for_work(contractor_request(&f, unit, dec!(40)))
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::InvalidConfig(_)));
        assert_eq!(available(&f).await, dec!(100));
        assert!(f.provider.transfers().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_payments_for_one_unit_transfer_once() {
        let f = fixture(dec!(100)).await;
        let unit = completed_work_order(&f).await;
        f.provider.set_delay(Some(Duration::from_millis(100))).await;

        let other = f.payments.clone();
        let (first, second) = tokio::join!(
            f.payments.pay_for_work(contractor_request(&f, unit, dec!(40))),
            other.pay_for_work(contractor_request(&f, unit, dec!(40))),
        );
        let outcomes = [first, second];
        let completed = outcomes
            .iter()
            .filter(|r| matches!(r, Ok(p) if p.status == PaymentStatus::Completed))
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|r| matches!(r, Err(PayoutError::DuplicatePayment { .. })))
            .count();
        assert_eq!((completed, duplicates), (1, 1));
        assert_eq!(f.provider.transfers().await.len(), 1);
        assert_eq!(available(&f).await, dec!(60));
        let debits: Vec<_> = f
            .ctx
            .ledger()
            .transactions(f.landlord)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.is_debit())
            .collect();
        assert_eq!(debits.len(), 1);
    }

    #[tokio::test]
    async fn test_kind_must_match_work_unit() {
        let f = fixture(dec!(3000)).await;
        let order = completed_work_order(&f).await;
        let sheet = WorkUnitRef::Timesheet(approved_timesheet(&f, dec!(40), dec!(25), "ba_alex").await);

        let mut team_for_order = contractor_request(&f, order, dec!(40));
        team_for_order.kind = PaymentKind::Team;
        let contractor_for_sheet = contractor_request(&f, sheet, dec!(40));
        for request in [team_for_order, contractor_for_sheet] {
            let err = f.payments.pay_for_work(request).await.unwrap_err();
            assert!(matches!(err, PayoutError::InvalidRequest(_)));
        }
        assert_eq!(available(&f).await, dec!(3000));
        assert!(f.provider.transfers().await.is_empty());

        let mut team_for_sheet = contractor_request(&f, sheet, dec!(1000));
        team_for_sheet.kind = PaymentKind::Team;
        let payment = f.payments.pay_for_work(team_for_sheet).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(unit_status(&f, sheet).await, WorkUnitStatus::Paid);
    }

    #[tokio::test]
    async fn test_another_landlords_timesheet_is_rejected() {
        let f = fixture(dec!(3000)).await;
        let sheet = WorkUnitRef::Timesheet(approved_timesheet(&f, dec!(40), dec!(25), "ba_alex").await);
        let intruder = Uuid::new_v4();
        f.ctx
            .ledger()
            .credit(CreditRequest {
                landlord_id: intruder,
                amount: dec!(3000),
                description: "rent".into(),
                reference_id: Uuid::new_v4(),
                hold_until: None,
            })
            .await
            .unwrap();

        let mut request = contractor_request(&f, sheet, dec!(1000));
        request.kind = PaymentKind::Team;
        request.landlord_id = intruder;
        let err = f.payments.pay_for_work(request).await.unwrap_err();
        assert!(matches!(err, PayoutError::InvalidRequest(_)));

        let err = f
            .payments
            .process_payroll(intruder, &[sheet.id()])
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::InvalidRequest(_)));
        assert_eq!(unit_status(&f, sheet).await, WorkUnitStatus::Approved);
        assert!(f.provider.transfers().await.is_empty());
    }

    #[tokio::test]
    async fn test_preview_skips_timesheet_already_paid() {
        let f = fixture(dec!(3000)).await;
        let first = approved_timesheet(&f, dec!(40), dec!(25), "ba_alex").await;
        let settled = approved_timesheet(&f, dec!(20), dec!(30), "ba_sam").await;
        f.work_units
            .insert(WorkUnitRef::Timesheet(settled), WorkUnitStatus::Paid)
            .await;

        let preview = f
            .payments
            .preview_payroll(f.landlord, &[first, settled])
            .await
            .unwrap();
        assert_eq!(preview.lines.len(), 1);
        assert_eq!(preview.skipped.len(), 1);
        assert_eq!(preview.skipped[0].timesheet_id, settled);
        assert_eq!(preview.total_gross, dec!(1000));
    }

    #[tokio::test]
    async fn test_payroll_pays_every_timesheet() {
        let f = fixture(dec!(3000)).await;
        let first = approved_timesheet(&f, dec!(40), dec!(25), "ba_alex").await;
        let second = approved_timesheet(&f, dec!(20), dec!(30), "ba_sam").await;

        let run = f
            .payments
            .process_payroll(f.landlord, &[first, second])
            .await
            .unwrap();
        assert!(run.is_complete());
        assert_eq!(run.total_gross, dec!(1600));
        assert_eq!(run.total_fees, dec!(40));
        assert_eq!(run.total_net, dec!(1560));
        assert_eq!(available(&f).await, dec!(1400));
        assert!(run.payments.iter().all(|p| p.batch_id == Some(run.batch_id)));
        for id in [first, second] {
            assert_eq!(unit_status(&f, WorkUnitRef::Timesheet(id)).await, WorkUnitStatus::Paid);
        }
        assert_eq!(f.notifier.events().len(), 2);
    }

    #[tokio::test]
    async fn test_payroll_refunds_failed_entries_only() {
        let f = fixture(dec!(3000)).await;
        let first = approved_timesheet(&f, dec!(40), dec!(25), "ba_alex").await;
        let second = approved_timesheet(&f, dec!(20), dec!(30), "ba_closed").await;
        f.provider
            .fail_destination(
                "ba_closed",
                ProviderError::new(ProviderErrorCode::InvalidDestination, "account closed"),
            )
            .await;

        let run = f
            .payments
            .process_payroll(f.landlord, &[first, second])
            .await
            .unwrap();
        assert!(!run.is_complete());
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].timesheet_id, second);
        assert_eq!(run.failures[0].code, ProviderErrorCode::InvalidDestination);
        assert_eq!(run.total_gross, dec!(1000));
        assert_eq!(available(&f).await, dec!(2000));
        assert_eq!(unit_status(&f, WorkUnitRef::Timesheet(first)).await, WorkUnitStatus::Paid);
        assert_eq!(
            unit_status(&f, WorkUnitRef::Timesheet(second)).await,
            WorkUnitStatus::Approved
        );
        let fees = f.store.fee_records(f.landlord).await.unwrap();
        assert_eq!(fees.len(), 1);
        assert_eq!(fees[0].amount, dec!(25.00));
    }

    #[tokio::test]
    async fn test_payroll_with_every_transfer_failing_restores_wallet() {
        let f = fixture(dec!(3000)).await;
        let first = approved_timesheet(&f, dec!(40), dec!(25), "ba_alex").await;
        f.provider
            .set_fail_always(Some(ProviderError::new(ProviderErrorCode::Generic, "down")))
            .await;

        let run = f.payments.process_payroll(f.landlord, &[first]).await.unwrap();
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.total_gross, Decimal::ZERO);
        assert_eq!(available(&f).await, dec!(3000));
        assert_eq!(
            unit_status(&f, WorkUnitRef::Timesheet(first)).await,
            WorkUnitStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_payroll_over_balance_touches_nothing() {
        let f = fixture(dec!(500)).await;
        let first = approved_timesheet(&f, dec!(40), dec!(25), "ba_alex").await;

        let err = f
            .payments
            .process_payroll(f.landlord, &[first])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PayoutError::InsufficientBalance { shortfall, .. } if shortfall == dec!(500)
        ));
        assert_eq!(available(&f).await, dec!(500));
        assert!(f.provider.transfers().await.is_empty());
        assert!(f.payments.payments_for(f.landlord).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payroll_requires_compensation() {
        let f = fixture(dec!(3000)).await;
        let first = approved_timesheet(&f, dec!(40), dec!(25), "ba_alex").await;
        let employee_id = Uuid::new_v4();
        let start = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let orphan = Timesheet {
            id: Uuid::new_v4(),
            employee_id,
            landlord_id: f.landlord,
            period_start: start,
            period_end: start,
            total_hours: dec!(8),
            regular_hours: dec!(8),
            overtime_hours: Decimal::ZERO,
            status: WorkUnitStatus::Approved,
            entries: Vec::new(),
        };
        let orphan_id = orphan.id;
        f.store.insert_timesheet(orphan).await;
        f.work_units
            .insert(WorkUnitRef::Timesheet(orphan_id), WorkUnitStatus::Approved)
            .await;

        let err = f
            .payments
            .process_payroll(f.landlord, &[first, orphan_id])
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::MissingCompensation { employee_id: id } if id == employee_id));
        assert_eq!(available(&f).await, dec!(3000));

        let preview = f
            .payments
            .preview_payroll(f.landlord, &[first, orphan_id])
            .await
            .unwrap();
        assert_eq!(preview.lines.len(), 1);
        assert_eq!(preview.skipped.len(), 1);
        assert_eq!(preview.skipped[0].timesheet_id, orphan_id);
        assert_eq!(preview.total_gross, dec!(1000));
    }

    #[tokio::test]
    async fn test_payroll_rejects_repeated_timesheet() {
        let f = fixture(dec!(3000)).await;
        let first = approved_timesheet(&f, dec!(40), dec!(25), "ba_alex").await;
        let err = f
            .payments
            .process_payroll(f.landlord, &[first, first])
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::InvalidRequest(_)));
        let err = f.payments.process_payroll(f.landlord, &[]).await.unwrap_err();
        assert!(matches!(err, PayoutError::InvalidRequest(_)));
    }
}
