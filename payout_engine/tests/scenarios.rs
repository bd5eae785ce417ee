//! End-to-end money flows through the public services.

use chrono::NaiveDate;
use payout_engine::config::EngineConfig;
use payout_engine::error::{ErrorClass, PayoutError, ProviderError, ProviderErrorCode};
use payout_engine::ledger::CreditRequest;
use payout_engine::models::{
    Compensation, DestinationKind, Money, Payee, PayType, PaymentKind, PayoutDestination,
    PayoutStatus, PayoutType, PayrollSettings, Timesheet, TransactionStatus, WorkUnitRef,
    WorkUnitStatus,
};
use payout_engine::notify::RecordingNotifier;
use payout_engine::payment::{PaymentProcessor, WorkPaymentRequest};
use payout_engine::payout::{PayoutOrchestrator, PayoutRequest};
use payout_engine::payroll::calculate_pay;
use payout_engine::provider::SandboxTransferProvider;
use payout_engine::store::MemoryStore;
use payout_engine::work_units::{MemoryWorkUnits, WorkUnits};
use payout_engine::EngineContext;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    ctx: EngineContext,
    provider: SandboxTransferProvider,
    work_units: Arc<MemoryWorkUnits>,
    landlord: Uuid,
}

impl Harness {
    async fn with_balance(balance: Money) -> Self {
        let provider = SandboxTransferProvider::new("usd", dec!(1000000));
        let work_units = Arc::new(MemoryWorkUnits::new());
        let ctx = EngineContext::new(
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(provider.clone()),
            work_units.clone(),
            Arc::new(RecordingNotifier::new()),
        );
        let landlord = Uuid::new_v4();
        ctx.ledger()
            .credit(CreditRequest {
                landlord_id: landlord,
                amount: balance,
                description: "rent for unit 4B".into(),
                reference_id: Uuid::new_v4(),
                hold_until: None,
            })
            .await
            .unwrap();
        Self {
            ctx,
            provider,
            work_units,
            landlord,
        }
    }

    async fn available(&self) -> Money {
        self.ctx
            .ledger()
            .balance(self.landlord)
            .await
            .unwrap()
            .available_balance
    }

    /// Live transactions sum to the wallet's balances.
    async fn assert_conserved(&self) {
        let balance = self.ctx.ledger().balance(self.landlord).await.unwrap();
        let total: Money = self
            .ctx
            .ledger()
            .transactions(self.landlord)
            .await
            .unwrap()
            .iter()
            .filter(|tx| tx.status != TransactionStatus::Failed)
            .map(|tx| tx.amount)
            .sum();
        assert_eq!(total, balance.available_balance + balance.pending_balance);
        assert!(balance.available_balance >= Decimal::ZERO);
    }
}

fn bank_payout(landlord_id: Uuid, amount: Money) -> PayoutRequest {
    PayoutRequest {
        landlord_id,
        amount: Some(amount),
        payout_type: PayoutType::Standard,
        destination: PayoutDestination {
            kind: DestinationKind::BankAccount,
            external_ref: "ba_landlord".into(),
            property_id: None,
        },
    }
}

#[tokio::test]
async fn standard_payout_is_free_and_debits_wallet() {
    let h = Harness::with_balance(dec!(100.00)).await;
    let payout = PayoutOrchestrator::new(h.ctx.clone())
        .create_payout(bank_payout(h.landlord, dec!(50)))
        .await
        .unwrap();
    assert_eq!(payout.fee_amount, Decimal::ZERO);
    assert_eq!(payout.net_amount, dec!(50));
    assert_eq!(payout.status, PayoutStatus::Paid);
    assert_eq!(h.available().await, dec!(50.00));
    h.assert_conserved().await;
}

#[tokio::test]
async fn payout_over_balance_changes_nothing() {
    let h = Harness::with_balance(dec!(10.00)).await;
    let err = PayoutOrchestrator::new(h.ctx.clone())
        .create_payout(bank_payout(h.landlord, dec!(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, PayoutError::InsufficientBalance { .. }));
    assert_eq!(err.class(), ErrorClass::UserCorrectable);
    assert_eq!(h.available().await, dec!(10.00));
    assert!(h.provider.transfers().await.is_empty());
}

#[tokio::test]
async fn work_order_is_paid_exactly_once() {
    let h = Harness::with_balance(dec!(100.00)).await;
    let unit = WorkUnitRef::WorkOrder(Uuid::new_v4());
    h.work_units.insert(unit, WorkUnitStatus::Completed).await;
    let request = WorkPaymentRequest {
        landlord_id: h.landlord,
        kind: PaymentKind::Contractor,
        payee: Payee {
            id: Uuid::new_v4(),
            name: "Reliable Plumbing".into(),
            destination: PayoutDestination {
                kind: DestinationKind::BankAccount,
                external_ref: "ba_plumbing".into(),
                property_id: None,
            },
        },
        work_unit: unit,
        amount: dec!(40),
    };
    let payments = PaymentProcessor::new(h.ctx.clone());

    let payment = payments.pay_for_work(request.clone()).await.unwrap();
    assert_eq!(payment.platform_fee, dec!(1.00));
    assert_eq!(payment.net_amount, dec!(39.00));
    assert_eq!(
        h.work_units.status(unit).await.unwrap(),
        Some(WorkUnitStatus::Paid)
    );

    let err = payments.pay_for_work(request).await.unwrap_err();
    assert!(matches!(err, PayoutError::DuplicatePayment { .. }));
    assert_eq!(h.available().await, dec!(60.00));
    h.assert_conserved().await;
}

#[test]
fn overtime_is_paid_at_the_overtime_rate() {
    let start = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
    let employee_id = Uuid::new_v4();
    let timesheet = Timesheet {
        id: Uuid::new_v4(),
        employee_id,
        landlord_id: Uuid::new_v4(),
        period_start: start,
        period_end: start + chrono::Duration::days(6),
        total_hours: dec!(45),
        regular_hours: dec!(40),
        overtime_hours: dec!(5),
        status: WorkUnitStatus::Approved,
        entries: Vec::new(),
    };
    let compensation = Compensation {
        employee_id,
        pay_type: PayType::Hourly,
        hourly_rate: Some(dec!(20)),
        overtime_rate: Some(dec!(30)),
        salary_amount: None,
        payee: Payee {
            id: Uuid::new_v4(),
            name: "Jordan".into(),
            destination: PayoutDestination {
                kind: DestinationKind::BankAccount,
                external_ref: "ba_jordan".into(),
                property_id: None,
            },
        },
    };
    let pay = calculate_pay(&compensation, &timesheet, &PayrollSettings::default()).unwrap();
    assert_eq!(pay.regular_pay, dec!(800));
    assert_eq!(pay.overtime_pay, dec!(150));
    assert_eq!(pay.gross_amount, dec!(950.00));
}

#[tokio::test]
async fn provider_failure_restores_balance() {
    let h = Harness::with_balance(dec!(100.00)).await;
    h.provider
        .set_fail_always(Some(ProviderError::new(
            ProviderErrorCode::Generic,
            "connection reset",
        )))
        .await;
    let payouts = PayoutOrchestrator::new(h.ctx.clone());

    let err = payouts
        .create_payout(bank_payout(h.landlord, dec!(30)))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::TransferFailed);
    assert_eq!(h.available().await, dec!(100.00));
    let recorded = payouts.payouts_for(h.landlord).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, PayoutStatus::Failed);
    h.assert_conserved().await;
}
