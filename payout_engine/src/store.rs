//! Transactional data store.
//!
//! Every mutation goes through [`LedgerStore::commit`] as one
//! [`WriteBatch`]: either every record in the batch is written or none
//! is.  Wallet writes carry the version they were computed from, and
//! the store rejects the batch with [`StoreError::VersionConflict`] when
//! the wallet has moved on in the meantime.

use crate::error::StoreError;
use crate::models::{
    Compensation, LandlordSettings, PaymentStatus, Payout, PlatformFeeRecord, Timesheet,
    TransactionKind, TransactionStatus, Wallet, WalletTransaction, WorkPayment, WorkUnitRef,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A wallet row together with the version it replaces.
#[derive(Debug, Clone)]
pub struct WalletWrite {
    pub wallet: Wallet,
    /// `None` inserts a new wallet; the landlord must not have one yet.
    pub expected_version: Option<u64>,
}

/// Records written atomically.  Transactions, payouts and payments are
/// upserted by id; fee records are appended.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub wallet: Option<WalletWrite>,
    pub transactions: Vec<WalletTransaction>,
    pub payouts: Vec<Payout>,
    pub payments: Vec<WorkPayment>,
    pub fees: Vec<PlatformFeeRecord>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payout(mut self, payout: Payout) -> Self {
        self.payouts.push(payout);
        self
    }

    pub fn with_payment(mut self, payment: WorkPayment) -> Self {
        self.payments.push(payment);
        self
    }

    pub fn with_payments(mut self, payments: impl IntoIterator<Item = WorkPayment>) -> Self {
        self.payments.extend(payments);
        self
    }

    pub fn with_fee(mut self, fee: PlatformFeeRecord) -> Self {
        self.fees.push(fee);
        self
    }

    pub fn with_fees(mut self, fees: impl IntoIterator<Item = PlatformFeeRecord>) -> Self {
        self.fees.extend(fees);
        self
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, StoreError>;

    async fn wallet_for(&self, landlord_id: Uuid) -> Result<Option<Wallet>, StoreError>;

    async fn transaction(&self, id: Uuid) -> Result<Option<WalletTransaction>, StoreError>;

    /// The wallet's log, oldest first.
    async fn transactions(&self, wallet_id: Uuid) -> Result<Vec<WalletTransaction>, StoreError>;

    async fn credit_by_reference(
        &self,
        wallet_id: Uuid,
        reference_id: Uuid,
    ) -> Result<Option<WalletTransaction>, StoreError>;

    async fn payout(&self, id: Uuid) -> Result<Option<Payout>, StoreError>;

    async fn payouts_for(&self, landlord_id: Uuid) -> Result<Vec<Payout>, StoreError>;

    async fn payment(&self, id: Uuid) -> Result<Option<WorkPayment>, StoreError>;

    async fn payments_for(&self, landlord_id: Uuid) -> Result<Vec<WorkPayment>, StoreError>;

    /// A pending or completed payment for `work_unit`, if any.
    async fn active_payment_for(
        &self,
        work_unit: WorkUnitRef,
    ) -> Result<Option<WorkPayment>, StoreError>;

    async fn fee_records(&self, landlord_id: Uuid) -> Result<Vec<PlatformFeeRecord>, StoreError>;

    async fn timesheet(&self, id: Uuid) -> Result<Option<Timesheet>, StoreError>;

    async fn compensation(&self, employee_id: Uuid) -> Result<Option<Compensation>, StoreError>;

    async fn landlord_settings(
        &self,
        landlord_id: Uuid,
    ) -> Result<Option<LandlordSettings>, StoreError>;

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

fn is_active(status: PaymentStatus) -> bool {
    matches!(status, PaymentStatus::Pending | PaymentStatus::Completed)
}

#[derive(Default)]
struct MemoryState {
    wallets: HashMap<Uuid, Wallet>,
    wallet_by_landlord: HashMap<Uuid, Uuid>,
    transactions: HashMap<Uuid, WalletTransaction>,
    transaction_order: Vec<Uuid>,
    payouts: HashMap<Uuid, Payout>,
    payments: HashMap<Uuid, WorkPayment>,
    fees: Vec<PlatformFeeRecord>,
    timesheets: HashMap<Uuid, Timesheet>,
    compensation: HashMap<Uuid, Compensation>,
    settings: HashMap<Uuid, LandlordSettings>,
    injected_conflicts: u32,
    failing_commits: u32,
    fail_commits: bool,
}

impl MemoryState {
    /// Checks every constraint of `batch` without writing anything.
    fn check(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if let Some(write) = &batch.wallet {
            let wallet = &write.wallet;
            match write.expected_version {
                None => {
                    if self.wallet_by_landlord.contains_key(&wallet.landlord_id) {
                        return Err(StoreError::VersionConflict {
                            wallet_id: wallet.id,
                            expected: 0,
                        });
                    }
                }
                Some(expected) => {
                    let current = self.wallets.get(&wallet.id).ok_or(StoreError::NotFound {
                        entity: "wallet",
                        id: wallet.id,
                    })?;
                    if current.version != expected {
                        return Err(StoreError::VersionConflict {
                            wallet_id: wallet.id,
                            expected,
                        });
                    }
                }
            }
            if wallet.available_balance < Decimal::ZERO || wallet.pending_balance < Decimal::ZERO {
                return Err(StoreError::Rejected(format!(
                    "wallet {} balance would go negative",
                    wallet.id
                )));
            }
        }

        for tx in &batch.transactions {
            if let Some(existing) = self.transactions.get(&tx.id) {
                if existing.status != TransactionStatus::Pending {
                    return Err(StoreError::Immutable {
                        entity: "wallet transaction",
                        id: tx.id,
                    });
                }
            } else if tx.kind == TransactionKind::Credit {
                if let Some(reference_id) = tx.reference_id {
                    let duplicate = self.transactions.values().any(|other| {
                        other.wallet_id == tx.wallet_id
                            && other.kind == TransactionKind::Credit
                            && other.reference_id == Some(reference_id)
                    });
                    if duplicate {
                        return Err(StoreError::UniqueViolation(format!(
                            "credit reference {reference_id}"
                        )));
                    }
                }
            }
        }

        for payment in batch.payments.iter().filter(|p| is_active(p.status)) {
            let taken = self.payments.values().any(|other| {
                other.id != payment.id
                    && other.work_unit == payment.work_unit
                    && is_active(other.status)
            });
            if taken {
                return Err(StoreError::UniqueViolation(format!(
                    "payment for {}",
                    payment.work_unit
                )));
            }
        }
        Ok(())
    }

    fn apply(&mut self, batch: WriteBatch) {
        if let Some(write) = batch.wallet {
            self.wallet_by_landlord
                .insert(write.wallet.landlord_id, write.wallet.id);
            self.wallets.insert(write.wallet.id, write.wallet);
        }
        for tx in batch.transactions {
            if !self.transactions.contains_key(&tx.id) {
                self.transaction_order.push(tx.id);
            }
            self.transactions.insert(tx.id, tx);
        }
        for payout in batch.payouts {
            self.payouts.insert(payout.id, payout);
        }
        for payment in batch.payments {
            self.payments.insert(payment.id, payment);
        }
        self.fees.extend(batch.fees);
    }
}

/// In-memory [`LedgerStore`].
///
/// A single lock around the whole state makes each commit atomic.  Test
/// hooks inject version conflicts and outages.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_timesheet(&self, timesheet: Timesheet) {
        self.state
            .write()
            .await
            .timesheets
            .insert(timesheet.id, timesheet);
    }

    pub async fn insert_compensation(&self, compensation: Compensation) {
        self.state
            .write()
            .await
            .compensation
            .insert(compensation.employee_id, compensation);
    }

    pub async fn set_landlord_settings(&self, landlord_id: Uuid, settings: LandlordSettings) {
        self.state.write().await.settings.insert(landlord_id, settings);
    }

    /// Makes the next `count` wallet writes fail with a version conflict,
    /// as if another writer got there first.
    pub async fn inject_conflicts(&self, count: u32) {
        self.state.write().await.injected_conflicts = count;
    }

    /// Makes the next `count` commits fail as if the store were down.
    pub async fn fail_next_commits(&self, count: u32) {
        self.state.write().await.failing_commits = count;
    }

    /// Makes every commit fail until cleared.
    pub async fn set_fail_commits(&self, fail: bool) {
        self.state.write().await.fail_commits = fail;
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, StoreError> {
        Ok(self.state.read().await.wallets.get(&wallet_id).cloned())
    }

    async fn wallet_for(&self, landlord_id: Uuid) -> Result<Option<Wallet>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .wallet_by_landlord
            .get(&landlord_id)
            .and_then(|id| state.wallets.get(id))
            .cloned())
    }

    async fn transaction(&self, id: Uuid) -> Result<Option<WalletTransaction>, StoreError> {
        Ok(self.state.read().await.transactions.get(&id).cloned())
    }

    async fn transactions(&self, wallet_id: Uuid) -> Result<Vec<WalletTransaction>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .transaction_order
            .iter()
            .filter_map(|id| state.transactions.get(id))
            .filter(|tx| tx.wallet_id == wallet_id)
            .cloned()
            .collect())
    }

    async fn credit_by_reference(
        &self,
        wallet_id: Uuid,
        reference_id: Uuid,
    ) -> Result<Option<WalletTransaction>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .values()
            .find(|tx| {
                tx.wallet_id == wallet_id
                    && tx.kind == TransactionKind::Credit
                    && tx.reference_id == Some(reference_id)
            })
            .cloned())
    }

    async fn payout(&self, id: Uuid) -> Result<Option<Payout>, StoreError> {
        Ok(self.state.read().await.payouts.get(&id).cloned())
    }

    async fn payouts_for(&self, landlord_id: Uuid) -> Result<Vec<Payout>, StoreError> {
        let mut payouts: Vec<Payout> = self
            .state
            .read()
            .await
            .payouts
            .values()
            .filter(|p| p.landlord_id == landlord_id)
            .cloned()
            .collect();
        payouts.sort_by_key(|p| p.initiated_at);
        Ok(payouts)
    }

    async fn payment(&self, id: Uuid) -> Result<Option<WorkPayment>, StoreError> {
        Ok(self.state.read().await.payments.get(&id).cloned())
    }

    async fn payments_for(&self, landlord_id: Uuid) -> Result<Vec<WorkPayment>, StoreError> {
        let mut payments: Vec<WorkPayment> = self
            .state
            .read()
            .await
            .payments
            .values()
            .filter(|p| p.landlord_id == landlord_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn active_payment_for(
        &self,
        work_unit: WorkUnitRef,
    ) -> Result<Option<WorkPayment>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .payments
            .values()
            .find(|p| p.work_unit == work_unit && is_active(p.status))
            .cloned())
    }

    async fn fee_records(&self, landlord_id: Uuid) -> Result<Vec<PlatformFeeRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .fees
            .iter()
            .filter(|f| f.landlord_id == landlord_id)
            .cloned()
            .collect())
    }

    async fn timesheet(&self, id: Uuid) -> Result<Option<Timesheet>, StoreError> {
        Ok(self.state.read().await.timesheets.get(&id).cloned())
    }

    async fn compensation(&self, employee_id: Uuid) -> Result<Option<Compensation>, StoreError> {
        Ok(self.state.read().await.compensation.get(&employee_id).cloned())
    }

    async fn landlord_settings(
        &self,
        landlord_id: Uuid,
    ) -> Result<Option<LandlordSettings>, StoreError> {
        Ok(self.state.read().await.settings.get(&landlord_id).cloned())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.fail_commits {
            return Err(StoreError::Unavailable("commits disabled".into()));
        }
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StoreError::Unavailable("transient outage".into()));
        }
        if let Some(write) = &batch.wallet {
            if state.injected_conflicts > 0 {
                state.injected_conflicts -= 1;
                return Err(StoreError::VersionConflict {
                    wallet_id: write.wallet.id,
                    expected: write.expected_version.unwrap_or(0),
                });
            }
        }
        state.check(&batch)?;
        state.apply(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DestinationKind, Payee, PaymentKind, PayoutDestination, TransactionStatus,
    };
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn wallet_write(wallet: Wallet, expected_version: Option<u64>) -> WriteBatch {
        WriteBatch {
            wallet: Some(WalletWrite {
                wallet,
                expected_version,
            }),
            ..WriteBatch::default()
        }
    }

    fn payment(work_unit: WorkUnitRef, status: PaymentStatus) -> WorkPayment {
        WorkPayment {
            id: Uuid::new_v4(),
            landlord_id: Uuid::new_v4(),
            kind: PaymentKind::Contractor,
            payee: Payee {
                id: Uuid::new_v4(),
                name: "Plumber".into(),
                destination: PayoutDestination {
                    kind: DestinationKind::BankAccount,
                    external_ref: "acct_plumber".into(),
                    property_id: None,
                },
            },
            work_unit,
            amount: dec!(40),
            platform_fee: dec!(1),
            net_amount: dec!(39),
            status,
            batch_id: None,
            provider_transfer_id: None,
            failure: None,
            created_at: Utc::now(),
            paid_at: None,
        }
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryStore::new();
        let mut wallet = Wallet::open(Uuid::new_v4(), Utc::now());
        store.commit(wallet_write(wallet.clone(), None)).await.unwrap();

        wallet.version = 1;
        wallet.available_balance = dec!(10);
        store.commit(wallet_write(wallet.clone(), Some(0))).await.unwrap();

        wallet.version = 2;
        let err = store.commit(wallet_write(wallet, Some(0))).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, .. }));
    }

    #[tokio::test]
    async fn test_second_wallet_for_landlord_conflicts() {
        let store = MemoryStore::new();
        let landlord = Uuid::new_v4();
        store
            .commit(wallet_write(Wallet::open(landlord, Utc::now()), None))
            .await
            .unwrap();
        let err = store
            .commit(wallet_write(Wallet::open(landlord, Utc::now()), None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_settled_transaction_is_immutable() {
        let store = MemoryStore::new();
        let mut tx = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: Uuid::new_v4(),
            kind: TransactionKind::Payout,
            amount: dec!(-5),
            description: "payout".into(),
            status: TransactionStatus::Completed,
            reference_id: None,
            available_at: None,
            created_at: Utc::now(),
            settled_at: Some(Utc::now()),
        };
        store
            .commit(WriteBatch {
                transactions: vec![tx.clone()],
                ..WriteBatch::default()
            })
            .await
            .unwrap();
        tx.status = TransactionStatus::Failed;
        let err = store
            .commit(WriteBatch {
                transactions: vec![tx],
                ..WriteBatch::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Immutable { .. }));
    }

    #[tokio::test]
    async fn test_one_active_payment_per_work_unit() {
        let store = MemoryStore::new();
        let unit = WorkUnitRef::WorkOrder(Uuid::new_v4());
        store
            .commit(WriteBatch::new().with_payment(payment(unit, PaymentStatus::Completed)))
            .await
            .unwrap();
        let err = store
            .commit(WriteBatch::new().with_payment(payment(unit, PaymentStatus::Pending)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));

        // failed attempts never block a retry
        store
            .commit(WriteBatch::new().with_payment(payment(unit, PaymentStatus::Failed)))
            .await
            .unwrap();
        assert!(store.active_payment_for(unit).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_batch_writes_nothing() {
        let store = MemoryStore::new();
        let unit = WorkUnitRef::Timesheet(Uuid::new_v4());
        store
            .commit(WriteBatch::new().with_payment(payment(unit, PaymentStatus::Completed)))
            .await
            .unwrap();

        let landlord = Uuid::new_v4();
        let batch = wallet_write(Wallet::open(landlord, Utc::now()), None)
            .with_payment(payment(unit, PaymentStatus::Pending));
        assert!(store.commit(batch).await.is_err());
        assert!(store.wallet_for(landlord).await.unwrap().is_none());
    }
}
