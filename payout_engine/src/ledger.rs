//! Wallet ledger.
//!
//! The ledger owns every change to a wallet's balances.  Debits follow a
//! reserve/settle discipline: [`Ledger::reserve_debit`] takes the money
//! out of the available balance before any external call is made, and
//! the returned [`Reservation`] must then be consumed by exactly one of
//! [`Ledger::commit_debit`] or [`Ledger::cancel_debit`].
//!
//! Writes use optimistic concurrency on the wallet row.  A version
//! conflict restarts the whole step from the balance read, a bounded
//! number of times.

use crate::clock::Clock;
use crate::error::{PayoutError, Result, StoreError};
use crate::models::{
    round_money, Money, TransactionKind, TransactionStatus, Wallet, WalletTransaction,
};
use crate::store::{LedgerStore, WalletWrite, WriteBatch};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMPENSATION_BACKOFF: Duration = Duration::from_millis(50);

/// A credit into a landlord's wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditRequest {
    pub landlord_id: Uuid,
    pub amount: Money,
    pub description: String,
    /// Id of the originating charge.  A second credit with the same
    /// reference is rejected.
    pub reference_id: Uuid,
    /// Funds land in the pending balance until this instant.
    #[serde(default)]
    pub hold_until: Option<DateTime<Utc>>,
}

/// A debit about to be reserved.
#[derive(Debug, Clone)]
pub struct DebitRequest {
    pub landlord_id: Uuid,
    pub amount: Money,
    pub kind: TransactionKind,
    pub reference_id: Uuid,
    pub description: String,
}

/// Money taken out of the available balance and not yet settled.
///
/// Deliberately neither `Clone` nor `Copy`: settling consumes it.
#[derive(Debug)]
#[must_use = "a reservation must be committed or cancelled"]
pub struct Reservation {
    transaction_id: Uuid,
    wallet_id: Uuid,
    landlord_id: Uuid,
    amount: Money,
    kind: TransactionKind,
    reference_id: Uuid,
}

impl Reservation {
    pub fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    pub fn wallet_id(&self) -> Uuid {
        self.wallet_id
    }

    pub fn landlord_id(&self) -> Uuid {
        self.landlord_id
    }

    /// Amount still held by this reservation.
    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn reference_id(&self) -> Uuid {
        self.reference_id
    }
}

/// Point-in-time view of a wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub landlord_id: Uuid,
    pub wallet_id: Option<Uuid>,
    pub available_balance: Money,
    pub pending_balance: Money,
    pub last_payout_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        Self {
            store,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs `step` until it succeeds, fails with something other than a
    /// version conflict, or the attempt budget is spent.
    async fn retry_on_conflict<T, F, Fut>(&self, mut step: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match step().await {
                Err(PayoutError::Store(StoreError::VersionConflict { wallet_id, .. })) => {
                    if attempt >= self.max_attempts {
                        warn!(%wallet_id, attempts = attempt, "giving up after repeated wallet conflicts");
                        return Err(PayoutError::ConcurrencyConflict {
                            wallet_id,
                            attempts: attempt,
                        });
                    }
                    debug!(%wallet_id, attempt, "wallet changed underneath us, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Like [`Ledger::retry_on_conflict`], but also waits out a store
    /// outage.  Used for compensating writes, which must not be dropped
    /// after money has failed to move.
    async fn retry_compensation<T, F, Fut>(&self, mut step: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match self.retry_on_conflict(&mut step).await {
                Err(PayoutError::Store(StoreError::Unavailable(reason))) if attempt < self.max_attempts => {
                    warn!(%reason, attempt, "store unavailable during compensation, retrying");
                    tokio::time::sleep(COMPENSATION_BACKOFF * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    #[tracing::instrument(name = "ledger.credit", skip_all, fields(landlord_id = %request.landlord_id, reference_id = %request.reference_id))]
    pub async fn credit(&self, request: CreditRequest) -> Result<WalletTransaction> {
        let amount = round_money(request.amount);
        if amount <= Decimal::ZERO {
            return Err(PayoutError::AmountTooSmall {
                amount,
                minimum: dec!(0.01),
            });
        }
        let tx = self
            .retry_on_conflict(|| self.try_credit(&request, amount))
            .await?;
        info!(amount = %amount, status = ?tx.status, "wallet credited");
        Ok(tx)
    }

    async fn try_credit(&self, request: &CreditRequest, amount: Money) -> Result<WalletTransaction> {
        let now = self.clock.now();
        let (mut wallet, expected_version) = match self.store.wallet_for(request.landlord_id).await? {
            Some(wallet) => {
                if self
                    .store
                    .credit_by_reference(wallet.id, request.reference_id)
                    .await?
                    .is_some()
                {
                    return Err(PayoutError::DuplicateCredit {
                        reference_id: request.reference_id,
                    });
                }
                let version = wallet.version;
                (wallet, Some(version))
            }
            None => (Wallet::open(request.landlord_id, now), None),
        };

        let held = request.hold_until.filter(|until| *until > now);
        if held.is_some() {
            wallet.pending_balance = add_money(wallet.pending_balance, amount)?;
        } else {
            wallet.available_balance = add_money(wallet.available_balance, amount)?;
        }
        bump(&mut wallet, now);

        let tx = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            kind: TransactionKind::Credit,
            amount,
            description: request.description.clone(),
            status: if held.is_some() {
                TransactionStatus::Pending
            } else {
                TransactionStatus::Completed
            },
            reference_id: Some(request.reference_id),
            available_at: held,
            created_at: now,
            settled_at: if held.is_some() { None } else { Some(now) },
        };
        let batch = WriteBatch {
            wallet: Some(WalletWrite {
                wallet,
                expected_version,
            }),
            transactions: vec![tx.clone()],
            ..WriteBatch::default()
        };
        match self.store.commit(batch).await {
            Err(StoreError::UniqueViolation(_)) => Err(PayoutError::DuplicateCredit {
                reference_id: request.reference_id,
            }),
            other => other.map(|_| tx).map_err(PayoutError::from),
        }
    }

    /// Moves a matured held credit into the available balance.
    #[tracing::instrument(name = "ledger.release_hold", skip(self))]
    pub async fn release_hold(&self, transaction_id: Uuid) -> Result<WalletTransaction> {
        self.retry_on_conflict(|| self.try_release_hold(transaction_id))
            .await
    }

    async fn try_release_hold(&self, transaction_id: Uuid) -> Result<WalletTransaction> {
        let now = self.clock.now();
        let mut tx = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or(PayoutError::TransactionNotFound(transaction_id))?;
        if tx.kind != TransactionKind::Credit || tx.status != TransactionStatus::Pending {
            return Err(PayoutError::InvalidTransactionState {
                transaction_id,
                action: "released",
                reason: format!("{:?} {:?} is not a held credit", tx.status, tx.kind),
            });
        }
        if tx.available_at.is_some_and(|at| at > now) {
            return Err(PayoutError::HoldNotMatured { transaction_id });
        }
        let mut wallet = self.load_wallet(tx.wallet_id).await?;
        let expected_version = wallet.version;
        move_to_available(&mut wallet, tx.amount)?;
        bump(&mut wallet, now);
        tx.status = TransactionStatus::Completed;
        tx.settled_at = Some(now);

        self.store
            .commit(WriteBatch {
                wallet: Some(WalletWrite {
                    wallet,
                    expected_version: Some(expected_version),
                }),
                transactions: vec![tx.clone()],
                ..WriteBatch::default()
            })
            .await?;
        Ok(tx)
    }

    /// Releases every matured hold on the landlord's wallet in one step.
    #[tracing::instrument(name = "ledger.release_matured", skip(self))]
    pub async fn release_matured(&self, landlord_id: Uuid) -> Result<Vec<WalletTransaction>> {
        let released = self
            .retry_on_conflict(|| self.try_release_matured(landlord_id))
            .await?;
        if !released.is_empty() {
            info!(count = released.len(), "released matured holds");
        }
        Ok(released)
    }

    async fn try_release_matured(&self, landlord_id: Uuid) -> Result<Vec<WalletTransaction>> {
        let now = self.clock.now();
        let Some(mut wallet) = self.store.wallet_for(landlord_id).await? else {
            return Ok(Vec::new());
        };
        let matured: Vec<WalletTransaction> = self
            .store
            .transactions(wallet.id)
            .await?
            .into_iter()
            .filter(|tx| {
                tx.kind == TransactionKind::Credit
                    && tx.status == TransactionStatus::Pending
                    && tx.available_at.map_or(true, |at| at <= now)
            })
            .map(|mut tx| {
                tx.status = TransactionStatus::Completed;
                tx.settled_at = Some(now);
                tx
            })
            .collect();
        if matured.is_empty() {
            return Ok(matured);
        }

        let expected_version = wallet.version;
        for tx in &matured {
            move_to_available(&mut wallet, tx.amount)?;
        }
        bump(&mut wallet, now);
        self.store
            .commit(WriteBatch {
                wallet: Some(WalletWrite {
                    wallet,
                    expected_version: Some(expected_version),
                }),
                transactions: matured.clone(),
                ..WriteBatch::default()
            })
            .await?;
        Ok(matured)
    }

    /// Current balances, after releasing any matured holds.
    pub async fn balance(&self, landlord_id: Uuid) -> Result<WalletBalance> {
        self.release_matured(landlord_id).await?;
        let balance = match self.store.wallet_for(landlord_id).await? {
            Some(wallet) => WalletBalance {
                landlord_id,
                wallet_id: Some(wallet.id),
                available_balance: wallet.available_balance,
                pending_balance: wallet.pending_balance,
                last_payout_at: wallet.last_payout_at,
            },
            None => WalletBalance {
                landlord_id,
                wallet_id: None,
                available_balance: Decimal::ZERO,
                pending_balance: Decimal::ZERO,
                last_payout_at: None,
            },
        };
        Ok(balance)
    }

    /// The landlord's transaction log, oldest first.
    pub async fn transactions(&self, landlord_id: Uuid) -> Result<Vec<WalletTransaction>> {
        match self.store.wallet_for(landlord_id).await? {
            Some(wallet) => Ok(self.store.transactions(wallet.id).await?),
            None => Ok(Vec::new()),
        }
    }

    /// Takes `request.amount` out of the available balance.
    ///
    /// `records` are written in the same atomic step, so a pending
    /// payout or payment row exists exactly when the reservation does.
    #[tracing::instrument(name = "ledger.reserve_debit", skip_all, fields(landlord_id = %request.landlord_id, reference_id = %request.reference_id, amount = %request.amount))]
    pub async fn reserve_debit(
        &self,
        request: DebitRequest,
        records: WriteBatch,
    ) -> Result<Reservation> {
        let amount = round_money(request.amount);
        if amount <= Decimal::ZERO {
            return Err(PayoutError::AmountTooSmall {
                amount,
                minimum: dec!(0.01),
            });
        }
        if request.kind == TransactionKind::Credit {
            return Err(PayoutError::InvalidRequest(
                "credits cannot be reserved as debits".into(),
            ));
        }
        let reservation = self
            .retry_on_conflict(|| self.try_reserve(&request, amount, records.clone()))
            .await?;
        debug!(transaction_id = %reservation.transaction_id, "debit reserved");
        Ok(reservation)
    }

    async fn try_reserve(
        &self,
        request: &DebitRequest,
        amount: Money,
        records: WriteBatch,
    ) -> Result<Reservation> {
        let now = self.clock.now();
        let Some(mut wallet) = self.store.wallet_for(request.landlord_id).await? else {
            return Err(insufficient(Decimal::ZERO, amount));
        };
        if wallet.available_balance < amount {
            return Err(insufficient(wallet.available_balance, amount));
        }
        let expected_version = wallet.version;
        wallet.available_balance -= amount;
        bump(&mut wallet, now);

        let tx = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            kind: request.kind,
            amount: -amount,
            description: request.description.clone(),
            status: TransactionStatus::Pending,
            reference_id: Some(request.reference_id),
            available_at: None,
            created_at: now,
            settled_at: None,
        };
        let reservation = Reservation {
            transaction_id: tx.id,
            wallet_id: wallet.id,
            landlord_id: request.landlord_id,
            amount,
            kind: request.kind,
            reference_id: request.reference_id,
        };
        let mut batch = records;
        batch.wallet = Some(WalletWrite {
            wallet,
            expected_version: Some(expected_version),
        });
        batch.transactions.push(tx);
        self.store.commit(batch).await?;
        Ok(reservation)
    }

    /// Finalises a reservation: the debit becomes a completed transaction.
    #[tracing::instrument(name = "ledger.commit_debit", skip_all, fields(transaction_id = %reservation.transaction_id, amount = %reservation.amount))]
    pub async fn commit_debit(
        &self,
        reservation: Reservation,
        records: WriteBatch,
    ) -> Result<WalletTransaction> {
        let tx = self
            .retry_compensation(|| self.try_commit(&reservation, records.clone()))
            .await?;
        debug!("debit committed");
        Ok(tx)
    }

    async fn try_commit(
        &self,
        reservation: &Reservation,
        records: WriteBatch,
    ) -> Result<WalletTransaction> {
        let now = self.clock.now();
        let mut tx = self.pending_debit(reservation).await?;
        tx.amount = -reservation.amount;
        tx.status = TransactionStatus::Completed;
        tx.settled_at = Some(now);

        let mut batch = records;
        if reservation.kind == TransactionKind::Payout {
            let mut wallet = self.load_wallet(reservation.wallet_id).await?;
            let expected_version = wallet.version;
            wallet.last_payout_at = Some(now);
            bump(&mut wallet, now);
            batch.wallet = Some(WalletWrite {
                wallet,
                expected_version: Some(expected_version),
            });
        }
        batch.transactions.push(tx.clone());
        self.store.commit(batch).await?;
        Ok(tx)
    }

    /// Undoes a reservation: the held amount goes back to the available
    /// balance and the transaction is marked failed.
    #[tracing::instrument(name = "ledger.cancel_debit", skip_all, fields(transaction_id = %reservation.transaction_id, amount = %reservation.amount))]
    pub async fn cancel_debit(
        &self,
        reservation: Reservation,
        records: WriteBatch,
    ) -> Result<WalletTransaction> {
        let tx = self
            .retry_compensation(|| self.try_cancel(&reservation, records.clone()))
            .await?;
        info!("reservation cancelled, balance restored");
        Ok(tx)
    }

    /// Cancels a debit still pending by its transaction id.
    ///
    /// Reconciliation entry point for reservations whose owner went away
    /// before settling them; `records` typically marks the matching
    /// payout or payment failed.
    #[tracing::instrument(name = "ledger.cancel_pending_debit", skip(self, records))]
    pub async fn cancel_pending_debit(
        &self,
        transaction_id: Uuid,
        records: WriteBatch,
    ) -> Result<WalletTransaction> {
        let tx = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or(PayoutError::TransactionNotFound(transaction_id))?;
        if tx.status != TransactionStatus::Pending || !tx.is_debit() {
            return Err(PayoutError::InvalidTransactionState {
                transaction_id,
                action: "cancelled",
                reason: format!("{:?} {:?} is not a pending debit", tx.status, tx.kind),
            });
        }
        let wallet = self.load_wallet(tx.wallet_id).await?;
        let reservation = Reservation {
            transaction_id,
            wallet_id: wallet.id,
            landlord_id: wallet.landlord_id,
            amount: -tx.amount,
            kind: tx.kind,
            reference_id: tx.reference_id.unwrap_or(transaction_id),
        };
        self.cancel_debit(reservation, records).await
    }

    /// Debits reserved but never settled.
    pub async fn pending_debits(&self, landlord_id: Uuid) -> Result<Vec<WalletTransaction>> {
        Ok(self
            .transactions(landlord_id)
            .await?
            .into_iter()
            .filter(|tx| tx.is_debit() && tx.status == TransactionStatus::Pending)
            .collect())
    }

    async fn try_cancel(
        &self,
        reservation: &Reservation,
        records: WriteBatch,
    ) -> Result<WalletTransaction> {
        let now = self.clock.now();
        let mut tx = self.pending_debit(reservation).await?;
        let mut wallet = self.load_wallet(reservation.wallet_id).await?;
        let expected_version = wallet.version;
        wallet.available_balance = add_money(wallet.available_balance, reservation.amount)?;
        bump(&mut wallet, now);
        tx.status = TransactionStatus::Failed;
        tx.settled_at = Some(now);

        let mut batch = records;
        batch.wallet = Some(WalletWrite {
            wallet,
            expected_version: Some(expected_version),
        });
        batch.transactions.push(tx.clone());
        self.store.commit(batch).await?;
        Ok(tx)
    }

    /// Returns `amount` of a reservation to the available balance while
    /// keeping the rest reserved.  Used when some entries of a batch
    /// fail; to give back everything use [`Ledger::cancel_debit`].
    #[tracing::instrument(name = "ledger.release_partial", skip_all, fields(transaction_id = %reservation.transaction_id, amount = %amount))]
    pub async fn release_partial(
        &self,
        reservation: &mut Reservation,
        amount: Money,
        records: WriteBatch,
    ) -> Result<()> {
        let amount = round_money(amount);
        if amount <= Decimal::ZERO || amount >= reservation.amount {
            return Err(PayoutError::InvalidRequest(format!(
                "partial release of {amount} must be between 0 and {}",
                reservation.amount
            )));
        }
        let remaining = reservation.amount - amount;
        let held: &Reservation = reservation;
        self.retry_compensation(|| self.try_release_partial(held, amount, remaining, records.clone()))
            .await?;
        reservation.amount = remaining;
        info!(%remaining, "partially released reservation");
        Ok(())
    }

    async fn try_release_partial(
        &self,
        reservation: &Reservation,
        amount: Money,
        remaining: Money,
        records: WriteBatch,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut tx = self.pending_debit(reservation).await?;
        let mut wallet = self.load_wallet(reservation.wallet_id).await?;
        let expected_version = wallet.version;
        wallet.available_balance = add_money(wallet.available_balance, amount)?;
        bump(&mut wallet, now);
        tx.amount = -remaining;

        let mut batch = records;
        batch.wallet = Some(WalletWrite {
            wallet,
            expected_version: Some(expected_version),
        });
        batch.transactions.push(tx);
        self.store.commit(batch).await?;
        Ok(())
    }

    async fn load_wallet(&self, wallet_id: Uuid) -> Result<Wallet> {
        self.store
            .wallet(wallet_id)
            .await?
            .ok_or(PayoutError::NotFound {
                entity: "wallet",
                id: wallet_id,
            })
    }

    async fn pending_debit(&self, reservation: &Reservation) -> Result<WalletTransaction> {
        let tx = self
            .store
            .transaction(reservation.transaction_id)
            .await?
            .ok_or(PayoutError::TransactionNotFound(reservation.transaction_id))?;
        if tx.status != TransactionStatus::Pending || !tx.is_debit() {
            return Err(PayoutError::InvalidTransactionState {
                transaction_id: tx.id,
                action: "settled",
                reason: format!("reservation is already {:?}", tx.status),
            });
        }
        Ok(tx)
    }
}

fn add_money(balance: Money, amount: Money) -> Result<Money> {
    balance
        .checked_add(amount)
        .ok_or_else(|| PayoutError::overflow(amount))
}

fn insufficient(available: Money, requested: Money) -> PayoutError {
    PayoutError::InsufficientBalance {
        available,
        requested,
        shortfall: requested - available,
    }
}

fn move_to_available(wallet: &mut Wallet, amount: Money) -> Result<()> {
    if wallet.pending_balance < amount {
        return Err(PayoutError::InvalidRequest(format!(
            "wallet {} holds only {} pending, cannot release {amount}",
            wallet.id, wallet.pending_balance
        )));
    }
    wallet.pending_balance -= amount;
    wallet.available_balance = add_money(wallet.available_balance, amount)?;
    Ok(())
}

fn bump(wallet: &mut Wallet, now: DateTime<Utc>) {
    wallet.version += 1;
    wallet.updated_at = now;
}
