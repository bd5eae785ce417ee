//! Payout orchestration.
//!
//! A payout cashes a landlord's available balance out to their own bank
//! account or debit card.  The gross amount is reserved before the
//! transfer provider is called and the net amount (gross minus fee) is
//! what the provider moves.  When the provider fails the reservation is
//! cancelled before the error is returned, so a caller never sees a
//! debited wallet without a paid payout.  The sequence runs on its own
//! task and finishes even when the caller stops waiting for it.

use crate::context::{run_detached, EngineContext};
use crate::error::{PayoutError, Result};
use crate::fees::FeeClass;
use crate::ledger::DebitRequest;
use crate::models::{
    round_money, DestinationKind, Money, Payout, PayoutDestination, PayoutStatus, PayoutType,
    PlatformFeeRecord, TransactionKind,
};
use crate::notify::{emit, MoneyEvent, MoneyEventKind, MoneyEventStatus};
use crate::provider::{transfer_with_timeout, ProviderBalance, TransferRequest};
use crate::store::WriteBatch;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub landlord_id: Uuid,
    /// Gross amount; the whole available balance when omitted.
    #[serde(default)]
    pub amount: Option<Money>,
    pub payout_type: PayoutType,
    pub destination: PayoutDestination,
}

#[derive(Clone)]
pub struct PayoutOrchestrator {
    ctx: EngineContext,
}

impl PayoutOrchestrator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn create_payout(&self, request: PayoutRequest) -> Result<Payout> {
        let this = self.clone();
        run_detached(async move { this.execute_payout(request).await }).await
    }

    #[tracing::instrument(name = "payout.create", skip_all, fields(landlord_id = %request.landlord_id, payout_type = %request.payout_type))]
    async fn execute_payout(&self, request: PayoutRequest) -> Result<Payout> {
        check_destination(request.payout_type, &request.destination)?;

        let ledger = self.ctx.ledger();
        let balance = ledger.balance(request.landlord_id).await?;
        let amount = round_money(request.amount.unwrap_or(balance.available_balance));
        self.check_amount(request.payout_type, amount, balance.available_balance)?;

        let fees = self.ctx.fee_schedule_for(request.landlord_id).await?;
        let quote = fees.quote(amount, FeeClass::from(request.payout_type))?;

        let now = self.ctx.clock.now();
        let mut payout = Payout {
            id: Uuid::new_v4(),
            landlord_id: request.landlord_id,
            amount: quote.amount,
            payout_type: request.payout_type,
            status: PayoutStatus::Pending,
            fee_amount: quote.fee,
            net_amount: quote.net_amount,
            destination: request.destination,
            provider_transfer_id: None,
            failure: None,
            initiated_at: now,
            paid_at: None,
        };

        let reservation = ledger
            .reserve_debit(
                DebitRequest {
                    landlord_id: payout.landlord_id,
                    amount: payout.amount,
                    kind: TransactionKind::Payout,
                    reference_id: payout.id,
                    description: format!("{} payout", payout.payout_type),
                },
                WriteBatch::new().with_payout(payout.clone()),
            )
            .await?;

        let transfer = TransferRequest {
            amount: payout.net_amount,
            currency: self.ctx.config.currency.clone(),
            destination: payout.destination.clone(),
            idempotency_key: payout.id,
            metadata: payout_metadata(&payout),
        };
        let outcome = transfer_with_timeout(
            self.ctx.provider.as_ref(),
            transfer,
            self.ctx.config.provider_timeout(),
        )
        .await;

        match outcome {
            Ok(receipt) => {
                let paid_at = self.ctx.clock.now();
                payout.status = PayoutStatus::Paid;
                payout.provider_transfer_id = Some(receipt.provider_transfer_id);
                payout.paid_at = Some(paid_at);
                let mut records = WriteBatch::new().with_payout(payout.clone());
                if payout.fee_amount > Decimal::ZERO {
                    records = records.with_fee(PlatformFeeRecord {
                        id: Uuid::new_v4(),
                        landlord_id: payout.landlord_id,
                        source_id: payout.id,
                        amount: payout.fee_amount,
                        created_at: paid_at,
                    });
                }
                if let Err(err) = ledger.commit_debit(reservation, records).await {
                    // The money has left; the pending rows need reconciling by hand.
                    error!(payout_id = %payout.id, error = %err, "transfer succeeded but the payout could not be recorded");
                    return Err(err);
                }
                info!(payout_id = %payout.id, gross = %payout.amount, net = %payout.net_amount, "payout paid");
                self.announce(&payout, MoneyEventStatus::Succeeded);
                Ok(payout)
            }
            Err(provider_err) => {
                warn!(payout_id = %payout.id, error = %provider_err, "transfer failed, restoring balance");
                payout.status = PayoutStatus::Failed;
                payout.failure = Some(provider_err.to_string());
                let transaction_id = reservation.transaction_id();
                if let Err(err) = ledger
                    .cancel_debit(reservation, WriteBatch::new().with_payout(payout.clone()))
                    .await
                {
                    error!(payout_id = %payout.id, %transaction_id, error = %err, "balance not restored, debit left pending for reconciliation");
                }
                self.announce(&payout, MoneyEventStatus::Failed);
                Err(provider_err.into())
            }
        }
    }

    fn check_amount(&self, payout_type: PayoutType, amount: Money, available: Money) -> Result<()> {
        let config = &self.ctx.config;
        if amount < config.minimum_payout {
            return Err(PayoutError::AmountTooSmall {
                amount,
                minimum: config.minimum_payout,
            });
        }
        if let Some(limit) = config.payout_limits.for_type(payout_type) {
            if amount > limit {
                return Err(PayoutError::AmountExceedsLimit { amount, limit });
            }
        }
        if amount > available {
            return Err(PayoutError::InsufficientBalance {
                available,
                requested: amount,
                shortfall: amount - available,
            });
        }
        Ok(())
    }

    fn announce(&self, payout: &Payout, status: MoneyEventStatus) {
        emit(
            self.ctx.notifier.as_ref(),
            MoneyEvent {
                kind: MoneyEventKind::Payout,
                landlord_id: payout.landlord_id,
                payee_id: None,
                amount: payout.amount,
                status,
                reference_id: payout.id,
            },
        );
    }

    pub async fn get_payout(&self, id: Uuid) -> Result<Payout> {
        self.ctx
            .store
            .payout(id)
            .await?
            .ok_or(PayoutError::NotFound {
                entity: "payout",
                id,
            })
    }

    pub async fn payouts_for(&self, landlord_id: Uuid) -> Result<Vec<Payout>> {
        Ok(self.ctx.store.payouts_for(landlord_id).await?)
    }

    /// Funds the platform holds at the transfer provider.
    pub async fn platform_balance(&self) -> Result<ProviderBalance> {
        Ok(self.ctx.provider.retrieve_balance().await?)
    }
}

fn check_destination(payout_type: PayoutType, destination: &PayoutDestination) -> Result<()> {
    if destination.external_ref.trim().is_empty() {
        return Err(PayoutError::InvalidRequest(
            "payout destination is missing".into(),
        ));
    }
    if payout_type == PayoutType::Instant && destination.kind != DestinationKind::DebitCard {
        return Err(PayoutError::DestinationIncompatible {
            reason: "instant payouts require a debit card".into(),
        });
    }
    Ok(())
}

fn payout_metadata(payout: &Payout) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("payout_id".to_string(), payout.id.to_string());
    metadata.insert("landlord_id".to_string(), payout.landlord_id.to_string());
    metadata.insert("payout_type".to_string(), payout.payout_type.to_string());
    metadata.insert("fee".to_string(), payout.fee_amount.to_string());
    if let Some(property_id) = payout.destination.property_id {
        metadata.insert("property_id".to_string(), property_id.to_string());
    }
    metadata
}
