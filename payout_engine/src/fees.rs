//! Fee calculation.
//!
//! Fees are a pure function of an amount and the class of money
//! movement.  The tier table lives in [`FeeSchedule`], which is loaded
//! as part of the engine configuration so that rates can change
//! without touching the calculation itself.

use crate::error::{PayoutError, Result};
use crate::models::{round_money, Money, PaymentKind, PayoutType};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// The class of money movement a fee is charged on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeClass {
    StandardPayout,
    SameDayPayout,
    InstantPayout,
    ContractorPayment,
    TeamPayment,
}

impl From<PayoutType> for FeeClass {
    fn from(payout_type: PayoutType) -> Self {
        match payout_type {
            PayoutType::Standard => FeeClass::StandardPayout,
            PayoutType::SameDay => FeeClass::SameDayPayout,
            PayoutType::Instant => FeeClass::InstantPayout,
        }
    }
}

impl From<PaymentKind> for FeeClass {
    fn from(kind: PaymentKind) -> Self {
        match kind {
            PaymentKind::Contractor => FeeClass::ContractorPayment,
            PaymentKind::Team => FeeClass::TeamPayment,
        }
    }
}

/// Result of a fee calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    /// Gross amount, rounded to cents.
    pub amount: Money,
    pub fee: Money,
    /// `amount - fee`; what reaches the destination.
    pub net_amount: Money,
}

/// Configurable fee tiers.  Percentages are expressed in percent
/// (`2.5` means 2.5%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    pub same_day_flat_fee: Money,
    pub instant_percent: Decimal,
    pub instant_minimum_fee: Money,
    /// Platform fee on contractor and team payments.  Zero for tiers
    /// that waive it.
    pub platform_fee_percent: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            same_day_flat_fee: dec!(1.50),
            instant_percent: dec!(1.5),
            instant_minimum_fee: dec!(0.50),
            platform_fee_percent: dec!(2.5),
        }
    }
}

impl FeeSchedule {
    /// Same schedule with a different platform fee, as used for
    /// landlords on a tier with its own payment pricing.
    pub fn with_platform_fee_percent(&self, percent: Decimal) -> Self {
        Self {
            platform_fee_percent: percent,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("same_day_flat_fee", self.same_day_flat_fee),
            ("instant_percent", self.instant_percent),
            ("instant_minimum_fee", self.instant_minimum_fee),
            ("platform_fee_percent", self.platform_fee_percent),
        ];
        for (name, value) in checks {
            if value.is_sign_negative() {
                return Err(PayoutError::InvalidConfig(format!(
                    "{name} must not be negative"
                )));
            }
        }
        if self.instant_percent >= dec!(100) || self.platform_fee_percent >= dec!(100) {
            return Err(PayoutError::InvalidConfig(
                "fee percentages must be below 100".into(),
            ));
        }
        Ok(())
    }

    /// Computes the fee and net amount for `amount` moved as `class`.
    ///
    /// The fee is computed (and rounded) first; the net is derived from
    /// it.  Fails with [`PayoutError::AmountTooSmall`] when nothing
    /// would be left after the fee.
    pub fn quote(&self, amount: Money, class: FeeClass) -> Result<FeeQuote> {
        let amount = round_money(amount);
        if amount <= Decimal::ZERO {
            return Err(PayoutError::AmountTooSmall {
                amount,
                minimum: dec!(0.01),
            });
        }
        let fee = match class {
            FeeClass::StandardPayout => Decimal::ZERO,
            FeeClass::SameDayPayout => round_money(self.same_day_flat_fee),
            FeeClass::InstantPayout => {
                percent_of(amount, self.instant_percent)?.max(round_money(self.instant_minimum_fee))
            }
            FeeClass::ContractorPayment | FeeClass::TeamPayment => {
                percent_of(amount, self.platform_fee_percent)?
            }
        };
        if fee < Decimal::ZERO {
            return Err(PayoutError::InvalidConfig(format!(
                "fee schedule produced a negative fee of {fee}"
            )));
        }
        let net_amount = amount - fee;
        if net_amount <= Decimal::ZERO {
            return Err(PayoutError::AmountTooSmall {
                amount,
                minimum: fee + dec!(0.01),
            });
        }
        Ok(FeeQuote {
            amount,
            fee,
            net_amount,
        })
    }
}

/// `percent`% of `amount`, rounded to cents.
fn percent_of(amount: Money, percent: Decimal) -> Result<Money> {
    amount
        .checked_mul(percent)
        .and_then(|scaled| scaled.checked_div(dec!(100)))
        .map(round_money)
        .ok_or_else(|| PayoutError::overflow(amount))
}
