//! Data models for the Payout Engine.
//!
//! The `models` module defines the serialisable records owned by the
//! money-movement core: wallets and their transaction log, payouts,
//! contractor/team payments, and the timesheet and compensation inputs
//! consumed by payroll.  Every type derives `Serialize` and
//! `Deserialize` so that it can be persisted by a store or returned
//! over the HTTP interface unchanged.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Monetary amount.  Always handled at two decimal places.
pub type Money = Decimal;

/// Rounds a monetary amount to cents using round-half-up.
pub fn round_money(amount: Money) -> Money {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// A landlord's balance of platform-held funds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub landlord_id: Uuid,
    /// Funds the landlord may cash out or spend now.  Never negative.
    pub available_balance: Money,
    /// Credited funds still inside their hold period.
    pub pending_balance: Money,
    pub last_payout_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped on every write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// A fresh, empty wallet for `landlord_id`.
    pub fn open(landlord_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            landlord_id,
            available_balance: Decimal::ZERO,
            pending_balance: Decimal::ZERO,
            last_payout_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The kind of movement a [`WalletTransaction`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Credit,
    Payout,
    ContractorPayment,
    TeamPayment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// Append-only ledger entry.
///
/// Credits carry positive amounts, debits negative ones.  A `Pending`
/// credit is inside its hold; a `Pending` debit is a reservation whose
/// external transfer has not settled yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub kind: TransactionKind,
    pub amount: Money,
    pub description: String,
    pub status: TransactionStatus,
    /// Id of the originating payout, payment, payroll batch or rent charge.
    pub reference_id: Option<Uuid>,
    /// When a held credit becomes spendable.
    pub available_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl WalletTransaction {
    pub fn is_debit(&self) -> bool {
        self.amount.is_sign_negative()
    }
}

/// How quickly a payout should reach its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutType {
    Standard,
    SameDay,
    Instant,
}

impl fmt::Display for PayoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayoutType::Standard => "standard",
            PayoutType::SameDay => "same_day",
            PayoutType::Instant => "instant",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    BankAccount,
    DebitCard,
}

/// External account a payout or payment lands in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutDestination {
    pub kind: DestinationKind,
    /// Provider-side account reference (connected account, card token...).
    pub external_ref: String,
    /// Set when the destination is a property's dedicated bank account.
    /// The debited wallet is still the landlord's.
    #[serde(default)]
    pub property_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Paid,
    Failed,
}

/// A landlord-initiated cash-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub landlord_id: Uuid,
    /// Gross amount debited from the wallet.
    pub amount: Money,
    pub payout_type: PayoutType,
    pub status: PayoutStatus,
    pub fee_amount: Money,
    /// What actually arrives at the destination.
    pub net_amount: Money,
    pub destination: PayoutDestination,
    pub provider_transfer_id: Option<String>,
    pub failure: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Whether a work payment settles a contractor job or an employee's time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Contractor,
    Team,
}

impl PaymentKind {
    pub fn transaction_kind(self) -> TransactionKind {
        match self {
            PaymentKind::Contractor => TransactionKind::ContractorPayment,
            PaymentKind::Team => TransactionKind::TeamPayment,
        }
    }

    /// Contractors are paid for work orders, team members for timesheets.
    pub fn settles(self, unit: WorkUnitRef) -> bool {
        matches!(
            (self, unit),
            (PaymentKind::Contractor, WorkUnitRef::WorkOrder(_))
                | (PaymentKind::Team, WorkUnitRef::Timesheet(_))
        )
    }
}

/// A unit of completed work a payment settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum WorkUnitRef {
    WorkOrder(Uuid),
    Timesheet(Uuid),
}

impl WorkUnitRef {
    /// The status a unit must be in before it can be paid.
    pub fn ready_status(&self) -> WorkUnitStatus {
        match self {
            WorkUnitRef::WorkOrder(_) => WorkUnitStatus::Completed,
            WorkUnitRef::Timesheet(_) => WorkUnitStatus::Approved,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            WorkUnitRef::WorkOrder(id) | WorkUnitRef::Timesheet(id) => *id,
        }
    }
}

impl fmt::Display for WorkUnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkUnitRef::WorkOrder(id) => write!(f, "work_order:{id}"),
            WorkUnitRef::Timesheet(id) => write!(f, "timesheet:{id}"),
        }
    }
}

/// Lifecycle states shared by work orders and timesheets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitStatus {
    Draft,
    Open,
    InProgress,
    Submitted,
    Completed,
    Approved,
    Rejected,
    Paid,
}

/// Third party receiving a work payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payee {
    pub id: Uuid,
    pub name: String,
    pub destination: PayoutDestination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

/// A contractor or team payment debited from a landlord's wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPayment {
    pub id: Uuid,
    pub landlord_id: Uuid,
    pub kind: PaymentKind,
    pub payee: Payee,
    pub work_unit: WorkUnitRef,
    /// Gross amount debited from the wallet.
    pub amount: Money,
    pub platform_fee: Money,
    pub net_amount: Money,
    pub status: PaymentStatus,
    /// Payroll run this payment was settled in, if any.
    pub batch_id: Option<Uuid>,
    pub provider_transfer_id: Option<String>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Revenue retained by the platform on a money movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformFeeRecord {
    pub id: Uuid,
    pub landlord_id: Uuid,
    /// Payout or payment the fee was taken from.
    pub source_id: Uuid,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

/// Hours worked on a single day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub date: NaiveDate,
    pub hours: Decimal,
}

/// An employee's hours over one pay period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timesheet {
    pub id: Uuid,
    pub employee_id: Uuid,
    pub landlord_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub total_hours: Decimal,
    pub regular_hours: Decimal,
    pub overtime_hours: Decimal,
    /// Last status seen.  The work-unit service owns the live value and
    /// it is re-read before the sheet is priced.
    pub status: WorkUnitStatus,
    #[serde(default)]
    pub entries: Vec<TimeEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayType {
    Hourly,
    Salary,
}

/// Per-employee pay configuration.  Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub employee_id: Uuid,
    pub pay_type: PayType,
    #[serde(default)]
    pub hourly_rate: Option<Money>,
    /// Explicit overtime rate; derived from the multiplier when absent.
    #[serde(default)]
    pub overtime_rate: Option<Money>,
    /// Annual salary for salaried employees.
    #[serde(default)]
    pub salary_amount: Option<Money>,
    pub payee: Payee,
}

/// How overtime hours are separated from regular hours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "period", content = "threshold_hours", rename_all = "lowercase")]
pub enum OvertimeRule {
    Weekly(Decimal),
    Daily(Decimal),
}

/// Per-landlord payroll policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayrollSettings {
    pub overtime_rule: OvertimeRule,
    /// Multiplier applied to the hourly rate for overtime, 1.0 to 3.0.
    pub overtime_multiplier: Decimal,
    /// Divisor converting an annual salary to an hourly rate.
    pub salary_hours_per_year: Decimal,
}

impl Default for PayrollSettings {
    fn default() -> Self {
        Self {
            overtime_rule: OvertimeRule::Weekly(Decimal::from(40)),
            overtime_multiplier: Decimal::new(15, 1),
            salary_hours_per_year: Decimal::from(2080),
        }
    }
}

/// Per-landlord overrides of the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandlordSettings {
    pub payroll: Option<PayrollSettings>,
    /// Platform fee on contractor/team payments for this landlord's tier.
    pub platform_fee_percent: Option<Decimal>,
}
