//! Error types for the money-movement core.
//!
//! Every failure distinguishes input the caller can correct from a
//! transfer that failed on the platform side (see [`ErrorClass`]).
//! Validation failures are raised before any wallet mutation;
//! [`PayoutError::ProviderTransferFailed`] is only returned after the
//! compensating re-credit has been applied.

use crate::models::{Money, WorkUnitRef, WorkUnitStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error codes reported by a transfer provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorCode {
    InsufficientPlatformBalance,
    InvalidDestination,
    Timeout,
    Generic,
}

impl fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ProviderErrorCode::InsufficientPlatformBalance => "insufficient_platform_balance",
            ProviderErrorCode::InvalidDestination => "invalid_destination",
            ProviderErrorCode::Timeout => "timeout",
            ProviderErrorCode::Generic => "generic",
        };
        f.write_str(code)
    }
}

/// Failure returned by a [`TransferProvider`](crate::provider::TransferProvider).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ProviderErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failures raised by a [`LedgerStore`](crate::store::LedgerStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("wallet {wallet_id} was modified concurrently (expected version {expected})")]
    VersionConflict { wallet_id: Uuid, expected: u64 },

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("{entity} {id} is settled and cannot be modified")]
    Immutable { entity: &'static str, id: Uuid },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Broad category of a [`PayoutError`], used to pick the user-facing
/// message and status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The request was invalid or the balance is insufficient.  Nothing
    /// was changed.
    UserCorrectable,
    /// The external transfer failed.  The wallet has already been
    /// restored; the caller should retry later or contact support.
    TransferFailed,
    Internal,
}

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("insufficient balance: available {available}, requested {requested}, short by {shortfall}")]
    InsufficientBalance {
        available: Money,
        requested: Money,
        shortfall: Money,
    },

    #[error("amount {amount} is too small (minimum {minimum})")]
    AmountTooSmall { amount: Money, minimum: Money },

    #[error("amount {amount} exceeds the limit of {limit}")]
    AmountExceedsLimit { amount: Money, limit: Money },

    #[error("destination incompatible: {reason}")]
    DestinationIncompatible { reason: String },

    #[error("work unit {work_unit} already has a completed payment")]
    DuplicatePayment { work_unit: WorkUnitRef },

    #[error("a credit with reference {reference_id} was already applied")]
    DuplicateCredit { reference_id: Uuid },

    #[error("work unit {work_unit} is {status:?}, expected {expected:?}")]
    WorkUnitNotReady {
        work_unit: WorkUnitRef,
        status: WorkUnitStatus,
        expected: WorkUnitStatus,
    },

    #[error("transfer failed ({code}): {message}")]
    ProviderTransferFailed {
        code: ProviderErrorCode,
        message: String,
    },

    #[error("no compensation configured for employee {employee_id}")]
    MissingCompensation { employee_id: Uuid },

    #[error("invalid compensation for employee {employee_id}: {reason}")]
    InvalidCompensation { employee_id: Uuid, reason: String },

    #[error("wallet {wallet_id} kept changing; gave up after {attempts} attempts")]
    ConcurrencyConflict { wallet_id: Uuid, attempts: u32 },

    #[error("hold on transaction {transaction_id} has not matured")]
    HoldNotMatured { transaction_id: Uuid },

    #[error("transaction {0} not found")]
    TransactionNotFound(Uuid),

    #[error("transaction {transaction_id} cannot be {action}: {reason}")]
    InvalidTransactionState {
        transaction_id: Uuid,
        action: &'static str,
        reason: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PayoutError {
    /// An amount whose arithmetic would overflow the money type.
    pub fn overflow(amount: Money) -> Self {
        PayoutError::AmountExceedsLimit {
            amount,
            limit: Money::MAX,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PayoutError::InsufficientBalance { .. }
            | PayoutError::AmountTooSmall { .. }
            | PayoutError::AmountExceedsLimit { .. }
            | PayoutError::DestinationIncompatible { .. }
            | PayoutError::DuplicatePayment { .. }
            | PayoutError::DuplicateCredit { .. }
            | PayoutError::WorkUnitNotReady { .. }
            | PayoutError::MissingCompensation { .. }
            | PayoutError::InvalidCompensation { .. }
            | PayoutError::HoldNotMatured { .. }
            | PayoutError::InvalidRequest(_) => ErrorClass::UserCorrectable,
            PayoutError::ProviderTransferFailed { .. } => ErrorClass::TransferFailed,
            PayoutError::ConcurrencyConflict { .. }
            | PayoutError::TransactionNotFound(_)
            | PayoutError::InvalidTransactionState { .. }
            | PayoutError::NotFound { .. }
            | PayoutError::InvalidConfig(_)
            | PayoutError::TaskFailed(_)
            | PayoutError::Store(_) => ErrorClass::Internal,
        }
    }

    /// Message suitable for showing to the landlord.
    pub fn user_message(&self) -> String {
        match self {
            PayoutError::ProviderTransferFailed { code, .. } => match code {
                ProviderErrorCode::InsufficientPlatformBalance => {
                    "The transfer could not be funded right now. Your balance has been restored; please try again later.".to_string()
                }
                ProviderErrorCode::InvalidDestination => {
                    "The destination account was rejected. Please check your payout details.".to_string()
                }
                ProviderErrorCode::Timeout | ProviderErrorCode::Generic => {
                    "The transfer failed. Your balance has been restored; please retry or contact support.".to_string()
                }
            },
            PayoutError::ConcurrencyConflict { .. } => {
                "Your wallet is busy with another operation. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<ProviderError> for PayoutError {
    fn from(err: ProviderError) -> Self {
        PayoutError::ProviderTransferFailed {
            code: err.code,
            message: err.message,
        }
    }
}

pub type Result<T> = std::result::Result<T, PayoutError>;
