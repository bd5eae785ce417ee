//! Payout Engine library crate.
//!
//! The money-movement core of a property-management platform: landlord
//! wallets fed by rent collection, payouts to the landlord's own bank
//! account or card, and payments to contractors and team members for
//! completed work.  External applications may embed the services
//! directly (`payout::PayoutOrchestrator`, `payment::PaymentProcessor`)
//! or mount the HTTP surface via `api::build_router`.

pub mod api;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod fees;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod payment;
pub mod payout;
pub mod payroll;
pub mod provider;
pub mod store;
pub mod work_units;

pub use context::EngineContext;
pub use error::{ErrorClass, PayoutError, Result};
