//! Outbound money-movement events.
//!
//! Delivery (email, in-app) happens downstream.  Notification is fire
//! and forget: a failing notifier is logged and never unwinds the
//! financial operation that triggered it.

use crate::models::Money;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoneyEventKind {
    Payout,
    ContractorPayment,
    TeamPayment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoneyEventStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoneyEvent {
    pub kind: MoneyEventKind,
    pub landlord_id: Uuid,
    /// Contractor or employee paid; `None` for payouts to the landlord.
    pub payee_id: Option<Uuid>,
    pub amount: Money,
    pub status: MoneyEventStatus,
    /// Payout or payment id.
    pub reference_id: Uuid,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &MoneyEvent) -> anyhow::Result<()>;
}

/// Sends `event` and swallows any failure after logging it.
pub fn emit(notifier: &dyn Notifier, event: MoneyEvent) {
    if let Err(err) = notifier.notify(&event) {
        tracing::warn!(
            reference_id = %event.reference_id,
            kind = ?event.kind,
            error = %err,
            "failed to emit money event"
        );
    }
}

/// Writes events to the log.  Default for the demo server.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &MoneyEvent) -> anyhow::Result<()> {
        tracing::info!(
            kind = ?event.kind,
            status = ?event.status,
            landlord_id = %event.landlord_id,
            amount = %event.amount,
            reference_id = %event.reference_id,
            "money event"
        );
        Ok(())
    }
}

/// Keeps every event in memory; optionally fails after recording.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<MoneyEvent>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every delivery fails.
    pub fn failing() -> Self {
        Self {
            events: Mutex::default(),
            failing: true,
        }
    }

    pub fn events(&self) -> Vec<MoneyEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &MoneyEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
        if self.failing {
            anyhow::bail!("notification channel unavailable");
        }
        Ok(())
    }
}
