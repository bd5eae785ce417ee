//! Work-order and timesheet state machine.
//!
//! The lifecycle itself belongs to the surrounding application.  The
//! payment processor only reads the current status and moves a unit
//! from its ready state to `paid`.

use crate::error::StoreError;
use crate::models::{WorkUnitRef, WorkUnitStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait WorkUnits: Send + Sync {
    async fn status(&self, unit: WorkUnitRef) -> Result<Option<WorkUnitStatus>, StoreError>;

    async fn transition(&self, unit: WorkUnitRef, status: WorkUnitStatus) -> Result<(), StoreError>;
}

/// Whether `from -> to` is a legal step for `unit`.
pub fn is_allowed_transition(unit: WorkUnitRef, from: WorkUnitStatus, to: WorkUnitStatus) -> bool {
    use WorkUnitStatus::*;
    match unit {
        WorkUnitRef::WorkOrder(_) => matches!(
            (from, to),
            (Open, InProgress) | (InProgress, Completed) | (Completed, Paid)
        ),
        WorkUnitRef::Timesheet(_) => matches!(
            (from, to),
            (Draft, Submitted)
                | (Submitted, Approved)
                | (Submitted, Rejected)
                | (Rejected, Draft)
                | (Approved, Paid)
        ),
    }
}

/// In-memory state machine.
#[derive(Default)]
pub struct MemoryWorkUnits {
    statuses: RwLock<HashMap<WorkUnitRef, WorkUnitStatus>>,
}

impl MemoryWorkUnits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `unit` in `status`, replacing any previous state.
    pub async fn insert(&self, unit: WorkUnitRef, status: WorkUnitStatus) {
        self.statuses.write().await.insert(unit, status);
    }
}

#[async_trait]
impl WorkUnits for MemoryWorkUnits {
    async fn status(&self, unit: WorkUnitRef) -> Result<Option<WorkUnitStatus>, StoreError> {
        Ok(self.statuses.read().await.get(&unit).copied())
    }

    async fn transition(&self, unit: WorkUnitRef, status: WorkUnitStatus) -> Result<(), StoreError> {
        let mut statuses = self.statuses.write().await;
        let current = statuses.get_mut(&unit).ok_or(StoreError::NotFound {
            entity: "work unit",
            id: unit.id(),
        })?;
        if !is_allowed_transition(unit, *current, status) {
            return Err(StoreError::Rejected(format!(
                "{unit} cannot move from {current:?} to {status:?}"
            )));
        }
        *current = status;
        Ok(())
    }
}
