//! External money-transfer provider.
//!
//! The provider is a black box: it either accepts a transfer and returns
//! its own id, or fails with a [`ProviderError`].  Implementations are
//! injected into the orchestrators; nothing in the core constructs a
//! client on its own.

use crate::error::{ProviderError, ProviderErrorCode};
use crate::models::{Money, PayoutDestination};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Net amount that should arrive at the destination.
    pub amount: Money,
    pub currency: String,
    pub destination: PayoutDestination,
    /// Local payout/payment id; the provider must not move money twice
    /// for the same key.
    pub idempotency_key: Uuid,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub provider_transfer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderBalance {
    pub available: Money,
    pub currency: String,
}

#[async_trait]
pub trait TransferProvider: Send + Sync {
    async fn transfer(&self, request: TransferRequest) -> Result<TransferReceipt, ProviderError>;

    async fn retrieve_balance(&self) -> Result<ProviderBalance, ProviderError>;
}

/// Calls `provider.transfer`, converting an elapsed `timeout` into a
/// [`ProviderErrorCode::Timeout`] failure.  The call is never retried.
pub async fn transfer_with_timeout(
    provider: &dyn TransferProvider,
    request: TransferRequest,
    timeout: Duration,
) -> Result<TransferReceipt, ProviderError> {
    match tokio::time::timeout(timeout, provider.transfer(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::new(
            ProviderErrorCode::Timeout,
            format!("no response from transfer provider within {}s", timeout.as_secs_f64()),
        )),
    }
}

#[derive(Default)]
struct SandboxState {
    balance: Money,
    transfers: Vec<TransferRequest>,
    by_key: HashMap<Uuid, TransferReceipt>,
    fail_next: Option<ProviderError>,
    fail_destinations: HashMap<String, ProviderError>,
    fail_always: Option<ProviderError>,
    delay: Option<Duration>,
}

/// In-process provider used by the demo server and tests.
///
/// It honours idempotency keys, debits its own platform balance and can
/// be scripted to fail or stall.
#[derive(Clone)]
pub struct SandboxTransferProvider {
    currency: String,
    state: Arc<RwLock<SandboxState>>,
}

impl SandboxTransferProvider {
    pub fn new(currency: impl Into<String>, balance: Money) -> Self {
        Self {
            currency: currency.into(),
            state: Arc::new(RwLock::new(SandboxState {
                balance,
                ..SandboxState::default()
            })),
        }
    }

    /// Make the next transfer fail with `error`.
    pub async fn fail_next(&self, error: ProviderError) {
        self.state.write().await.fail_next = Some(error);
    }

    /// Make every transfer fail until cleared.
    pub async fn set_fail_always(&self, error: Option<ProviderError>) {
        self.state.write().await.fail_always = error;
    }

    /// Reject every transfer to `external_ref`.
    pub async fn fail_destination(&self, external_ref: impl Into<String>, error: ProviderError) {
        self.state
            .write()
            .await
            .fail_destinations
            .insert(external_ref.into(), error);
    }

    /// Sleep this long before answering each transfer.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.write().await.delay = delay;
    }

    /// Accepted transfers, in order.
    pub async fn transfers(&self) -> Vec<TransferRequest> {
        self.state.read().await.transfers.clone()
    }
}

#[async_trait]
impl TransferProvider for SandboxTransferProvider {
    async fn transfer(&self, request: TransferRequest) -> Result<TransferReceipt, ProviderError> {
        let delay = self.state.read().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        if let Some(receipt) = state.by_key.get(&request.idempotency_key) {
            return Ok(receipt.clone());
        }
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if let Some(err) = &state.fail_always {
            return Err(err.clone());
        }
        if let Some(err) = state.fail_destinations.get(&request.destination.external_ref) {
            return Err(err.clone());
        }
        if request.currency != self.currency {
            return Err(ProviderError::new(
                ProviderErrorCode::Generic,
                format!("unsupported currency {}", request.currency),
            ));
        }
        if request.amount > state.balance {
            return Err(ProviderError::new(
                ProviderErrorCode::InsufficientPlatformBalance,
                format!("platform balance {} cannot cover {}", state.balance, request.amount),
            ));
        }

        state.balance -= request.amount;
        let receipt = TransferReceipt {
            provider_transfer_id: format!("tr_{}", Uuid::new_v4().simple()),
        };
        state.by_key.insert(request.idempotency_key, receipt.clone());
        state.transfers.push(request);
        Ok(receipt)
    }

    async fn retrieve_balance(&self) -> Result<ProviderBalance, ProviderError> {
        Ok(ProviderBalance {
            available: self.state.read().await.balance,
            currency: self.currency.clone(),
        })
    }
}
