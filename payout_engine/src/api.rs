//! HTTP API for the payout engine.
//!
//! A thin [`axum`](https://crates.io/crates/axum) layer over the wallet
//! ledger, payout orchestrator and payment processor.  Handlers only
//! translate JSON in and out; every rule lives in the engine.  Errors
//! are rendered as `{ "error", "class" }` with a status code derived from
//! [`ErrorClass`].

use crate::context::EngineContext;
use crate::error::{ErrorClass, PayoutError};
use crate::fees::{FeeClass, FeeQuote};
use crate::ledger::{CreditRequest, WalletBalance};
use crate::models::{Money, Payout, WalletTransaction, WorkPayment};
use crate::payment::{PaymentProcessor, PayrollRun, WorkPaymentRequest};
use crate::payout::{PayoutOrchestrator, PayoutRequest};
use crate::payroll::PayrollPreview;
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Application state shared across requests.
pub struct AppState {
    pub ctx: EngineContext,
    pub payouts: PayoutOrchestrator,
    pub payments: PaymentProcessor,
}

impl AppState {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            payouts: PayoutOrchestrator::new(ctx.clone()),
            payments: PaymentProcessor::new(ctx.clone()),
            ctx,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeQuoteRequest {
    pub amount: Money,
    pub class: FeeClass,
    /// Applies the landlord's fee tier when given.
    #[serde(default)]
    pub landlord_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayrollRequest {
    pub landlord_id: Uuid,
    pub timesheet_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    class: ErrorClass,
}

/// Engine error carried out of a handler.
pub struct ApiError(PayoutError);

impl From<PayoutError> for ApiError {
    fn from(err: PayoutError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: self.0.user_message(),
            class: self.0.class(),
        };
        (status, Json(body)).into_response()
    }
}

fn status_for(err: &PayoutError) -> StatusCode {
    match err {
        PayoutError::DuplicatePayment { .. }
        | PayoutError::DuplicateCredit { .. }
        | PayoutError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
        PayoutError::NotFound { .. } | PayoutError::TransactionNotFound(_) => StatusCode::NOT_FOUND,
        other => match other.class() {
            ErrorClass::UserCorrectable => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorClass::TransferFailed => StatusCode::BAD_GATEWAY,
            ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Build the API router over an engine context.
pub fn build_router(ctx: EngineContext) -> Router {
    let state = Arc::new(AppState::new(ctx));
    Router::new()
        .route("/api/wallets/credit", post(credit_handler))
        .route("/api/wallets/holds/:transaction_id/release", post(release_hold_handler))
        .route("/api/wallets/:landlord_id", get(balance_handler))
        .route("/api/wallets/:landlord_id/transactions", get(transactions_handler))
        .route("/api/fees/quote", post(quote_handler))
        .route("/api/payouts", post(payout_handler))
        .route("/api/payouts/:payout_id", get(get_payout_handler))
        .route("/api/payments", post(payment_handler))
        .route("/api/payments/:payment_id", get(get_payment_handler))
        .route("/api/payroll/preview", post(preview_handler))
        .route("/api/payroll/run", post(payroll_handler))
        .with_state(state)
}

async fn balance_handler(
    State(state): State<Arc<AppState>>,
    Path(landlord_id): Path<Uuid>,
) -> ApiResult<WalletBalance> {
    Ok(Json(state.ctx.ledger().balance(landlord_id).await?))
}

async fn transactions_handler(
    State(state): State<Arc<AppState>>,
    Path(landlord_id): Path<Uuid>,
) -> ApiResult<Vec<WalletTransaction>> {
    Ok(Json(state.ctx.ledger().transactions(landlord_id).await?))
}

async fn credit_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreditRequest>,
) -> ApiResult<WalletTransaction> {
    Ok(Json(state.ctx.ledger().credit(request).await?))
}

async fn release_hold_handler(
    State(state): State<Arc<AppState>>,
    Path(transaction_id): Path<Uuid>,
) -> ApiResult<WalletTransaction> {
    Ok(Json(state.ctx.ledger().release_hold(transaction_id).await?))
}

async fn quote_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FeeQuoteRequest>,
) -> ApiResult<FeeQuote> {
    let fees = match request.landlord_id {
        Some(landlord_id) => state.ctx.fee_schedule_for(landlord_id).await?,
        None => state.ctx.config.fees.clone(),
    };
    Ok(Json(fees.quote(request.amount, request.class)?))
}

async fn payout_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PayoutRequest>,
) -> ApiResult<Payout> {
    Ok(Json(state.payouts.create_payout(request).await?))
}

async fn get_payout_handler(
    State(state): State<Arc<AppState>>,
    Path(payout_id): Path<Uuid>,
) -> ApiResult<Payout> {
    Ok(Json(state.payouts.get_payout(payout_id).await?))
}

async fn payment_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WorkPaymentRequest>,
) -> ApiResult<WorkPayment> {
    Ok(Json(state.payments.pay_for_work(request).await?))
}

async fn get_payment_handler(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<WorkPayment> {
    Ok(Json(state.payments.get_payment(payment_id).await?))
}

async fn preview_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PayrollRequest>,
) -> ApiResult<PayrollPreview> {
    Ok(Json(
        state
            .payments
            .preview_payroll(request.landlord_id, &request.timesheet_ids)
            .await?,
    ))
}

async fn payroll_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PayrollRequest>,
) -> ApiResult<PayrollRun> {
    Ok(Json(
        state
            .payments
            .process_payroll(request.landlord_id, &request.timesheet_ids)
            .await?,
    ))
}

/// Launch the API server on `addr`.  Blocks until the server terminates.
pub async fn serve(addr: &str, ctx: EngineContext) -> Result<()> {
    let router = build_router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "payout engine listening");
    axum::serve(listener, router).await?;
    Ok(())
}
