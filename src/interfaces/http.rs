//! HTTP surface of the reconciliation core.
//!
//! - `GET /health`
//! - `POST /orders`, `GET /orders/:id`
//! - `POST /orders/:id/payments` (checkout), `POST /orders/:id/refund`,
//!   `POST /orders/:id/cancel`
//! - `POST /payments/:provider/:provider_ref/capture`
//! - `POST /webhooks/:provider`
//!
//! Provider failures never leak to callers: errors are reduced to
//! [`PaymentError::public_kind`].

use crate::application::reconciliation::{CheckoutSession, RefundOutcome, ReconciliationService};
use crate::domain::money::{Amount, Currency};
use crate::domain::order::OrderId;
use crate::domain::outcome::{Outcome, RejectReason, Source};
use crate::domain::payment::{Payment, PaymentId, PaymentStatus};
use crate::domain::provider::{Provider, ReturnUrls};
use crate::error::{ErrorClass, PaymentError, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

type AppState = Arc<ReconciliationService>;

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(service: AppState, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP API listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Build the router (separated for testing).
pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/orders", post(place_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/payments", post(create_payment))
        .route("/orders/:id/refund", post(refund_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/payments/:provider/:provider_ref/capture", post(capture))
        .route("/webhooks/:provider", post(webhook))
        .with_state(service)
}

/// Error response carrying only the provider-agnostic kind.
#[derive(Debug)]
pub struct ApiError(PaymentError);

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.public_kind();
        let status = match kind {
            "not_found" => StatusCode::NOT_FOUND,
            "invalid_request" => StatusCode::BAD_REQUEST,
            "payment_conflict" => StatusCode::CONFLICT,
            "payment_rejected" => StatusCode::UNPROCESSABLE_ENTITY,
            "payment_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if self.0.class() == ErrorClass::Fatal {
            error!(error = %self.0, "Request failed");
        } else {
            warn!(error = %self.0, kind, "Request refused");
        }
        (status, Json(json!({ "error": kind }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct PlaceOrder {
    amount: u64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct Checkout {
    provider: String,
    #[serde(default)]
    return_url: Option<String>,
    #[serde(default)]
    cancel_url: Option<String>,
    #[serde(default)]
    payer: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RefundRequest {
    #[serde(default)]
    amount: Option<u64>,
}

/// A payment as API callers see it. Raw provider payloads stay internal.
#[derive(Debug, Serialize)]
struct PaymentView<'a> {
    id: PaymentId,
    order_id: OrderId,
    attempt: u32,
    provider: Provider,
    provider_ref: Option<&'a str>,
    status: PaymentStatus,
    amount: Amount,
    currency: &'a Currency,
    refunded_amount: u64,
    refund_ref: Option<&'a str>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
}

impl<'a> From<&'a Payment> for PaymentView<'a> {
    fn from(p: &'a Payment) -> Self {
        Self {
            id: p.id,
            order_id: p.order_id,
            attempt: p.attempt,
            provider: p.provider,
            provider_ref: p.provider_ref.as_deref(),
            status: p.status,
            amount: p.amount,
            currency: &p.currency,
            refunded_amount: p.refunded_amount,
            refund_ref: p.refund_ref.as_deref(),
            created_at: p.created_at,
            updated_at: p.updated_at,
            confirmed_at: p.confirmed_at,
        }
    }
}

async fn health(State(service): State<AppState>) -> Json<Value> {
    let providers: Vec<_> = service.providers().configured().collect();
    Json(json!({ "status": "ok", "providers": providers }))
}

async fn place_order(
    State(service): State<AppState>,
    Json(body): Json<PlaceOrder>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let amount = Amount::new(body.amount)?;
    let currency = Currency::new(&body.currency)?;
    let order = service.orders().place(amount, currency).await?;
    Ok((StatusCode::CREATED, Json(json!(order))))
}

async fn get_order(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let order = service.orders().get(id.parse()?).await?;
    let payments = service.ledger().for_order(order.id).await?;
    let payments: Vec<PaymentView<'_>> = payments.iter().map(PaymentView::from).collect();
    Ok(Json(json!({ "order": order, "payments": payments })))
}

async fn create_payment(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Checkout>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let order_id: OrderId = id.parse()?;
    let provider: Provider = body.provider.parse()?;
    let urls = ReturnUrls {
        return_url: body.return_url,
        cancel_url: body.cancel_url,
        payer: body.payer,
    };
    let CheckoutSession {
        payment,
        redirect_target,
    } = service.create_payment(order_id, provider, urls).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "payment_id": payment.id,
            "provider_ref": payment.provider_ref,
            "redirect_target": redirect_target,
            "status": payment.status,
        })),
    ))
}

async fn cancel_order(
    State(service): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Json<Value>> {
    let order_id: OrderId = id.parse()?;
    let Json(body) = body.unwrap_or_default();
    let reason = body.reason.unwrap_or_else(|| "cancelled on request".to_string());
    let (order, _) = service.orders().cancel(order_id, &reason).await?;
    Ok(Json(json!(order)))
}

async fn refund_order(
    State(service): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RefundRequest>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let order_id: OrderId = id.parse()?;
    let Json(body) = body.unwrap_or_default();
    let amount = body.amount.map(Amount::new).transpose()?;

    let response = match service.refund_order(order_id, amount).await? {
        RefundOutcome::Refunded {
            order,
            payment,
            refund_ref,
        } => (
            StatusCode::OK,
            json!({
                "refund": "completed",
                "refund_ref": refund_ref,
                "order": order,
                "payment": PaymentView::from(&payment),
            }),
        ),
        RefundOutcome::PartiallyRefunded {
            payment,
            refund_ref,
        } => (
            StatusCode::OK,
            json!({ "refund": "partial", "refund_ref": refund_ref, "payment": PaymentView::from(&payment) }),
        ),
        RefundOutcome::Pending {
            payment,
            refund_ref,
        } => (
            StatusCode::ACCEPTED,
            json!({ "refund": "pending", "refund_ref": refund_ref, "payment": PaymentView::from(&payment) }),
        ),
    };
    Ok((response.0, Json(response.1)))
}

async fn capture(
    State(service): State<AppState>,
    Path((provider, provider_ref)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let provider: Provider = provider.parse()?;
    let outcome = service.capture(provider, &provider_ref).await?;
    let status = match &outcome {
        Outcome::Rejected(RejectReason::UnknownProviderRef { .. }) => StatusCode::NOT_FOUND,
        Outcome::Rejected(_) => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome_body(&outcome))))
}

/// Answers 2xx only once the event is classified. Verification failures
/// get 4xx so forged payloads are never acknowledged; transient failures
/// get 503 so the provider redelivers.
async fn webhook(
    State(service): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(provider) = provider.parse::<Provider>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match service
        .apply_outcome(Source::Webhook, provider, &body, &headers)
        .await
    {
        Ok(Outcome::Rejected(RejectReason::BadSignature)) => {
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad_signature" }))).into_response()
        }
        Ok(Outcome::Rejected(RejectReason::MalformedEvent { .. })) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "malformed_event" }))).into_response()
        }
        Ok(outcome) => (StatusCode::OK, Json(json!({ "outcome": outcome.label() }))).into_response(),
        Err(PaymentError::ProviderNotConfigured(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) if e.is_retryable() => {
            warn!(%provider, error = %e, "Webhook not classified; asking for redelivery");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

fn outcome_body(outcome: &Outcome) -> Value {
    match outcome {
        Outcome::Applied { payment, order } => json!({
            "outcome": outcome.label(),
            "payment": PaymentView::from(payment),
            "order": order,
        }),
        Outcome::Ignored(reason) => json!({ "outcome": outcome.label(), "detail": reason }),
        Outcome::Rejected(reason) => json!({ "outcome": outcome.label(), "detail": reason }),
    }
}
