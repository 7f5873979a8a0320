use super::order::{Order, OrderId, OrderStatus};
use super::payment::{Payment, PaymentId, PaymentStatus};
use super::provider::Provider;
use serde::Serialize;
use std::fmt;

/// Where an outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Webhook,
    SynchronousCapture,
    StatusPoll,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Source::Webhook => "webhook",
            Source::SynchronousCapture => "synchronous_capture",
            Source::StatusPoll => "status_poll",
        })
    }
}

/// Progress of a single reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitingProvider,
    Verifying,
    Applying,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AwaitingProvider => "awaiting_provider",
            Stage::Verifying => "verifying",
            Stage::Applying => "applying",
            Stage::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IgnoreReason {
    /// The payment already had the target status.
    Duplicate {
        payment_id: PaymentId,
        status: PaymentStatus,
    },
    /// The provider is still processing the payment.
    InFlight {
        payment_id: PaymentId,
        provider_status: String,
    },
    /// The provider status is not in the mapping table.
    UnmappedStatus { provider_status: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    BadSignature,
    MalformedEvent {
        detail: String,
    },
    UnknownProviderRef {
        provider: Provider,
        provider_ref: String,
    },
    IllegalTransition {
        payment_id: PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// The payment moved but the order cannot follow; needs an operator.
    OrderConflict {
        payment_id: PaymentId,
        order_id: OrderId,
        detail: String,
    },
}

impl RejectReason {
    /// Rejections decided before anything was verified.
    pub fn is_unverified_input(&self) -> bool {
        matches!(
            self,
            RejectReason::BadSignature | RejectReason::MalformedEvent { .. }
        )
    }
}

/// Terminal classification of an inbound provider outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied { payment: Payment, order: Order },
    Ignored(IgnoreReason),
    Rejected(RejectReason),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Applied { .. } => "applied",
            Outcome::Ignored(_) => "ignored",
            Outcome::Rejected(_) => "rejected",
        }
    }
}

/// What the notification dispatcher is told after an order transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderOutcome {
    Paid,
    Cancelled,
    Refunded,
}

impl From<OrderOutcome> for OrderStatus {
    fn from(outcome: OrderOutcome) -> Self {
        match outcome {
            OrderOutcome::Paid => OrderStatus::Paid,
            OrderOutcome::Cancelled => OrderStatus::Cancelled,
            OrderOutcome::Refunded => OrderStatus::Refunded,
        }
    }
}
