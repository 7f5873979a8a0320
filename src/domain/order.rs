use super::money::{Amount, Currency};
use super::payment::{Payment, PaymentId, PaymentStatus};
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OrderId {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| PaymentError::Validation(format!("Invalid order id: {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a requested transition changed the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Changed,
    Unchanged,
}

/// One entry of the order's append-only status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// A customer order and its lifecycle.
///
/// Edges: `pending → {paid, cancelled}` and `paid → refunded`. Every other
/// request fails with `IllegalTransition`. Repeating a transition that already
/// happened for the same payment is a no-op, which keeps redelivered events safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub amount: Amount,
    pub currency: Currency,
    pub status: OrderStatus,
    /// The payment that settled the order.
    pub payment_ref: Option<PaymentId>,
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(amount: Amount, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id: OrderId::new(),
            amount,
            currency,
            status: OrderStatus::Pending,
            payment_ref: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn illegal(&self, to: OrderStatus) -> PaymentError {
        PaymentError::IllegalTransition {
            entity: "order",
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    fn move_to(&mut self, to: OrderStatus, reason: Option<String>) {
        let now = Utc::now();
        self.history.push(StatusChange {
            from: self.status,
            to,
            at: now,
            reason,
        });
        self.status = to;
        self.updated_at = now;
    }

    /// Settles the order with a completed payment.
    pub fn mark_paid(&mut self, payment: &Payment) -> Result<Effect, PaymentError> {
        if payment.order_id != self.id {
            return Err(PaymentError::Validation(format!(
                "Payment {} does not belong to order {}",
                payment.id, self.id
            )));
        }
        match self.status {
            OrderStatus::Paid if self.payment_ref == Some(payment.id) => Ok(Effect::Unchanged),
            OrderStatus::Paid => Err(PaymentError::AlreadySettled {
                order_id: self.id,
                settled_with: self.payment_ref,
                attempted: payment.id,
            }),
            OrderStatus::Pending if payment.status == PaymentStatus::Completed => {
                self.payment_ref = Some(payment.id);
                self.move_to(OrderStatus::Paid, Some(format!("payment {}", payment.id)));
                Ok(Effect::Changed)
            }
            _ => Err(self.illegal(OrderStatus::Paid)),
        }
    }

    pub fn cancel(&mut self, reason: &str) -> Result<Effect, PaymentError> {
        match self.status {
            OrderStatus::Pending => {
                self.move_to(OrderStatus::Cancelled, Some(reason.to_string()));
                Ok(Effect::Changed)
            }
            OrderStatus::Cancelled => Ok(Effect::Unchanged),
            _ => Err(self.illegal(OrderStatus::Cancelled)),
        }
    }

    /// Checks that a refund may be initiated and returns the settling payment.
    pub fn refundable_payment(&self) -> Result<PaymentId, PaymentError> {
        match (self.status, self.payment_ref) {
            (OrderStatus::Paid, Some(payment_id)) => Ok(payment_id),
            _ => Err(self.illegal(OrderStatus::Refunded)),
        }
    }

    /// Completes a provider-confirmed refund of the settling payment.
    pub fn refund(&mut self, payment_id: PaymentId) -> Result<Effect, PaymentError> {
        match self.status {
            OrderStatus::Refunded if self.payment_ref == Some(payment_id) => Ok(Effect::Unchanged),
            OrderStatus::Paid if self.payment_ref == Some(payment_id) => {
                self.move_to(OrderStatus::Refunded, Some(format!("payment {payment_id}")));
                Ok(Effect::Changed)
            }
            _ => Err(self.illegal(OrderStatus::Refunded)),
        }
    }
}
