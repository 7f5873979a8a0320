use super::money::{Amount, Currency};
use super::order::{Effect, OrderId};
use super::provider::{IdempotencyKey, Operation, Provider};
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(Uuid);

impl PaymentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PaymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PaymentId {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| PaymentError::Validation(format!("Invalid payment id: {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// The only legal edges: pending→{completed, failed}, completed→refunded.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Completed)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Completed, PaymentStatus::Refunded)
        )
    }

    /// Pending and completed payments still have outgoing edges.
    pub fn is_active(self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(PaymentError::Validation(format!(
                "Unknown payment status: {other:?}"
            ))),
        }
    }
}

/// A refund issued to the provider and not yet settled locally.
///
/// While it is set, repeated refund requests for the same amount reuse its
/// sequence (and so its idempotency key) instead of issuing a second refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRefund {
    pub sequence: u32,
    pub amount: Amount,
}

/// One payment attempt against a provider for an order.
///
/// Payments are never deleted; a failed attempt stays in the ledger next to
/// the retry that replaced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    /// 1-based attempt number within the order.
    pub attempt: u32,
    pub provider: Provider,
    /// External correlation id, set once the provider accepted the creation request.
    pub provider_ref: Option<String>,
    pub status: PaymentStatus,
    pub amount: Amount,
    pub currency: Currency,
    /// Minor units refunded so far.
    pub refunded_amount: u64,
    /// Number of refund requests issued, used to derive refund idempotency keys.
    pub refund_requests: u32,
    pub pending_refund: Option<PendingRefund>,
    /// Provider reference of the last booked refund.
    #[serde(default)]
    pub refund_ref: Option<String>,
    /// Last provider payload, kept for diagnostics only.
    pub last_provider_payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn new(
        order_id: OrderId,
        attempt: u32,
        provider: Provider,
        amount: Amount,
        currency: Currency,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PaymentId::new(),
            order_id,
            attempt,
            provider,
            provider_ref: None,
            status: PaymentStatus::Pending,
            amount,
            currency,
            refunded_amount: 0,
            refund_requests: 0,
            pending_refund: None,
            refund_ref: None,
            last_provider_payload: None,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn idempotency_key(&self, operation: Operation) -> IdempotencyKey {
        IdempotencyKey::derive(&self.order_id, self.attempt, operation)
    }

    /// Sets the provider correlation id. Re-attaching the same value is a no-op.
    pub fn attach_provider_ref(&mut self, provider_ref: &str) -> Result<Effect, PaymentError> {
        match &self.provider_ref {
            Some(existing) if existing == provider_ref => Ok(Effect::Unchanged),
            Some(existing) => Err(PaymentError::ProviderRefAlreadyAttached {
                payment_id: self.id,
                existing: existing.clone(),
            }),
            None => {
                self.provider_ref = Some(provider_ref.to_string());
                self.updated_at = Utc::now();
                Ok(Effect::Changed)
            }
        }
    }

    /// Applies a legal status edge and records the provider payload.
    pub fn transition(
        &mut self,
        next: PaymentStatus,
        payload: Option<serde_json::Value>,
    ) -> Result<Effect, PaymentError> {
        if !self.status.can_transition_to(next) {
            return Err(PaymentError::IllegalTransition {
                entity: "payment",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if matches!(next, PaymentStatus::Completed | PaymentStatus::Failed) {
            self.confirmed_at = Some(now);
        }
        if next == PaymentStatus::Refunded {
            self.refunded_amount = self.amount.minor_units();
            self.pending_refund = None;
        }
        self.status = next;
        if payload.is_some() {
            self.last_provider_payload = payload;
        }
        self.updated_at = now;
        Ok(Effect::Changed)
    }

    /// Minor units that can still be refunded.
    pub fn refundable(&self) -> u64 {
        self.amount.minor_units().saturating_sub(self.refunded_amount)
    }

    /// Accumulates a provider-confirmed refund. Returns true once the payment
    /// is refunded in full (the caller then drives completed→refunded).
    pub fn record_refund(&mut self, amount: Amount) -> Result<bool, PaymentError> {
        if self.status != PaymentStatus::Completed {
            return Err(PaymentError::IllegalTransition {
                entity: "payment",
                from: self.status.to_string(),
                to: PaymentStatus::Refunded.to_string(),
            });
        }
        if amount.minor_units() > self.refundable() {
            return Err(PaymentError::Validation(format!(
                "Refund of {amount} exceeds refundable balance {}",
                self.refundable()
            )));
        }
        self.refunded_amount += amount.minor_units();
        self.updated_at = Utc::now();
        Ok(self.refundable() == 0)
    }

    /// Reserves a refund sequence, or returns the one already in flight when
    /// the amount matches.
    pub fn begin_refund(&mut self, amount: Amount) -> Result<PendingRefund, PaymentError> {
        if self.status != PaymentStatus::Completed {
            return Err(PaymentError::IllegalTransition {
                entity: "payment",
                from: self.status.to_string(),
                to: PaymentStatus::Refunded.to_string(),
            });
        }
        if let Some(pending) = self.pending_refund {
            if pending.amount == amount {
                return Ok(pending);
            }
            return Err(PaymentError::RefundInProgress {
                payment_id: self.id,
                sequence: pending.sequence,
            });
        }
        if amount.minor_units() > self.refundable() {
            return Err(PaymentError::Validation(format!(
                "Refund of {amount} exceeds refundable balance {}",
                self.refundable()
            )));
        }
        let pending = PendingRefund {
            sequence: self.refund_requests,
            amount,
        };
        self.refund_requests += 1;
        self.pending_refund = Some(pending);
        self.updated_at = Utc::now();
        Ok(pending)
    }

    /// Books the in-flight refund `sequence` under the provider's
    /// `refund_ref`. Returns `None` when it was already booked, otherwise
    /// whether the payment is now fully refunded.
    pub fn settle_refund(&mut self, sequence: u32, refund_ref: &str) -> Result<Option<bool>, PaymentError> {
        match self.pending_refund {
            Some(pending) if pending.sequence == sequence => {
                let fully = self.record_refund(pending.amount)?;
                self.pending_refund = None;
                self.refund_ref = Some(refund_ref.to_string());
                Ok(Some(fully))
            }
            _ => Ok(None),
        }
    }

    /// Drops the in-flight refund after the provider refused it.
    pub fn abandon_refund(&mut self, sequence: u32) -> Effect {
        if self.pending_refund.is_some_and(|p| p.sequence == sequence) {
            self.pending_refund = None;
            self.updated_at = Utc::now();
            return Effect::Changed;
        }
        Effect::Unchanged
    }

    /// Fully refunded by booked refunds but still `completed`: the
    /// completed→refunded edge is all that is left to apply.
    pub fn awaits_refunded_status(&self) -> bool {
        self.status == PaymentStatus::Completed
            && self.pending_refund.is_none()
            && self.refundable() == 0
    }
}
