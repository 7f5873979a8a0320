//! The payment ledger: the only writer of payment records.

use crate::domain::money::{Amount, Currency};
use crate::domain::order::{Effect, OrderId};
use crate::domain::payment::{Payment, PaymentId, PaymentStatus, PendingRefund};
use crate::domain::ports::PaymentStoreRef;
use crate::domain::provider::Provider;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

/// Result of a compare-and-set status transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Payment),
    /// The payment already had the target status; nothing was written.
    AlreadyApplied(Payment),
}

impl TransitionOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            TransitionOutcome::Applied(p) | TransitionOutcome::AlreadyApplied(p) => p,
        }
    }

    pub fn into_payment(self) -> Payment {
        match self {
            TransitionOutcome::Applied(p) | TransitionOutcome::AlreadyApplied(p) => p,
        }
    }
}

#[derive(Clone)]
pub struct PaymentLedger {
    store: PaymentStoreRef,
}

impl PaymentLedger {
    pub fn new(store: PaymentStoreRef) -> Self {
        Self { store }
    }

    /// Opens the next attempt for an order. Fails with `ActivePaymentExists`
    /// while a pending or completed payment exists.
    pub async fn open(
        &self,
        order_id: OrderId,
        provider: Provider,
        amount: Amount,
        currency: Currency,
    ) -> Result<Payment> {
        let attempt = self
            .store
            .for_order(&order_id)
            .await?
            .iter()
            .map(|p| p.attempt)
            .max()
            .unwrap_or(0)
            + 1;
        let payment = self
            .store
            .open(Payment::new(order_id, attempt, provider, amount, currency))
            .await?;
        info!(payment_id = %payment.id, %order_id, %provider, attempt, "Payment opened");
        Ok(payment)
    }

    /// Sets the provider reference once; the same value again is a no-op.
    pub async fn attach_provider_ref(&self, id: PaymentId, provider_ref: &str) -> Result<Payment> {
        let reference = provider_ref.to_string();
        let (payment, effect) = self
            .store
            .update(&id, Box::new(move |p| p.attach_provider_ref(&reference)))
            .await?;
        if effect == Effect::Changed {
            debug!(payment_id = %id, %provider_ref, "Provider reference attached");
        }
        Ok(payment)
    }

    /// Moves `id` from `from` to `to` iff its current status is `from`.
    ///
    /// When the payment already sits at `to` nothing is written and the stored
    /// payload is kept. Any other mismatch is `StaleTransition`; an edge
    /// outside the status graph is `IllegalTransition`.
    pub async fn transition(
        &self,
        id: PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        payload: Option<Value>,
    ) -> Result<TransitionOutcome> {
        let mutation = Box::new(move |p: &mut Payment| {
            if p.status != from {
                return Err(PaymentError::StaleTransition {
                    payment_id: p.id,
                    expected: from.to_string(),
                    actual: p.status.to_string(),
                });
            }
            p.transition(to, payload)
        });

        match self.store.update(&id, mutation).await {
            Ok((payment, _)) => {
                info!(payment_id = %id, %from, %to, "Payment transitioned");
                Ok(TransitionOutcome::Applied(payment))
            }
            Err(PaymentError::StaleTransition { actual, .. }) if actual == to.as_str() => {
                let payment = self.get(id).await?;
                Ok(TransitionOutcome::AlreadyApplied(payment))
            }
            Err(e) => Err(e),
        }
    }

    /// Reserves (or resumes) the refund sequence used for the idempotency key.
    pub async fn begin_refund(&self, id: PaymentId, amount: Amount) -> Result<(Payment, PendingRefund)> {
        let (payment, _) = self
            .store
            .update(
                &id,
                Box::new(move |p| {
                    let resumed = p.pending_refund.is_some();
                    p.begin_refund(amount)?;
                    Ok(if resumed { Effect::Unchanged } else { Effect::Changed })
                }),
            )
            .await?;
        let pending = payment.pending_refund.ok_or(PaymentError::RefundInProgress {
            payment_id: id,
            sequence: payment.refund_requests,
        })?;
        Ok((payment, pending))
    }

    /// Books a provider-confirmed refund once under `refund_ref`. `Unchanged`
    /// means the sequence was already booked.
    pub async fn settle_refund(
        &self,
        id: PaymentId,
        sequence: u32,
        refund_ref: &str,
    ) -> Result<(Payment, Effect)> {
        let reference = refund_ref.to_string();
        let (payment, effect) = self
            .store
            .update(
                &id,
                Box::new(move |p| {
                    Ok(match p.settle_refund(sequence, &reference)? {
                        Some(_) => Effect::Changed,
                        None => Effect::Unchanged,
                    })
                }),
            )
            .await?;
        if effect == Effect::Changed {
            info!(
                payment_id = %id,
                sequence,
                %refund_ref,
                refunded = payment.refunded_amount,
                fully = payment.refundable() == 0,
                "Refund booked"
            );
        }
        Ok((payment, effect))
    }

    pub async fn abandon_refund(&self, id: PaymentId, sequence: u32) -> Result<Payment> {
        let (payment, _) = self
            .store
            .update(&id, Box::new(move |p| Ok(p.abandon_refund(sequence))))
            .await?;
        Ok(payment)
    }

    pub async fn get(&self, id: PaymentId) -> Result<Payment> {
        self.store
            .get(&id)
            .await?
            .ok_or(PaymentError::PaymentNotFound(id))
    }

    pub async fn find_by_provider_ref(
        &self,
        provider: Provider,
        provider_ref: &str,
    ) -> Result<Option<Payment>> {
        self.store.find_by_provider_ref(provider, provider_ref).await
    }

    pub async fn for_order(&self, order_id: OrderId) -> Result<Vec<Payment>> {
        self.store.for_order(&order_id).await
    }

    pub async fn with_status(&self, status: PaymentStatus) -> Result<Vec<Payment>> {
        self.store.with_status(status).await
    }

    pub async fn all(&self) -> Result<Vec<Payment>> {
        self.store.all().await
    }

    /// Pending payments created at or before `cutoff`.
    pub async fn pending_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Payment>> {
        Ok(self
            .store
            .with_status(PaymentStatus::Pending)
            .await?
            .into_iter()
            .filter(|p| p.created_at <= cutoff)
            .collect())
    }
}
