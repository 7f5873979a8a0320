//! Order lifecycle driven by settled payments.
//!
//! Every transition runs inside the order store's atomic section together
//! with a read of the order's payments, so "the settling payment is
//! completed" holds at commit time. Notifications go out only after commit.

use crate::domain::money::{Amount, Currency};
use crate::domain::order::{Effect, Order, OrderId, OrderStatus};
use crate::domain::outcome::OrderOutcome;
use crate::domain::payment::{PaymentId, PaymentStatus};
use crate::domain::ports::{NotifierRef, OrderStoreRef};
use crate::error::{PaymentError, Result};
use tracing::{info, warn};

#[derive(Clone)]
pub struct OrderStateMachine {
    orders: OrderStoreRef,
    notifier: NotifierRef,
}

impl OrderStateMachine {
    pub fn new(orders: OrderStoreRef, notifier: NotifierRef) -> Self {
        Self { orders, notifier }
    }

    pub async fn place(&self, amount: Amount, currency: Currency) -> Result<Order> {
        let order = Order::new(amount, currency);
        self.orders.insert(order.clone()).await?;
        info!(order_id = %order.id, amount = %order.amount, currency = %order.currency, "Order placed");
        Ok(order)
    }

    pub async fn get(&self, id: OrderId) -> Result<Order> {
        self.orders
            .get(&id)
            .await?
            .ok_or(PaymentError::OrderNotFound(id))
    }

    /// `pending → paid`. Idempotent for the payment that already settled the
    /// order; another payment gets `AlreadySettled`.
    pub async fn mark_paid(&self, order_id: OrderId, payment_id: PaymentId) -> Result<(Order, Effect)> {
        let (order, effect) = self
            .orders
            .update(
                &order_id,
                Box::new(move |order, payments| {
                    let payment = payments
                        .iter()
                        .find(|p| p.id == payment_id)
                        .ok_or(PaymentError::PaymentNotFound(payment_id))?;
                    order.mark_paid(payment)
                }),
            )
            .await?;
        self.after_commit(&order, effect, OrderOutcome::Paid);
        Ok((order, effect))
    }

    /// `pending → cancelled`, on request.
    pub async fn cancel(&self, order_id: OrderId, reason: &str) -> Result<(Order, Effect)> {
        let reason = reason.to_string();
        let (order, effect) = self
            .orders
            .update(&order_id, Box::new(move |order, _| order.cancel(&reason)))
            .await?;
        self.after_commit(&order, effect, OrderOutcome::Cancelled);
        Ok((order, effect))
    }

    /// Follows a failed payment: only a pending order is cancelled. An order
    /// already settled by another payment is left alone.
    pub async fn cancel_after_failure(
        &self,
        order_id: OrderId,
        payment_id: PaymentId,
    ) -> Result<(Order, Effect)> {
        let (order, effect) = self
            .orders
            .update(
                &order_id,
                Box::new(move |order, payments| {
                    let failed = payments
                        .iter()
                        .any(|p| p.id == payment_id && p.status == PaymentStatus::Failed);
                    if !failed {
                        return Err(PaymentError::Validation(format!(
                            "Payment {payment_id} of order {} has not failed",
                            order.id
                        )));
                    }
                    match order.status {
                        OrderStatus::Pending => order.cancel(&format!("payment {payment_id} failed")),
                        _ => Ok(Effect::Unchanged),
                    }
                }),
            )
            .await?;
        if effect == Effect::Unchanged && order.status != OrderStatus::Cancelled {
            warn!(%order_id, %payment_id, status = %order.status, "Failed payment left settled order untouched");
        }
        self.after_commit(&order, effect, OrderOutcome::Cancelled);
        Ok((order, effect))
    }

    /// Checks that the order can be refunded and returns its settling payment.
    pub async fn refundable(&self, order_id: OrderId) -> Result<(Order, PaymentId)> {
        let order = self.get(order_id).await?;
        let payment_id = order.refundable_payment()?;
        Ok((order, payment_id))
    }

    /// `paid → refunded`, once the settling payment is refunded.
    pub async fn complete_refund(&self, order_id: OrderId, payment_id: PaymentId) -> Result<(Order, Effect)> {
        let (order, effect) = self
            .orders
            .update(
                &order_id,
                Box::new(move |order, payments| {
                    let refunded = payments
                        .iter()
                        .any(|p| p.id == payment_id && p.status == PaymentStatus::Refunded);
                    if !refunded {
                        return Err(PaymentError::IllegalTransition {
                            entity: "order",
                            from: order.status.to_string(),
                            to: OrderStatus::Refunded.to_string(),
                        });
                    }
                    order.refund(payment_id)
                }),
            )
            .await?;
        self.after_commit(&order, effect, OrderOutcome::Refunded);
        Ok((order, effect))
    }

    fn after_commit(&self, order: &Order, effect: Effect, outcome: OrderOutcome) {
        if effect == Effect::Unchanged {
            return;
        }
        info!(order_id = %order.id, status = %order.status, "Order transitioned");

        let notifier = self.notifier.clone();
        let order_id = order.id;
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(order_id, outcome).await {
                warn!(%order_id, ?outcome, error = %e, "Order notification failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::Payment;
    use crate::domain::ports::{Notifier, PaymentStore};
    use crate::domain::provider::Provider;
    use crate::infrastructure::in_memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(OrderId, OrderOutcome)>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, order_id: OrderId, outcome: OrderOutcome) -> Result<()> {
            self.0.lock().unwrap().push((order_id, outcome));
            Ok(())
        }
    }

    async fn setup() -> (OrderStateMachine, InMemoryStore, Arc<Recorder>, Order) {
        let store = InMemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        let machine = OrderStateMachine::new(Arc::new(store.clone()), recorder.clone());
        let order = machine
            .place(Amount::new(990).unwrap(), Currency::new("USD").unwrap())
            .await
            .unwrap();
        (machine, store, recorder, order)
    }

    async fn settled_payment(
        store: &InMemoryStore,
        order: &Order,
        attempt: u32,
        status: PaymentStatus,
    ) -> Payment {
        let payment = store
            .open(Payment::new(
                order.id,
                attempt,
                Provider::CardWallet,
                order.amount,
                order.currency.clone(),
            ))
            .await
            .unwrap();
        PaymentStore::update(store, &payment.id, Box::new(move |p| p.transition(status, None)))
            .await
            .unwrap()
            .0
    }

    async fn settle_notifications() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_mark_paid_notifies_once() {
        let (machine, store, recorder, order) = setup().await;
        let payment = settled_payment(&store, &order, 1, PaymentStatus::Completed).await;

        let (paid, effect) = machine.mark_paid(order.id, payment.id).await.unwrap();
        assert_eq!(effect, Effect::Changed);
        assert_eq!(paid.status, OrderStatus::Paid);
        let (_, effect) = machine.mark_paid(order.id, payment.id).await.unwrap();
        assert_eq!(effect, Effect::Unchanged);

        settle_notifications().await;
        assert_eq!(*recorder.0.lock().unwrap(), vec![(order.id, OrderOutcome::Paid)]);
    }

    #[tokio::test]
    async fn test_late_failure_does_not_cancel_paid_order() {
        let (machine, store, _, order) = setup().await;
        let failed = settled_payment(&store, &order, 1, PaymentStatus::Failed).await;
        let completed = settled_payment(&store, &order, 2, PaymentStatus::Completed).await;
        machine.mark_paid(order.id, completed.id).await.unwrap();

        let (order, effect) = machine.cancel_after_failure(order.id, failed.id).await.unwrap();
        assert_eq!(effect, Effect::Unchanged);
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.payment_ref, Some(completed.id));
    }

    #[tokio::test]
    async fn test_cancel_after_failure() {
        let (machine, store, recorder, order) = setup().await;
        let payment = settled_payment(&store, &order, 1, PaymentStatus::Failed).await;

        let (cancelled, effect) = machine.cancel_after_failure(order.id, payment.id).await.unwrap();
        assert_eq!(effect, Effect::Changed);
        assert_eq!(cancelled.status, OrderStatus::Cancelled);

        let (_, effect) = machine.cancel_after_failure(order.id, payment.id).await.unwrap();
        assert_eq!(effect, Effect::Unchanged);
        settle_notifications().await;
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_only_from_pending() {
        let (machine, store, _, order) = setup().await;
        let (cancelled, effect) = machine.cancel(order.id, "customer abandoned").await.unwrap();
        assert_eq!(effect, Effect::Changed);
        assert_eq!(cancelled.history.last().unwrap().reason.as_deref(), Some("customer abandoned"));

        let paid = machine
            .place(Amount::new(500).unwrap(), Currency::new("EUR").unwrap())
            .await
            .unwrap();
        let payment = settled_payment(&store, &paid, 1, PaymentStatus::Completed).await;
        machine.mark_paid(paid.id, payment.id).await.unwrap();
        let err = machine.cancel(paid.id, "too late").await.unwrap_err();
        assert!(matches!(err, PaymentError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_mark_paid_requires_completed_payment_at_commit() {
        let (machine, store, _, order) = setup().await;
        let payment = settled_payment(&store, &order, 1, PaymentStatus::Failed).await;

        let err = machine.mark_paid(order.id, payment.id).await.unwrap_err();
        assert!(matches!(err, PaymentError::IllegalTransition { .. }));
        assert_eq!(machine.get(order.id).await.unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_refund_requires_refunded_payment() {
        let (machine, store, _, order) = setup().await;
        let payment = settled_payment(&store, &order, 1, PaymentStatus::Completed).await;
        machine.mark_paid(order.id, payment.id).await.unwrap();

        assert_eq!(machine.refundable(order.id).await.unwrap().1, payment.id);
        assert!(machine.complete_refund(order.id, payment.id).await.is_err());

        PaymentStore::update(
            &store,
            &payment.id,
            Box::new(|p| p.transition(PaymentStatus::Refunded, None)),
        )
        .await
        .unwrap();
        let (refunded, effect) = machine.complete_refund(order.id, payment.id).await.unwrap();
        assert_eq!(effect, Effect::Changed);
        assert_eq!(refunded.status, OrderStatus::Refunded);
    }
}
