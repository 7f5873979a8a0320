use crate::domain::order::{Effect, Order, OrderId};
use crate::domain::payment::{Payment, PaymentId, PaymentStatus};
use crate::domain::ports::{OrderMutation, OrderStore, PaymentMutation, PaymentStore};
use crate::domain::provider::Provider;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    orders: HashMap<OrderId, Order>,
    payments: HashMap<PaymentId, Payment>,
    /// Unique index on (provider, provider_ref).
    provider_refs: HashMap<(Provider, String), PaymentId>,
    /// Partial index: the single active payment per order.
    active: HashMap<OrderId, PaymentId>,
}

impl Tables {
    fn check_immutable(current: &Payment, next: &Payment) -> Result<()> {
        if current.id != next.id
            || current.order_id != next.order_id
            || current.provider != next.provider
            || current.attempt != next.attempt
        {
            return Err(PaymentError::Validation(format!(
                "Identity fields of payment {} are immutable",
                current.id
            )));
        }
        Ok(())
    }

    /// Validates index constraints for `next` and updates the indexes.
    fn reindex(&mut self, current: Option<&Payment>, next: &Payment) -> Result<()> {
        let previous_ref = current.and_then(|p| p.provider_ref.clone());
        if next.provider_ref != previous_ref
            && let Some(provider_ref) = &next.provider_ref
        {
            let key = (next.provider, provider_ref.clone());
            if let Some(owner) = self.provider_refs.get(&key)
                && *owner != next.id
            {
                return Err(PaymentError::DuplicateProviderRef {
                    provider: next.provider,
                    provider_ref: provider_ref.clone(),
                });
            }
            if let Some(old) = previous_ref {
                self.provider_refs.remove(&(next.provider, old));
            }
            self.provider_refs.insert(key, next.id);
        }

        if next.is_active() {
            self.active.insert(next.order_id, next.id);
        } else if self.active.get(&next.order_id) == Some(&next.id) {
            self.active.remove(&next.order_id);
        }
        Ok(())
    }
}

/// A thread-safe in-memory store for orders and payments.
///
/// Both record kinds live behind one `RwLock` so that an order mutation can
/// read the order's payments in the same critical section. Critical sections
/// are pure compare-and-set work on a single record; no I/O happens under the
/// lock. Ideal for tests and single-node deployments without persistence.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryStore {
    async fn open(&self, payment: Payment) -> Result<Payment> {
        let mut tables = self.tables.write().await;
        if let Some(active_id) = tables.active.get(&payment.order_id) {
            return Err(PaymentError::ActivePaymentExists {
                order_id: payment.order_id,
                payment_id: *active_id,
            });
        }
        if tables.payments.contains_key(&payment.id) {
            return Err(PaymentError::Validation(format!(
                "Payment {} already exists",
                payment.id
            )));
        }
        tables.reindex(None, &payment)?;
        tables.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get(&self, id: &PaymentId) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables.payments.get(id).cloned())
    }

    async fn find_by_provider_ref(
        &self,
        provider: Provider,
        provider_ref: &str,
    ) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .provider_refs
            .get(&(provider, provider_ref.to_string()))
            .and_then(|id| tables.payments.get(id))
            .cloned())
    }

    async fn for_order(&self, order_id: &OrderId) -> Result<Vec<Payment>> {
        let tables = self.tables.read().await;
        let mut payments: Vec<Payment> = tables
            .payments
            .values()
            .filter(|p| p.order_id == *order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.attempt);
        Ok(payments)
    }

    async fn with_status(&self, status: PaymentStatus) -> Result<Vec<Payment>> {
        let tables = self.tables.read().await;
        let mut payments: Vec<Payment> = tables
            .payments
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn all(&self) -> Result<Vec<Payment>> {
        let tables = self.tables.read().await;
        let mut payments: Vec<Payment> = tables.payments.values().cloned().collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn update(&self, id: &PaymentId, mutation: PaymentMutation) -> Result<(Payment, Effect)> {
        let mut tables = self.tables.write().await;
        let current = tables
            .payments
            .get(id)
            .cloned()
            .ok_or(PaymentError::PaymentNotFound(*id))?;
        let mut next = current.clone();
        let effect = mutation(&mut next)?;
        if effect == Effect::Unchanged {
            return Ok((current, effect));
        }
        Tables::check_immutable(&current, &next)?;
        tables.reindex(Some(&current), &next)?;
        tables.payments.insert(*id, next.clone());
        Ok((next, effect))
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert(&self, order: Order) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.orders.contains_key(&order.id) {
            return Err(PaymentError::Validation(format!(
                "Order {} already exists",
                order.id
            )));
        }
        tables.orders.insert(order.id, order);
        Ok(())
    }

    async fn get(&self, id: &OrderId) -> Result<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables.orders.get(id).cloned())
    }

    async fn update(&self, id: &OrderId, mutation: OrderMutation) -> Result<(Order, Effect)> {
        let mut tables = self.tables.write().await;
        let current = tables
            .orders
            .get(id)
            .cloned()
            .ok_or(PaymentError::OrderNotFound(*id))?;
        let payments: Vec<Payment> = tables
            .payments
            .values()
            .filter(|p| p.order_id == *id)
            .cloned()
            .collect();
        let mut next = current;
        let effect = mutation(&mut next, &payments)?;
        if next.id != *id {
            return Err(PaymentError::Validation(format!(
                "Identity of order {id} is immutable"
            )));
        }
        if effect == Effect::Changed {
            tables.orders.insert(*id, next.clone());
        }
        Ok((next, effect))
    }
}
