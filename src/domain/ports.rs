use super::event::ProviderEvent;
use super::money::{Amount, Currency};
use super::order::{Effect, Order, OrderId};
use super::outcome::OrderOutcome;
use super::payment::{Payment, PaymentId, PaymentStatus};
use super::provider::{
    AccessToken, CreatePaymentRequest, IdempotencyKey, Provider, ProviderPayment, RefundResult,
};
use crate::error::Result;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::sync::Arc;

/// Mutation applied to one payment inside the store's atomic section.
/// An `Unchanged` result skips the write.
pub type PaymentMutation = Box<dyn FnOnce(&mut Payment) -> Result<Effect> + Send>;

/// Mutation applied to one order. It also sees the order's payments as read
/// in the same atomic section, so cross-record preconditions hold at commit.
/// An `Unchanged` result skips the write.
pub type OrderMutation = Box<dyn FnOnce(&mut Order, &[Payment]) -> Result<Effect> + Send>;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Inserts a new payment unless its order already has an active one
    /// (`ActivePaymentExists`).
    async fn open(&self, payment: Payment) -> Result<Payment>;
    async fn get(&self, id: &PaymentId) -> Result<Option<Payment>>;
    async fn find_by_provider_ref(
        &self,
        provider: Provider,
        provider_ref: &str,
    ) -> Result<Option<Payment>>;
    async fn for_order(&self, order_id: &OrderId) -> Result<Vec<Payment>>;
    async fn with_status(&self, status: PaymentStatus) -> Result<Vec<Payment>>;
    async fn all(&self) -> Result<Vec<Payment>>;
    /// Atomic read-modify-write. Nothing is written if the mutation fails.
    /// Enforces (provider, provider_ref) uniqueness (`DuplicateProviderRef`).
    async fn update(&self, id: &PaymentId, mutation: PaymentMutation) -> Result<(Payment, Effect)>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: Order) -> Result<()>;
    async fn get(&self, id: &OrderId) -> Result<Option<Order>>;
    /// Atomic read-modify-write. Nothing is written if the mutation fails.
    async fn update(&self, id: &OrderId, mutation: OrderMutation) -> Result<(Order, Effect)>;
}

pub type PaymentStoreRef = Arc<dyn PaymentStore>;
pub type OrderStoreRef = Arc<dyn OrderStore>;

/// One external payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// Returns a cached token, refreshing it inside the safety margin.
    async fn authenticate(&self) -> Result<AccessToken>;

    /// The provider reference a creation keyed by `key` will carry, for
    /// providers where the client picks it. Known before the call, so a
    /// timed-out creation can still be matched and polled.
    fn reference_for(&self, _key: &IdempotencyKey) -> Option<String> {
        None
    }

    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<ProviderPayment>;

    async fn capture(&self, provider_ref: &str, key: &IdempotencyKey) -> Result<ProviderEvent>;

    async fn get_status(&self, provider_ref: &str) -> Result<ProviderEvent>;

    /// Refunds `amount` of the captured payment.
    async fn refund(
        &self,
        provider_ref: &str,
        amount: Amount,
        currency: &Currency,
        key: &IdempotencyKey,
    ) -> Result<RefundResult>;

    /// Constant-time check; false on any malformed input.
    fn verify_webhook_signature(&self, body: &[u8], headers: &HeaderMap) -> bool;

    fn parse_event(&self, body: &[u8]) -> Result<ProviderEvent> {
        ProviderEvent::parse(self.provider(), body)
    }
}

pub type ProviderRef = Arc<dyn PaymentProvider>;

/// Outbound notification collaborator. Fire-and-forget from the core.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, order_id: OrderId, outcome: OrderOutcome) -> Result<()>;
}

pub type NotifierRef = Arc<dyn Notifier>;
