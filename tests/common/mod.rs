#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use payrecon::application::{
    OrderStateMachine, PaymentLedger, ProviderRegistry, ReconciliationService,
};
use payrecon::config::RetryConfig;
use payrecon::domain::event::ProviderEvent;
use payrecon::domain::money::{Amount, Currency};
use payrecon::domain::order::{Order, OrderId};
use payrecon::domain::outcome::{OrderOutcome, Outcome, Source};
use payrecon::domain::payment::Payment;
use payrecon::domain::ports::{Notifier, PaymentProvider};
use payrecon::domain::provider::{
    AccessToken, CreatePaymentRequest, IdempotencyKey, Provider, ProviderPayment, RefundResult,
    ReturnUrls,
};
use payrecon::error::Result;
use payrecon::infrastructure::in_memory::InMemoryStore;
use payrecon::infrastructure::providers::signature::{BodyHmac, SignatureScheme};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SIGNATURE_HEADER: &str = "x-test-signature";
pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Retries quickly so exhausted-retry paths stay fast.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_retries: 2,
    }
}

/// Provider-shaped notification body for `provider_ref` in `status`.
pub fn event_body(provider: Provider, provider_ref: &str, status: &str) -> Vec<u8> {
    let body = match provider {
        Provider::CardWallet => json!({
            "id": format!("WH-{provider_ref}-{status}"),
            "event_type": "CHECKOUT.ORDER.UPDATED",
            "resource": { "id": provider_ref, "status": status },
        }),
        Provider::MobileMoney => json!({ "referenceId": provider_ref, "status": status }),
    };
    serde_json::to_vec(&body).unwrap()
}

pub fn event(provider: Provider, provider_ref: &str, status: &str) -> ProviderEvent {
    ProviderEvent::parse(provider, &event_body(provider, provider_ref, status)).unwrap()
}

/// A provider whose answers are scripted per operation. Once a script runs
/// dry the provider falls back to a happy-path answer.
pub struct FakeProvider {
    provider: Provider,
    signer: BodyHmac,
    next_ref: AtomicUsize,
    /// When set, references are derived from the creation key before the call.
    derived_refs: AtomicBool,
    creates: Mutex<VecDeque<Result<ProviderPayment>>>,
    captures: Mutex<VecDeque<Result<ProviderEvent>>>,
    /// Status answers per provider reference.
    statuses: Mutex<HashMap<String, VecDeque<Result<ProviderEvent>>>>,
    refunds: Mutex<VecDeque<Result<RefundResult>>>,
    /// Every idempotency key sent, in call order.
    pub keys: Mutex<Vec<String>>,
    pub create_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            signer: BodyHmac::new(SIGNATURE_HEADER, WEBHOOK_SECRET),
            next_ref: AtomicUsize::new(1),
            derived_refs: AtomicBool::new(false),
            creates: Mutex::default(),
            captures: Mutex::default(),
            statuses: Mutex::default(),
            refunds: Mutex::default(),
            keys: Mutex::default(),
            create_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
        }
    }

    /// Picks references client-side, the way MobileMoney does.
    pub fn derive_references(&self) -> &Self {
        self.derived_refs.store(true, Ordering::SeqCst);
        self
    }

    pub fn script_create(&self, answer: Result<ProviderPayment>) {
        self.creates.lock().unwrap().push_back(answer);
    }

    pub fn script_capture(&self, answer: Result<ProviderEvent>) {
        self.captures.lock().unwrap().push_back(answer);
    }

    pub fn script_status(&self, provider_ref: &str, answer: Result<ProviderEvent>) {
        self.statuses
            .lock()
            .unwrap()
            .entry(provider_ref.to_string())
            .or_default()
            .push_back(answer);
    }

    pub fn script_refund(&self, answer: Result<RefundResult>) {
        self.refunds.lock().unwrap().push_back(answer);
    }

    pub fn sign(&self, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&self.signer.sign(body)).unwrap(),
        );
        headers
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    fn record(&self, key: &IdempotencyKey) {
        self.keys.lock().unwrap().push(key.as_str().to_string());
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn authenticate(&self) -> Result<AccessToken> {
        Ok(AccessToken::new("fake-token".to_string(), 3600, Utc::now()))
    }

    fn reference_for(&self, key: &IdempotencyKey) -> Option<String> {
        self.derived_refs
            .load(Ordering::SeqCst)
            .then(|| format!("{}-{}", self.provider.as_str().to_uppercase(), key.to_uuid()))
    }

    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<ProviderPayment> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.record(&request.idempotency_key);
        if let Some(answer) = self.creates.lock().unwrap().pop_front() {
            return answer;
        }
        let n = self.next_ref.fetch_add(1, Ordering::SeqCst);
        let provider_ref = self
            .reference_for(&request.idempotency_key)
            .unwrap_or_else(|| format!("{}-REF-{n}", self.provider.as_str().to_uppercase()));
        Ok(ProviderPayment {
            provider_ref,
            redirect_target: Some(format!("https://pay.example/approve/{n}")),
        })
    }

    async fn capture(&self, provider_ref: &str, key: &IdempotencyKey) -> Result<ProviderEvent> {
        self.record(key);
        if let Some(answer) = self.captures.lock().unwrap().pop_front() {
            return answer;
        }
        let status = match self.provider {
            Provider::CardWallet => "COMPLETED",
            Provider::MobileMoney => "SUCCESSFUL",
        };
        Ok(event(self.provider, provider_ref, status))
    }

    async fn get_status(&self, provider_ref: &str) -> Result<ProviderEvent> {
        let scripted = self
            .statuses
            .lock()
            .unwrap()
            .get_mut(provider_ref)
            .and_then(|answers| answers.pop_front());
        if let Some(answer) = scripted {
            return answer;
        }
        Ok(event(self.provider, provider_ref, "PENDING"))
    }

    async fn refund(
        &self,
        provider_ref: &str,
        _amount: Amount,
        _currency: &Currency,
        key: &IdempotencyKey,
    ) -> Result<RefundResult> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.record(key);
        if let Some(answer) = self.refunds.lock().unwrap().pop_front() {
            return answer;
        }
        Ok(RefundResult::Completed {
            refund_ref: format!("RF-{provider_ref}"),
        })
    }

    fn verify_webhook_signature(&self, body: &[u8], headers: &HeaderMap) -> bool {
        self.signer.verify(body, headers)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(OrderId, OrderOutcome)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, order_id: OrderId, outcome: OrderOutcome) -> Result<()> {
        self.sent.lock().unwrap().push((order_id, outcome));
        Ok(())
    }
}

pub struct Harness {
    pub service: Arc<ReconciliationService>,
    pub provider: Arc<FakeProvider>,
    pub store: InMemoryStore,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new(provider: Provider) -> Self {
        let store = InMemoryStore::new();
        let fake = Arc::new(FakeProvider::new(provider));
        let notifier = Arc::new(RecordingNotifier::default());
        let service = ReconciliationService::new(
            PaymentLedger::new(Arc::new(store.clone())),
            OrderStateMachine::new(Arc::new(store.clone()), notifier.clone()),
            ProviderRegistry::new().with(fake.clone()),
            fast_retry(),
            "https://shop.example",
        );
        Self {
            service: Arc::new(service),
            provider: fake,
            store,
            notifier,
        }
    }

    pub fn provider_kind(&self) -> Provider {
        self.provider.provider()
    }

    pub async fn order(&self, minor_units: u64) -> Order {
        self.service
            .orders()
            .place(Amount::new(minor_units).unwrap(), Currency::new("USD").unwrap())
            .await
            .unwrap()
    }

    /// Places an order and registers a payment with the provider.
    pub async fn checkout(&self, minor_units: u64) -> (Order, Payment) {
        let order = self.order(minor_units).await;
        let session = self
            .service
            .create_payment(order.id, self.provider_kind(), urls())
            .await
            .unwrap();
        (order, session.payment)
    }

    /// Delivers a correctly signed webhook.
    pub async fn deliver(&self, provider_ref: &str, status: &str) -> Outcome {
        let body = event_body(self.provider_kind(), provider_ref, status);
        let headers = self.provider.sign(&body);
        self.service
            .apply_outcome(Source::Webhook, self.provider_kind(), &body, &headers)
            .await
            .unwrap()
    }

    pub async fn order_state(&self, order: &Order) -> Order {
        self.service.orders().get(order.id).await.unwrap()
    }

    pub async fn payment_state(&self, payment: &Payment) -> Payment {
        self.service.ledger().get(payment.id).await.unwrap()
    }
}

pub fn urls() -> ReturnUrls {
    ReturnUrls {
        return_url: Some("https://shop.example/return".to_string()),
        cancel_url: Some("https://shop.example/cancel".to_string()),
        payer: Some("256700000001".to_string()),
    }
}
