//! The reconciliation orchestrator.
//!
//! Provider outcomes reach us three ways: signed webhooks, synchronous
//! capture responses and status polls. All of them funnel into one path that
//! looks the payment up by `(provider, provider_ref)`, maps the provider
//! status through a fixed table, moves the payment with a compare-and-set and
//! then lets the order follow. Every step is idempotent, so at-least-once
//! delivery converges on the same state.

use super::ledger::{PaymentLedger, TransitionOutcome};
use super::order_state_machine::OrderStateMachine;
use super::retry::with_retry;
use crate::config::RetryConfig;
use crate::domain::event::{ProviderEvent, ProviderStatus};
use crate::domain::money::Amount;
use crate::domain::order::{Effect, Order, OrderId, OrderStatus};
use crate::domain::outcome::{IgnoreReason, Outcome, RejectReason, Source, Stage};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::ports::ProviderRef;
use crate::domain::provider::{CreatePaymentRequest, Operation, Provider, RefundResult, ReturnUrls};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};

/// Re-reads after losing a compare-and-set race before giving up.
const MAX_CAS_ATTEMPTS: usize = 3;

/// The provider clients available to this service.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<Provider, ProviderRef>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, client: ProviderRef) -> Self {
        self.providers.insert(client.provider(), client);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<&ProviderRef> {
        self.providers
            .get(&provider)
            .ok_or(PaymentError::ProviderNotConfigured(provider))
    }

    pub fn configured(&self) -> impl Iterator<Item = Provider> + '_ {
        self.providers.keys().copied()
    }
}

/// What checkout hands back to the customer.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub payment: Payment,
    pub redirect_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefundOutcome {
    /// The provider confirmed and the order is now refunded.
    Refunded {
        order: Order,
        payment: Payment,
        refund_ref: String,
    },
    /// Booked, but the payment still has a refundable balance.
    PartiallyRefunded { payment: Payment, refund_ref: String },
    /// Accepted by the provider; confirmation arrives as an event.
    Pending { payment: Payment, refund_ref: String },
}

/// Tally of one sweep over stale pending payments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub applied: usize,
    pub ignored: usize,
    pub rejected: usize,
    pub errors: usize,
    /// Pending payments whose creation outcome is still unknown.
    pub unreferenced: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Applied { .. } => self.applied += 1,
            Outcome::Ignored(_) => self.ignored += 1,
            Outcome::Rejected(_) => self.rejected += 1,
        }
    }
}

fn reconcile_span(provider: Provider, source: Source) -> Span {
    info_span!(
        "reconcile",
        %provider,
        %source,
        provider_ref = field::Empty,
        stage = Stage::AwaitingProvider.as_str()
    )
}

fn enter(stage: Stage) {
    Span::current().record("stage", stage.as_str());
}

fn finish(outcome: Outcome) -> Outcome {
    enter(Stage::Done);
    debug!(outcome = outcome.label(), "Reconciliation finished");
    outcome
}

/// Diagnostic only: the ledger amount stays authoritative.
fn check_reported_amount(payment: &Payment, event: &ProviderEvent) {
    let Some((value, currency)) = event.reported_amount() else {
        return;
    };
    let same = currency.eq_ignore_ascii_case(payment.currency.code())
        && Amount::from_major(value, &payment.currency).is_ok_and(|a| a == payment.amount);
    if !same {
        warn!(
            payment_id = %payment.id,
            expected = %payment.amount,
            reported = %value,
            currency,
            "Provider reported a different amount"
        );
    }
}

pub struct ReconciliationService {
    ledger: PaymentLedger,
    orders: OrderStateMachine,
    providers: ProviderRegistry,
    retry: RetryConfig,
    /// Public base URL; provider callbacks go to `{base}/webhooks/{provider}`.
    callback_base: String,
}

impl ReconciliationService {
    pub fn new(
        ledger: PaymentLedger,
        orders: OrderStateMachine,
        providers: ProviderRegistry,
        retry: RetryConfig,
        callback_base: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            orders,
            providers,
            retry,
            callback_base: callback_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    pub fn orders(&self) -> &OrderStateMachine {
        &self.orders
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn callback_url(&self, provider: Provider) -> String {
        format!("{}/webhooks/{provider}", self.callback_base)
    }

    /// Opens (or resumes) a payment attempt and registers it with the provider.
    ///
    /// A rejection or an exhausted outage closes the attempt as failed and
    /// leaves the order pending for a new attempt. A timeout, on any attempt,
    /// leaves it pending; calling again re-sends the same idempotency key.
    /// References the client picks itself are attached before sending, so a
    /// late callback or a status poll can still settle a timed-out attempt.
    pub async fn create_payment(
        &self,
        order_id: OrderId,
        provider: Provider,
        urls: ReturnUrls,
    ) -> Result<CheckoutSession> {
        let client = self.providers.get(provider)?.as_ref();
        let order = self.orders.get(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(PaymentError::IllegalTransition {
                entity: "order",
                from: order.status.to_string(),
                to: OrderStatus::Paid.to_string(),
            });
        }

        let payment = match self
            .ledger
            .open(order.id, provider, order.amount, order.currency.clone())
            .await
        {
            Ok(payment) => payment,
            Err(PaymentError::ActivePaymentExists {
                order_id,
                payment_id,
            }) => {
                let active = self.ledger.get(payment_id).await?;
                // A client-chosen reference is attached before the provider
                // answers, so it does not prove the creation went through.
                let chosen = client.reference_for(&active.idempotency_key(Operation::Create));
                let unanswered = active.provider_ref.is_none() || active.provider_ref == chosen;
                if active.provider != provider
                    || !unanswered
                    || active.status != PaymentStatus::Pending
                {
                    return Err(PaymentError::ActivePaymentExists {
                        order_id,
                        payment_id,
                    });
                }
                info!(%payment_id, attempt = active.attempt, "Resuming payment with unknown creation outcome");
                active
            }
            Err(e) => return Err(e),
        };

        let idempotency_key = payment.idempotency_key(Operation::Create);
        let payment = match client.reference_for(&idempotency_key) {
            Some(reference) => self.ledger.attach_provider_ref(payment.id, &reference).await?,
            None => payment,
        };
        let request = CreatePaymentRequest {
            amount: payment.amount,
            currency: payment.currency.clone(),
            order_ref: payment.id.to_string(),
            callback_url: self.callback_url(provider),
            urls,
            idempotency_key,
        };
        let req = &request;
        match with_retry(&self.retry, "create_payment", move || client.create_payment(req)).await {
            Ok(accepted) => {
                let payment = self
                    .ledger
                    .attach_provider_ref(payment.id, &accepted.provider_ref)
                    .await?;
                Ok(CheckoutSession {
                    payment,
                    redirect_target: accepted.redirect_target,
                })
            }
            Err(e @ PaymentError::ProviderTimeout { .. }) => {
                warn!(payment_id = %payment.id, "Creation outcome unknown; payment stays pending");
                Err(e)
            }
            Err(
                e @ (PaymentError::ProviderRejected { .. }
                | PaymentError::ProviderUnavailable { .. }
                | PaymentError::Validation(_)),
            ) => {
                warn!(payment_id = %payment.id, error = %e, "Payment creation failed; attempt closed");
                self.ledger
                    .transition(
                        payment.id,
                        PaymentStatus::Pending,
                        PaymentStatus::Failed,
                        Some(json!({ "error": e.to_string() })),
                    )
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Classifies one inbound provider outcome. Webhooks are verified before
    /// anything is parsed or read.
    pub async fn apply_outcome(
        &self,
        source: Source,
        provider: Provider,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<Outcome> {
        self.verify_and_apply(source, provider, body, headers)
            .instrument(reconcile_span(provider, source))
            .await
    }

    async fn verify_and_apply(
        &self,
        source: Source,
        provider: Provider,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<Outcome> {
        enter(Stage::Verifying);
        let client = self.providers.get(provider)?;
        if source == Source::Webhook && !client.verify_webhook_signature(body, headers) {
            warn!("Webhook signature rejected");
            return Ok(finish(Outcome::Rejected(RejectReason::BadSignature)));
        }
        let event = match client.parse_event(body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Malformed provider event");
                return Ok(finish(Outcome::Rejected(RejectReason::MalformedEvent {
                    detail: e.to_string(),
                })));
            }
        };
        self.apply_event(event).await
    }

    /// Captures an approved payment and applies the provider's answer.
    ///
    /// Timeouts and exhausted outages leave the payment pending and surface
    /// a retryable error; the webhook or a status poll settles it later.
    pub async fn capture(&self, provider: Provider, provider_ref: &str) -> Result<Outcome> {
        self.capture_and_apply(provider, provider_ref)
            .instrument(reconcile_span(provider, Source::SynchronousCapture))
            .await
    }

    async fn capture_and_apply(&self, provider: Provider, provider_ref: &str) -> Result<Outcome> {
        Span::current().record("provider_ref", provider_ref);
        let client = self.providers.get(provider)?.as_ref();
        let Some(payment) = self.ledger.find_by_provider_ref(provider, provider_ref).await? else {
            warn!("Capture requested for unknown provider reference");
            return Ok(finish(Outcome::Rejected(RejectReason::UnknownProviderRef {
                provider,
                provider_ref: provider_ref.to_string(),
            })));
        };

        let key = payment.idempotency_key(Operation::Capture);
        let key = &key;
        let event =
            match with_retry(&self.retry, "capture", move || client.capture(provider_ref, key)).await {
                Ok(event) => event,
                Err(e) => {
                    if e.is_retryable() {
                        warn!(payment_id = %payment.id, error = %e, "Capture outcome unknown; payment left pending");
                    } else {
                        warn!(payment_id = %payment.id, error = %e, "Capture refused by provider");
                    }
                    return Err(e);
                }
            };

        enter(Stage::Verifying);
        if event.provider_ref() != provider_ref {
            warn!(answered = event.provider_ref(), "Capture answer names another reference");
            return Ok(finish(Outcome::Rejected(RejectReason::MalformedEvent {
                detail: format!("capture of {provider_ref} answered for {}", event.provider_ref()),
            })));
        }
        self.apply_event(event).await
    }

    /// Resolves one payment through the provider's status endpoint.
    pub async fn poll_status(&self, provider: Provider, provider_ref: &str) -> Result<Outcome> {
        self.poll_and_apply(provider, provider_ref)
            .instrument(reconcile_span(provider, Source::StatusPoll))
            .await
    }

    async fn poll_and_apply(&self, provider: Provider, provider_ref: &str) -> Result<Outcome> {
        Span::current().record("provider_ref", provider_ref);
        let client = self.providers.get(provider)?.as_ref();
        let event =
            with_retry(&self.retry, "get_status", move || client.get_status(provider_ref)).await?;
        enter(Stage::Verifying);
        self.apply_event(event).await
    }

    /// Polls every pending payment older than `min_age` that has a provider
    /// reference. One failing payment does not stop the sweep.
    pub async fn reconcile_pending(&self, min_age: chrono::Duration) -> Result<SweepReport> {
        let cutoff = Utc::now() - min_age;
        let mut report = SweepReport::default();

        for payment in self.ledger.pending_since(cutoff).await? {
            report.examined += 1;
            let Some(provider_ref) = payment.provider_ref.as_deref() else {
                report.unreferenced += 1;
                continue;
            };
            match self.poll_status(payment.provider, provider_ref).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    warn!(payment_id = %payment.id, error = %e, "Status poll failed");
                    report.errors += 1;
                }
            }
        }

        info!(?report, "Pending sweep finished");
        Ok(report)
    }

    /// Refunds a paid order, in full unless `amount` is given.
    ///
    /// The refund sequence is reserved on the payment before the provider is
    /// called, so a retry after an unknown outcome reuses the idempotency key
    /// and a confirmed refund is booked once. When every refund is already
    /// booked but the status edges were not applied, the call only finishes
    /// them.
    pub async fn refund_order(&self, order_id: OrderId, amount: Option<Amount>) -> Result<RefundOutcome> {
        let (_, payment_id) = self.orders.refundable(order_id).await?;
        let payment = self.ledger.get(payment_id).await?;
        if payment.awaits_refunded_status() || payment.status == PaymentStatus::Refunded {
            info!(%payment_id, "Refund already booked; finishing status transitions");
            let refund_ref = payment.refund_ref.clone().unwrap_or_default();
            return self.finish_refund(payment, refund_ref).await;
        }
        let Some(provider_ref) = payment.provider_ref.clone() else {
            return Err(PaymentError::Validation(format!(
                "Payment {payment_id} has no provider reference"
            )));
        };
        let amount = match (amount, payment.pending_refund) {
            (Some(amount), _) => amount,
            (None, Some(pending)) => pending.amount,
            (None, None) => Amount::new(payment.refundable())?,
        };

        let (payment, pending) = self.ledger.begin_refund(payment.id, amount).await?;
        let client = self.providers.get(payment.provider)?.as_ref();
        let key = payment.idempotency_key(Operation::Refund {
            sequence: pending.sequence,
        });
        let (key, currency, provider_ref) = (&key, &payment.currency, provider_ref.as_str());
        let result = match with_retry(&self.retry, "refund", move || {
            client.refund(provider_ref, amount, currency, key)
        })
        .await
        {
            Ok(result) => result,
            Err(e) if !e.is_retryable() => {
                warn!(%payment_id, error = %e, "Refund refused");
                self.ledger.abandon_refund(payment_id, pending.sequence).await?;
                return Err(e);
            }
            Err(e) => {
                warn!(%payment_id, error = %e, "Refund outcome unknown; retry resumes with the same key");
                return Err(e);
            }
        };

        match result {
            RefundResult::Pending { refund_ref } => {
                info!(%payment_id, %refund_ref, "Refund pending provider confirmation");
                Ok(RefundOutcome::Pending { payment, refund_ref })
            }
            RefundResult::Completed { refund_ref } => {
                let (payment, _) = self
                    .ledger
                    .settle_refund(payment_id, pending.sequence, &refund_ref)
                    .await?;
                if payment.refundable() == 0 {
                    self.finish_refund(payment, refund_ref).await
                } else {
                    Ok(RefundOutcome::PartiallyRefunded { payment, refund_ref })
                }
            }
        }
    }

    async fn finish_refund(&self, payment: Payment, refund_ref: String) -> Result<RefundOutcome> {
        let payment = self
            .ledger
            .transition(payment.id, PaymentStatus::Completed, PaymentStatus::Refunded, None)
            .await?
            .into_payment();
        let (order, _) = self.orders.complete_refund(payment.order_id, payment.id).await?;
        Ok(RefundOutcome::Refunded {
            order,
            payment,
            refund_ref,
        })
    }

    async fn apply_event(&self, event: ProviderEvent) -> Result<Outcome> {
        let provider = event.provider();
        let provider_ref = event.provider_ref().to_string();
        Span::current().record("provider_ref", provider_ref.as_str());

        let Some(payment) = self.ledger.find_by_provider_ref(provider, &provider_ref).await? else {
            warn!("Event for unknown provider reference");
            return Ok(finish(Outcome::Rejected(RejectReason::UnknownProviderRef {
                provider,
                provider_ref,
            })));
        };

        let status = event.status();
        let Some(target) = status.target() else {
            let provider_status = event.raw_status().to_string();
            let reason = if status == ProviderStatus::InFlight {
                debug!(%provider_status, "Provider still processing");
                IgnoreReason::InFlight {
                    payment_id: payment.id,
                    provider_status,
                }
            } else {
                warn!(%provider_status, "Unmapped provider status ignored");
                IgnoreReason::UnmappedStatus { provider_status }
            };
            return Ok(finish(Outcome::Ignored(reason)));
        };
        if target == PaymentStatus::Completed {
            check_reported_amount(&payment, &event);
        }

        enter(Stage::Applying);
        let transition = match self.transition_to(payment, target, event.payload()).await? {
            Ok(transition) => transition,
            Err(reason) => return Ok(finish(Outcome::Rejected(reason))),
        };
        let duplicate = matches!(transition, TransitionOutcome::AlreadyApplied(_));
        let payment = transition.into_payment();

        // Re-run on duplicates too: the order step is idempotent and this heals
        // a crash between the payment and order writes.
        let order_step = match target {
            PaymentStatus::Completed => self.orders.mark_paid(payment.order_id, payment.id).await,
            PaymentStatus::Failed => {
                self.orders
                    .cancel_after_failure(payment.order_id, payment.id)
                    .await
            }
            PaymentStatus::Refunded => {
                self.orders
                    .complete_refund(payment.order_id, payment.id)
                    .await
            }
            PaymentStatus::Pending => self
                .orders
                .get(payment.order_id)
                .await
                .map(|order| (order, Effect::Unchanged)),
        };

        let outcome = match order_step {
            Ok((_, Effect::Unchanged)) if duplicate => {
                debug!(payment_id = %payment.id, status = %target, "Duplicate delivery");
                Outcome::Ignored(IgnoreReason::Duplicate {
                    payment_id: payment.id,
                    status: target,
                })
            }
            Ok((order, _)) => {
                info!(
                    payment_id = %payment.id,
                    order_id = %order.id,
                    payment_status = %payment.status,
                    order_status = %order.status,
                    "Provider outcome applied"
                );
                Outcome::Applied { payment, order }
            }
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                error!(
                    payment_id = %payment.id,
                    order_id = %payment.order_id,
                    error = %e,
                    "Order cannot follow payment; manual reconciliation required"
                );
                Outcome::Rejected(RejectReason::OrderConflict {
                    payment_id: payment.id,
                    order_id: payment.order_id,
                    detail: e.to_string(),
                })
            }
        };
        Ok(finish(outcome))
    }

    /// Compare-and-set towards `target`, re-reading after a lost race. The
    /// inner `Err` is a terminal rejection for this event.
    async fn transition_to(
        &self,
        mut payment: Payment,
        target: PaymentStatus,
        payload: &Value,
    ) -> Result<std::result::Result<TransitionOutcome, RejectReason>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            if payment.status == target {
                return Ok(Ok(TransitionOutcome::AlreadyApplied(payment)));
            }
            if !payment.status.can_transition_to(target) {
                error!(
                    payment_id = %payment.id,
                    from = %payment.status,
                    to = %target,
                    "Illegal payment transition requested; manual reconciliation required"
                );
                return Ok(Err(RejectReason::IllegalTransition {
                    payment_id: payment.id,
                    from: payment.status,
                    to: target,
                }));
            }
            match self
                .ledger
                .transition(payment.id, payment.status, target, Some(payload.clone()))
                .await
            {
                Ok(transition) => return Ok(Ok(transition)),
                Err(PaymentError::StaleTransition { .. }) => {
                    debug!(payment_id = %payment.id, "Lost transition race, re-reading");
                    payment = self.ledger.get(payment.id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(PaymentError::StoreUnavailable(format!(
            "payment {} kept changing during reconciliation",
            payment.id
        )))
    }
}
