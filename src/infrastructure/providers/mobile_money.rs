//! Client for the push-style mobile money collection API.
//!
//! There is no redirect: the payer approves on the handset and the outcome
//! arrives as a callback. We choose the reference id ourselves (the UUID of
//! the idempotency key), so a resent request lands on the same transaction
//! and the provider answers 409 instead of charging twice.

use super::http::{self, endpoint, path_segment};
use super::signature::{BodyHmac, SignatureScheme};
use super::token::TokenCache;
use crate::config::ProviderConfig;
use crate::domain::event::ProviderEvent;
use crate::domain::money::{Amount, Currency};
use crate::domain::ports::PaymentProvider;
use crate::domain::provider::{
    AccessToken, CreatePaymentRequest, IdempotencyKey, Provider, ProviderPayment, RefundResult,
};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info};

pub const SIGNATURE_HEADER: &str = "x-callback-signature";
pub const REFERENCE_HEADER: &str = "x-reference-id";
pub const CALLBACK_HEADER: &str = "x-callback-url";

const PROVIDER: Provider = Provider::MobileMoney;

pub struct MobileMoneyClient {
    http: Client,
    config: ProviderConfig,
    tokens: TokenCache,
    signatures: BodyHmac,
}

impl MobileMoneyClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(PaymentError::Config(
                "mobile money base URL not configured".to_string(),
            ));
        }
        Ok(Self {
            http: http::client(PROVIDER, config.timeout)?,
            tokens: TokenCache::new(PROVIDER, config.token_refresh_margin),
            signatures: BodyHmac::new(SIGNATURE_HEADER, config.webhook_secret.as_bytes()),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        endpoint(&self.config.base_url, path)
    }

    /// Sends a request keyed by a client-chosen reference id. `202` and `409`
    /// (reference already used) both mean the provider holds the request.
    async fn submit(&self, request: RequestBuilder) -> Result<()> {
        let response = http::send(PROVIDER, request).await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Reference id already known to provider; treating as accepted");
            return Ok(());
        }
        http::json_or_error(PROVIDER, Some(&self.tokens), response).await?;
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for MobileMoneyClient {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn authenticate(&self) -> Result<AccessToken> {
        self.tokens
            .get_or_refresh(|| {
                http::fetch_token(
                    PROVIDER,
                    &self.http,
                    self.url("/collection/token/"),
                    &self.config.client_id,
                    &self.config.client_secret,
                )
            })
            .await
    }

    fn reference_for(&self, key: &IdempotencyKey) -> Option<String> {
        Some(key.to_uuid().to_string())
    }

    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<ProviderPayment> {
        let Some(payer) = request.urls.payer.as_deref() else {
            return Err(PaymentError::Validation(
                "mobile money payments need a payer account".to_string(),
            ));
        };
        let reference = request.idempotency_key.to_uuid().to_string();
        let call = self
            .http
            .post(self.url("/collection/v1_0/requesttopay"))
            .bearer_auth(self.authenticate().await?.value)
            .header(REFERENCE_HEADER, &reference)
            .header(CALLBACK_HEADER, &request.callback_url)
            .json(&json!({
                "amount": request.amount.to_major(&request.currency).to_string(),
                "currency": request.currency.code(),
                "externalId": request.order_ref,
                "payer": { "partyIdType": "MSISDN", "partyId": payer },
                "payerMessage": format!("Order payment {}", request.order_ref),
                "payeeNote": request.order_ref,
            }));
        self.submit(call).await?;

        info!(provider_ref = %reference, key = %request.idempotency_key, "Collection requested");
        Ok(ProviderPayment {
            provider_ref: reference,
            redirect_target: None,
        })
    }

    /// Collections settle on the payer's approval; capturing means reading
    /// the current state.
    async fn capture(&self, provider_ref: &str, _key: &IdempotencyKey) -> Result<ProviderEvent> {
        self.get_status(provider_ref).await
    }

    async fn get_status(&self, provider_ref: &str) -> Result<ProviderEvent> {
        let path = format!("/collection/v1_0/requesttopay/{}", path_segment(provider_ref)?);
        let call = self
            .http
            .get(self.url(&path))
            .bearer_auth(self.authenticate().await?.value);
        let response = http::send(PROVIDER, call).await?;
        let mut json = http::json_or_error(PROVIDER, Some(&self.tokens), response).await?;

        // Status documents omit the reference they were fetched by.
        if let Value::Object(map) = &mut json {
            map.entry("referenceId")
                .or_insert_with(|| Value::String(provider_ref.to_string()));
        }
        ProviderEvent::from_value(PROVIDER, json).map_err(|e| PaymentError::ProviderUnavailable {
            provider: PROVIDER,
            reason: format!("unexpected status response: {e}"),
        })
    }

    async fn refund(
        &self,
        provider_ref: &str,
        amount: Amount,
        currency: &Currency,
        key: &IdempotencyKey,
    ) -> Result<RefundResult> {
        let reference = key.to_uuid().to_string();
        let call = self
            .http
            .post(self.url("/disbursement/v2_0/refund"))
            .bearer_auth(self.authenticate().await?.value)
            .header(REFERENCE_HEADER, &reference)
            .json(&json!({
                "amount": amount.to_major(currency).to_string(),
                "currency": currency.code(),
                "externalId": key.as_str(),
                "referenceIdToRefund": path_segment(provider_ref)?,
            }));
        self.submit(call).await.map_err(http::refund_refused)?;

        debug!(%provider_ref, refund_ref = %reference, "Refund accepted for processing");
        Ok(RefundResult::Pending {
            refund_ref: reference,
        })
    }

    fn verify_webhook_signature(&self, body: &[u8], headers: &HeaderMap) -> bool {
        self.signatures.verify(body, headers)
    }
}
