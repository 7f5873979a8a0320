//! Client for the card/wallet checkout gateway.
//!
//! Checkout is redirect based: creation returns an approval link, the payer
//! approves on the gateway, and the capture call or the webhook settles it.

use super::http::{self, endpoint, path_segment};
use super::signature::{SignatureScheme, TimestampedHmac};
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
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

pub const SIGNATURE_HEADER: &str = "cardwallet-signature";
/// The gateway deduplicates mutating calls carrying the same value.
pub const REQUEST_ID_HEADER: &str = "cardwallet-request-id";

const PROVIDER: Provider = Provider::CardWallet;

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct CreatedCheckout {
    id: String,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: String,
}

pub struct CardWalletClient {
    http: Client,
    config: ProviderConfig,
    tokens: TokenCache,
    signatures: TimestampedHmac,
}

impl CardWalletClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(PaymentError::Config(
                "card wallet base URL not configured".to_string(),
            ));
        }
        Ok(Self {
            http: http::client(PROVIDER, config.timeout)?,
            tokens: TokenCache::new(PROVIDER, config.token_refresh_margin),
            signatures: TimestampedHmac::new(
                SIGNATURE_HEADER,
                config.webhook_secret.as_bytes(),
                config.webhook_tolerance,
            ),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        endpoint(&self.config.base_url, path)
    }

    async fn bearer(&self) -> Result<String> {
        Ok(self.authenticate().await?.value)
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = http::send(PROVIDER, request).await?;
        http::json_or_error(PROVIDER, Some(&self.tokens), response).await
    }

    fn event(json: Value) -> Result<ProviderEvent> {
        ProviderEvent::from_value(PROVIDER, json).map_err(|e| PaymentError::ProviderUnavailable {
            provider: PROVIDER,
            reason: format!("unexpected response: {e}"),
        })
    }
}

#[async_trait]
impl PaymentProvider for CardWalletClient {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn authenticate(&self) -> Result<AccessToken> {
        self.tokens
            .get_or_refresh(|| {
                http::fetch_token(
                    PROVIDER,
                    &self.http,
                    self.url("/v1/oauth2/token"),
                    &self.config.client_id,
                    &self.config.client_secret,
                )
            })
            .await
    }

    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<ProviderPayment> {
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_ref,
                "amount": {
                    "currency_code": request.currency.code(),
                    "value": request.amount.to_major(&request.currency).to_string(),
                },
            }],
            "application_context": {
                "return_url": request.urls.return_url,
                "cancel_url": request.urls.cancel_url,
            },
            "notification_url": request.callback_url,
        });
        let call = self
            .http
            .post(self.url("/v2/checkout/orders"))
            .bearer_auth(self.bearer().await?)
            .header(REQUEST_ID_HEADER, request.idempotency_key.as_str())
            .json(&body);
        let json = self.call(call).await?;

        let created: CreatedCheckout =
            serde_json::from_value(json).map_err(|e| PaymentError::ProviderUnavailable {
                provider: PROVIDER,
                reason: format!("unexpected create response: {e}"),
            })?;
        let redirect_target = created
            .links
            .into_iter()
            .find(|link| link.rel == "approve" || link.rel == "payer-action")
            .map(|link| link.href);
        info!(provider_ref = %created.id, key = %request.idempotency_key, "Checkout created");
        Ok(ProviderPayment {
            provider_ref: created.id,
            redirect_target,
        })
    }

    async fn capture(&self, provider_ref: &str, key: &IdempotencyKey) -> Result<ProviderEvent> {
        let path = format!("/v2/checkout/orders/{}/capture", path_segment(provider_ref)?);
        let call = self
            .http
            .post(self.url(&path))
            .bearer_auth(self.bearer().await?)
            .header(REQUEST_ID_HEADER, key.as_str())
            .json(&json!({}));
        Self::event(self.call(call).await?)
    }

    async fn get_status(&self, provider_ref: &str) -> Result<ProviderEvent> {
        let path = format!("/v2/checkout/orders/{}", path_segment(provider_ref)?);
        let call = self
            .http
            .get(self.url(&path))
            .bearer_auth(self.bearer().await?);
        Self::event(self.call(call).await?)
    }

    async fn refund(
        &self,
        provider_ref: &str,
        amount: Amount,
        currency: &Currency,
        key: &IdempotencyKey,
    ) -> Result<RefundResult> {
        let path = format!("/v2/checkout/orders/{}/refund", path_segment(provider_ref)?);
        let call = self
            .http
            .post(self.url(&path))
            .bearer_auth(self.bearer().await?)
            .header(REQUEST_ID_HEADER, key.as_str())
            .json(&json!({
                "amount": {
                    "currency_code": currency.code(),
                    "value": amount.to_major(currency).to_string(),
                }
            }));
        let json = self.call(call).await.map_err(http::refund_refused)?;

        let refund: RefundResponse =
            serde_json::from_value(json).map_err(|e| PaymentError::ProviderUnavailable {
                provider: PROVIDER,
                reason: format!("unexpected refund response: {e}"),
            })?;
        debug!(%provider_ref, refund_ref = %refund.id, status = %refund.status, "Refund answered");
        match refund.status.as_str() {
            "COMPLETED" => Ok(RefundResult::Completed {
                refund_ref: refund.id,
            }),
            "PENDING" => Ok(RefundResult::Pending {
                refund_ref: refund.id,
            }),
            other => Err(PaymentError::RefundNotAllowed {
                provider: PROVIDER,
                reason: format!("refund {} ended as {other}", refund.id),
            }),
        }
    }

    fn verify_webhook_signature(&self, body: &[u8], headers: &HeaderMap) -> bool {
        self.signatures.verify(body, headers)
    }
}
