//! Transport plumbing shared by the provider clients: request building,
//! error mapping and JSON decoding.

use super::token::TokenCache;
use crate::domain::provider::{AccessToken, Provider};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_REASON_CHARS: usize = 200;

pub(crate) fn client(provider: Provider, timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PaymentError::Config(format!("{provider} HTTP client: {e}")))
}

/// Joins `base` and `path` without doubling the slash.
pub(crate) fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Provider references are spliced into URL paths, so they must stay a
/// single plain segment.
pub(crate) fn path_segment(provider_ref: &str) -> Result<&str> {
    let valid = !provider_ref.is_empty()
        && provider_ref
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(provider_ref)
    } else {
        Err(PaymentError::Validation(format!(
            "Invalid provider reference: {provider_ref:?}"
        )))
    }
}

/// A timeout leaves the outcome unknown; anything else that kept the request
/// from completing is a plain outage.
pub(crate) fn transport_error(provider: Provider, err: reqwest::Error) -> PaymentError {
    if err.is_timeout() {
        PaymentError::ProviderTimeout { provider }
    } else {
        PaymentError::ProviderUnavailable {
            provider,
            reason: err.to_string(),
        }
    }
}

pub(crate) async fn send(provider: Provider, request: RequestBuilder) -> Result<Response> {
    request
        .send()
        .await
        .map_err(|e| transport_error(provider, e))
}

fn reason(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            ["message", "error_description", "reason", "name", "code"]
                .iter()
                .find_map(|key| json.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.chars().take(MAX_REASON_CHARS).collect());
    format!("HTTP {status} - {detail}")
}

/// Decodes a successful response (an empty body reads as `null`) or maps the
/// status: 401 drops the cached token and 429/5xx are transient; other 4xx
/// answers are rejections.
///
/// `tokens` must be `None` while the token slot itself is held.
pub(crate) async fn json_or_error(
    provider: Provider,
    tokens: Option<&TokenCache>,
    response: Response,
) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(provider, e))?;

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&body).map_err(|e| PaymentError::ProviderUnavailable {
            provider,
            reason: format!("undecodable response: {e}"),
        });
    }

    let reason = reason(status, &body);
    if status == StatusCode::UNAUTHORIZED
        && let Some(tokens) = tokens
    {
        tokens.invalidate().await;
        warn!(%provider, "Access token refused, cache cleared");
        return Err(PaymentError::ProviderUnavailable { provider, reason });
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        warn!(%provider, %status, "Provider returned retryable status");
        return Err(PaymentError::ProviderUnavailable { provider, reason });
    }
    debug!(%provider, %status, "Provider rejected request");
    Err(PaymentError::ProviderRejected { provider, reason })
}

/// On the refund path a 4xx means the payment is not refundable as asked.
pub(crate) fn refund_refused(err: PaymentError) -> PaymentError {
    match err {
        PaymentError::ProviderRejected { provider, reason } => {
            PaymentError::RefundNotAllowed { provider, reason }
        }
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Client-credentials token fetch shared by both providers.
pub(crate) async fn fetch_token(
    provider: Provider,
    http: &Client,
    url: String,
    client_id: &str,
    client_secret: &str,
) -> Result<AccessToken> {
    let request = http
        .post(url)
        .basic_auth(client_id, Some(client_secret))
        .header(
            reqwest::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body("grant_type=client_credentials");
    let response = send(provider, request).await?;
    let json = json_or_error(provider, None, response).await?;
    let token: TokenResponse =
        serde_json::from_value(json).map_err(|e| PaymentError::ProviderUnavailable {
            provider,
            reason: format!("undecodable token response: {e}"),
        })?;
    Ok(AccessToken::new(token.access_token, token.expires_in, Utc::now()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() {
        assert_eq!(endpoint("https://p.example/", "/v1/x"), "https://p.example/v1/x");
        assert_eq!(endpoint("https://p.example", "v1/x"), "https://p.example/v1/x");
    }

    #[test]
    fn test_path_segment_rejects_separators() {
        assert!(path_segment("CW-12_a.b").is_ok());
        assert!(path_segment("").is_err());
        assert!(path_segment("../admin").is_err());
        assert!(path_segment("a?b=c").is_err());
    }

    #[test]
    fn test_reason_prefers_structured_message() {
        let r = reason(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"name":"UNPROCESSABLE_ENTITY","message":"Capture already refunded"}"#,
        );
        assert!(r.contains("Capture already refunded"));

        let long = "x".repeat(500);
        assert!(reason(StatusCode::BAD_REQUEST, &long).len() < 250);
    }
}
