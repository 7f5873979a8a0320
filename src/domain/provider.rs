use super::money::{Amount, Currency};
use super::order::OrderId;
use crate::error::PaymentError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The external payment processors this core reconciles against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    CardWallet,
    MobileMoney,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::CardWallet, Provider::MobileMoney];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::CardWallet => "card_wallet",
            Provider::MobileMoney => "mobile_money",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card_wallet" => Ok(Provider::CardWallet),
            "mobile_money" => Ok(Provider::MobileMoney),
            other => Err(PaymentError::Validation(format!(
                "Unknown provider: {other:?}"
            ))),
        }
    }
}

/// Outbound operations that mutate provider-side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Capture,
    Refund { sequence: u32 },
}

/// Key sent with every provider-mutating call so that a retry after a lost
/// response is deduplicated by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(order_id: &OrderId, attempt: u32, operation: Operation) -> Self {
        let key = match operation {
            Operation::Create => format!("{order_id}:{attempt}:create"),
            Operation::Capture => format!("{order_id}:{attempt}:capture"),
            Operation::Refund { sequence } => format!("{order_id}:{attempt}:refund:{sequence}"),
        };
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic UUID for providers that want a client-chosen reference id.
    pub fn to_uuid(&self) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, self.0.as_bytes())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the provider should send the customer and its notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnUrls {
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
    /// Payer account (MSISDN) for push-style mobile money collections.
    pub payer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatePaymentRequest {
    pub amount: Amount,
    pub currency: Currency,
    /// Our correlation reference (the payment id).
    pub order_ref: String,
    pub callback_url: String,
    pub urls: ReturnUrls,
    pub idempotency_key: IdempotencyKey,
}

/// A payment the provider accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPayment {
    pub provider_ref: String,
    /// Redirect/approval link, absent for push-style flows.
    pub redirect_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundResult {
    /// The provider settled the refund synchronously.
    Completed { refund_ref: String },
    /// Accepted; confirmation arrives later as an event.
    Pending { refund_ref: String },
}

/// Provider access token with its expiry tracked explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: String, expires_in_secs: i64, now: DateTime<Utc>) -> Self {
        Self {
            value,
            expires_at: now + Duration::seconds(expires_in_secs),
        }
    }

    /// A token is refreshed once less than `margin` remains before expiry.
    pub fn needs_refresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now < margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_is_stable_per_attempt() {
        let order = OrderId::new();
        let first = IdempotencyKey::derive(&order, 1, Operation::Create);
        let again = IdempotencyKey::derive(&order, 1, Operation::Create);
        let retry = IdempotencyKey::derive(&order, 2, Operation::Create);

        assert_eq!(first, again);
        assert_eq!(first.to_uuid(), again.to_uuid());
        assert_ne!(first, retry);
        assert_ne!(
            IdempotencyKey::derive(&order, 1, Operation::Refund { sequence: 0 }),
            IdempotencyKey::derive(&order, 1, Operation::Refund { sequence: 1 })
        );
    }

    #[test]
    fn test_token_refresh_margin() {
        let now = Utc::now();
        let token = AccessToken::new("t".to_string(), 3600, now);
        assert!(!token.needs_refresh(Duration::minutes(30), now));
        assert!(token.needs_refresh(Duration::minutes(30), now + Duration::minutes(31)));
    }

    #[test]
    fn test_provider_round_trips_through_str() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("paypal".parse::<Provider>().is_err());
    }
}
