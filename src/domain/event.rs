//! Provider notifications parsed through a strict schema at the boundary.
//!
//! Each provider gets its own event type. Only the typed fields drive
//! reconciliation; the full JSON document is kept alongside as an opaque
//! diagnostic payload.

use super::payment::PaymentStatus;
use super::provider::Provider;
use crate::error::PaymentError;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

/// Provider status after the fixed per-provider mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Completed,
    Failed,
    Refunded,
    /// Still being processed on the provider side.
    InFlight,
    /// Not present in the table; never guessed.
    Unmapped,
}

impl ProviderStatus {
    /// Payment status this provider status drives, if any.
    pub fn target(self) -> Option<PaymentStatus> {
        match self {
            ProviderStatus::Completed => Some(PaymentStatus::Completed),
            ProviderStatus::Failed => Some(PaymentStatus::Failed),
            ProviderStatus::Refunded => Some(PaymentStatus::Refunded),
            ProviderStatus::InFlight | ProviderStatus::Unmapped => None,
        }
    }
}

fn card_wallet_status(raw: &str) -> ProviderStatus {
    match raw {
        "COMPLETED" => ProviderStatus::Completed,
        "DENIED" | "DECLINED" | "FAILED" | "VOIDED" => ProviderStatus::Failed,
        "REFUNDED" => ProviderStatus::Refunded,
        "CREATED" | "SAVED" | "APPROVED" | "PAYER_ACTION_REQUIRED" | "PENDING" => {
            ProviderStatus::InFlight
        }
        _ => ProviderStatus::Unmapped,
    }
}

fn mobile_money_status(raw: &str) -> ProviderStatus {
    match raw {
        "SUCCESSFUL" => ProviderStatus::Completed,
        "FAILED" | "REJECTED" | "TIMEOUT" | "EXPIRED" => ProviderStatus::Failed,
        "REFUNDED" => ProviderStatus::Refunded,
        "PENDING" => ProviderStatus::InFlight,
        _ => ProviderStatus::Unmapped,
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WireMoney {
    value: Decimal,
    currency_code: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CardWalletResource {
    id: String,
    status: String,
    amount: Option<WireMoney>,
}

#[derive(Debug, Clone, Deserialize)]
struct CardWalletEnvelope {
    id: Option<String>,
    event_type: Option<String>,
    resource: CardWalletResource,
}

/// Card/wallet gateway notification or capture/status response.
#[derive(Debug, Clone)]
pub struct CardWalletEvent {
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub resource_id: String,
    pub status: String,
    pub amount: Option<(Decimal, String)>,
    pub raw: Value,
}

impl CardWalletEvent {
    /// Accepts either a webhook envelope or a bare resource document.
    fn from_value(raw: Value) -> Result<Self, serde_json::Error> {
        let (event_id, event_type, resource) = if raw.get("resource").is_some() {
            let envelope: CardWalletEnvelope = serde_json::from_value(raw.clone())?;
            (envelope.id, envelope.event_type, envelope.resource)
        } else {
            let resource: CardWalletResource = serde_json::from_value(raw.clone())?;
            (None, None, resource)
        };
        Ok(Self {
            event_id,
            event_type,
            resource_id: resource.id,
            status: resource.status,
            amount: resource.amount.map(|m| (m.value, m.currency_code)),
            raw,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MobileMoneyWire {
    reference_id: String,
    status: String,
    financial_transaction_id: Option<String>,
    amount: Option<Decimal>,
    currency: Option<String>,
}

/// Mobile-money collection callback or status response.
#[derive(Debug, Clone)]
pub struct MobileMoneyEvent {
    pub reference_id: String,
    pub status: String,
    pub financial_transaction_id: Option<String>,
    pub amount: Option<(Decimal, String)>,
    pub raw: Value,
}

impl MobileMoneyEvent {
    fn from_value(raw: Value) -> Result<Self, serde_json::Error> {
        let wire: MobileMoneyWire = serde_json::from_value(raw.clone())?;
        let amount = match (wire.amount, wire.currency) {
            (Some(value), Some(currency)) => Some((value, currency)),
            _ => None,
        };
        Ok(Self {
            reference_id: wire.reference_id,
            status: wire.status,
            financial_transaction_id: wire.financial_transaction_id,
            amount,
            raw,
        })
    }
}

#[derive(Debug, Clone)]
pub enum ProviderEvent {
    CardWallet(CardWalletEvent),
    MobileMoney(MobileMoneyEvent),
}

impl ProviderEvent {
    /// Parses a raw body for the given provider. Malformed input is a
    /// validation error and never reaches the ledger.
    pub fn parse(provider: Provider, body: &[u8]) -> Result<Self, PaymentError> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| PaymentError::Validation(format!("Malformed {provider} event: {e}")))?;
        Self::from_value(provider, raw)
    }

    pub fn from_value(provider: Provider, raw: Value) -> Result<Self, PaymentError> {
        let malformed =
            |e: serde_json::Error| PaymentError::Validation(format!("Malformed {provider} event: {e}"));
        let event = match provider {
            Provider::CardWallet => {
                ProviderEvent::CardWallet(CardWalletEvent::from_value(raw).map_err(malformed)?)
            }
            Provider::MobileMoney => {
                ProviderEvent::MobileMoney(MobileMoneyEvent::from_value(raw).map_err(malformed)?)
            }
        };
        if event.provider_ref().trim().is_empty() {
            return Err(PaymentError::Validation(format!(
                "Malformed {provider} event: empty reference"
            )));
        }
        Ok(event)
    }

    pub fn provider(&self) -> Provider {
        match self {
            ProviderEvent::CardWallet(_) => Provider::CardWallet,
            ProviderEvent::MobileMoney(_) => Provider::MobileMoney,
        }
    }

    pub fn provider_ref(&self) -> &str {
        match self {
            ProviderEvent::CardWallet(e) => &e.resource_id,
            ProviderEvent::MobileMoney(e) => &e.reference_id,
        }
    }

    pub fn raw_status(&self) -> &str {
        match self {
            ProviderEvent::CardWallet(e) => &e.status,
            ProviderEvent::MobileMoney(e) => &e.status,
        }
    }

    pub fn status(&self) -> ProviderStatus {
        match self {
            ProviderEvent::CardWallet(e) => card_wallet_status(&e.status),
            ProviderEvent::MobileMoney(e) => mobile_money_status(&e.status),
        }
    }

    /// Amount the provider reported, in major units, with its currency code.
    pub fn reported_amount(&self) -> Option<(Decimal, &str)> {
        let amount = match self {
            ProviderEvent::CardWallet(e) => e.amount.as_ref(),
            ProviderEvent::MobileMoney(e) => e.amount.as_ref(),
        };
        amount.map(|(value, currency)| (*value, currency.as_str()))
    }

    pub fn payload(&self) -> &Value {
        match self {
            ProviderEvent::CardWallet(e) => &e.raw,
            ProviderEvent::MobileMoney(e) => &e.raw,
        }
    }
}
