use crate::domain::order::{OrderId, OrderStatus};
use crate::domain::outcome::OrderOutcome;
use crate::domain::ports::Notifier;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Writes order outcomes to the log. Used when no notification endpoint is
/// configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, order_id: OrderId, outcome: OrderOutcome) -> Result<()> {
        info!(%order_id, ?outcome, "Order outcome");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Notification {
    order_id: OrderId,
    outcome: OrderOutcome,
    status: OrderStatus,
}

/// POSTs order outcomes as JSON to a downstream endpoint.
pub struct HttpNotifier {
    client: Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            return Err(PaymentError::Config(
                "notification endpoint not configured".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("notifier HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, order_id: OrderId, outcome: OrderOutcome) -> Result<()> {
        let body = Notification {
            order_id,
            outcome,
            status: outcome.into(),
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| PaymentError::Notification(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PaymentError::Notification(format!(
                "endpoint returned {status}"
            )));
        }
        debug!(%order_id, ?outcome, "Notification delivered");
        Ok(())
    }
}
