use crate::domain::provider::{AccessToken, Provider};
use crate::error::Result;
use chrono::Utc;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::debug;

/// Single-flight cache for a provider access token.
///
/// The slot lock is held across the refresh call, so concurrent callers that
/// find the token stale queue behind one fetch and then reuse its result.
pub struct TokenCache {
    provider: Provider,
    margin: chrono::Duration,
    slot: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(provider: Provider, margin: std::time::Duration) -> Self {
        Self {
            provider,
            margin: chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero()),
            slot: Mutex::new(None),
        }
    }

    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<AccessToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref()
            && !token.needs_refresh(self.margin, Utc::now())
        {
            return Ok(token.clone());
        }

        debug!(provider = %self.provider, "Refreshing access token");
        let token = fetch().await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Drops the cached token after the provider refused it.
    pub async fn invalidate(&self) {
        self.slot.lock().await.take();
    }
}
