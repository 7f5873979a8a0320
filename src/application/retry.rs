use crate::config::RetryConfig;
use crate::domain::provider::Provider;
use crate::error::{PaymentError, Result};
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Backoff configuration for provider calls.
pub fn backoff(config: &RetryConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.min_delay)
        .with_max_delay(config.max_delay)
        .with_max_times(config.max_retries)
        .with_jitter()
}

/// Runs `call` until it succeeds, fails with a non-transient error, or the
/// retries are spent. Mutating calls must carry the same idempotency key on
/// every attempt.
///
/// Once any attempt timed out the provider may hold the request, so a later
/// failure still surfaces as `ProviderTimeout`.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let timed_out = OnceLock::<Provider>::new();
    let seen = &timed_out;
    let result = (move || {
        let attempt = call();
        async move {
            let result = attempt.await;
            if let Err(PaymentError::ProviderTimeout { provider }) = &result {
                seen.get_or_init(|| *provider);
            }
            result
        }
    })
    .retry(backoff(config))
    .when(PaymentError::is_retryable)
    .notify(|err: &PaymentError, delay: Duration| {
        warn!(operation, error = %err, ?delay, "Transient failure, retrying");
    })
    .await;

    match (result, timed_out.into_inner()) {
        (Err(e), Some(provider)) if !matches!(e, PaymentError::ProviderTimeout { .. }) => {
            warn!(operation, error = %e, "Earlier attempt timed out; outcome unknown");
            Err(PaymentError::ProviderTimeout { provider })
        }
        (result, _) => result,
    }
}
