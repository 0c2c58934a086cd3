use castpool_providers::ApiError;
use std::future::Future;
use std::time::Duration;

/// Provider error codes worth retrying (throttling, transient unavailability, internal errors).
const RETRYABLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ServiceUnavailable",
    "Unavailable",
    "InternalError",
    "InternalFailure",
];

const RETRYABLE_STATUS: &[u16] = &[429, 500, 502, 503, 504];

/// Network-reset signatures matched against the rendered error chain.
const RESET_SIGNATURES: &[&str] = &[
    "econnreset",
    "connection reset",
    "epipe",
    "broken pipe",
    "socket hang up",
];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the `retry`-th retry (0-based): `min(base * 2^retry, max)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub fn is_retryable(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(api) = cause.downcast_ref::<ApiError>() {
            if RETRYABLE_CODES.contains(&api.code.as_str()) {
                return true;
            }
            if api.status.map(|s| RETRYABLE_STATUS.contains(&s)).unwrap_or(false) {
                return true;
            }
        }
        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            if http.is_timeout() || http.is_connect() {
                return true;
            }
            if http
                .status()
                .map(|s| RETRYABLE_STATUS.contains(&s.as_u16()))
                .unwrap_or(false)
            {
                return true;
            }
        }
    }
    let rendered = format!("{:#}", err).to_lowercase();
    RESET_SIGNATURES.iter().any(|sig| rendered.contains(sig))
}

/// Run `op` under `policy`. Non-retryable errors surface after one attempt; exhausting
/// the budget re-raises the last error tagged with `operation`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => {
                return Err(err.context(format!("{} failed (not retryable)", operation)));
            }
            Err(err) if attempt >= policy.max_attempts => {
                tracing::error!(operation, attempt, error = %err, "provider call exhausted retries");
                return Err(err.context(format!("{} failed after {} attempts", operation, attempt)));
            }
            Err(err) => {
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable provider error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
