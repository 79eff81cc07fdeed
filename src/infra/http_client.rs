use crate::error::ProviderError;
use metrics::counter;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Build the HTTP client shared by one adapter.
pub fn build_client(request_timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(request_timeout)
        .user_agent(concat!("finops_costs/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(ProviderError::from)
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// The last error is returned once the attempt budget is spent, so callers
/// never see a partial result.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempts = 0;
    let mut delay = policy.initial_backoff;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;
                if !err.is_transient() || attempts >= policy.max_attempts {
                    return Err(err);
                }
                counter!("finops_provider_retries_total", "call" => what.to_string()).increment(1);
                warn!(call = what, attempt = attempts, ?delay, error = %err, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, policy.max_backoff);
            }
        }
    }
}

/// Turn a non-2xx response into a `ProviderError`, keeping the body.
///
/// 401 and 403 become `Auth`; everything else is `Status`.
pub async fn check_status(resp: Response) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = truncate(&resp.text().await.unwrap_or_default(), 512);
    match status.as_u16() {
        401 | 403 => Err(ProviderError::Auth(format!("{status}: {body}"))),
        code => Err(ProviderError::Status { status: code, body }),
    }
}

/// Check the status and decode a JSON body.
pub async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, ProviderError> {
    let resp = check_status(resp).await?;
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ProviderError::Decode(e.to_string()))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
