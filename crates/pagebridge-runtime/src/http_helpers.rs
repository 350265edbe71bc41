use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::warn;

pub(crate) const RETRY_ATTEMPT_HEADER: &str = "x-pagebridge-retry-attempt";

/// Upper bound honoured for a server-provided `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Seconds-form `Retry-After`; HTTP-date values are ignored.
pub(crate) fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    let seconds = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER))
}

/// Backoff before attempt `attempt + 1`: `base * 2^(attempt-1)`, doubling at
/// most six times, unless the server asked for a specific wait.
pub(crate) fn retry_delay(
    base_delay_ms: u64,
    attempt: usize,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(retry_after) = retry_after {
        return retry_after;
    }
    let doublings = attempt.clamp(1, 7) - 1;
    Duration::from_millis(base_delay_ms.max(1).saturating_mul(1_u64 << doublings))
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

pub(crate) fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

pub(crate) fn truncate_for_error(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}

pub(crate) fn build_http_client(
    user_agent: &'static str,
    timeout_ms: u64,
) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        reqwest::header::HeaderValue::from_static(user_agent),
    );
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_millis(timeout_ms.max(1)))
        .timeout(Duration::from_millis(timeout_ms.max(1)))
        .build()
        .context("failed to create http client")
}

/// Sends the request produced by `builder`, retrying retryable statuses and
/// transport errors until `max_attempts` is spent. Returns the success body.
pub(crate) async fn send_with_retry<F>(
    operation: &str,
    max_attempts: usize,
    base_delay_ms: u64,
    mut builder: F,
) -> Result<String>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0_usize;
    loop {
        attempt = attempt.saturating_add(1);
        let response = builder()
            .header(RETRY_ATTEMPT_HEADER, attempt.saturating_sub(1).to_string())
            .send()
            .await;
        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .text()
                        .await
                        .with_context(|| format!("failed to read {operation} response"));
                }

                let retry_after = parse_retry_after(&response);
                let body = response.text().await.unwrap_or_default();
                if attempt < max_attempts && is_retryable_status(status.as_u16()) {
                    warn!(
                        operation,
                        attempt,
                        status = status.as_u16(),
                        "retrying http request"
                    );
                    tokio::time::sleep(retry_delay(base_delay_ms, attempt, retry_after)).await;
                    continue;
                }

                bail!(
                    "{operation} failed with status {}: {}",
                    status.as_u16(),
                    truncate_for_error(&body, 800)
                );
            }
            Err(error) => {
                if attempt < max_attempts && is_retryable_transport_error(&error) {
                    warn!(operation, attempt, error = %error, "retrying http request");
                    tokio::time::sleep(retry_delay(base_delay_ms, attempt, None)).await;
                    continue;
                }
                return Err(error).with_context(|| format!("{operation} request failed"));
            }
        }
    }
}
