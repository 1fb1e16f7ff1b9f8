//! HTTP retry policy with exponential backoff.
//!
//! # Retry Policy
//!
//! - Max retries: 2 (3 total attempts)
//! - Initial delay: 500ms
//! - Max delay: 8 seconds
//! - Jitter: down-jitter up to 25% (multiplier in [0.75, 1.0])
//!
//! # Retryable Conditions
//!
//! - HTTP 429 (`M_LIMIT_EXCEEDED`), always: the homeserver rejected the
//!   request before acting on it
//! - HTTP 502, 503, 504 and timeouts, only for [`Idempotency::Idempotent`]
//!   requests
//! - Connection failures, always (nothing reached the server)
//!
//! A server-provided hint wins over backoff: the `Retry-After` header, or the
//! `retry_after_ms` field of a Matrix rate-limit body.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};
use tokio::time::sleep;

const MAX_HINT: Duration = Duration::from_secs(60);

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (not counting initial request).
    pub max_retries: u32,
    /// Initial backoff delay before first retry.
    pub initial_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Jitter factor for down-jitter (0.25 = up to 25% reduction).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

/// Whether replaying a request after an ambiguous failure is harmless.
///
/// Sends carry a transaction ID and registration tolerates `M_USER_IN_USE`,
/// so both are idempotent. Room creation is not: a timeout after the server
/// committed the room would produce a duplicate on replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

/// Parse the `Retry-After` header (integer seconds).
///
/// Returns `Some(duration)` only when `0 < duration < 60s`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    clamp_hint(Duration::from_secs(secs))
}

/// Parse `retry_after_ms` from a Matrix error body.
#[must_use]
pub fn parse_retry_after_body(body: &[u8]) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let ms = value.get("retry_after_ms")?.as_u64()?;
    clamp_hint(Duration::from_millis(ms))
}

fn clamp_hint(duration: Duration) -> Option<Duration> {
    (duration > Duration::ZERO && duration < MAX_HINT).then_some(duration)
}

/// Determine if a response status is retryable for this kind of request.
#[must_use]
pub fn should_retry(status: StatusCode, idempotency: Idempotency) -> bool {
    match status.as_u16() {
        429 => true,
        502..=504 => idempotency == Idempotency::Idempotent,
        _ => false,
    }
}

/// Calculate retry delay with exponential backoff and jitter.
///
/// - `backoff_step`: 0 before first retry, 1 before second, etc.
/// - A valid server hint is used as-is.
#[must_use]
pub fn calculate_retry_delay(
    backoff_step: u32,
    config: &RetryConfig,
    hint: Option<Duration>,
) -> Duration {
    if let Some(delay) = hint {
        return delay;
    }

    // Exponential backoff: initial_delay * 2^backoff_step
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(backoff_step as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Down-jitter: multiply by random factor in [1 - jitter_factor, 1.0]
    let jitter = 1.0 - rand::random::<f64>() * config.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

/// Outcome of a retry operation.
///
/// This is a sum type that structurally distinguishes success from failure,
/// ensuring callers cannot accidentally treat an error response as success.
#[derive(Debug)]
pub enum RetryOutcome {
    /// Request succeeded (2xx status).
    Success(Response),
    /// Request failed with an HTTP error, either non-retryable or after
    /// exhausting retries. The response is provided for error body inspection.
    HttpError(Response),
    /// Request failed with a transport error.
    ConnectionError {
        attempts: u32,
        source: reqwest::Error,
    },
}

/// Send a request with automatic retries.
///
/// `build_request` is called once per attempt; it must produce the same
/// request every time (same URL, same transaction ID).
pub async fn send_with_retry<F>(
    build_request: F,
    idempotency: Idempotency,
    config: &RetryConfig,
) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        let can_retry = attempt < config.max_retries;

        match build_request().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return RetryOutcome::Success(response);
                }
                if !can_retry || !should_retry(status, idempotency) {
                    return RetryOutcome::HttpError(response);
                }

                let hint = retry_hint(response).await;
                let delay = calculate_retry_delay(attempt, config, hint);
                tracing::debug!(
                    status = %status,
                    retry_count = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying homeserver request after error status"
                );
                sleep(delay).await;
            }
            Err(e) => {
                if !can_retry || !is_retryable_error(&e, idempotency) {
                    return RetryOutcome::ConnectionError {
                        attempts: attempt + 1,
                        source: e,
                    };
                }

                let delay = calculate_retry_delay(attempt, config, None);
                tracing::debug!(
                    error = %e,
                    retry_count = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying homeserver request after connection error"
                );
                sleep(delay).await;
            }
        }

        attempt += 1;
    }
}

/// Pull a delay hint out of a response that is about to be discarded.
async fn retry_hint(response: Response) -> Option<Duration> {
    if let Some(delay) = parse_retry_after(response.headers()) {
        return Some(delay);
    }
    let body = response.bytes().await.ok()?;
    parse_retry_after_body(&body)
}

fn is_retryable_error(error: &reqwest::Error, idempotency: Idempotency) -> bool {
    if error.is_connect() {
        return true;
    }
    idempotency == Idempotency::Idempotent && (error.is_timeout() || error.is_request())
}
