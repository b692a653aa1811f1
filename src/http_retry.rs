//! Upstream fetch with automatic retry and backoff.
//!
//! Provides [`fetch_with_retry`], the single entry point the proxy uses to
//! reach an upstream host. Only transport failures (connect errors, DNS
//! failures, timeouts) are retried; an HTTP response of any status is handed
//! back to the caller as-is so it can be forwarded.

use crate::metrics;
use crate::upstream::{Transport, TransportError, UpstreamRequest, UpstreamResponse};
use std::time::Duration;
use tracing::warn;

/// Default number of fetch attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between attempts in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 1000;

/// Default bound on waiting for upstream response headers.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Upper bound for any single computed delay.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// How the delay grows between consecutive attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay every time.
    #[default]
    Fixed,
    /// `backoff × attempt`
    Linear,
    /// `backoff × 2^(attempt - 1)`
    Exponential,
}

impl BackoffStrategy {
    /// Parse a strategy name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "linear" => Some(Self::Linear),
            "exponential" | "exp" => Some(Self::Exponential),
            _ => None,
        }
    }
}

/// Configuration for [`fetch_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Base delay between consecutive attempts.
    pub backoff: Duration,
    /// Growth of the delay across attempts.
    pub strategy: BackoffStrategy,
    /// Per-attempt bound on waiting for response headers.
    ///
    /// When `None`, the transport waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            strategy: BackoffStrategy::Fixed,
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.backoff,
            BackoffStrategy::Linear => self.backoff.saturating_mul(attempt.max(1)),
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.backoff.saturating_mul(1u32 << exponent)
            }
        };
        delay.min(MAX_DELAY)
    }
}

/// Send `request` through `transport`, retrying transport failures.
///
/// Attempts the request up to `config.max_attempts` times, sleeping
/// [`RetryConfig::delay_after`] between attempts. The request is resent with
/// identical method, headers and body each time.
///
/// Dropping the returned future (e.g. because the client disconnected)
/// aborts the in-flight attempt or the pending sleep.
///
/// # Errors
///
/// Returns the last [`TransportError`] once every attempt has failed.
pub async fn fetch_with_retry<T>(
    transport: &T,
    request: &UpstreamRequest,
    config: &RetryConfig,
) -> Result<UpstreamResponse, TransportError>
where
    T: Transport + ?Sized,
{
    let max_attempts = config.max_attempts.max(1);
    let url = request.url.as_str();

    // Attempts 1 through N-1 may retry; the final attempt below returns
    // its error directly.
    for attempt in 1..max_attempts {
        match transport.send(request, config.timeout).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                warn!(
                    "Upstream fetch failed for {} (attempt {}/{}): {}",
                    url, attempt, max_attempts, e
                );
            }
        }

        let delay = config.delay_after(attempt);
        warn!("Retrying upstream fetch in {}ms...", delay.as_millis());
        metrics::record_retry();
        tokio::time::sleep(delay).await;
    }

    transport
        .send(request, config.timeout)
        .await
        .inspect_err(|e| {
            warn!(
                "Upstream fetch failed for {} (attempt {}/{}): {}",
                url, max_attempts, max_attempts, e
            );
        })
}
