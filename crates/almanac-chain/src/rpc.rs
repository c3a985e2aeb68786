//! JSON-RPC transport.
//!
//! Transport-level failures (connection errors, malformed envelopes) are
//! retried on a fixed delay schedule. A JSON-RPC `error` member is NOT
//! retried: it is surfaced verbatim so callers can react to provider
//! messages such as log-range limits.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde_json::Value;

use almanac_common::AlmanacError;

/// Retry delays for RPC calls (in seconds)
const RPC_RETRY_DELAYS: &[u64] = &[2, 5, 10, 20, 30];
const RPC_MAX_RETRIES: usize = 10;

pub type SharedRateLimiter = Arc<
    RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
>;

#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Issue a single JSON-RPC request and return the `result` member.
    async fn request(&self, method: &str, params: Value) -> Result<Value, AlmanacError>;
}

/// HTTP JSON-RPC transport with a shared request rate limiter.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    limiter: SharedRateLimiter,
}

impl HttpTransport {
    pub fn new(url: &str, timeout: Duration, requests_per_second: u32) -> Result<Self, AlmanacError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlmanacError::Config(format!("failed to build HTTP client: {e}")))?;

        let rps = NonZeroU32::new(requests_per_second)
            .unwrap_or_else(|| NonZeroU32::new(100).expect("nonzero"));
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            url: url.to_string(),
            limiter,
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, AlmanacError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let mut last_error = String::new();

        for attempt in 0..RPC_MAX_RETRIES {
            self.limiter.until_ready().await;

            let response = match self.client.post(&self.url).json(&body).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        "RPC request {} failed (attempt {}/{}): {}. Retrying in {}s...",
                        method,
                        attempt + 1,
                        RPC_MAX_RETRIES,
                        e,
                        delay
                    );
                    last_error = format!("HTTP request failed: {e}");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    continue;
                }
            };

            let envelope: Value = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        "Failed to parse RPC response for {} (attempt {}/{}): {}. Retrying in {}s...",
                        method,
                        attempt + 1,
                        RPC_MAX_RETRIES,
                        e,
                        delay
                    );
                    last_error = format!("failed to parse response: {e}");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    continue;
                }
            };

            // Provider errors go straight back to the caller.
            if let Some(error) = envelope.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Err(AlmanacError::Rpc(message));
            }

            return match envelope.get("result") {
                Some(result) => Ok(result.clone()),
                None => Err(AlmanacError::Rpc(format!(
                    "no result in response for {method}"
                ))),
            };
        }

        Err(AlmanacError::Rpc(format!(
            "RPC request {method} failed after {RPC_MAX_RETRIES} retries: {last_error}"
        )))
    }
}

fn retry_delay(attempt: usize) -> u64 {
    RPC_RETRY_DELAYS
        .get(attempt)
        .copied()
        .unwrap_or(*RPC_RETRY_DELAYS.last().unwrap_or(&30))
}
