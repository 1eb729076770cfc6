use std::collections::VecDeque;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Statuses worth another attempt. Everything else in the 4xx range is a
/// final answer.
pub(crate) fn should_retry(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

const JITTER_RANGE: (f64, f64) = (0.05, 0.35);

/// Exponential backoff for the given 1-based attempt, with uniform jitter
/// so retry bursts spread out.
pub(crate) fn backoff_delay(base: f64, attempt: u32) -> Duration {
    let jitter = JITTER_RANGE.0 + fastrand::f64() * (JITTER_RANGE.1 - JITTER_RANGE.0);
    Duration::from_secs_f64(base.powi(attempt as i32 - 1) + jitter)
}

/// Admits at most `rps` acquisitions within any rolling one-second
/// window. Waiters queue on the internal mutex, so admissions keep their
/// arrival order.
pub struct RpsLimiter {
    rps: usize,
    window: Mutex<VecDeque<Instant>>,
}

impl RpsLimiter {
    pub fn new(rps: usize) -> Self {
        Self {
            rps: rps.max(1),
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until the window has room, then record this acquisition.
    pub async fn acquire(&self) {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        while window.front().is_some_and(|t| now - *t >= Duration::from_secs(1)) {
            window.pop_front();
        }
        if window.len() >= self.rps {
            if let Some(oldest) = window.front().copied() {
                tokio::time::sleep_until(oldest + Duration::from_secs(1)).await;
            }
            let now = Instant::now();
            while window.front().is_some_and(|t| now - *t >= Duration::from_secs(1)) {
                window.pop_front();
            }
        }
        window.push_back(Instant::now());
    }
}

/// Retry knobs shared by every outbound call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: f64,
}

/// The terminal reply of a request that ran out of retries.
#[derive(Debug)]
pub(crate) struct Exhausted {
    pub last_payload: Option<Value>,
}

/// POST a JSON body, retrying transient failures (429/5xx, connection
/// and payload errors) with jittered exponential backoff.
///
/// Returns the first conclusive reply: a 2xx, or any status outside the
/// retryable set. The payload is parsed JSON when possible, otherwise
/// the raw body as a JSON string.
pub(crate) async fn post_json_with_retries(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
    policy: RetryPolicy,
    tag: &str,
) -> Result<(StatusCode, Value), Exhausted> {
    let mut last_payload = None;
    for attempt in 1..=policy.max_retries {
        match client
            .post(url)
            .headers(headers.clone())
            .json(body)
            .send()
            .await
        {
            Ok(resp) => {
                let status = resp.status();
                match resp.text().await {
                    Ok(text) => {
                        let payload = serde_json::from_str(&text)
                            .unwrap_or_else(|_| Value::String(text));
                        if status.is_success() || !should_retry(status) {
                            return Ok((status, payload));
                        }
                        warn!(tag, %status, attempt, "retryable response");
                        last_payload = Some(payload);
                    }
                    Err(e) => warn!(tag, err = ?e, attempt, "failed to read response body"),
                }
            }
            Err(e) => warn!(tag, err = ?e, attempt, "request failed"),
        }
        tokio::time::sleep(backoff_delay(policy.backoff_base, attempt)).await;
    }
    Err(Exhausted { last_payload })
}

/// GET a page, retrying transient failures like the POST helper. Returns
/// the final response for the caller to inspect, or `None` once retries
/// are exhausted.
pub(crate) async fn get_with_retries(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    policy: RetryPolicy,
) -> Option<reqwest::Response> {
    for attempt in 1..=policy.max_retries {
        match client.get(url).headers(headers.clone()).send().await {
            Ok(resp) if !should_retry(resp.status()) => return Some(resp),
            Ok(resp) => warn!(url, status = %resp.status(), attempt, "retryable response"),
            Err(e) => warn!(url, err = ?e, attempt, "request failed"),
        }
        tokio::time::sleep(backoff_delay(policy.backoff_base, attempt)).await;
    }
    None
}
