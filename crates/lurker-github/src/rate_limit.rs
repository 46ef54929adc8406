use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use reqwest::header::HeaderMap;

/// Remaining-request threshold below which the limiter sleeps until the
/// advertised reset before letting the next request out.
const PREEMPTIVE_THRESHOLD: i64 = 10;
/// Buffer added on top of the advertised reset instant.
const RESET_BUFFER: Duration = Duration::from_secs(1);
/// Fallback wait when a rate-limit response carries no usable header.
const FALLBACK_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct LimitState {
    /// None until the first response has been observed.
    remaining: Option<i64>,
    reset_at: Option<SystemTime>,
}

/// Tracks hosting-API rate limits from response headers.
///
/// Process-wide: one limiter is shared by every poller and worker so
/// the budget is spent coherently across repositories.
#[derive(Debug, Default)]
pub struct RateLimiter {
    state: Mutex<LimitState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `X-RateLimit-Remaining` and `X-RateLimit-Reset` from the
    /// headers of any response.
    pub fn update(&self, headers: &HeaderMap) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(remaining) = header_i64(headers, "x-ratelimit-remaining") {
            state.remaining = Some(remaining);
        }
        if let Some(epoch) = header_i64(headers, "x-ratelimit-reset") {
            state.reset_at = Some(epoch_to_system_time(epoch));
        }
    }

    /// Processes a 429 / 403-rate-limit response: the budget is
    /// exhausted until `Retry-After`, the reset header, or a fallback.
    pub fn note_exhausted(&self, headers: &HeaderMap) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remaining = Some(0);

        if let Some(secs) = header_i64(headers, "retry-after") {
            state.reset_at = Some(SystemTime::now() + Duration::from_secs(secs.max(0) as u64));
            return;
        }
        if let Some(epoch) = header_i64(headers, "x-ratelimit-reset") {
            state.reset_at = Some(epoch_to_system_time(epoch));
            return;
        }
        state.reset_at = Some(SystemTime::now() + FALLBACK_WAIT);
    }

    /// Blocks while the remaining budget is below the safety threshold
    /// and the reset lies in the future. Unknown remaining never blocks.
    pub async fn wait(&self) {
        let delay = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match (state.remaining, state.reset_at) {
                (Some(remaining), Some(reset_at)) if remaining < PREEMPTIVE_THRESHOLD => reset_at
                    .duration_since(SystemTime::now())
                    .ok()
                    .map(|until_reset| until_reset + RESET_BUFFER),
                _ => None,
            }
        };

        if let Some(delay) = delay {
            tracing::debug!(?delay, "rate limit budget low; sleeping until reset");
            tokio::time::sleep(delay).await;
        }
    }

    #[cfg(test)]
    fn set_state(&self, remaining: i64, reset_in: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remaining = Some(remaining);
        state.reset_at = Some(SystemTime::now() + reset_in);
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn epoch_to_system_time(epoch: i64) -> SystemTime {
    if epoch <= 0 {
        return SystemTime::UNIX_EPOCH;
    }
    SystemTime::UNIX_EPOCH + Duration::from_secs(epoch as u64)
}
