use crate::error::{IngestError, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff for transient send failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Wait as long as a 429 `Retry-After` header asks, up to `max_delay_ms`.
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            respect_retry_after: true,
        }
    }
}

impl RetryConfig {
    /// # Errors
    /// Returns [`IngestError::Config`] for a shrinking backoff.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 || self.initial_delay_ms > self.max_delay_ms {
            return Err(IngestError::Config(
                "retry: backoff_multiplier must be >= 1 and initial_delay_ms <= max_delay_ms"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let ms = (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(exp);
        let capped = if ms.is_finite() {
            ms.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    /// [`delay_for`](Self::delay_for), overridden by a server hint when allowed.
    #[must_use]
    pub fn delay_with_hint(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) if self.respect_retry_after => {
                hint.min(Duration::from_millis(self.max_delay_ms))
            }
            _ => self.delay_for(retry),
        }
    }
}

/// Statuses worth retrying.
#[must_use]
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 501 | 502 | 503 | 504 | 524)
}

/// Transport failures worth retrying.
#[must_use]
pub fn is_transient_error(err: &IngestError) -> bool {
    match err {
        IngestError::Timeout(_) => true,
        IngestError::Transport(e) => {
            e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
        }
        IngestError::Http { status, .. } => is_transient_status(*status),
        _ => false,
    }
}
