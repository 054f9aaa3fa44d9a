//! Bounded retry with exponential backoff for flaky external calls.
//!
//! One policy object is applied to both layout detection and model calls.
//! Each attempt runs under a timeout; timeouts and transient errors are
//! retried, permanent errors return immediately.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::ModelError;
use super::structure::StructureError;

/// Errors the retry loop knows how to classify.
pub trait Retryable: Sized {
    fn is_transient(&self) -> bool;

    /// Error reported when an attempt exceeds its timeout.
    fn timed_out(after_secs: u64) -> Self;
}

impl Retryable for ModelError {
    fn is_transient(&self) -> bool {
        ModelError::is_transient(self)
    }

    fn timed_out(after_secs: u64) -> Self {
        ModelError::Timeout(after_secs)
    }
}

impl Retryable for StructureError {
    fn is_transient(&self) -> bool {
        StructureError::is_transient(self)
    }

    fn timed_out(after_secs: u64) -> Self {
        StructureError::Timeout(after_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            multiplier: 2.0,
        }
    }
}

/// Result of a retried operation plus the number of attempts it took.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Policy that tries once and never waits.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay after the given failed attempt (1-based), capped at `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, label: &str, timeout: Duration, mut op: F) -> Attempted<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(timeout, op(attempt)).await {
                Ok(r) => r,
                Err(_) => Err(E::timed_out(timeout.as_secs())),
            };

            match outcome {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_for(1), Duration::from_millis(500));
        assert_eq!(p.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(p.backoff_for(3), Duration::from_millis(2000));
        assert_eq!(p.backoff_for(10), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let out = fast(3)
            .run("test", Duration::from_secs(5), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ModelError::RateLimited)
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(out.result.unwrap(), "ok");
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn permanent_error_returns_immediately() {
        let out: Attempted<(), ModelError> = fast(5)
            .run("test", Duration::from_secs(5), |_| async {
                Err(ModelError::Api {
                    status: 400,
                    body: "bad".into(),
                })
            })
            .await;
        assert_eq!(out.attempts, 1);
        assert!(matches!(out.result, Err(ModelError::Api { status: 400, .. })));
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let out: Attempted<(), StructureError> = fast(2)
            .run("test", Duration::from_secs(5), |_| async {
                Err(StructureError::Unavailable("down".into()))
            })
            .await;
        assert_eq!(out.attempts, 2);
        assert!(out.result.is_err());
    }

    #[tokio::test]
    async fn missing_layout_output_is_not_retried() {
        let out: Attempted<(), StructureError> = fast(3)
            .run("test", Duration::from_secs(5), |_| async {
                Err(StructureError::MissingOutput(std::path::PathBuf::from("brf.layout.json")))
            })
            .await;
        assert_eq!(out.attempts, 1);
        assert!(matches!(out.result, Err(StructureError::MissingOutput(_))));
    }

    #[tokio::test]
    async fn timeout_becomes_error() {
        let out: Attempted<(), ModelError> = RetryPolicy::none()
            .run("test", Duration::from_millis(10), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(out.result, Err(ModelError::Timeout(_))));
        assert_eq!(out.attempts, 1);
    }
}
