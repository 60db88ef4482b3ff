//! Exponential-backoff retry with jitter and venue rate-limit hints.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

/// Retry an async operation, retrying only errors accepted by `retriable`.
///
/// On exhaustion the last error is returned. When an error text carries a
/// venue rate-limit hint (`retry after N`, `wait N seconds`, `Ns`), that
/// wait overrides the computed backoff for the next attempt.
pub async fn retry_async<T, E, F, Fut, P>(
    config: &RetryConfig,
    label: &str,
    retriable: P,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.base_delay;

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt == max_attempts || !retriable(&err) {
                    if attempt > 1 {
                        error!("{label} failed after {attempt} attempts: {err}");
                    }
                    return Err(err);
                }

                let mut actual = delay;
                if let Some(hint) = parse_rate_limit_wait(&err.to_string()) {
                    actual = hint;
                } else if config.jitter {
                    let factor = rand::thread_rng().gen_range(0.5..1.5);
                    actual = actual.mul_f64(factor);
                }

                warn!(
                    "{label} attempt {attempt} failed, retrying in {:.1}s: {err}",
                    actual.as_secs_f64()
                );
                tokio::time::sleep(actual).await;

                delay = delay.mul_f64(config.backoff_factor).min(config.max_delay);
            }
        }
    }

    unreachable!("retry loop always returns within max_attempts")
}

/// Parse a wait hint out of a venue rate-limit error message.
///
/// Returns `None` when the message carries no recognizable hint; callers
/// that know they were rate limited should fall back to
/// [`DEFAULT_RATE_LIMIT_WAIT`].
pub fn parse_rate_limit_wait(error_message: &str) -> Option<Duration> {
    let lowered = error_message.to_lowercase();
    let patterns = [
        r"retry after (\d+)",
        r"wait (\d+) seconds",
        r"\b(\d+)s\b",
    ];

    for pattern in patterns {
        let re = Regex::new(pattern).expect("static retry pattern");
        if let Some(caps) = re.captures(&lowered) {
            if let Ok(secs) = caps[1].parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
        }
    }

    None
}

pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn parses_retry_after_hint() {
        assert_eq!(
            parse_rate_limit_wait("Too many requests, retry after 12"),
            Some(Duration::from_secs(12))
        );
        assert_eq!(
            parse_rate_limit_wait("please wait 5 seconds"),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            parse_rate_limit_wait("banned for 30s"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parse_rate_limit_wait("connection refused"), None);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result: Result<u32, String> = retry_async(&config, "test", |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retriable_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result: Result<(), String> = retry_async(&config, "test", |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("fatal".to_string()) }
        })
        .await;

        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result: Result<(), String> = retry_async(&config, "test", |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("boom {n}")) }
        })
        .await;

        assert_eq!(result, Err("boom 2".to_string()));
    }
}
