//! Typed adapter error kinds.
//!
//! The engine and the retry utility dispatch on the kind, not the text:
//! timeouts skip a tick, network errors retry, venue rejections surface per
//! order, and closing-market rejections stay quiet.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("venue rejected request: {0}")]
    Venue(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("market is closing soon")]
    MarketClosing,

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("market metadata unavailable: {0}")]
    MarketUnavailable(String),
}

impl ExchangeError {
    /// Errors worth retrying inside the adapter.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_) | ExchangeError::RateLimited(_) | ExchangeError::Timeout(_)
        )
    }

    /// Errors that should not produce an order-failure notification.
    pub fn suppress_notify(&self) -> bool {
        matches!(self, ExchangeError::MarketClosing)
    }

    /// Venue "unknown order" phrasings that mean the order no longer exists.
    pub fn text_means_not_found(text: &str) -> bool {
        let lowered = text.to_lowercase();
        ["unknown order", "order does not exist", "order not found", "not found", "-2013"]
            .iter()
            .any(|marker| lowered.contains(marker))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_status() {
            match err.status().map(|s| s.as_u16()) {
                Some(429) | Some(418) => ExchangeError::RateLimited(err.to_string()),
                _ => ExchangeError::Venue(err.to_string()),
            }
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(ExchangeError::Network("reset".into()).is_retriable());
        assert!(ExchangeError::RateLimited("429".into()).is_retriable());
        assert!(!ExchangeError::Venue("bad qty".into()).is_retriable());
        assert!(!ExchangeError::MarketClosing.is_retriable());
    }

    #[test]
    fn not_found_text_markers() {
        assert!(ExchangeError::text_means_not_found("Unknown order sent."));
        assert!(ExchangeError::text_means_not_found("code=-2013, msg=..."));
        assert!(!ExchangeError::text_means_not_found("insufficient balance"));
    }
}
