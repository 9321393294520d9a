//! Backoff policy, bounded RPC waits and submission error classification.

use std::future::IntoFuture;
use std::time::Duration;

use eyre::{eyre, Result};

use crate::error::{HandlerError, ProtocolError};

/// Retry configuration for transient failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Await `fut`, failing with a timeout error after `limit`.
pub async fn with_timeout<T, E, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: IntoFuture<Output = std::result::Result<T, E>>,
    E: Into<eyre::Report>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Into::<eyre::Report>::into(e).wrap_err(format!("{} failed", what))),
        Err(_) => Err(eyre!("{} timed out after {:?}", what, limit)),
    }
}

/// Classifies RPC/submission errors
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// The destination refused the transaction; retrying fails the same way
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("blockhash not found")
        || error_lower.contains("accountnotinitialized")
        || error_lower.contains("custom program error: 0xbc4")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("nonce too low")
        || error_lower.contains("already been processed")
        || error_lower.contains("custom program error")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Map a failed RPC round trip onto the handler error taxonomy.
pub fn into_handler_error(error: eyre::Report) -> HandlerError {
    match classify_error(&format!("{:#}", error)) {
        ErrorClass::Permanent => {
            HandlerError::Protocol(ProtocolError::Rejected(format!("{:#}", error)))
        }
        ErrorClass::Transient | ErrorClass::Unknown => HandlerError::Transient(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(classify_error("Blockhash not found"), ErrorClass::Transient);
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(
            classify_error("Transaction simulation failed: custom program error: 0x1771"),
            ErrorClass::Permanent
        );
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
        // An account the instruction reads has not landed yet.
        assert_eq!(
            classify_error("Transaction simulation failed: custom program error: 0xbc4"),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error("AnchorError caused by account: output_root. AccountNotInitialized."),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_handler_error_mapping() {
        assert!(matches!(
            into_handler_error(eyre!("request timed out")),
            HandlerError::Transient(_)
        ));
        assert!(matches!(
            into_handler_error(eyre!("insufficient funds for gas")),
            HandlerError::Protocol(ProtocolError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_with_timeout() {
        let ok: Result<u8> = with_timeout(Duration::from_secs(1), "fast", async {
            Ok::<_, eyre::Report>(7)
        })
        .await;
        assert_eq!(ok.unwrap(), 7);

        let slow: Result<u8> = with_timeout(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, eyre::Report>(1)
        })
        .await;
        assert!(slow.unwrap_err().to_string().contains("timed out"));
    }
}
