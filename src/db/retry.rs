//! Bounded retry of transient storage failures.

use crate::config::RetryConfig;
use crate::error::{Error, Result, StorageError};
use std::time::Duration;
use tracing::warn;

/// Attempt budget and fixed delay for one class of transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub const NONE: Self = Self {
        max_attempts: 1,
        delay: Duration::ZERO,
    };

    /// Policy for busy/locked responses of the embedded store.
    pub const fn busy(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.busy_max_attempts,
            delay: config.busy_delay(),
        }
    }

    /// Policy for lost or refused server connections.
    pub const fn connection(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.connection_max_attempts,
            delay: config.connection_delay(),
        }
    }
}

/// Returns true for failures worth retrying.
pub const fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Storage(StorageError::Transient(_)))
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up.
///
/// Exhaustion yields [`StorageError::RetriesExhausted`] carrying the last
/// transient message.
pub fn with_retry<T>(
    policy: RetryPolicy,
    operation: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                if attempt >= max_attempts {
                    return Err(StorageError::RetriesExhausted {
                        operation: super::dialect::statement_context(operation),
                        attempts: attempt,
                        message: err.to_string(),
                    }
                    .into());
                }
                warn!(
                    operation = %super::dialect::statement_context(operation),
                    attempt,
                    max_attempts,
                    error = %err,
                    "transient storage failure, retrying"
                );
                std::thread::sleep(policy.delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
        }
    }

    fn busy() -> Error {
        StorageError::Transient("database is locked".to_string()).into()
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let value = with_retry(fast(5), "BEGIN IMMEDIATE", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(busy()) } else { Ok(7) }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhaustion_reports_attempts() {
        let calls = Cell::new(0);
        let err = with_retry(fast(4), "INSERT INTO objects", || -> Result<()> {
            calls.set(calls.get() + 1);
            Err(busy())
        })
        .unwrap_err();
        assert_eq!(calls.get(), 4);
        match err {
            Error::Storage(StorageError::RetriesExhausted {
                attempts, message, ..
            }) => {
                assert_eq!(attempts, 4);
                assert!(message.contains("locked"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_integrity_is_not_retried() {
        let calls = Cell::new(0);
        let err = with_retry(fast(5), "INSERT", || -> Result<()> {
            calls.set(calls.get() + 1);
            Err(Error::Integrity {
                operation: "INSERT".to_string(),
                message: "UNIQUE constraint failed".to_string(),
            })
        })
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(err.is_integrity());
    }

    #[test]
    fn test_unsupported_schema_is_not_retried() {
        use crate::schema::SchemaVersion;
        let calls = Cell::new(0);
        let err = with_retry(fast(5), "open", || -> Result<()> {
            calls.set(calls.get() + 1);
            Err(Error::UnsupportedSchema {
                found: SchemaVersion::new(9, 0),
                oldest: SchemaVersion::OLDEST,
                supported: SchemaVersion::CURRENT,
            })
        })
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(err.is_unsupported_schema());
    }

    #[test]
    fn test_policies_from_config() {
        let config = RetryConfig::default();
        assert_eq!(RetryPolicy::busy(&config).max_attempts, config.busy_max_attempts);
        assert_eq!(
            RetryPolicy::connection(&config).delay,
            Duration::from_millis(config.connection_delay_ms)
        );
    }
}
