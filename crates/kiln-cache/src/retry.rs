use std::io;
use std::path::Path;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Bounded exponential backoff for transient filesystem failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base_delay * 2^(retry-1)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Whether `err` may go away on its own, e.g. another process briefly holding
/// the file open.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ResourceBusy
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33))
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up.
pub fn retry_io<T>(
    policy: &RetryPolicy,
    operation: &'static str,
    path: &Path,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if !is_transient(&err) => return Err(CacheError::io(path, err)),
            Err(err) if attempt >= attempts => {
                return Err(CacheError::RetriesExhausted {
                    operation,
                    path: path.to_path_buf(),
                    attempts,
                    source: err,
                })
            }
            Err(err) => {
                let delay = policy.delay(attempt);
                tracing::debug!(
                    target = "kiln.cache",
                    operation,
                    path = %path.display(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient io failure; retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(100));
        assert_eq!(policy.delay(4), Duration::from_millis(400));
    }

    #[test]
    fn recovers_from_transient_failures() {
        let mut calls = 0;
        let value = retry_io(&quick(5), "read", Path::new("x"), || {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let mut calls = 0;
        let err = retry_io(&quick(3), "write", Path::new("x"), || -> io::Result<()> {
            calls += 1;
            Err(io::Error::from(io::ErrorKind::TimedOut))
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(err, CacheError::RetriesExhausted { attempts: 3, .. }), "{err}");
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let err = retry_io(&quick(5), "read", Path::new("x"), || -> io::Result<()> {
            calls += 1;
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, CacheError::Io { .. }));
    }
}
