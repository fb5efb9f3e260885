// AgriNet - Row-level greenhouse monitoring and control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Retry strategies
//!
//! Transport failures are retried by the state machine that owns the
//! transport, after a delay chosen by a [`RetryStrategy`]. Flash writes use a
//! bounded [`RetryStrategy::Fixed`]; the wide-area session keeps retrying its
//! initialisation with [`RetryStrategy::Forever`].

use std::time::Duration;

/// Retry strategy for operations
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RetryStrategy {
    /// No retries
    #[default]
    None,
    /// Fixed number of retries with constant delay
    Fixed {
        /// Maximum number of retry attempts
        max_retries: u32,
        /// Delay between retries
        delay: Duration,
    },
    /// Retry forever with constant delay
    Forever {
        /// Delay between retries
        delay: Duration,
    },
}

impl RetryStrategy {
    /// Calculate delay for a given attempt number (0-indexed)
    ///
    /// Returns None if no more retries should be attempted
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_retries, delay } => {
                if attempt < *max_retries {
                    Some(*delay)
                } else {
                    None
                }
            }
            Self::Forever { delay } => Some(*delay),
        }
    }

    /// Create a fixed retry strategy
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    /// Create an unbounded constant-delay strategy
    pub fn forever(delay: Duration) -> Self {
        Self::Forever { delay }
    }
}

/// Execute an operation with retry logic
///
/// Retries the operation according to the strategy, sleeping between attempts.
///
/// # Example
///
/// ```
/// use agrinet::recovery::{with_retry, RetryStrategy};
/// use std::time::Duration;
///
/// let strategy = RetryStrategy::fixed(3, Duration::from_millis(1));
/// let mut calls = 0;
/// let result = with_retry(&strategy, || {
///     calls += 1;
///     if calls < 3 { Err("busy") } else { Ok(calls) }
/// });
/// assert_eq!(result, Ok(3));
/// ```
pub fn with_retry<T, E, F>(strategy: &RetryStrategy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                if let Some(delay) = strategy.delay_for_attempt(attempt) {
                    std::thread::sleep(delay);
                    attempt += 1;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_strategy_none() {
        let strategy = RetryStrategy::None;
        assert_eq!(strategy.delay_for_attempt(0), None);
    }

    #[test]
    fn test_retry_strategy_fixed() {
        let strategy = RetryStrategy::fixed(3, Duration::from_millis(100));
        assert_eq!(
            strategy.delay_for_attempt(0),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            strategy.delay_for_attempt(2),
            Some(Duration::from_millis(100))
        );
        assert_eq!(strategy.delay_for_attempt(3), None);
    }

    #[test]
    fn test_retry_strategy_forever() {
        let strategy = RetryStrategy::forever(Duration::from_secs(5));
        assert_eq!(
            strategy.delay_for_attempt(10_000),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_with_retry_gives_up() {
        let strategy = RetryStrategy::fixed(2, Duration::from_millis(1));
        let mut attempts = 0;
        let result: Result<(), &str> = with_retry(&strategy, || {
            attempts += 1;
            Err("flash busy")
        });
        assert_eq!(result, Err("flash busy"));
        assert_eq!(attempts, 3);
    }
}
