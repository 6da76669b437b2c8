//! Retry backoff policy.

use std::time::Duration;

use crate::models::BackoffStrategy;

/// Delay before the next attempt, given the number of attempts already made.
///
/// `exp` doubles per attempt: 2s after the first failure, 4s after the
/// second, and so on. The exponent saturates so absurd attempt counts cannot
/// overflow.
pub fn backoff_delay(attempts_so_far: i32, strategy: BackoffStrategy) -> Duration {
    match strategy {
        BackoffStrategy::None => Duration::ZERO,
        BackoffStrategy::Exp => {
            let exp = attempts_so_far.clamp(0, 62) as u32;
            Duration::from_secs(1u64 << exp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_immediate() {
        assert_eq!(
            backoff_delay(1, BackoffStrategy::None),
            Duration::ZERO
        );
        assert_eq!(
            backoff_delay(100, BackoffStrategy::None),
            Duration::ZERO
        );
    }

    #[test]
    fn test_exp_doubles_per_attempt() {
        assert_eq!(
            backoff_delay(1, BackoffStrategy::Exp),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff_delay(2, BackoffStrategy::Exp),
            Duration::from_secs(4)
        );
        assert_eq!(
            backoff_delay(3, BackoffStrategy::Exp),
            Duration::from_secs(8)
        );
        assert_eq!(
            backoff_delay(10, BackoffStrategy::Exp),
            Duration::from_secs(1024)
        );
    }

    #[test]
    fn test_exp_zero_attempts() {
        assert_eq!(
            backoff_delay(0, BackoffStrategy::Exp),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_exp_saturates_instead_of_overflowing() {
        let huge = backoff_delay(i32::MAX, BackoffStrategy::Exp);
        assert_eq!(huge, Duration::from_secs(1u64 << 62));
        let negative = backoff_delay(-3, BackoffStrategy::Exp);
        assert_eq!(negative, Duration::from_secs(1));
    }
}
