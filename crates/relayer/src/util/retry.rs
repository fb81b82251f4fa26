use core::iter;
use core::time::Duration;

pub use retry::{retry_with_index, Error as RetryError, OperationResult as RetryResult};

/// A bounded retry schedule: `max_attempts` re-attempts with the same
/// pause before each one.
///
/// Transient chain errors are the only thing retried in this code base,
/// and a flaky node either answers again within a few attempts or the
/// failure should surface; neither case benefits from a growing backoff,
/// so the schedule is deliberately flat.
pub fn fixed_delay(delay: Duration, max_attempts: usize) -> impl Iterator<Item = Duration> {
    iter::repeat(delay).take(max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_bounded_and_flat() {
        let delays: Vec<_> = fixed_delay(Duration::from_millis(250), 4).collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d == Duration::from_millis(250)));
    }

    #[test]
    fn zero_attempts_never_retry() {
        assert_eq!(fixed_delay(Duration::from_secs(1), 0).count(), 0);
    }
}
