use core::time::Duration;

use crate::util::retry::fixed_delay;

/// How many times a transient chain failure is re-attempted before it is
/// surfaced.
pub const RETRY_ATTEMPTS: usize = 5;

/// The pause before each re-attempt. Half a second is long enough for a
/// node that dropped one request to answer the next, and short enough
/// that a cancelled worker is never stuck behind more than one pause.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// The retry schedule shared by the workers, the supervisor's channel
/// re-queries and the chain processors.
pub fn worker_default_strategy() -> impl Iterator<Item = Duration> {
    fixed_delay(RETRY_DELAY, RETRY_ATTEMPTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_is_bounded() {
        let delays: Vec<_> = worker_default_strategy().collect();
        assert_eq!(delays.len(), RETRY_ATTEMPTS);
        assert!(delays.iter().all(|d| *d == RETRY_DELAY));
    }
}
