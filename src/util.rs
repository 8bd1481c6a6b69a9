use std::sync::Mutex;
use std::time::{Duration, Instant};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Remaining time before an optional whole-operation deadline, measured from
/// `started_at`. `None` deadline means unbounded.
pub(crate) fn remaining_before_deadline(
    deadline: Option<Duration>,
    started_at: Instant,
) -> Option<Duration> {
    let total = deadline?;
    Some(total.saturating_sub(started_at.elapsed()))
}

/// Bounds a backoff sleep by the whole-operation deadline. Returns `None` when
/// sleeping the full delay would cross the deadline, in which case the caller
/// must abort instead of starting another attempt.
pub(crate) fn bounded_backoff(
    backoff: Duration,
    deadline: Option<Duration>,
    started_at: Instant,
) -> Option<Duration> {
    let Some(remaining) = remaining_before_deadline(deadline, started_at) else {
        return Some(backoff);
    };
    if remaining.is_zero() || backoff >= remaining {
        return None;
    }
    Some(backoff)
}

#[cfg(test)]
mod tests {
    use super::{bounded_backoff, remaining_before_deadline};
    use std::time::{Duration, Instant};

    #[test]
    fn unbounded_deadline_passes_backoff_through() {
        let backoff = Duration::from_millis(250);
        assert_eq!(
            bounded_backoff(backoff, None, Instant::now()),
            Some(backoff)
        );
    }

    #[test]
    fn backoff_crossing_deadline_is_rejected() {
        let started_at = Instant::now();
        let deadline = Some(Duration::from_millis(10));
        assert_eq!(
            bounded_backoff(Duration::from_secs(5), deadline, started_at),
            None
        );
    }

    #[test]
    fn remaining_saturates_at_zero_after_deadline() {
        let started_at = Instant::now() - Duration::from_secs(2);
        let remaining = remaining_before_deadline(Some(Duration::from_secs(1)), started_at);
        assert_eq!(remaining, Some(Duration::ZERO));
    }
}
