//! Deadline bookkeeping for timer watchers.
//!
//! A timer is armed when its watcher starts. The reactor asks every armed
//! timer for its remaining time to bound the `poll` timeout, then fires the
//! ones whose deadline has passed. Repeating timers re-arm from their previous
//! deadline so they do not drift; one-shot timers disarm after firing.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub(crate) struct TimerState {
    after: Duration,
    repeat: Duration,
    deadline: Option<Instant>,
}

impl TimerState {
    pub(crate) fn new(after: Duration, repeat: Duration) -> Self {
        Self {
            after,
            repeat,
            deadline: None,
        }
    }

    /// A delay too long to represent leaves the timer armed in name only: it
    /// never fires.
    pub(crate) fn arm(&mut self, now: Instant) {
        self.deadline = now.checked_add(self.after);
    }

    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn is_repeating(&self) -> bool {
        !self.repeat.is_zero()
    }

    /// Time left until the deadline, zero if it already passed.
    pub(crate) fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Returns `true` if the timer expired at `now`.
    ///
    /// Repeating timers are re-armed, one-shot timers disarmed.
    pub(crate) fn fire(&mut self, now: Instant) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        if now < deadline {
            return false;
        }

        if self.is_repeating() {
            let mut next = deadline.checked_add(self.repeat);
            // Skip intervals missed while the loop was busy.
            while let Some(at) = next.filter(|at| *at <= now) {
                next = at.checked_add(self.repeat);
            }
            self.deadline = next;
        } else {
            self.deadline = None;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_fires_once() {
        let now = Instant::now();
        let mut timer = TimerState::new(Duration::from_millis(10), Duration::ZERO);
        timer.arm(now);

        assert!(!timer.fire(now));
        assert_eq!(timer.remaining(now), Some(Duration::from_millis(10)));
        assert!(timer.fire(now + Duration::from_millis(10)));
        assert!(!timer.fire(now + Duration::from_millis(20)));
        assert_eq!(timer.remaining(now), None);
    }

    #[test]
    fn test_repeating_rearms_without_drift() {
        let now = Instant::now();
        let mut timer = TimerState::new(Duration::from_millis(10), Duration::from_millis(5));
        timer.arm(now);

        assert!(timer.fire(now + Duration::from_millis(12)));
        assert_eq!(
            timer.remaining(now + Duration::from_millis(12)),
            Some(Duration::from_millis(3))
        );

        assert!(timer.fire(now + Duration::from_millis(31)));
        assert_eq!(
            timer.remaining(now + Duration::from_millis(31)),
            Some(Duration::from_millis(4))
        );
    }

    #[test]
    fn test_unrepresentable_delay_never_fires() {
        let now = Instant::now();
        let mut timer = TimerState::new(Duration::MAX, Duration::ZERO);
        timer.arm(now);
        assert_eq!(timer.remaining(now), None);
        assert!(!timer.fire(now + Duration::from_secs(3600)));

        let mut repeating = TimerState::new(Duration::ZERO, Duration::MAX);
        repeating.arm(now);
        assert!(repeating.fire(now));
        assert!(!repeating.fire(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_disarmed_never_fires() {
        let now = Instant::now();
        let mut timer = TimerState::new(Duration::ZERO, Duration::ZERO);
        assert!(!timer.fire(now));

        timer.arm(now);
        timer.disarm();
        assert!(!timer.fire(now + Duration::from_secs(1)));
    }
}
