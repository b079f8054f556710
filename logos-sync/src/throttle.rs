//! Throttle as an explicit state machine.
//!
//! A `Throttle` never spawns anything. The owner passes the current time in,
//! gets back the arguments to act on when a call should go through, and
//! asks for [`Throttle::deadline`] to know when to come back and
//! [`Throttle::poll`] for the trailing call.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct Throttle<T> {
    wait: Duration,
    leading: bool,
    last_fired: Option<Instant>,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Throttle<T> {
    /// Fires immediately when idle, then at most once per `wait` with the
    /// latest arguments.
    pub fn leading(wait: Duration) -> Self {
        Self::with_mode(wait, true)
    }

    /// Fires only at the end of the window, with the latest arguments.
    pub fn trailing(wait: Duration) -> Self {
        Self::with_mode(wait, false)
    }

    fn with_mode(wait: Duration, leading: bool) -> Self {
        Self {
            wait,
            leading,
            last_fired: None,
            pending: None,
            deadline: None,
        }
    }

    /// Register a call. Returns the arguments if the call goes through now.
    pub fn trigger(&mut self, now: Instant, args: T) -> Option<T> {
        if self.leading && self.deadline.is_none() {
            let ready = self.last_fired.map_or(true, |last| now >= last + self.wait);
            if ready {
                self.last_fired = Some(now);
                return Some(args);
            }
        }

        self.pending = Some(args);
        if self.deadline.is_none() {
            self.deadline = Some(match (self.leading, self.last_fired) {
                (true, Some(last)) => last + self.wait,
                _ => now + self.wait,
            });
        }
        None
    }

    /// Release the trailing call once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                let args = self.pending.take()?;
                self.last_fired = Some(now);
                Some(args)
            }
            _ => None,
        }
    }

    /// Release the trailing call immediately, if any.
    pub fn flush(&mut self, now: Instant) -> Option<T> {
        self.deadline = None;
        let args = self.pending.take()?;
        self.last_fired = Some(now);
        Some(args)
    }

    /// Drop any pending call and forget the last fire time.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.pending = None;
        self.last_fired = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(100);

    #[test]
    fn test_leading_fires_immediately() {
        let now = Instant::now();
        let mut throttle = Throttle::leading(WAIT);
        assert_eq!(throttle.trigger(now, 1), Some(1));
        assert!(throttle.deadline().is_none());
    }

    #[test]
    fn test_leading_coalesces_into_trailing() {
        let start = Instant::now();
        let mut throttle = Throttle::leading(WAIT);
        assert_eq!(throttle.trigger(start, 1), Some(1));
        assert_eq!(throttle.trigger(start + Duration::from_millis(10), 2), None);
        assert_eq!(throttle.trigger(start + Duration::from_millis(20), 3), None);
        assert_eq!(throttle.deadline(), Some(start + WAIT));

        assert_eq!(throttle.poll(start + Duration::from_millis(50)), None);
        assert_eq!(throttle.poll(start + WAIT), Some(3));
        assert!(!throttle.is_pending());
    }

    #[test]
    fn test_leading_with_zero_wait_never_defers() {
        let now = Instant::now();
        let mut throttle = Throttle::leading(Duration::ZERO);
        assert_eq!(throttle.trigger(now, 1), Some(1));
        assert_eq!(throttle.trigger(now, 2), Some(2));
    }

    #[test]
    fn test_trailing_only() {
        let start = Instant::now();
        let mut throttle = Throttle::trailing(WAIT);
        assert_eq!(throttle.trigger(start, "a"), None);
        assert_eq!(throttle.trigger(start + Duration::from_millis(60), "b"), None);
        assert_eq!(throttle.deadline(), Some(start + WAIT));
        assert_eq!(throttle.poll(start + WAIT), Some("b"));
        assert_eq!(throttle.poll(start + WAIT * 2), None);
    }

    #[test]
    fn test_flush_and_cancel() {
        let start = Instant::now();
        let mut throttle = Throttle::trailing(WAIT);
        throttle.trigger(start, 7);
        assert_eq!(throttle.flush(start), Some(7));
        assert_eq!(throttle.flush(start), None);

        throttle.trigger(start, 8);
        throttle.cancel();
        assert!(throttle.deadline().is_none());
        assert_eq!(throttle.poll(start + WAIT), None);
    }
}
